use super::model::{ModelState, Observation};
use super::types::Sample;
use super::window::SampleWindow;
use super::{
    AnomalyCounts, ForecastParams, ForecastPoint, ForecastResult, ForecastUnit, IngestOutcome,
    NotReady, UnitState,
};
use crate::error::{IngestError, ModelDivergence, OrderingAnomaly};
use crate::telemetry::SensorEvent;
use chrono::Duration as ChronoDuration;

impl ForecastUnit {
    pub fn new(sensor_id: impl Into<String>, params: ForecastParams) -> Self {
        let window = SampleWindow::new(params.window_size, params.window_span);
        Self {
            sensor_id: sensor_id.into(),
            params,
            window,
            base: ModelState::new(),
            head: ModelState::new(),
            closed: false,
            anomalies: AnomalyCounts::default(),
            last_forecast: None,
        }
    }

    pub fn sensor_id(&self) -> &str {
        &self.sensor_id
    }

    pub fn params(&self) -> &ForecastParams {
        &self.params
    }

    pub fn anomalies(&self) -> AnomalyCounts {
        self.anomalies
    }

    pub fn last_forecast(&self) -> Option<&ForecastResult> {
        self.last_forecast.as_ref()
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn is_initialized(&self) -> bool {
        self.state() == UnitState::Ready
    }

    pub fn state(&self) -> UnitState {
        if self.closed {
            UnitState::Closed
        } else if self.window.is_empty() && self.base.is_empty() {
            UnitState::Cold
        } else if self.head.is_tracking() {
            UnitState::Ready
        } else {
            UnitState::Warming
        }
    }

    pub fn ingest(&mut self, event: &SensorEvent) -> Result<IngestOutcome, IngestError> {
        if self.closed {
            return Err(IngestError::Closed {
                sensor_id: self.sensor_id.clone(),
            });
        }
        if event.sensor_id != self.sensor_id {
            return Err(IngestError::WrongSensor {
                expected: self.sensor_id.clone(),
                got: event.sensor_id.clone(),
            });
        }
        if !event.value.is_finite() {
            self.anomalies.invalid += 1;
            tracing::warn!(sensor = %self.sensor_id, ts = %event.timestamp, "dropping non-finite reading");
            return Ok(IngestOutcome::Invalid);
        }

        let sample = Sample {
            timestamp: event.timestamp,
            value: event.value,
        };
        let (Some(floor), Some(newest)) = (self.window.floor(), self.window.newest()) else {
            return Ok(self.append(sample));
        };
        if sample.timestamp > newest {
            return Ok(self.append(sample));
        }
        if sample.timestamp < floor {
            let anomaly = OrderingAnomaly::Stale {
                sensor_id: self.sensor_id.clone(),
                timestamp: sample.timestamp,
                floor,
            };
            self.anomalies.stale += 1;
            tracing::warn!(%anomaly, "dropped out-of-order event");
            return Ok(IngestOutcome::Dropped(anomaly));
        }

        match self.window.locate(sample.timestamp) {
            Ok(idx) => {
                let anomaly = OrderingAnomaly::Duplicate {
                    sensor_id: self.sensor_id.clone(),
                    timestamp: sample.timestamp,
                };
                self.anomalies.replaced += 1;
                tracing::debug!(%anomaly, "replacing sample with newer arrival");
                self.window.replace_value(idx, sample.value);
                self.rebuild();
                Ok(IngestOutcome::Replaced(anomaly))
            }
            Err(idx) => {
                let anomaly = OrderingAnomaly::Late {
                    sensor_id: self.sensor_id.clone(),
                    timestamp: sample.timestamp,
                    newest,
                };
                self.anomalies.reordered += 1;
                tracing::debug!(%anomaly, "reordering late event into window");
                self.window.insert(idx, sample);
                self.evict();
                self.rebuild();
                Ok(IngestOutcome::Reordered(anomaly))
            }
        }
    }

    fn append(&mut self, sample: Sample) -> IngestOutcome {
        let observation = self.head.observe(sample, &self.params);
        self.window.push_back(sample);
        self.record(observation);
        self.evict();
        IngestOutcome::Appended
    }

    fn evict(&mut self) {
        while let Some(expired) = self.window.pop_expired() {
            self.base.observe(expired, &self.params);
        }
    }

    fn rebuild(&mut self) {
        let mut head = self.base.clone();
        for sample in self.window.iter() {
            head.observe(*sample, &self.params);
        }
        self.head = head;
    }

    fn record(&mut self, observation: Observation) {
        match observation {
            Observation::Seeding | Observation::Updated => {}
            Observation::Seeded => {
                tracing::info!(sensor = %self.sensor_id, samples = self.params.min_samples, "forecast model seeded");
            }
            Observation::Outlier { residual, bound } => {
                self.anomalies.outliers += 1;
                tracing::debug!(sensor = %self.sensor_id, residual, bound, policy = ?self.params.outlier_policy, "outlier sample");
            }
            Observation::LevelShift => {
                self.anomalies.level_shifts += 1;
                tracing::warn!(sensor = %self.sensor_id, "sustained outliers; reseeding model");
            }
            Observation::GapReset { gap_secs } => {
                self.anomalies.gap_resets += 1;
                tracing::warn!(sensor = %self.sensor_id, gap_secs, max_gap_secs = self.params.max_gap.num_seconds(), "gap exceeded; model is stale");
            }
            Observation::Diverged => {
                self.anomalies.divergences += 1;
                tracing::warn!(sensor = %self.sensor_id, "model components became non-finite; reseeding");
            }
        }
    }

    pub fn forecast(&mut self) -> Result<ForecastResult, NotReady> {
        match self.state() {
            UnitState::Closed => return Err(NotReady::Closed),
            UnitState::Cold => return Err(NotReady::Cold),
            UnitState::Warming => return Err(NotReady::Warming),
            UnitState::Ready => {}
        }
        let as_of = self.window.newest().ok_or(NotReady::Cold)?;
        let projection = self.head.project(&self.params).ok_or(NotReady::Warming)?;

        let value = projection.value;
        let target_time = as_of.checked_add_signed(self.params.horizon);
        let in_range = value.is_finite() && value >= self.params.min_valid && value <= self.params.max_valid;
        let Some(target_time) = target_time.filter(|_| in_range) else {
            let divergence = ModelDivergence {
                sensor_id: self.sensor_id.clone(),
                value,
                min_valid: self.params.min_valid,
                max_valid: self.params.max_valid,
            };
            self.anomalies.divergences += 1;
            tracing::warn!(%divergence, unrepresentable_target = target_time.is_none(), "suppressing forecast");
            return Err(NotReady::Diverged(divergence));
        };

        let result = ForecastResult {
            sensor_id: self.sensor_id.clone(),
            as_of,
            horizon_secs: self.params.horizon.num_seconds(),
            target_time,
            predicted_value: value,
            error_estimate: projection.half_width.is_finite().then_some(projection.half_width),
        };
        self.last_forecast = Some(result.clone());
        Ok(result)
    }

    /// The next `steps` one-interval-apart predictions with their prediction bounds.
    pub fn forecast_path(&self, steps: usize) -> Vec<ForecastPoint> {
        if self.state() != UnitState::Ready {
            return Vec::new();
        }
        let Some(as_of) = self.window.newest() else {
            return Vec::new();
        };
        (1..=steps)
            .filter_map(|t| {
                let projection = self.head.project_steps(t as f64, &self.params)?;
                let offset_ms = (projection.step_secs * 1000.0 * t as f64).round() as i64;
                let timestamp = as_of.checked_add_signed(ChronoDuration::try_milliseconds(offset_ms)?)?;
                Some(ForecastPoint {
                    timestamp,
                    value: projection.value,
                    lower_bound: projection.value - projection.half_width,
                    upper_bound: projection.value + projection.half_width,
                })
            })
            .collect()
    }

    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            tracing::debug!(sensor = %self.sensor_id, anomalies = ?self.anomalies, "forecast unit closed");
        }
    }

    #[cfg(test)]
    pub(crate) fn model(&self) -> &ModelState {
        &self.head
    }

    #[cfg(test)]
    pub(crate) fn seed_len(&self) -> usize {
        self.head.seed_len()
    }
}
