use super::params::{ForecastParams, ModelKind, OutlierPolicy};
use super::types::Sample;
use chrono::{DateTime, Utc};

const STEP_SMOOTHING: f64 = 0.1;
const RESIDUAL_SMOOTHING: f64 = 0.05;

/// What a single `observe` did to the model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Observation {
    Seeding,
    Seeded,
    Updated,
    Outlier { residual: f64, bound: f64 },
    LevelShift,
    GapReset { gap_secs: f64 },
    Diverged,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Projection {
    pub(crate) step_secs: f64,
    pub(crate) value: f64,
    pub(crate) half_width: f64,
}

/// Exponential smoothing state folded over an ordered sample stream.
///
/// The state is a pure function of the samples observed since construction, which lets
/// a unit rebuild it from a checkpoint when an event arrives out of order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ModelState {
    phase: Phase,
    last_ts: Option<DateTime<Utc>>,
    step_secs: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
enum Phase {
    Seeding(Vec<Sample>),
    Tracking(Components),
}

#[derive(Debug, Clone, PartialEq)]
struct Components {
    level: f64,
    trend: f64,
    /// Empty for Holt; one entry per season position for Holt-Winters.
    season: Vec<f64>,
    /// Season position of the next sample.
    season_pos: usize,
    residual_var: f64,
    outlier_run: u32,
}

impl ModelState {
    pub(crate) fn new() -> Self {
        Self {
            phase: Phase::Seeding(Vec::new()),
            last_ts: None,
            step_secs: None,
        }
    }

    pub(crate) fn is_tracking(&self) -> bool {
        matches!(self.phase, Phase::Tracking(_))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.last_ts.is_none()
    }

    #[cfg(test)]
    pub(crate) fn seed_len(&self) -> usize {
        match &self.phase {
            Phase::Seeding(buf) => buf.len(),
            Phase::Tracking(_) => 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn residual_var(&self) -> Option<f64> {
        match &self.phase {
            Phase::Tracking(c) => Some(c.residual_var),
            Phase::Seeding(_) => None,
        }
    }

    fn reset_with(&mut self, sample: Sample) {
        self.phase = Phase::Seeding(vec![sample]);
        self.last_ts = Some(sample.timestamp);
        self.step_secs = None;
    }

    /// Callers guarantee strictly increasing timestamps.
    pub(crate) fn observe(&mut self, sample: Sample, params: &ForecastParams) -> Observation {
        if let Some(prev) = self.last_ts {
            let elapsed = sample.timestamp - prev;
            let dt = elapsed.num_milliseconds() as f64 / 1000.0;
            if elapsed > params.max_gap {
                self.reset_with(sample);
                return Observation::GapReset { gap_secs: dt };
            }
            if dt > 0.0 {
                self.step_secs = Some(match self.step_secs {
                    Some(step) => step + STEP_SMOOTHING * (dt - step),
                    None => dt,
                });
            }
        }
        self.last_ts = Some(sample.timestamp);

        let observation = match &mut self.phase {
            Phase::Seeding(buf) => {
                buf.push(sample);
                if buf.len() < params.min_samples {
                    return Observation::Seeding;
                }
                let components = seed(buf, params);
                self.phase = Phase::Tracking(components);
                Observation::Seeded
            }
            Phase::Tracking(components) => components.update(sample.value, params),
        };

        match observation {
            Observation::LevelShift => {
                let step_secs = self.step_secs;
                self.reset_with(sample);
                self.step_secs = step_secs;
            }
            _ if !self.components_finite() => {
                self.reset_with(sample);
                return Observation::Diverged;
            }
            _ => {}
        }
        observation
    }

    fn components_finite(&self) -> bool {
        match &self.phase {
            Phase::Seeding(_) => true,
            Phase::Tracking(c) => {
                c.level.is_finite()
                    && c.trend.is_finite()
                    && c.residual_var.is_finite()
                    && c.season.iter().all(|s| s.is_finite())
            }
        }
    }

    /// Projects `steps` sampling intervals past the newest sample.
    pub(crate) fn project_steps(&self, steps: f64, params: &ForecastParams) -> Option<Projection> {
        let Phase::Tracking(c) = &self.phase else {
            return None;
        };
        let step_secs = self.step_secs.filter(|s| *s > 0.0)?;
        let whole_steps = steps.round().max(1.0) as usize;
        let seasonal = if c.season.is_empty() {
            0.0
        } else {
            c.season[(c.season_pos + whole_steps - 1) % c.season.len()]
        };
        let k = match params.model {
            ModelKind::Holt => (whole_steps - 1) as f64,
            ModelKind::HoltWinters => ((whole_steps - 1) / params.season_length.max(1)) as f64,
        };
        Some(Projection {
            step_secs,
            value: c.level + steps * c.trend + seasonal,
            half_width: params.bound_modifier * c.residual_var.sqrt() * (k + 1.0).sqrt(),
        })
    }

    pub(crate) fn project(&self, params: &ForecastParams) -> Option<Projection> {
        let step_secs = self.step_secs.filter(|s| *s > 0.0)?;
        let horizon_secs = params.horizon.num_milliseconds() as f64 / 1000.0;
        self.project_steps(horizon_secs / step_secs, params)
    }
}

impl Components {
    fn update(&mut self, value: f64, params: &ForecastParams) -> Observation {
        let seasonal = self.season.get(self.season_pos).copied().unwrap_or(0.0);
        let prediction = self.level + self.trend + seasonal;
        let residual = value - prediction;
        let scale = self.residual_var.sqrt().max(params.outlier_floor);
        let bound = params.outlier_threshold * scale;

        let mut observed = value;
        let mut outcome = Observation::Updated;
        if residual.abs() > bound {
            self.outlier_run += 1;
            if self.outlier_run >= params.max_consecutive_outliers {
                return Observation::LevelShift;
            }
            observed = match params.outlier_policy {
                OutlierPolicy::Clip => prediction + bound.copysign(residual),
                OutlierPolicy::Exclude => prediction,
            };
            outcome = Observation::Outlier { residual, bound };
        } else {
            self.outlier_run = 0;
        }

        let prev_level = self.level;
        let prev_trend = self.trend;
        let alpha = params.alpha;
        match params.model {
            ModelKind::Holt => {
                self.level = alpha * observed + (1.0 - alpha) * (prev_level + prev_trend);
            }
            ModelKind::HoltWinters => {
                let gamma = params.gamma;
                self.level = alpha * (observed - seasonal) + (1.0 - alpha) * (prev_level + prev_trend);
                if let Some(slot) = self.season.get_mut(self.season_pos) {
                    *slot = gamma * (observed - prev_level - prev_trend) + (1.0 - gamma) * seasonal;
                }
                if !self.season.is_empty() {
                    self.season_pos = (self.season_pos + 1) % self.season.len();
                }
            }
        }
        self.trend = params.beta * (self.level - prev_level) + (1.0 - params.beta) * prev_trend;

        let innovation = observed - prediction;
        if !(matches!(outcome, Observation::Outlier { .. })
            && params.outlier_policy == OutlierPolicy::Exclude)
        {
            self.residual_var += RESIDUAL_SMOOTHING * (innovation * innovation - self.residual_var);
        }
        outcome
    }
}

fn seed(buf: &[Sample], params: &ForecastParams) -> Components {
    let values: Vec<f64> = buf.iter().map(|s| s.value).collect();
    match params.model {
        ModelKind::Holt => seed_holt(&values),
        ModelKind::HoltWinters => seed_holt_winters(&values, params.season_length),
    }
}

fn seed_holt(values: &[f64]) -> Components {
    let n = values.len();
    let (intercept, slope) = linear_fit(values);
    let residual_var = values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let r = v - (intercept + slope * i as f64);
            r * r
        })
        .sum::<f64>()
        / n as f64;
    Components {
        level: intercept + slope * (n - 1) as f64,
        trend: slope,
        season: Vec::new(),
        season_pos: 0,
        residual_var,
        outlier_run: 0,
    }
}

/// Classical decomposition seed: a centred moving average of three seasons removes the
/// trend, per-position means of the remainder give the seasonal profile, and a linear
/// fit of the deseasonalized series gives level and trend.
fn seed_holt_winters(values: &[f64], season_length: usize) -> Components {
    let n = values.len();
    let half = (1.5 * season_length as f64) as usize;

    let detrended: Vec<f64> = (0..n)
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half + 1).min(n);
            let window = &values[lo..hi];
            values[i] - window.iter().sum::<f64>() / window.len() as f64
        })
        .collect();

    let seasons = (n / season_length).max(1);
    let mut season: Vec<f64> = (0..season_length)
        .map(|pos| {
            let members: Vec<f64> = (0..seasons)
                .map(|j| pos + j * season_length)
                .filter(|&idx| idx < n)
                .map(|idx| detrended[idx])
                .collect();
            if members.is_empty() {
                0.0
            } else {
                members.iter().sum::<f64>() / members.len() as f64
            }
        })
        .collect();
    let mean = season.iter().sum::<f64>() / season_length as f64;
    for s in season.iter_mut() {
        *s -= mean;
    }

    let adjusted: Vec<f64> = values
        .iter()
        .enumerate()
        .map(|(i, v)| v - season[i % season_length])
        .collect();
    let (intercept, slope) = linear_fit(&adjusted);
    let residual_var = adjusted
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let r = v - (intercept + slope * i as f64);
            r * r
        })
        .sum::<f64>()
        / n as f64;

    Components {
        level: intercept + slope * (n - 1) as f64,
        trend: slope,
        season,
        season_pos: n % season_length,
        residual_var,
        outlier_run: 0,
    }
}

/// Least-squares line through `(i, values[i])`; returns `(intercept, slope)`.
pub(crate) fn linear_fit(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mut sx = 0.0;
    let mut sy = 0.0;
    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (i, y) in values.iter().enumerate() {
        let x = i as f64;
        sx += x;
        sy += y;
        sxx += x * x;
        sxy += x * y;
    }
    let denom = n * sxx - sx * sx;
    if n == 0.0 {
        return (0.0, 0.0);
    }
    if denom == 0.0 {
        return (sy / n, 0.0);
    }
    let slope = (n * sxy - sx * sy) / denom;
    let intercept = (sy - slope * sx) / n;
    (intercept, slope)
}
