use crate::error::{BackfillError, ConnectionError};
use crate::forecast::{AnomalyCounts, ForecastPoint, NotReady, UnitState};
use crate::pipeline::{total_anomalies, PipelineStats, StatsSnapshot};
use crate::registry::SensorRegistry;
use crate::sink::ForecastSink;
use crate::source::{HistorySource, LiveSource, LiveStream};
use crate::telemetry::SensorEvent;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub backfill: Option<BackfillRange>,
    pub live: bool,
    pub emit_backfill_forecasts: bool,
    pub backfill_page_retries: u32,
    pub max_reconnect_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub live_idle_timeout: Option<Duration>,
    /// Forecast path length captured per sensor at the end of the run; 0 disables.
    pub summary_steps: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            backfill: None,
            live: true,
            emit_backfill_forecasts: false,
            backfill_page_retries: 3,
            max_reconnect_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            live_idle_timeout: None,
            summary_steps: 0,
        }
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub backfill_errors: Vec<BackfillError>,
    pub live_error: Option<ConnectionError>,
    pub cancelled: bool,
    pub stats: StatsSnapshot,
    pub anomalies: AnomalyCounts,
    pub summaries: Vec<(String, Vec<ForecastPoint>)>,
}

/// `min(base * 2^(attempt - 1), max)` for attempt >= 1.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// Drives backfill then live ingestion for every unit in the registry.
pub struct Coordinator {
    registry: SensorRegistry,
    sinks: Arc<dyn ForecastSink>,
    stats: Arc<PipelineStats>,
    settings: CoordinatorSettings,
    cancel: CancellationToken,
}

impl Coordinator {
    pub fn new(
        registry: SensorRegistry,
        sinks: Arc<dyn ForecastSink>,
        stats: Arc<PipelineStats>,
        settings: CoordinatorSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            sinks,
            stats,
            settings,
            cancel,
        }
    }

    pub fn registry(&self) -> &SensorRegistry {
        &self.registry
    }

    fn emit_during_backfill(&self) -> bool {
        self.settings.emit_backfill_forecasts || !self.settings.live
    }

    /// Runs both phases, then closes every unit. Only discovery failures are fatal and
    /// they happen before this point, so the run always produces a report.
    pub async fn run(
        &mut self,
        history: Option<&dyn HistorySource>,
        live: Option<&dyn LiveSource>,
    ) -> RunReport {
        let mut backfill_errors = Vec::new();
        if let (Some(range), Some(history)) = (self.settings.backfill, history) {
            backfill_errors = self.backfill(history, range).await;
        }

        let mut live_error = None;
        if self.settings.live && !self.cancel.is_cancelled() {
            if let Some(live) = live {
                if let Err(err) = self.run_live(live).await {
                    tracing::error!(error=%err, "live ingestion stopped");
                    self.stats.record_error(err.to_string());
                    live_error = Some(err);
                }
            }
        }

        let summaries = if self.settings.summary_steps > 0 {
            self.registry
                .units()
                .map(|unit| {
                    (
                        unit.sensor_id().to_string(),
                        unit.forecast_path(self.settings.summary_steps),
                    )
                })
                .collect()
        } else {
            Vec::new()
        };

        let anomalies = total_anomalies(self.registry.units().map(|unit| unit.anomalies()));

        self.sinks.flush();
        self.registry.close_all();
        tracing::info!(sensors = self.registry.len(), "all forecast units closed");

        RunReport {
            backfill_errors,
            live_error,
            cancelled: self.cancel.is_cancelled(),
            stats: self.stats.snapshot(),
            anomalies,
            summaries,
        }
    }

    /// Pages each sensor's history independently; a failing sensor does not stop the others.
    pub async fn backfill(
        &mut self,
        history: &dyn HistorySource,
        range: BackfillRange,
    ) -> Vec<BackfillError> {
        let mut errors = Vec::new();
        let emit = self.emit_during_backfill();
        tracing::info!(start=%range.start, end=%range.end, sensors = self.registry.len(), emit, "starting backfill");

        for sensor_id in self.registry.sensor_ids() {
            if self.cancel.is_cancelled() {
                tracing::info!("backfill cancelled");
                break;
            }
            let (mut events, failure) = self.collect_history(history, &sensor_id, range).await;
            if let Some(err) = failure {
                tracing::warn!(error=%err, sensor=%sensor_id, collected = events.len(), "backfill incomplete");
                self.stats.backfill_failures.fetch_add(1, Ordering::Relaxed);
                self.stats.record_error(err.to_string());
                errors.push(err);
            }

            events.sort_by_key(|event| event.timestamp);
            let count = events.len();
            for event in events {
                self.ingest_event(event, emit);
            }
            let state = self.registry.unit(&sensor_id).map(|unit| unit.state());
            tracing::info!(sensor=%sensor_id, events = count, state = ?state, "backfill complete");
        }
        errors
    }

    async fn collect_history(
        &self,
        history: &dyn HistorySource,
        sensor_id: &str,
        range: BackfillRange,
    ) -> (Vec<SensorEvent>, Option<BackfillError>) {
        let mut events = Vec::new();
        let mut page_token: Option<String> = None;
        let max_attempts = self.settings.backfill_page_retries.saturating_add(1);

        loop {
            if self.cancel.is_cancelled() {
                return (events, None);
            }
            let mut attempt = 0;
            let page = loop {
                attempt += 1;
                match history
                    .page_history(sensor_id, range.start, range.end, page_token.as_deref())
                    .await
                {
                    Ok(page) => break page,
                    Err(source) if attempt >= max_attempts => {
                        let err = BackfillError {
                            sensor_id: sensor_id.to_string(),
                            attempts: attempt,
                            source,
                        };
                        return (events, Some(err));
                    }
                    Err(err) => {
                        let delay = backoff_delay(
                            self.settings.backoff_base,
                            self.settings.backoff_max,
                            attempt,
                        );
                        tracing::warn!(error=%err, sensor=%sensor_id, attempt, ?delay, "history page failed; retrying");
                        tokio::select! {
                            _ = self.cancel.cancelled() => return (events, None),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            };

            self.stats.backfill_pages.fetch_add(1, Ordering::Relaxed);
            events.extend(page.events);
            match page.next_page_token {
                Some(token) => {
                    tracing::debug!(sensor=%sensor_id, collected = events.len(), "paging");
                    page_token = Some(token);
                }
                None => return (events, None),
            }
        }
    }

    /// Keeps one live subscription open until cancelled or the reconnect budget runs out.
    pub async fn run_live(&mut self, live: &dyn LiveSource) -> Result<(), ConnectionError> {
        let sensor_ids = self.registry.sensor_ids();
        let mut failures: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let subscribed = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                result = live.subscribe_live(&sensor_ids) => result,
            };

            let err = match subscribed {
                Ok(mut stream) => {
                    failures = 0;
                    self.stats.set_live_connected(true);
                    self.stats.clear_error();
                    tracing::info!(sensors = sensor_ids.len(), "listening for live events");
                    let outcome = self.consume(&mut stream).await;
                    self.stats.set_live_connected(false);
                    match outcome {
                        Some(err) => err,
                        None => return Ok(()),
                    }
                }
                Err(err) => err,
            };

            failures += 1;
            self.stats.record_error(err.to_string());
            if failures > self.settings.max_reconnect_attempts {
                return Err(ConnectionError::Exhausted {
                    attempts: failures - 1,
                });
            }
            let delay = backoff_delay(self.settings.backoff_base, self.settings.backoff_max, failures);
            tracing::warn!(
                error=%err,
                attempt = failures,
                max = self.settings.max_reconnect_attempts,
                ?delay,
                "live connection lost; reconnecting"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Ingests from the stream until it fails. Returns `None` when cancelled.
    async fn consume(&mut self, stream: &mut LiveStream) -> Option<ConnectionError> {
        let idle = self.settings.live_idle_timeout;
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                next = next_with_idle(stream, idle) => next,
            };
            match next {
                Ok(Some(Ok(event))) => self.ingest_event(event, true),
                Ok(Some(Err(err))) => return Some(err),
                Ok(None) => return Some(ConnectionError::Ended),
                Err(err) => return Some(err),
            }
        }
    }

    /// Routes one event to its unit and emits a forecast if allowed and available.
    pub fn ingest_event(&mut self, event: SensorEvent, emit: bool) {
        let Some(unit) = self.registry.unit_mut(&event.sensor_id) else {
            self.stats.events_ignored.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(sensor=%event.sensor_id, "ignoring event for unknown sensor");
            return;
        };

        let outcome = match unit.ingest(&event) {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(error=%err, "event rejected by unit");
                return;
            }
        };
        self.stats.record_outcome(&outcome);
        if !outcome.changed_state() {
            return;
        }
        self.sinks.record_event(&event);

        if unit.state() != UnitState::Ready {
            return;
        }
        if !emit {
            self.stats.forecasts_suppressed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match unit.forecast() {
            Ok(result) => {
                self.sinks.emit(&result);
                self.stats.forecasts_emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(NotReady::Diverged(_)) => {
                self.stats.divergences.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {}
        }
    }
}

async fn next_with_idle(
    stream: &mut LiveStream,
    idle: Option<Duration>,
) -> Result<Option<Result<SensorEvent, ConnectionError>>, ConnectionError> {
    match idle {
        Some(limit) => tokio::time::timeout(limit, stream.next())
            .await
            .map_err(|_| ConnectionError::IdleTimeout(limit)),
        None => Ok(stream.next().await),
    }
}
