use crate::forecast::{AnomalyCounts, IngestOutcome};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Run-wide counters shared between the coordinator and the status logger.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub events_ingested: AtomicU64,
    pub events_ignored: AtomicU64,
    pub ordering_anomalies: AtomicU64,
    pub invalid_events: AtomicU64,
    pub forecasts_emitted: AtomicU64,
    pub forecasts_suppressed: AtomicU64,
    pub divergences: AtomicU64,
    pub backfill_pages: AtomicU64,
    pub backfill_failures: AtomicU64,
    pub reconnects: AtomicU64,
    pub live_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub events_ingested: u64,
    pub events_ignored: u64,
    pub ordering_anomalies: u64,
    pub invalid_events: u64,
    pub forecasts_emitted: u64,
    pub forecasts_suppressed: u64,
    pub divergences: u64,
    pub backfill_pages: u64,
    pub backfill_failures: u64,
    pub reconnects: u64,
    pub live_connected: bool,
}

impl PipelineStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_outcome(&self, outcome: &IngestOutcome) {
        match outcome {
            IngestOutcome::Appended => {
                self.events_ingested.fetch_add(1, Ordering::Relaxed);
            }
            IngestOutcome::Reordered(_) | IngestOutcome::Replaced(_) => {
                self.events_ingested.fetch_add(1, Ordering::Relaxed);
                self.ordering_anomalies.fetch_add(1, Ordering::Relaxed);
            }
            IngestOutcome::Dropped(_) => {
                self.ordering_anomalies.fetch_add(1, Ordering::Relaxed);
            }
            IngestOutcome::Invalid => {
                self.invalid_events.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn set_live_connected(&self, connected: bool) {
        self.live_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_ingested: self.events_ingested.load(Ordering::Relaxed),
            events_ignored: self.events_ignored.load(Ordering::Relaxed),
            ordering_anomalies: self.ordering_anomalies.load(Ordering::Relaxed),
            invalid_events: self.invalid_events.load(Ordering::Relaxed),
            forecasts_emitted: self.forecasts_emitted.load(Ordering::Relaxed),
            forecasts_suppressed: self.forecasts_suppressed.load(Ordering::Relaxed),
            divergences: self.divergences.load(Ordering::Relaxed),
            backfill_pages: self.backfill_pages.load(Ordering::Relaxed),
            backfill_failures: self.backfill_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            live_connected: self.live_connected.load(Ordering::Relaxed),
        }
    }
}

/// Logs a stats line every `interval` until cancelled.
pub async fn run_status_logger(
    stats: Arc<PipelineStats>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let snap = stats.snapshot();
                tracing::info!(
                    ingested = snap.events_ingested,
                    ignored = snap.events_ignored,
                    anomalies = snap.ordering_anomalies,
                    invalid = snap.invalid_events,
                    emitted = snap.forecasts_emitted,
                    suppressed = snap.forecasts_suppressed,
                    divergences = snap.divergences,
                    reconnects = snap.reconnects,
                    live = snap.live_connected,
                    last_error = stats.last_error().as_deref().unwrap_or(""),
                    "pipeline status"
                );
            }
        }
    }
}

/// Sums per-unit anomaly counters for the end-of-run summary.
pub fn total_anomalies(counts: impl IntoIterator<Item = AnomalyCounts>) -> AnomalyCounts {
    counts
        .into_iter()
        .fold(AnomalyCounts::default(), |mut acc, c| {
            acc.stale += c.stale;
            acc.reordered += c.reordered;
            acc.replaced += c.replaced;
            acc.invalid += c.invalid;
            acc.outliers += c.outliers;
            acc.level_shifts += c.level_shifts;
            acc.gap_resets += c.gap_resets;
            acc.divergences += c.divergences;
            acc
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrderingAnomaly;
    use chrono::Utc;

    #[test]
    fn outcomes_feed_counters() {
        let stats = PipelineStats::new();
        stats.record_outcome(&IngestOutcome::Appended);
        stats.record_outcome(&IngestOutcome::Dropped(OrderingAnomaly::Duplicate {
            sensor_id: "t1".into(),
            timestamp: Utc::now(),
        }));
        stats.record_outcome(&IngestOutcome::Invalid);

        let snap = stats.snapshot();
        assert_eq!(snap.events_ingested, 1);
        assert_eq!(snap.ordering_anomalies, 1);
        assert_eq!(snap.invalid_events, 1);
    }

    #[test]
    fn last_error_round_trips() {
        let stats = PipelineStats::new();
        stats.record_error("stream dropped");
        assert_eq!(stats.last_error().as_deref(), Some("stream dropped"));
        stats.clear_error();
        assert_eq!(stats.last_error(), None);
    }

    #[test]
    fn anomaly_totals_sum_units() {
        let a = AnomalyCounts {
            stale: 1,
            outliers: 2,
            ..AnomalyCounts::default()
        };
        let b = AnomalyCounts {
            stale: 3,
            gap_resets: 1,
            ..AnomalyCounts::default()
        };
        let total = total_anomalies([a, b]);
        assert_eq!(total.stale, 4);
        assert_eq!(total.outliers, 2);
        assert_eq!(total.gap_resets, 1);
    }
}
