use crate::error::{ModelDivergence, OrderingAnomaly};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Sample {
    pub(crate) timestamp: DateTime<Utc>,
    pub(crate) value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Cold,
    Warming,
    Ready,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastResult {
    pub sensor_id: String,
    pub as_of: DateTime<Utc>,
    pub horizon_secs: i64,
    pub target_time: DateTime<Utc>,
    pub predicted_value: f64,
    /// Half-width of the prediction interval, when the residual history allows one.
    pub error_estimate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Appended,
    /// Arrived late but inside the window; inserted in order and the model rebuilt.
    Reordered(OrderingAnomaly),
    /// Same timestamp as a retained sample; the newer value replaced it.
    Replaced(OrderingAnomaly),
    /// Older than the window floor; state untouched.
    Dropped(OrderingAnomaly),
    /// Non-finite reading; state untouched.
    Invalid,
}

impl IngestOutcome {
    pub fn changed_state(&self) -> bool {
        matches!(
            self,
            IngestOutcome::Appended | IngestOutcome::Reordered(_) | IngestOutcome::Replaced(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NotReady {
    Cold,
    Warming,
    Closed,
    Diverged(ModelDivergence),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnomalyCounts {
    pub stale: u64,
    pub reordered: u64,
    pub replaced: u64,
    pub invalid: u64,
    pub outliers: u64,
    pub level_shifts: u64,
    pub gap_resets: u64,
    pub divergences: u64,
}

impl AnomalyCounts {
    pub fn ordering(&self) -> u64 {
        self.stale + self.reordered + self.replaced
    }
}
