mod model;
mod params;
mod types;
mod unit;
mod window;

#[cfg(test)]
mod tests;

pub use params::{ForecastParams, ModelKind, OutlierPolicy, ParamOverrides, ParamSet};
pub use types::{
    AnomalyCounts, ForecastPoint, ForecastResult, IngestOutcome, NotReady, UnitState,
};

use model::ModelState;
use window::SampleWindow;

/// Forecasting state for one sensor. Nothing outside the unit mutates it.
///
/// `base` is the model folded over samples that have left the window; `head` is `base`
/// folded over the window. Appends advance `head` directly, evictions advance `base`,
/// and out-of-order arrivals rebuild `head` from `base`.
#[derive(Debug, Clone)]
pub struct ForecastUnit {
    sensor_id: String,
    params: ForecastParams,
    window: SampleWindow,
    base: ModelState,
    head: ModelState,
    closed: bool,
    anomalies: AnomalyCounts,
    last_forecast: Option<ForecastResult>,
}
