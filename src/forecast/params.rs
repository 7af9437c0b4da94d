use crate::error::ConfigError;
use chrono::Duration as ChronoDuration;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Holt's linear trend (level + trend).
    Holt,
    /// Additive Holt-Winters (level + trend + season).
    HoltWinters,
}

impl Default for ModelKind {
    fn default() -> Self {
        Self::HoltWinters
    }
}

impl FromStr for ModelKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "holt" => Ok(Self::Holt),
            "holt_winters" | "holt-winters" | "hw" => Ok(Self::HoltWinters),
            other => Err(ConfigError::new("model", format!("unknown model {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlierPolicy {
    /// Pull the value back onto the outlier bound before updating.
    Clip,
    /// Update as if the observation matched the prediction.
    Exclude,
}

impl Default for OutlierPolicy {
    fn default() -> Self {
        Self::Clip
    }
}

impl FromStr for OutlierPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "clip" => Ok(Self::Clip),
            "exclude" => Ok(Self::Exclude),
            other => Err(ConfigError::new(
                "outlier_policy",
                format!("unknown policy {other:?}"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForecastParams {
    pub model: ModelKind,
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    pub season_length: usize,
    /// Samples needed (since the last reset) before the model produces forecasts.
    pub min_samples: usize,
    pub window_size: usize,
    pub window_span: Option<ChronoDuration>,
    pub horizon: ChronoDuration,
    pub max_gap: ChronoDuration,
    /// Outlier bound in units of the smoothed residual RMS.
    pub outlier_threshold: f64,
    /// Lower bound (°C) for the residual scale used by the outlier test.
    pub outlier_floor: f64,
    pub outlier_policy: OutlierPolicy,
    pub max_consecutive_outliers: u32,
    pub bound_modifier: f64,
    pub min_valid: f64,
    pub max_valid: f64,
}

pub const DEFAULT_SEASON_LENGTH: usize = 7;
pub const DEFAULT_SEASONS_INIT: usize = 7;
/// Upper bound for `horizon` and `max_gap`.
pub const MAX_DURATION_SECS: i64 = 366 * 24 * 3600;

impl Default for ForecastParams {
    fn default() -> Self {
        Self {
            model: ModelKind::HoltWinters,
            alpha: 0.02,
            beta: 0.01,
            gamma: 0.75,
            season_length: DEFAULT_SEASON_LENGTH,
            min_samples: DEFAULT_SEASON_LENGTH * DEFAULT_SEASONS_INIT,
            window_size: 336,
            window_span: None,
            horizon: ChronoDuration::hours(1),
            max_gap: ChronoDuration::hours(3),
            outlier_threshold: 6.0,
            outlier_floor: 0.25,
            outlier_policy: OutlierPolicy::Clip,
            max_consecutive_outliers: 5,
            bound_modifier: 1.96,
            min_valid: -50.0,
            max_valid: 200.0,
        }
    }
}

impl ForecastParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit_interval = |field: &'static str, value: f64, allow_zero: bool| {
            let ok = value.is_finite() && value <= 1.0 && (value > 0.0 || (allow_zero && value == 0.0));
            if ok {
                Ok(())
            } else {
                Err(ConfigError::new(field, format!("{value} outside (0, 1]")))
            }
        };
        unit_interval("alpha", self.alpha, false)?;
        unit_interval("beta", self.beta, true)?;

        if self.model == ModelKind::HoltWinters {
            unit_interval("gamma", self.gamma, true)?;
            if self.season_length < 2 {
                return Err(ConfigError::new("season_length", "must be at least 2"));
            }
            if self.min_samples < 2 * self.season_length {
                return Err(ConfigError::new(
                    "min_samples",
                    format!(
                        "holt_winters needs at least two seasons ({} samples)",
                        2 * self.season_length
                    ),
                ));
            }
        }
        if self.min_samples < 2 {
            return Err(ConfigError::new("min_samples", "must be at least 2"));
        }
        if self.window_size < 2 {
            return Err(ConfigError::new("window_size", "must be at least 2"));
        }
        if let Some(span) = self.window_span {
            if span <= ChronoDuration::zero() {
                return Err(ConfigError::new("window_span", "must be positive"));
            }
        }
        bounded_duration("horizon", self.horizon)?;
        bounded_duration("max_gap", self.max_gap)?;
        if !(self.outlier_threshold.is_finite() && self.outlier_threshold > 0.0) {
            return Err(ConfigError::new("outlier_threshold", "must be positive"));
        }
        if !(self.outlier_floor.is_finite() && self.outlier_floor >= 0.0) {
            return Err(ConfigError::new("outlier_floor", "must be non-negative"));
        }
        if self.max_consecutive_outliers == 0 {
            return Err(ConfigError::new("max_consecutive_outliers", "must be at least 1"));
        }
        if !(self.bound_modifier.is_finite() && self.bound_modifier >= 0.0) {
            return Err(ConfigError::new("bound_modifier", "must be non-negative"));
        }
        if !(self.min_valid.is_finite() && self.max_valid.is_finite() && self.min_valid < self.max_valid) {
            return Err(ConfigError::new(
                "min_valid",
                format!("[{}, {}] is not a valid range", self.min_valid, self.max_valid),
            ));
        }
        Ok(())
    }
}

fn bounded_duration(field: &'static str, value: ChronoDuration) -> Result<(), ConfigError> {
    if value <= ChronoDuration::zero() {
        return Err(ConfigError::new(field, "must be positive"));
    }
    if value.num_seconds() > MAX_DURATION_SECS {
        return Err(ConfigError::new(
            field,
            format!("{}s exceeds {MAX_DURATION_SECS}s", value.num_seconds()),
        ));
    }
    Ok(())
}

fn seconds(field: &'static str, secs: i64) -> Result<ChronoDuration, ConfigError> {
    ChronoDuration::try_seconds(secs)
        .ok_or_else(|| ConfigError::new(field, format!("{secs}s is out of range")))
}

/// Partial parameter set, as read from the parameter file or environment.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParamOverrides {
    #[serde(default)]
    pub model: Option<ModelKind>,
    #[serde(default)]
    pub alpha: Option<f64>,
    #[serde(default)]
    pub beta: Option<f64>,
    #[serde(default)]
    pub gamma: Option<f64>,
    #[serde(default)]
    pub season_length: Option<usize>,
    #[serde(default)]
    pub min_samples: Option<usize>,
    #[serde(default)]
    pub window_size: Option<usize>,
    #[serde(default)]
    pub window_span_secs: Option<i64>,
    #[serde(default)]
    pub horizon_secs: Option<i64>,
    #[serde(default)]
    pub max_gap_secs: Option<i64>,
    #[serde(default)]
    pub outlier_threshold: Option<f64>,
    #[serde(default)]
    pub outlier_floor: Option<f64>,
    #[serde(default)]
    pub outlier_policy: Option<OutlierPolicy>,
    #[serde(default)]
    pub max_consecutive_outliers: Option<u32>,
    #[serde(default)]
    pub bound_modifier: Option<f64>,
    #[serde(default)]
    pub min_valid: Option<f64>,
    #[serde(default)]
    pub max_valid: Option<f64>,
}

impl ParamOverrides {
    pub fn apply_to(&self, params: &mut ForecastParams) -> Result<(), ConfigError> {
        if let Some(model) = self.model {
            params.model = model;
        }
        if let Some(value) = self.alpha {
            params.alpha = value;
        }
        if let Some(value) = self.beta {
            params.beta = value;
        }
        if let Some(value) = self.gamma {
            params.gamma = value;
        }
        if let Some(value) = self.season_length {
            params.season_length = value;
        }
        if let Some(value) = self.min_samples {
            params.min_samples = value;
        }
        if let Some(value) = self.window_size {
            params.window_size = value;
        }
        if let Some(secs) = self.window_span_secs {
            params.window_span = if secs > 0 {
                Some(seconds("window_span", secs)?)
            } else {
                None
            };
        }
        if let Some(secs) = self.horizon_secs {
            params.horizon = seconds("horizon", secs)?;
        }
        if let Some(secs) = self.max_gap_secs {
            params.max_gap = seconds("max_gap", secs)?;
        }
        if let Some(value) = self.outlier_threshold {
            params.outlier_threshold = value;
        }
        if let Some(value) = self.outlier_floor {
            params.outlier_floor = value;
        }
        if let Some(policy) = self.outlier_policy {
            params.outlier_policy = policy;
        }
        if let Some(value) = self.max_consecutive_outliers {
            params.max_consecutive_outliers = value;
        }
        if let Some(value) = self.bound_modifier {
            params.bound_modifier = value;
        }
        if let Some(value) = self.min_valid {
            params.min_valid = value;
        }
        if let Some(value) = self.max_valid {
            params.max_valid = value;
        }
        Ok(())
    }
}

/// Shared defaults plus per-sensor overrides, validated up front.
#[derive(Debug, Clone, Default)]
pub struct ParamSet {
    defaults: ForecastParams,
    sensors: HashMap<String, ForecastParams>,
}

impl ParamSet {
    pub fn new(
        defaults: ForecastParams,
        overrides: HashMap<String, ParamOverrides>,
    ) -> Result<Self, ConfigError> {
        defaults.validate()?;
        let mut sensors = HashMap::with_capacity(overrides.len());
        for (sensor_id, patch) in overrides {
            let mut params = defaults.clone();
            patch.apply_to(&mut params)?;
            params.validate()?;
            sensors.insert(sensor_id, params);
        }
        Ok(Self { defaults, sensors })
    }

    pub fn uniform(defaults: ForecastParams) -> Result<Self, ConfigError> {
        Self::new(defaults, HashMap::new())
    }

    pub fn defaults(&self) -> &ForecastParams {
        &self.defaults
    }

    pub fn for_sensor(&self, sensor_id: &str) -> ForecastParams {
        self.sensors
            .get(sensor_id)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ForecastParams::default().validate().expect("defaults");
    }

    #[test]
    fn holt_winters_requires_two_seasons() {
        let params = ForecastParams {
            min_samples: 10,
            ..ForecastParams::default()
        };
        let err = params.validate().expect_err("too few samples");
        assert_eq!(err.field, "min_samples");

        let holt = ForecastParams {
            model: ModelKind::Holt,
            min_samples: 10,
            ..ForecastParams::default()
        };
        holt.validate().expect("holt only needs two samples");
    }

    #[test]
    fn per_sensor_overrides_fall_back_to_defaults() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "S1".to_string(),
            ParamOverrides {
                model: Some(ModelKind::Holt),
                min_samples: Some(12),
                horizon_secs: Some(600),
                ..ParamOverrides::default()
            },
        );
        let set = ParamSet::new(ForecastParams::default(), overrides).expect("valid");

        let s1 = set.for_sensor("S1");
        assert_eq!(s1.model, ModelKind::Holt);
        assert_eq!(s1.min_samples, 12);
        assert_eq!(s1.horizon, ChronoDuration::minutes(10));
        assert_eq!(s1.alpha, ForecastParams::default().alpha);

        assert_eq!(set.for_sensor("S9"), ForecastParams::default());
    }

    #[test]
    fn invalid_override_is_rejected() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "S1".to_string(),
            ParamOverrides {
                alpha: Some(1.5),
                ..ParamOverrides::default()
            },
        );
        let err = ParamSet::new(ForecastParams::default(), overrides).expect_err("alpha");
        assert_eq!(err.field, "alpha");
    }

    #[test]
    fn out_of_range_durations_are_rejected() {
        let mut params = ForecastParams::default();
        let patch = ParamOverrides {
            horizon_secs: Some(i64::MAX),
            ..ParamOverrides::default()
        };
        let err = patch.apply_to(&mut params).expect_err("overflow");
        assert_eq!(err.field, "horizon");

        let too_long = ForecastParams {
            max_gap: ChronoDuration::seconds(MAX_DURATION_SECS + 1),
            ..ForecastParams::default()
        };
        assert_eq!(too_long.validate().expect_err("max_gap").field, "max_gap");
    }

    #[test]
    fn parses_names() {
        assert_eq!("holt".parse::<ModelKind>(), Ok(ModelKind::Holt));
        assert_eq!("Holt-Winters".parse::<ModelKind>(), Ok(ModelKind::HoltWinters));
        assert_eq!("exclude".parse::<OutlierPolicy>(), Ok(OutlierPolicy::Exclude));
        assert!("arima".parse::<ModelKind>().is_err());
    }
}
