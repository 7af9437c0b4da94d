use crate::feed::FeedSettings;
use crate::forecast::{ForecastParams, ModelKind, OutlierPolicy, ParamOverrides, ParamSet};
use crate::source::cloud::DEFAULT_API_URL;
use crate::source::{CloudCredentials, MqttSettings};
use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Three missed 15-minute reporting rounds.
const DEFAULT_LIVE_IDLE_SECS: u64 = 45 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveSourceKind {
    Cloud,
    Mqtt,
}

impl FromStr for LiveSourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cloud" | "" => Ok(Self::Cloud),
            "mqtt" => Ok(Self::Mqtt),
            other => anyhow::bail!("unknown live source {other:?} (expected cloud or mqtt)"),
        }
    }
}

/// Parameter file layout: shared `defaults` plus per-sensor `sensors` overrides.
#[derive(Debug, Clone, Default, Deserialize)]
struct ParamFile {
    #[serde(default)]
    defaults: ParamOverrides,
    #[serde(default)]
    sensors: HashMap<String, ParamOverrides>,
}

fn load_param_file(path: &Path) -> Result<ParamFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read forecast parameter file {}", path.display()))?;
    let mut bytes = contents.into_bytes();
    simd_json::serde::from_slice(&mut bytes)
        .with_context(|| format!("failed to parse forecast parameter file {}", path.display()))
}

#[derive(Clone, Debug)]
pub struct Config {
    pub api_url: String,
    pub project_id: Option<String>,
    pub key_id: Option<String>,
    pub key_secret: Option<String>,
    pub live_source: LiveSourceKind,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic_prefix: String,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_id: String,
    pub page_size: u32,
    pub backfill_page_retries: u32,
    pub max_reconnect_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// 0 disables the idle check.
    pub live_idle_secs: u64,
    pub status_interval_ms: u64,
    pub feed_url: Option<String>,
    pub feed_token: Option<String>,
    pub feed_batch_size: usize,
    pub feed_flush_ms: u64,
    pub feed_queue: usize,
    pub params: ParamSet,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let num = |key: &str| var(key).and_then(|v| v.parse::<u64>().ok());

        let live_source = var("FORECAST_LIVE_SOURCE")
            .map(|raw| raw.parse::<LiveSourceKind>())
            .transpose()?
            .unwrap_or(LiveSourceKind::Cloud);

        let feed_batch_size = num("FORECAST_FEED_BATCH_SIZE").unwrap_or(200) as usize;
        let params = load_params(&var)?;

        Ok(Self {
            api_url: var("DT_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            project_id: var("DT_PROJECT_ID"),
            key_id: var("DT_KEY_ID"),
            key_secret: var("DT_KEY_SECRET"),
            live_source,
            mqtt_host: var("FORECAST_MQTT_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            mqtt_port: var("FORECAST_MQTT_PORT")
                .and_then(|v| v.parse::<u16>().ok())
                .unwrap_or(1883),
            mqtt_username: var("FORECAST_MQTT_USERNAME"),
            mqtt_password: var("FORECAST_MQTT_PASSWORD"),
            mqtt_topic_prefix: var("FORECAST_MQTT_TOPIC_PREFIX").unwrap_or_else(|| "iot".to_string()),
            mqtt_keepalive_secs: num("FORECAST_MQTT_KEEPALIVE_SECS").unwrap_or(30),
            mqtt_client_id: var("FORECAST_MQTT_CLIENT_ID")
                .unwrap_or_else(|| format!("transformer-forecast-{}", std::process::id())),
            page_size: num("FORECAST_PAGE_SIZE").unwrap_or(1000).clamp(1, u32::MAX as u64) as u32,
            backfill_page_retries: num("FORECAST_BACKFILL_PAGE_RETRIES").unwrap_or(3) as u32,
            max_reconnect_attempts: num("FORECAST_MAX_RECONNECTS").unwrap_or(5) as u32,
            backoff_base_ms: num("FORECAST_BACKOFF_BASE_MS").unwrap_or(1000),
            backoff_max_ms: num("FORECAST_BACKOFF_MAX_MS").unwrap_or(60_000),
            live_idle_secs: num("FORECAST_LIVE_IDLE_SECS").unwrap_or(DEFAULT_LIVE_IDLE_SECS),
            status_interval_ms: num("FORECAST_STATUS_INTERVAL_MS").unwrap_or(30_000),
            feed_url: var("FORECAST_FEED_URL"),
            feed_token: var("FORECAST_FEED_TOKEN"),
            feed_batch_size,
            feed_flush_ms: num("FORECAST_FEED_FLUSH_MS").unwrap_or(500),
            feed_queue: num("FORECAST_FEED_QUEUE")
                .map(|v| v as usize)
                .unwrap_or(feed_batch_size.saturating_mul(4)),
            params,
            otlp_endpoint: var("OTEL_EXPORTER_OTLP_ENDPOINT"),
        })
    }

    pub fn cloud_credentials(&self) -> Result<(String, CloudCredentials)> {
        let project_id = self
            .project_id
            .clone()
            .context("DT_PROJECT_ID is required unless --path is given")?;
        let key_id = self.key_id.clone().context("DT_KEY_ID is required")?;
        let secret = self.key_secret.clone().context("DT_KEY_SECRET is required")?;
        Ok((project_id, CloudCredentials { key_id, secret }))
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            host: self.mqtt_host.clone(),
            port: self.mqtt_port,
            client_id: self.mqtt_client_id.clone(),
            username: self.mqtt_username.clone(),
            password: self.mqtt_password.clone(),
            topic_prefix: self.mqtt_topic_prefix.clone(),
            keepalive: Duration::from_secs(self.mqtt_keepalive_secs),
        }
    }

    pub fn feed_settings(&self) -> Option<FeedSettings> {
        Some(FeedSettings {
            url: self.feed_url.clone()?,
            token: self.feed_token.clone(),
            batch_size: self.feed_batch_size.max(1),
            flush_interval: Duration::from_millis(self.feed_flush_ms.max(1)),
            queue: self.feed_queue.max(1),
        })
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms.max(self.backoff_base_ms))
    }

    pub fn live_idle_timeout(&self) -> Option<Duration> {
        (self.live_idle_secs > 0).then(|| Duration::from_secs(self.live_idle_secs))
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms.max(1))
    }
}

/// File defaults first, then `FORECAST_*` variables, then per-sensor file overrides.
fn load_params(var: &impl Fn(&str) -> Option<String>) -> Result<ParamSet> {
    let file = match var("FORECAST_PARAMS_PATH") {
        Some(path) => load_param_file(Path::new(&path))?,
        None => ParamFile::default(),
    };

    let mut defaults = ForecastParams::default();
    file.defaults
        .apply_to(&mut defaults)
        .context("invalid forecast parameter file defaults")?;
    env_overrides(var)?
        .apply_to(&mut defaults)
        .context("invalid forecast parameters")?;

    ParamSet::new(defaults, file.sensors).context("invalid forecast parameters")
}

fn env_overrides(var: &impl Fn(&str) -> Option<String>) -> Result<ParamOverrides> {
    fn parse<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
        var(key).and_then(|v| v.parse::<T>().ok())
    }

    let model = var("FORECAST_MODEL")
        .map(|raw| raw.parse::<ModelKind>())
        .transpose()
        .context("FORECAST_MODEL")?;
    let outlier_policy = var("FORECAST_OUTLIER_POLICY")
        .map(|raw| raw.parse::<OutlierPolicy>())
        .transpose()
        .context("FORECAST_OUTLIER_POLICY")?;

    Ok(ParamOverrides {
        model,
        alpha: parse(var, "FORECAST_ALPHA"),
        beta: parse(var, "FORECAST_BETA"),
        gamma: parse(var, "FORECAST_GAMMA"),
        season_length: parse(var, "FORECAST_SEASON_LENGTH"),
        min_samples: parse(var, "FORECAST_MIN_SAMPLES"),
        window_size: parse(var, "FORECAST_WINDOW_SIZE"),
        window_span_secs: parse(var, "FORECAST_WINDOW_SPAN_SECS"),
        horizon_secs: parse(var, "FORECAST_HORIZON_SECS"),
        max_gap_secs: parse(var, "FORECAST_MAX_GAP_SECS"),
        outlier_threshold: parse(var, "FORECAST_OUTLIER_THRESHOLD"),
        outlier_policy,
        ..ParamOverrides::default()
    })
}
