use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Sensor enumeration failed. Fatal to the run.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no temperature sensors found in {scope}")]
    NoSensors { scope: String },
    #[error("device listing rejected ({status}): check service account credentials")]
    Unauthorized { status: u16 },
    #[error("device listing failed: {0}")]
    Source(#[from] SourceError),
}

/// History paging for one sensor gave up after its retries.
#[derive(Debug, Error)]
#[error("backfill for {sensor_id} abandoned after {attempts} attempts: {source}")]
pub struct BackfillError {
    pub sensor_id: String,
    pub attempts: u32,
    #[source]
    pub source: SourceError,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("live subscription failed: {0}")]
    Connect(String),
    #[error("live stream dropped: {0}")]
    Dropped(String),
    #[error("live stream idle for {0:?}")]
    IdleTimeout(Duration),
    #[error("live stream ended by remote")]
    Ended,
    #[error("live reconnection gave up after {attempts} attempts")]
    Exhausted { attempts: u32 },
}

/// An event that could not be appended in order. Counted and logged, never fatal.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum OrderingAnomaly {
    #[error("{sensor_id}: event at {timestamp} is older than window floor {floor}")]
    Stale {
        sensor_id: String,
        timestamp: DateTime<Utc>,
        floor: DateTime<Utc>,
    },
    #[error("{sensor_id}: event at {timestamp} arrived after {newest}")]
    Late {
        sensor_id: String,
        timestamp: DateTime<Utc>,
        newest: DateTime<Utc>,
    },
    #[error("{sensor_id}: duplicate event at {timestamp}")]
    Duplicate {
        sensor_id: String,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Debug, Error, Clone, PartialEq)]
#[error("{sensor_id}: forecast {value} outside [{min_valid}, {max_valid}]")]
pub struct ModelDivergence {
    pub sensor_id: String,
    pub value: f64,
    pub min_valid: f64,
    pub max_valid: f64,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum IngestError {
    #[error("event for {got} routed to unit {expected}")]
    WrongSensor { expected: String, got: String },
    #[error("unit {sensor_id} is closed")]
    Closed { sensor_id: String },
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode payload: {0}")]
    Decode(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl From<simd_json::Error> for SourceError {
    fn from(err: simd_json::Error) -> Self {
        SourceError::Decode(err.to_string())
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
#[error("invalid forecast parameter {field}: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}
