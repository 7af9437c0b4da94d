pub mod cloud;
pub mod csv_file;
pub mod mqtt;
mod sse;

pub use cloud::{CloudApi, CloudCredentials};
pub use csv_file::CsvFileSource;
pub use mqtt::{MqttLiveSource, MqttSettings};

use crate::error::{ConnectionError, DiscoveryError, SourceError};
use crate::telemetry::SensorEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

pub const TEMPERATURE_KIND: &str = "temperature";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Full resource name; the sensor id is its last path segment.
    pub name: String,
    pub kind: String,
}

impl DeviceDescriptor {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
        }
    }

    pub fn is_temperature(&self) -> bool {
        self.kind == TEMPERATURE_KIND
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryPage {
    pub events: Vec<SensorEvent>,
    /// `None` once the range is exhausted.
    pub next_page_token: Option<String>,
}

pub type LiveStream = BoxStream<'static, Result<SensorEvent, ConnectionError>>;

#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, DiscoveryError>;
}

#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn page_history(
        &self,
        sensor_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        page_token: Option<&str>,
    ) -> Result<HistoryPage, SourceError>;
}

/// A shared subscription for every requested sensor. Calling again reconnects.
#[async_trait]
pub trait LiveSource: Send + Sync {
    async fn subscribe_live(&self, sensor_ids: &[String]) -> Result<LiveStream, ConnectionError>;
}
