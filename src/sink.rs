use crate::forecast::ForecastResult;
use crate::telemetry::SensorEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Destination for forecasts and, when the raw tap is on, ingested events.
///
/// Calls come from the coordinator's ingest path and must not block on I/O for long.
pub trait ForecastSink: Send + Sync {
    fn record_event(&self, _event: &SensorEvent) {}

    fn emit(&self, result: &ForecastResult);

    fn flush(&self) {}
}

/// Logs every forecast through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ForecastSink for LogSink {
    fn record_event(&self, event: &SensorEvent) {
        tracing::debug!(sensor = %event.sensor_id, ts = %event.timestamp, value = event.value, "event");
    }

    fn emit(&self, result: &ForecastResult) {
        tracing::info!(
            sensor = %result.sensor_id,
            as_of = %result.as_of,
            target = %result.target_time,
            predicted = result.predicted_value,
            error = ?result.error_estimate,
            "forecast"
        );
    }
}

#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    kind: &'static str,
    sensor_id: &'a str,
    timestamp: DateTime<Utc>,
    value: f64,
    target_time: Option<DateTime<Utc>>,
    horizon_secs: Option<i64>,
    error_estimate: Option<f64>,
}

/// Appends forecasts (and tapped events) as CSV rows.
pub struct CsvSink {
    writer: Mutex<csv::Writer<File>>,
}

impl CsvSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, csv::Error> {
        let writer = csv::Writer::from_path(path)?;
        Ok(Self {
            writer: Mutex::new(writer),
        })
    }

    fn write(&self, row: CsvRow<'_>) {
        let Ok(mut writer) = self.writer.lock() else {
            tracing::warn!("csv sink lock poisoned; dropping row");
            return;
        };
        if let Err(err) = writer.serialize(row) {
            tracing::warn!(error=%err, "failed to write csv row");
        }
    }
}

impl ForecastSink for CsvSink {
    fn record_event(&self, event: &SensorEvent) {
        self.write(CsvRow {
            kind: "event",
            sensor_id: &event.sensor_id,
            timestamp: event.timestamp,
            value: event.value,
            target_time: None,
            horizon_secs: None,
            error_estimate: None,
        });
    }

    fn emit(&self, result: &ForecastResult) {
        self.write(CsvRow {
            kind: "forecast",
            sensor_id: &result.sensor_id,
            timestamp: result.as_of,
            value: result.predicted_value,
            target_time: Some(result.target_time),
            horizon_secs: Some(result.horizon_secs),
            error_estimate: result.error_estimate,
        });
    }

    fn flush(&self) {
        if let Ok(mut writer) = self.writer.lock() {
            if let Err(err) = writer.flush() {
                tracing::warn!(error=%err, "failed to flush csv sink");
            }
        }
    }
}

/// Fans out to every configured sink.
#[derive(Clone, Default)]
pub struct SinkSet {
    sinks: Vec<Arc<dyn ForecastSink>>,
    record_events: bool,
}

impl SinkSet {
    pub fn new(record_events: bool) -> Self {
        Self {
            sinks: Vec::new(),
            record_events,
        }
    }

    pub fn with(mut self, sink: Arc<dyn ForecastSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl ForecastSink for SinkSet {
    fn record_event(&self, event: &SensorEvent) {
        if !self.record_events {
            return;
        }
        for sink in &self.sinks {
            sink.record_event(event);
        }
    }

    fn emit(&self, result: &ForecastResult) {
        for sink in &self.sinks {
            sink.emit(result);
        }
    }

    fn flush(&self) {
        for sink in &self.sinks {
            sink.flush();
        }
    }
}
