use super::{DeviceDescriptor, DeviceDirectory, HistoryPage, HistorySource, TEMPERATURE_KIND};
use crate::error::{DiscoveryError, SourceError};
use crate::telemetry::SensorEvent;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::path::Path;

pub const LOCAL_SENSOR_ID: &str = "local_file";

#[derive(Debug, Deserialize)]
struct CsvRow {
    unix_time: f64,
    temperature: f64,
}

/// A recorded series exposed as the history of one pseudo-device.
#[derive(Debug, Clone)]
pub struct CsvFileSource {
    events: Vec<SensorEvent>,
    page_size: usize,
}

impl CsvFileSource {
    pub fn open(path: impl AsRef<Path>, page_size: usize) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;

        let headers = reader.headers()?;
        for column in ["unix_time", "temperature"] {
            if !headers.iter().any(|h| h == column) {
                return Err(SourceError::Decode(format!(
                    "{} is missing the {column:?} column",
                    path.display()
                )));
            }
        }

        let mut events = Vec::new();
        for row in reader.deserialize::<CsvRow>() {
            let row = row?;
            let Some(timestamp) = unix_seconds(row.unix_time) else {
                tracing::warn!(unix_time = row.unix_time, "skipping row with unrepresentable time");
                continue;
            };
            events.push(SensorEvent::new(LOCAL_SENSOR_ID, timestamp, row.temperature));
        }
        events.sort_by_key(|event| event.timestamp);
        tracing::info!(path = %path.display(), rows = events.len(), "loaded local event file");

        Ok(Self {
            events,
            page_size: page_size.max(1),
        })
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// First and last timestamps in the file.
    pub fn span(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        Some((self.events.first()?.timestamp, self.events.last()?.timestamp))
    }

    /// Events with `start <= timestamp <= end`; rows are kept sorted by time.
    fn range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> &[SensorEvent] {
        let lo = self.events.partition_point(|event| event.timestamp < start);
        let hi = self.events.partition_point(|event| event.timestamp <= end);
        self.events.get(lo..hi).unwrap_or_default()
    }
}

fn unix_seconds(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    Utc.timestamp_millis_opt((secs * 1000.0).round() as i64).single()
}

#[async_trait]
impl DeviceDirectory for CsvFileSource {
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, DiscoveryError> {
        Ok(vec![DeviceDescriptor::new(LOCAL_SENSOR_ID, TEMPERATURE_KIND)])
    }
}

#[async_trait]
impl HistorySource for CsvFileSource {
    async fn page_history(
        &self,
        sensor_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        page_token: Option<&str>,
    ) -> Result<HistoryPage, SourceError> {
        if sensor_id != LOCAL_SENSOR_ID {
            return Ok(HistoryPage::default());
        }
        let offset = match page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| SourceError::Decode(format!("bad page token {token:?}")))?,
            None => 0,
        };

        let in_range = self.range(start, end);
        let events: Vec<SensorEvent> = in_range
            .iter()
            .skip(offset)
            .take(self.page_size)
            .cloned()
            .collect();
        let next = offset + events.len();
        Ok(HistoryPage {
            events,
            next_page_token: (next < in_range.len()).then(|| next.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(contents.as_bytes()).expect("write");
        file
    }

    #[tokio::test]
    async fn pages_through_sorted_rows() {
        let file = write_file("unix_time,temperature\n1584616980,21.0\n1584616920,20.5\n1584617040,21.5\n");
        let source = CsvFileSource::open(file.path(), 2).expect("open");
        assert_eq!(source.len(), 3);
        let (start, end) = source.span().expect("span");

        let first = source
            .page_history(LOCAL_SENSOR_ID, start, end, None)
            .await
            .expect("page");
        assert_eq!(first.events.len(), 2);
        assert_eq!(first.events[0].value, 20.5);
        let token = first.next_page_token.expect("more");

        let second = source
            .page_history(LOCAL_SENSOR_ID, start, end, Some(&token))
            .await
            .expect("page");
        assert_eq!(second.events.len(), 1);
        assert_eq!(second.events[0].value, 21.5);
        assert_eq!(second.next_page_token, None);
    }

    #[tokio::test]
    async fn pages_only_the_requested_range() {
        let rows: String = (0..10).map(|i| format!("{},{}\n", 1_584_616_800 + 60 * i, 20 + i)).collect();
        let file = write_file(&format!("unix_time,temperature\n{rows}"));
        let source = CsvFileSource::open(file.path(), 2).expect("open");
        let (first, _) = source.span().expect("span");
        let start = first + chrono::Duration::minutes(3);
        let end = first + chrono::Duration::minutes(6);

        let mut values = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = source
                .page_history(LOCAL_SENSOR_ID, start, end, token.as_deref())
                .await
                .expect("page");
            values.extend(page.events.iter().map(|e| e.value));
            match page.next_page_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        assert_eq!(values, vec![23.0, 24.0, 25.0, 26.0]);

        let empty = source
            .page_history(LOCAL_SENSOR_ID, end, start, None)
            .await
            .expect("page");
        assert!(empty.events.is_empty());
        assert_eq!(empty.next_page_token, None);
    }

    #[tokio::test]
    async fn lists_a_single_pseudo_device() {
        let file = write_file("temperature,unix_time\n20.0,1584616920\n");
        let source = CsvFileSource::open(file.path(), 10).expect("open");
        let devices = source.list_devices().await.expect("devices");
        assert_eq!(devices, vec![DeviceDescriptor::new("local_file", "temperature")]);
    }

    #[test]
    fn rejects_files_without_required_columns() {
        let file = write_file("time,value\n1,2\n");
        let err = CsvFileSource::open(file.path(), 10).expect_err("missing columns");
        assert!(err.to_string().contains("unix_time"));
    }
}
