use crate::error::SourceError;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// One temperature reading, regardless of whether it came from history or a live feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorEvent {
    pub sensor_id: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl SensorEvent {
    pub fn new(sensor_id: impl Into<String>, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            timestamp,
            value,
        }
    }
}

/// Device and event resource names look like `projects/<p>/devices/<id>`.
pub fn device_id_from_name(name: &str) -> &str {
    let trimmed = name.trim().trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiEvent {
    #[serde(rename = "targetName")]
    target_name: String,
    #[serde(default)]
    data: ApiEventData,
}

#[derive(Debug, Default, Deserialize)]
struct ApiEventData {
    #[serde(default)]
    temperature: Option<ApiTemperature>,
}

#[derive(Debug, Deserialize)]
struct ApiTemperature {
    value: f64,
    #[serde(rename = "updateTime")]
    update_time: String,
}

impl ApiEvent {
    /// Non-temperature events (touch, network status, ...) map to `None`.
    pub(crate) fn into_sensor_event(self) -> Result<Option<SensorEvent>, SourceError> {
        let Some(temperature) = self.data.temperature else {
            return Ok(None);
        };
        let timestamp = parse_rfc3339(&temperature.update_time)?;
        Ok(Some(SensorEvent {
            sensor_id: device_id_from_name(&self.target_name).to_string(),
            timestamp,
            value: temperature.value,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct StreamEnvelope {
    result: StreamResult,
}

#[derive(Debug, Deserialize)]
struct StreamResult {
    event: ApiEvent,
}

/// Decodes one server-sent `data:` payload of the device stream.
pub fn parse_stream_payload(payload: &mut [u8]) -> Result<Option<SensorEvent>, SourceError> {
    let envelope: StreamEnvelope = simd_json::serde::from_slice(payload)?;
    envelope.result.event.into_sensor_event()
}

pub(crate) fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>, SourceError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| SourceError::Decode(format!("bad timestamp {raw:?}: {err}")))
}

#[derive(Debug, Deserialize)]
struct BorrowedTelemetry<'a> {
    #[serde(default, borrow)]
    timestamp: Option<BorrowedTimestamp<'a>>,
    value: f64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BorrowedTimestamp<'a> {
    Str(&'a str),
    Int(i64),
    Float(f64),
}

impl<'a> BorrowedTimestamp<'a> {
    fn to_datetime(&self) -> Result<DateTime<Utc>, SourceError> {
        match self {
            BorrowedTimestamp::Str(s) => parse_rfc3339(s),
            BorrowedTimestamp::Int(ms) => millis_to_dt(*ms),
            BorrowedTimestamp::Float(ts) if ts.is_finite() => millis_to_dt((*ts * 1000.0) as i64),
            BorrowedTimestamp::Float(ts) => {
                Err(SourceError::Decode(format!("non-finite timestamp {ts}")))
            }
        }
    }
}

fn millis_to_dt(ms: i64) -> Result<DateTime<Utc>, SourceError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| SourceError::Decode(format!("timestamp {ms}ms is out of range")))
}

/// Topics are `<prefix>/<node>/<sensor_id>/telemetry`; anything else is ignored.
pub fn parse_mqtt_payload(
    topic_prefix: &str,
    topic: &str,
    payload: &mut [u8],
    received_at: DateTime<Utc>,
) -> Result<Option<SensorEvent>, SourceError> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() != 4 || parts[0] != topic_prefix || parts[3] != "telemetry" {
        return Ok(None);
    }

    let sensor_id = parts[2].to_string();
    let telemetry: BorrowedTelemetry = simd_json::serde::from_slice(payload)?;
    let timestamp = match telemetry.timestamp.as_ref() {
        Some(ts) => ts.to_datetime()?,
        None => received_at,
    };

    Ok(Some(SensorEvent {
        sensor_id,
        timestamp,
        value: telemetry.value,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_is_last_path_segment() {
        assert_eq!(
            device_id_from_name("projects/abc/devices/bchonol7rihjtvdmd2vg"),
            "bchonol7rihjtvdmd2vg"
        );
        assert_eq!(device_id_from_name("local_file"), "local_file");
    }

    #[test]
    fn stream_payload_decodes_temperature_event() {
        let mut payload = br#"{"result":{"event":{"eventId":"x","targetName":"projects/p/devices/S1","eventType":"temperature","data":{"temperature":{"value":41.5,"updateTime":"2020-03-19T11:22:33.123Z"}}}}}"#.to_vec();
        let event = parse_stream_payload(&mut payload).expect("decode").expect("event");
        assert_eq!(event.sensor_id, "S1");
        assert!((event.value - 41.5).abs() < 1e-12);
        assert_eq!(event.timestamp.timestamp_millis(), 1_584_616_953_123);
    }

    #[test]
    fn stream_payload_skips_other_event_types() {
        let mut payload = br#"{"result":{"event":{"targetName":"projects/p/devices/S1","data":{"touch":{"updateTime":"2020-03-19T11:22:33Z"}}}}}"#.to_vec();
        assert!(parse_stream_payload(&mut payload).expect("decode").is_none());
    }

    #[test]
    fn mqtt_payload_uses_topic_sensor_and_payload_time() {
        let now = Utc::now();
        let mut payload = br#"{"value":22.25,"timestamp":1700000000000}"#.to_vec();
        let event = parse_mqtt_payload("iot", "iot/node-1/S2/telemetry", &mut payload, now)
            .expect("decode")
            .expect("event");
        assert_eq!(event.sensor_id, "S2");
        assert_eq!(event.timestamp.timestamp(), 1_700_000_000);

        let mut payload = br#"{"value":22.25}"#.to_vec();
        let event = parse_mqtt_payload("iot", "iot/node-1/S2/telemetry", &mut payload, now)
            .expect("decode")
            .expect("event");
        assert_eq!(event.timestamp, now);
    }

    #[test]
    fn mqtt_payload_with_out_of_range_time_is_rejected() {
        let mut payload = br#"{"value":22.25,"timestamp":9223372036854775807}"#.to_vec();
        let err = parse_mqtt_payload("iot", "iot/node-1/S2/telemetry", &mut payload, Utc::now())
            .expect_err("out of range");
        assert!(matches!(err, SourceError::Decode(_)));
    }

    #[test]
    fn mqtt_payload_ignores_foreign_topics() {
        let mut payload = br#"{"value":1.0}"#.to_vec();
        let parsed = parse_mqtt_payload("iot", "iot/node-1/status", &mut payload, Utc::now())
            .expect("decode");
        assert!(parsed.is_none());
    }
}
