use super::sse::SseDecoder;
use super::{DeviceDescriptor, DeviceDirectory, HistoryPage, HistorySource, LiveSource, LiveStream};
use crate::error::{ConnectionError, DiscoveryError, SourceError};
use crate::telemetry::{parse_stream_payload, ApiEvent, SensorEvent};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://api.disruptive-technologies.com/v2";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Service account key pair used for HTTP basic auth.
#[derive(Clone)]
pub struct CloudCredentials {
    pub key_id: String,
    pub secret: String,
}

impl std::fmt::Debug for CloudCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudCredentials")
            .field("key_id", &self.key_id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// REST + server-sent-event client for one cloud project.
#[derive(Debug, Clone)]
pub struct CloudApi {
    client: Client,
    base_url: String,
    project_id: String,
    credentials: CloudCredentials,
    page_size: u32,
}

#[derive(Debug, Deserialize)]
struct DeviceList {
    #[serde(default)]
    devices: Vec<ApiDevice>,
}

#[derive(Debug, Deserialize)]
struct ApiDevice {
    name: String,
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct EventList {
    #[serde(default)]
    events: Vec<ApiEvent>,
    #[serde(rename = "nextPageToken", default)]
    next_page_token: Option<String>,
}

impl CloudApi {
    pub fn new(
        base_url: impl Into<String>,
        project_id: impl Into<String>,
        credentials: CloudCredentials,
        page_size: u32,
    ) -> Result<Self, SourceError> {
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            project_id: project_id.into(),
            credentials,
            page_size: page_size.max(1),
        })
    }

    fn project_url(&self, suffix: &str) -> String {
        format!("{}/projects/{}/{}", self.base_url, self.project_id, suffix)
    }

    fn get(&self, url: &str) -> RequestBuilder {
        self.client
            .get(url)
            .basic_auth(&self.credentials.key_id, Some(&self.credentials.secret))
    }
}

async fn read_body(response: reqwest::Response) -> Result<Vec<u8>, SourceError> {
    let status = response.status();
    let body = response.bytes().await?;
    if !status.is_success() {
        return Err(SourceError::Status {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).chars().take(512).collect(),
        });
    }
    Ok(body.to_vec())
}

fn decode_devices(body: &mut [u8]) -> Result<Vec<DeviceDescriptor>, SourceError> {
    let list: DeviceList = simd_json::serde::from_slice(body)?;
    Ok(list
        .devices
        .into_iter()
        .map(|device| DeviceDescriptor::new(device.name, device.kind))
        .collect())
}

fn decode_history_page(body: &mut [u8]) -> Result<HistoryPage, SourceError> {
    let list: EventList = simd_json::serde::from_slice(body)?;
    let mut events = Vec::with_capacity(list.events.len());
    for raw in list.events {
        match raw.into_sensor_event() {
            Ok(Some(event)) => events.push(event),
            Ok(None) => {}
            Err(err) => tracing::warn!(error=%err, "skipping undecodable history event"),
        }
    }
    Ok(HistoryPage {
        events,
        next_page_token: list.next_page_token.filter(|token| !token.is_empty()),
    })
}

fn decode_stream_payload(mut payload: Vec<u8>) -> Option<SensorEvent> {
    match parse_stream_payload(&mut payload) {
        Ok(event) => event,
        Err(err) => {
            tracing::warn!(error=%err, "skipping undecodable stream event");
            None
        }
    }
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[async_trait]
impl DeviceDirectory for CloudApi {
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, DiscoveryError> {
        let url = self.project_url("devices");
        let response = self
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(SourceError::from)?;
        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            return Err(DiscoveryError::Unauthorized {
                status: response.status().as_u16(),
            });
        }
        let mut body = read_body(response).await?;
        Ok(decode_devices(&mut body)?)
    }
}

#[async_trait]
impl HistorySource for CloudApi {
    async fn page_history(
        &self,
        sensor_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        page_token: Option<&str>,
    ) -> Result<HistoryPage, SourceError> {
        let url = self.project_url(&format!("devices/{sensor_id}/events"));
        let mut query: Vec<(&str, String)> = vec![
            ("page_size", self.page_size.to_string()),
            ("start_time", rfc3339(start)),
            ("end_time", rfc3339(end)),
            ("event_types", "temperature".to_string()),
        ];
        if let Some(token) = page_token {
            query.push(("page_token", token.to_string()));
        }

        let response = self
            .get(&url)
            .query(&query)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        let mut body = read_body(response).await?;
        let page = decode_history_page(&mut body)?;
        tracing::debug!(
            sensor = sensor_id,
            events = page.events.len(),
            more = page.next_page_token.is_some(),
            "history page"
        );
        Ok(page)
    }
}

#[async_trait]
impl LiveSource for CloudApi {
    async fn subscribe_live(&self, sensor_ids: &[String]) -> Result<LiveStream, ConnectionError> {
        let url = self.project_url("devices:stream");
        let response = self
            .get(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .query(&[("event_types", "temperature")])
            .send()
            .await
            .map_err(|err| ConnectionError::Connect(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ConnectionError::Connect(format!(
                "stream returned {}",
                response.status()
            )));
        }
        tracing::info!(project = %self.project_id, sensors = sensor_ids.len(), "device stream connected");

        let events = response
            .bytes_stream()
            .scan(SseDecoder::new(), |decoder, chunk| {
                let items: Vec<Result<SensorEvent, ConnectionError>> = match chunk {
                    Ok(bytes) => decoder
                        .push(&bytes)
                        .into_iter()
                        .filter_map(decode_stream_payload)
                        .map(Ok)
                        .collect(),
                    Err(err) => vec![Err(ConnectionError::Dropped(err.to_string()))],
                };
                futures::future::ready(Some(items))
            })
            .flat_map(futures::stream::iter);
        Ok(events.boxed())
    }
}
