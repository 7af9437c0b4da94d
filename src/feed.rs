use crate::forecast::ForecastResult;
use crate::sink::ForecastSink;
use crate::telemetry::SensorEvent;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};

pub const FEED_TOKEN_HEADER: &str = "X-Forecast-Ingest-Token";

#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub url: String,
    pub token: Option<String>,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub queue: usize,
}

/// Ships forecasts to an HTTP endpoint in batches from a background task.
#[derive(Clone)]
pub struct FeedSink {
    tx: mpsc::Sender<FeedItem>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    Observed,
    Forecast,
}

#[derive(Clone, Debug, Serialize)]
pub struct FeedItem {
    pub kind: FeedKind,
    pub sensor_id: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_estimate: Option<f64>,
}

#[derive(Serialize)]
struct FeedPayload<'a> {
    items: &'a [FeedItem],
}

impl FeedSink {
    /// Starts the batching task. It drains and exits once every `FeedSink` clone is dropped.
    pub fn spawn(settings: FeedSettings) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(settings.queue.max(1));
        let handle = tokio::spawn(run_feed(rx, settings));
        (Self { tx }, handle)
    }

    fn enqueue(&self, item: FeedItem) {
        if let Err(err) = self.tx.try_send(item) {
            tracing::warn!(error=%err, "forecast feed queue full; dropping item");
        }
    }
}

impl ForecastSink for FeedSink {
    fn record_event(&self, event: &SensorEvent) {
        self.enqueue(FeedItem {
            kind: FeedKind::Observed,
            sensor_id: event.sensor_id.clone(),
            timestamp: event.timestamp,
            value: event.value,
            target_time: None,
            error_estimate: None,
        });
    }

    fn emit(&self, result: &ForecastResult) {
        self.enqueue(FeedItem {
            kind: FeedKind::Forecast,
            sensor_id: result.sensor_id.clone(),
            timestamp: result.as_of,
            value: result.predicted_value,
            target_time: Some(result.target_time),
            error_estimate: result.error_estimate,
        });
    }
}

async fn run_feed(mut rx: mpsc::Receiver<FeedItem>, settings: FeedSettings) {
    let client = Client::new();
    let batch_size = settings.batch_size.max(1);
    let mut ticker = tokio::time::interval(settings.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut buffer: Vec<FeedItem> = Vec::with_capacity(batch_size);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = flush_feed(&client, &settings, &mut buffer).await {
                    tracing::warn!(error=%err, "forecast feed flush failed");
                }
            }
            msg = rx.recv() => {
                match msg {
                    Some(item) => {
                        buffer.push(item);
                        if buffer.len() >= batch_size {
                            if let Err(err) = flush_feed(&client, &settings, &mut buffer).await {
                                tracing::warn!(error=%err, "forecast feed flush failed");
                            }
                        }
                    }
                    None => {
                        if let Err(err) = flush_feed(&client, &settings, &mut buffer).await {
                            tracing::warn!(error=%err, "final forecast feed flush failed");
                        }
                        break;
                    }
                }
            }
        }
    }
}

async fn flush_feed(
    client: &Client,
    settings: &FeedSettings,
    buffer: &mut Vec<FeedItem>,
) -> Result<(), reqwest::Error> {
    if buffer.is_empty() {
        return Ok(());
    }

    let payload = FeedPayload { items: buffer };
    let mut request = client.post(&settings.url).json(&payload);
    if let Some(token) = settings.token.as_deref() {
        request = request.header(FEED_TOKEN_HEADER, token);
    }
    let sent = buffer.len();
    buffer.clear();

    let response = request.send().await?;
    if !response.status().is_success() {
        tracing::warn!(status=%response.status(), items = sent, "forecast feed returned non-success");
    }
    Ok(())
}
