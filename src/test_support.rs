//! In-memory sources and sinks for unit tests.

use crate::error::{ConnectionError, DiscoveryError, SourceError};
use crate::forecast::ForecastResult;
use crate::sink::ForecastSink;
use crate::source::{
    DeviceDescriptor, DeviceDirectory, HistoryPage, HistorySource, LiveSource, LiveStream,
};
use crate::telemetry::SensorEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub struct StaticDirectory {
    devices: Vec<DeviceDescriptor>,
}

impl StaticDirectory {
    pub fn new(devices: Vec<DeviceDescriptor>) -> Self {
        Self { devices }
    }
}

#[async_trait]
impl DeviceDirectory for StaticDirectory {
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, DiscoveryError> {
        Ok(self.devices.clone())
    }
}

struct PageFault {
    page: usize,
    remaining: u32,
}

/// Serves per-sensor events in fixed-size pages; page tokens are page indexes.
pub struct FakeHistory {
    page_size: usize,
    events: HashMap<String, Vec<SensorEvent>>,
    faults: Mutex<HashMap<String, PageFault>>,
    cancel_on_call: Option<(usize, CancellationToken)>,
    pub calls: AtomicUsize,
}

impl FakeHistory {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            events: HashMap::new(),
            faults: Mutex::new(HashMap::new()),
            cancel_on_call: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_events(mut self, sensor_id: &str, events: Vec<SensorEvent>) -> Self {
        self.events.insert(sensor_id.to_string(), events);
        self
    }

    /// Cancels `token` while serving the `call`-th request; that page is still returned.
    pub fn cancelling_on_call(mut self, call: usize, token: CancellationToken) -> Self {
        self.cancel_on_call = Some((call, token));
        self
    }

    /// Fails requests for `page` of `sensor_id` the next `times` times.
    pub fn failing(self, sensor_id: &str, page: usize, times: u32) -> Self {
        if let Ok(mut faults) = self.faults.lock() {
            faults.insert(sensor_id.to_string(), PageFault { page, remaining: times });
        }
        self
    }
}

#[async_trait]
impl HistorySource for FakeHistory {
    async fn page_history(
        &self,
        sensor_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        page_token: Option<&str>,
    ) -> Result<HistoryPage, SourceError> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some((at, token)) = &self.cancel_on_call {
            if *at == call {
                token.cancel();
            }
        }
        let page: usize = page_token.map(|t| t.parse().unwrap_or(0)).unwrap_or(0);

        if let Ok(mut faults) = self.faults.lock() {
            if let Some(fault) = faults.get_mut(sensor_id) {
                if fault.page == page && fault.remaining > 0 {
                    fault.remaining -= 1;
                    return Err(SourceError::Status {
                        status: 503,
                        body: "unavailable".into(),
                    });
                }
            }
        }

        let in_range: Vec<SensorEvent> = self
            .events
            .get(sensor_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.timestamp >= start && e.timestamp <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let events: Vec<SensorEvent> = in_range
            .iter()
            .skip(page * self.page_size)
            .take(self.page_size)
            .cloned()
            .collect();
        let more = (page + 1) * self.page_size < in_range.len();
        Ok(HistoryPage {
            events,
            next_page_token: more.then(|| (page + 1).to_string()),
        })
    }
}

pub enum Session {
    Refuse(&'static str),
    Events(Vec<Result<SensorEvent, ConnectionError>>),
    /// Delivers the events, then never yields again.
    EventsThenHang(Vec<SensorEvent>),
}

/// Hands out one scripted session per subscribe call; refuses once the script runs out.
pub struct ScriptedLive {
    sessions: Mutex<VecDeque<Session>>,
    pub subscribes: AtomicUsize,
}

impl ScriptedLive {
    pub fn new(sessions: Vec<Session>) -> Self {
        Self {
            sessions: Mutex::new(sessions.into()),
            subscribes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LiveSource for ScriptedLive {
    async fn subscribe_live(&self, _sensor_ids: &[String]) -> Result<LiveStream, ConnectionError> {
        self.subscribes.fetch_add(1, Ordering::Relaxed);
        let next = self.sessions.lock().ok().and_then(|mut s| s.pop_front());
        match next {
            None => Err(ConnectionError::Connect("script exhausted".into())),
            Some(Session::Refuse(reason)) => Err(ConnectionError::Connect(reason.into())),
            Some(Session::Events(items)) => Ok(futures::stream::iter(items).boxed()),
            Some(Session::EventsThenHang(events)) => Ok(futures::stream::iter(events.into_iter().map(Ok))
                .chain(futures::stream::pending())
                .boxed()),
        }
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SensorEvent>>,
    forecasts: Mutex<Vec<ForecastResult>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<SensorEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn forecasts(&self) -> Vec<ForecastResult> {
        self.forecasts.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

impl ForecastSink for RecordingSink {
    fn record_event(&self, event: &SensorEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }

    fn emit(&self, result: &ForecastResult) {
        if let Ok(mut forecasts) = self.forecasts.lock() {
            forecasts.push(result.clone());
        }
    }
}
