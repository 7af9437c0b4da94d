use super::{LiveSource, LiveStream};
use crate::error::ConnectionError;
use crate::telemetry::{parse_mqtt_payload, SensorEvent};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tokio::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    pub keepalive: Duration,
}

/// Live readings republished on a local broker by the sensor gateway.
#[derive(Debug, Clone)]
pub struct MqttLiveSource {
    settings: MqttSettings,
}

impl MqttLiveSource {
    pub fn new(settings: MqttSettings) -> Self {
        Self { settings }
    }

    fn telemetry_filter(&self) -> String {
        format!("{}/+/+/telemetry", self.settings.topic_prefix)
    }

    fn options(&self) -> MqttOptions {
        let settings = &self.settings;
        let mut options = MqttOptions::new(
            settings.client_id.clone(),
            settings.host.clone(),
            settings.port,
        );
        options.set_keep_alive(settings.keepalive);
        if let Some(username) = &settings.username {
            options.set_credentials(username.clone(), settings.password.clone().unwrap_or_default());
        }
        options
    }
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<(), ConnectionError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => return Ok(()),
            Ok(_) => {}
            Err(err) => return Err(ConnectionError::Connect(err.to_string())),
        }
    }
}

struct Subscription {
    _client: AsyncClient,
    eventloop: EventLoop,
    topic_prefix: String,
}

async fn next_event(
    mut sub: Subscription,
) -> Option<(Result<SensorEvent, ConnectionError>, Subscription)> {
    loop {
        match sub.eventloop.poll().await {
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let mut payload = publish.payload.to_vec();
                match parse_mqtt_payload(&sub.topic_prefix, &publish.topic, &mut payload, Utc::now()) {
                    Ok(Some(event)) => return Some((Ok(event), sub)),
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(error=%err, topic=%publish.topic, "failed to decode MQTT payload")
                    }
                }
            }
            Ok(_) => {}
            Err(err) => return Some((Err(ConnectionError::Dropped(err.to_string())), sub)),
        }
    }
}

#[async_trait]
impl LiveSource for MqttLiveSource {
    async fn subscribe_live(&self, sensor_ids: &[String]) -> Result<LiveStream, ConnectionError> {
        let filter = self.telemetry_filter();
        let (client, mut eventloop) = AsyncClient::new(self.options(), 32);

        tokio::time::timeout(CONNECT_TIMEOUT, await_connack(&mut eventloop))
            .await
            .map_err(|_| ConnectionError::Connect("timed out waiting for broker".to_string()))??;
        client
            .subscribe(filter.clone(), QoS::AtLeastOnce)
            .await
            .map_err(|err| ConnectionError::Connect(err.to_string()))?;
        tracing::info!(topic=%filter, sensors = sensor_ids.len(), "subscribed to telemetry feed");

        let sub = Subscription {
            _client: client,
            eventloop,
            topic_prefix: self.settings.topic_prefix.clone(),
        };
        Ok(futures::stream::unfold(sub, next_event).boxed())
    }
}
