//! Publication of poll results
//!
//! The scheduler only sees the [`Publisher`] trait. Every call is
//! fire-and-forget: failures are logged here and never reach the poll loop.

use rumqttc::{AsyncClient, QoS};
use tracing::{debug, warn};

use crate::discovery::{self, TopicScheme};
use crate::poll::PollResult;
use crate::registry::Device;

pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

/// Destination of normalized battery state
pub trait Publisher: Send + Sync {
    /// Publishes the state document of an answering battery (no-op for `Offline`)
    fn publish_state(&self, device: &Device, result: &PollResult);

    fn publish_availability(&self, device: &Device, online: bool);

    fn publish_discovery_metadata(&self, device: &Device);
}

/// Non-blocking MQTT publication primitive
pub trait MqttSink: Send + Sync {
    fn try_publish(&self, topic: String, retain: bool, payload: Vec<u8>) -> anyhow::Result<()>;
}

impl MqttSink for AsyncClient {
    fn try_publish(&self, topic: String, retain: bool, payload: Vec<u8>) -> anyhow::Result<()> {
        AsyncClient::try_publish(self, topic, QoS::AtLeastOnce, retain, payload)?;
        Ok(())
    }
}

/// Publishes state, availability and Home Assistant discovery over MQTT
#[derive(Clone)]
pub struct MqttPublisher<S> {
    sink: S,
    topics: TopicScheme,
}

impl<S: MqttSink> MqttPublisher<S> {
    pub fn new(sink: S, topics: TopicScheme) -> Self {
        Self { sink, topics }
    }

    fn send(&self, topic: String, retain: bool, payload: Vec<u8>) {
        if let Err(e) = self.sink.try_publish(topic.clone(), retain, payload) {
            warn!("MQTT publish to {} dropped: {}", topic, e);
        }
    }
}

impl<S: MqttSink> Publisher for MqttPublisher<S> {
    fn publish_state(&self, device: &Device, result: &PollResult) {
        let PollResult::Online(state) = result else {
            return;
        };
        match serde_json::to_vec(state) {
            Ok(payload) => self.send(self.topics.state(&device.device_id), false, payload),
            Err(e) => warn!("state of {} not serializable: {}", device.name, e),
        }
    }

    fn publish_availability(&self, device: &Device, online: bool) {
        let payload = if online { PAYLOAD_ONLINE } else { PAYLOAD_OFFLINE };
        self.send(self.topics.availability(&device.device_id), false, payload.as_bytes().to_vec());
    }

    fn publish_discovery_metadata(&self, device: &Device) {
        for (topic, config) in discovery::sensor_configs(&self.topics, device) {
            match serde_json::to_vec(&config) {
                Ok(payload) => self.send(topic, true, payload),
                Err(e) => warn!("discovery config {} not serializable: {}", topic, e),
            }
        }
        debug!("Published discovery config for {}", device.name);
    }
}

#[cfg(test)]
impl MqttSink for marstek_devkit::MockMqttClient {
    fn try_publish(&self, topic: String, retain: bool, payload: Vec<u8>) -> anyhow::Result<()> {
        marstek_devkit::MockMqttClient::try_publish(self, topic, QoS::AtLeastOnce, retain, payload)
    }
}
