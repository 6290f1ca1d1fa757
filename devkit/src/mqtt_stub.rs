/*!
Mock MQTT client for development without a broker

Records every publication so tests can assert on topics and payloads.
The publish path mirrors `rumqttc::AsyncClient::try_publish` (synchronous,
non-blocking), and a broker outage can be simulated with `set_offline`.
*/

use rumqttc::QoS;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use anyhow::Result;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl MockMessage {
    /// Payload as UTF-8 text (lossy)
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Mock MQTT client standing in for rumqttc::AsyncClient
#[derive(Clone)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    offline: Arc<AtomicBool>,
    rejected: Arc<Mutex<usize>>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self {
            published_messages: Arc::new(Mutex::new(Vec::new())),
            offline: Arc::new(AtomicBool::new(false)),
            rejected: Arc::new(Mutex::new(0)),
        }
    }

    /// Simulates a broker outage: publications are rejected while set
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Records a publication (same shape as AsyncClient::try_publish)
    pub fn try_publish<S, V>(&self, topic: S, qos: QoS, retain: bool, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let message = MockMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        };

        if self.offline.load(Ordering::SeqCst) {
            *self.rejected.lock().unwrap() += 1;
            anyhow::bail!("[MOCK] broker unavailable, dropped {}", message.topic);
        }

        log::debug!("[MOCK] Published to {}: {} bytes", message.topic, message.payload.len());
        self.published_messages.lock().unwrap().push(message);
        Ok(())
    }

    /// All recorded publications, oldest first
    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().unwrap().clone()
    }

    /// Number of publications refused while offline
    pub fn rejected_count(&self) -> usize {
        *self.rejected.lock().unwrap()
    }

    /// Publications on one topic
    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .unwrap()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Parses the last message of a topic as JSON
    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let messages = self.find_messages_by_topic(topic);
        if let Some(last_msg) = messages.last() {
            let parsed: T = serde_json::from_slice(&last_msg.payload)?;
            Ok(Some(parsed))
        } else {
            Ok(None)
        }
    }
}

impl Default for MockMqttClient {
    fn default() -> Self {
        Self::new()
    }
}
