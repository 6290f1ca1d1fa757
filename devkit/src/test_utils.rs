/*!
Test harness for the poller

Bundles the mock MQTT client with the assertions the poller tests need:
- availability and state topics per battery
- retained discovery configs
- nested JSON field checks
*/

use crate::mqtt_stub::MockMqttClient;
use serde_json::Value;
use std::collections::HashMap;
use anyhow::Result;

/// Default state topic prefix used by the poller
pub const STATE_PREFIX: &str = "marstek";

/// Test harness around a mock MQTT client
pub struct TestHarness {
    pub mqtt_client: MockMqttClient,
}

impl TestHarness {
    pub fn new() -> Self {
        env_logger::try_init().ok();

        Self {
            mqtt_client: MockMqttClient::new(),
        }
    }

    pub fn state_topic(&self, device_id: &str) -> String {
        format!("{}/{}/state", STATE_PREFIX, device_id)
    }

    pub fn availability_topic(&self, device_id: &str) -> String {
        format!("{}/{}/availability", STATE_PREFIX, device_id)
    }

    /// Every availability payload published for a battery, oldest first
    pub fn availability_history(&self, device_id: &str) -> Vec<String> {
        self.mqtt_client
            .find_messages_by_topic(&self.availability_topic(device_id))
            .iter()
            .map(|m| m.payload_str())
            .collect()
    }

    /// Last state document published for a battery
    pub fn last_state(&self, device_id: &str) -> Result<Option<Value>> {
        self.mqtt_client.get_last_json_message(&self.state_topic(device_id))
    }

    /// Asserts the last availability payload of a battery
    pub fn assert_availability(&self, device_id: &str, expected: &str) -> Result<()> {
        match self.availability_history(device_id).last() {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => anyhow::bail!(
                "Availability mismatch for '{}': expected {}, got {}",
                device_id, expected, actual
            ),
            None => anyhow::bail!("No availability published for '{}'", device_id),
        }
    }

    /// Asserts that a retained message was published on a topic
    pub fn assert_retained(&self, topic: &str) -> Result<()> {
        let messages = self.mqtt_client.find_messages_by_topic(topic);
        if messages.is_empty() {
            anyhow::bail!("Expected message not found on topic: {}", topic);
        }
        if !messages.iter().all(|m| m.retain) {
            anyhow::bail!("Message on {} was not retained", topic);
        }
        Ok(())
    }

    /// Asserts that a field of the last JSON message has a given value
    pub fn assert_field_equals(&self, topic: &str, field_path: &str, expected: &Value) -> Result<()> {
        if let Some(msg) = self.mqtt_client.get_last_json_message::<Value>(topic)? {
            if let Some(actual) = get_nested_field(&msg, field_path) {
                if actual == expected {
                    log::info!("Field '{}' = {:?} in {}", field_path, expected, topic);
                    return Ok(());
                } else {
                    anyhow::bail!("Field '{}' mismatch: expected {:?}, got {:?}",
                                 field_path, expected, actual);
                }
            }
        }

        anyhow::bail!("Field '{}' not found for comparison in {}", field_path, topic);
    }

    /// Count of publications per topic
    pub fn topic_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for msg in self.mqtt_client.get_published_messages() {
            *counts.entry(msg.topic).or_insert(0) += 1;
        }
        counts
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn get_nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;

    for part in path.split('.') {
        match current {
            Value::Object(obj) => {
                current = obj.get(part)?;
            }
            _ => return None,
        }
    }

    Some(current)
}
