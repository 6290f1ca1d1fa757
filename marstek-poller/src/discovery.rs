//! Home Assistant MQTT discovery configs
//!
//! Each battery is announced as three sensors (SOC, mode, grid power) that
//! read from the battery's state topic. Only the SOC sensor carries the
//! availability block.

use serde_json::{json, Value};

use crate::registry::Device;

/// Topic layout shared by the discovery configs and the publisher
#[derive(Debug, Clone)]
pub struct TopicScheme {
    pub discovery_prefix: String,
    pub state_prefix: String,
}

impl TopicScheme {
    pub fn new(discovery_prefix: impl Into<String>, state_prefix: impl Into<String>) -> Self {
        Self {
            discovery_prefix: discovery_prefix.into(),
            state_prefix: state_prefix.into(),
        }
    }

    pub fn state(&self, device_id: &str) -> String {
        format!("{}/{}/state", self.state_prefix, device_id)
    }

    pub fn availability(&self, device_id: &str) -> String {
        format!("{}/{}/availability", self.state_prefix, device_id)
    }

    pub fn sensor_config(&self, device_id: &str, sensor: &str) -> String {
        format!("{}/sensor/{}_{}/config", self.discovery_prefix, device_id, sensor)
    }
}

/// Entity id of a sibling sensor derived from the SOC entity id
pub fn sibling_entity_id(soc_entity_id: &str, kind: &str) -> String {
    soc_entity_id
        .replace("state_of_charge", kind)
        .replace("_soc", &format!("_{kind}"))
}

fn device_block(device: &Device) -> Value {
    json!({
        "identifiers": [device.device_id],
        "name": format!("Marstek {}", device.name),
        "manufacturer": "Marstek",
        "model": "Venus E"
    })
}

/// `(topic, payload)` of every discovery config of a battery
pub fn sensor_configs(topics: &TopicScheme, device: &Device) -> Vec<(String, Value)> {
    let state_topic = topics.state(&device.device_id);
    let soc_id = device.entity_id.clone();
    let mode_id = sibling_entity_id(&soc_id, "mode");
    let power_id = sibling_entity_id(&soc_id, "power");

    let soc = json!({
        "name": format!("{} SOC", device.name),
        "state_topic": state_topic,
        "value_template": "{{ value_json.soc }}",
        "unit_of_measurement": "%",
        "device_class": "battery",
        "state_class": "measurement",
        "unique_id": soc_id,
        "object_id": soc_id,
        "device": device_block(device),
        "availability": {
            "topic": topics.availability(&device.device_id),
            "payload_available": "online",
            "payload_not_available": "offline"
        }
    });

    let mode = json!({
        "name": format!("{} Mode", device.name),
        "state_topic": state_topic,
        "value_template": "{{ value_json.mode }}",
        "unique_id": mode_id,
        "object_id": mode_id,
        "icon": "mdi:battery-sync",
        "device": device_block(device)
    });

    let power = json!({
        "name": format!("{} Power", device.name),
        "state_topic": state_topic,
        "value_template": "{{ value_json.ongrid_power }}",
        "unit_of_measurement": "W",
        "device_class": "power",
        "state_class": "measurement",
        "unique_id": power_id,
        "object_id": power_id,
        "device": device_block(device)
    });

    vec![
        (topics.sensor_config(&device.device_id, "soc"), soc),
        (topics.sensor_config(&device.device_id, "mode"), mode),
        (topics.sensor_config(&device.device_id, "power"), power),
    ]
}
