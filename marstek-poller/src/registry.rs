//! Configured batteries, in polling order

use std::net::SocketAddr;

use crate::config::BatteryConfig;

/// One battery and what the poller last knew about it
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub name: String,
    pub address: SocketAddr,
    pub device_id: String,
    pub entity_id: String,
    online: bool,
}

impl Device {
    pub fn new(name: impl Into<String>, address: SocketAddr, device_id: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address,
            device_id: device_id.into(),
            entity_id: entity_id.into(),
            online: false,
        }
    }

    pub fn is_online(&self) -> bool {
        self.online
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
}

impl DeviceRegistry {
    pub fn new(devices: Vec<Device>) -> Self {
        Self { devices }
    }

    /// Builds the registry from the battery list; `api_port` fills missing ports
    pub fn from_config(batteries: &[BatteryConfig], api_port: u16) -> Self {
        let devices = batteries
            .iter()
            .map(|b| {
                Device::new(
                    b.name.clone(),
                    SocketAddr::from((b.ip, b.port.unwrap_or(api_port))),
                    b.resolved_device_id(),
                    b.resolved_entity_id(),
                )
            })
            .collect();
        Self { devices }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Records the outcome of a poll; returns the previous flag
    pub(crate) fn set_online(&mut self, index: usize, online: bool) -> bool {
        let device = &mut self.devices[index];
        std::mem::replace(&mut device.online, online)
    }

    pub(crate) fn mark_all_offline(&mut self) {
        for device in &mut self.devices {
            device.online = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PollerConfig;

    #[test]
    fn test_from_config_keeps_order_and_ports() {
        let config = PollerConfig::from_yaml(
            r#"
batteries:
  - { name: Fase C, ip: 192.168.6.144 }
  - { name: Fase A, ip: 192.168.6.80, port: 30001, device_id: marstek_fasea_d828 }
"#,
        )
        .unwrap();

        let registry = DeviceRegistry::from_config(&config.batteries, 30000);

        assert_eq!(registry.len(), 2);
        let devices = registry.devices();
        assert_eq!(devices[0].name, "Fase C");
        assert_eq!(devices[0].address, "192.168.6.144:30000".parse().unwrap());
        assert_eq!(devices[0].device_id, "fase_c");
        assert_eq!(devices[1].address.port(), 30001);
        assert_eq!(devices[1].entity_id, "marstek_marstek_fasea_d828_soc");
        assert!(!devices[1].is_online());
    }

    #[test]
    fn test_online_flag_transitions() {
        let mut registry = DeviceRegistry::new(vec![Device::new(
            "Fase A",
            "127.0.0.1:30000".parse().unwrap(),
            "fase_a",
            "marstek_fase_a_soc",
        )]);

        assert!(!registry.set_online(0, true));
        assert!(registry.set_online(0, true));
        assert!(registry.devices()[0].is_online());

        registry.mark_all_offline();
        assert!(!registry.devices()[0].is_online());
    }
}
