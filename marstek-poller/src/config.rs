//! Configuration management
//!
//! Handles:
//! - Battery list (name, address, Home Assistant identifiers)
//! - MQTT broker settings and topic prefixes
//! - Polling cadence and retry tuning
//! - UDP API port and local bind settings
//!
//! The file is YAML; every section is optional except `batteries`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::exchange::ExchangePolicy;
use crate::lease::BindRetry;

/// Longest accepted poll interval (one day)
const MAX_INTERVAL_SECONDS: u64 = 86_400;
/// Longest accepted per-attempt timeout
const MAX_TIMEOUT_SECONDS: f64 = 300.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub batteries: Vec<BatteryConfig>,
    pub mqtt: MqttConfig,
    pub polling: PollingConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatteryConfig {
    pub name: String,
    /// IPv4 only, the protocol socket is bound on an IPv4 address
    pub ip: Ipv4Addr,
    /// Stable identifier used in topics, defaults to the lower-cased name
    pub device_id: Option<String>,
    /// Home Assistant entity id of the SOC sensor
    pub entity_id: Option<String>,
    /// UDP port of this battery when it differs from `api.port`
    pub port: Option<u16>,
}

impl BatteryConfig {
    pub fn resolved_device_id(&self) -> String {
        self.device_id
            .clone()
            .unwrap_or_else(|| self.name.to_lowercase().replace(' ', "_"))
    }

    pub fn resolved_entity_id(&self) -> String {
        self.entity_id
            .clone()
            .unwrap_or_else(|| format!("marstek_{}_soc", self.resolved_device_id()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub client_id: String,
    pub keep_alive_secs: u64,
    /// How long startup waits for the first broker acknowledgement
    pub connect_timeout_secs: u64,
    /// Capacity of the outgoing request queue
    pub queue_capacity: usize,
    /// Pause before reconnecting after a broker error
    pub reconnect_delay_ms: u64,
    pub discovery_prefix: String,
    pub state_topic_prefix: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            client_id: "marstek_poller".to_string(),
            keep_alive_secs: 60,
            connect_timeout_secs: 5,
            queue_capacity: 64,
            reconnect_delay_ms: 5000,
            discovery_prefix: "homeassistant".to_string(),
            state_topic_prefix: "marstek".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_seconds: u64,
    pub timeout_seconds: f64,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Pause between two batteries of the same cycle
    pub device_spacing_ms: u64,
    /// Close the socket after every cycle and bind it again for the next one
    pub socket_per_cycle: bool,
    /// Granularity of the stop check during the interval sleep
    pub stop_check_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 30,
            timeout_seconds: 3.0,
            max_attempts: 3,
            retry_backoff_ms: 300,
            device_spacing_ms: 100,
            socket_per_cycle: true,
            stop_check_ms: 500,
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn stop_check(&self) -> Duration {
        Duration::from_millis(self.stop_check_ms.max(1))
    }

    pub fn device_spacing(&self) -> Duration {
        Duration::from_millis(self.device_spacing_ms)
    }

    pub fn exchange_policy(&self) -> ExchangePolicy {
        ExchangePolicy {
            timeout: Duration::from_secs_f64(self.timeout_seconds),
            max_attempts: self.max_attempts,
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Protocol port of the batteries
    pub port: u16,
    /// Local port to bind, defaults to `port` (batteries answer to the source port)
    pub local_port: Option<u16>,
    pub bind_address: Ipv4Addr,
    pub bind_attempts: u32,
    pub bind_retry_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: 30000,
            local_port: None,
            bind_address: Ipv4Addr::UNSPECIFIED,
            bind_attempts: 2,
            bind_retry_ms: 200,
        }
    }
}

impl ApiConfig {
    pub fn bind_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.bind_address, self.local_port.unwrap_or(self.port))
    }

    pub fn bind_retry(&self) -> BindRetry {
        BindRetry {
            attempts: self.bind_attempts,
            delay: Duration::from_millis(self.bind_retry_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "INFO".to_string() }
    }
}

impl LoggingConfig {
    /// Level as a tracing filter directive ("WARNING" is accepted for "warn")
    pub fn filter_directive(&self) -> String {
        match self.level.to_ascii_lowercase().as_str() {
            "warning" => "warn".to_string(),
            "critical" | "fatal" => "error".to_string(),
            other => other.to_string(),
        }
    }
}

impl PollerConfig {
    /// Reads, parses, applies environment overrides and validates
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;

        let mut config = Self::from_yaml(&text).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }

    /// MARSTEK_MQTT_* variables take precedence over the file
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("MARSTEK_MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup("MARSTEK_MQTT_PORT").and_then(|p| p.parse().ok()) {
            self.mqtt.port = port;
        }
        if let Some(username) = lookup("MARSTEK_MQTT_USERNAME") {
            self.mqtt.username = username;
        }
        if let Some(password) = lookup("MARSTEK_MQTT_PASSWORD") {
            self.mqtt.password = password;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batteries.is_empty() {
            return Err(ConfigError::Invalid("no batteries configured".into()));
        }

        let mut seen = HashSet::new();
        for battery in &self.batteries {
            let device_id = battery.resolved_device_id();
            if device_id.is_empty() {
                return Err(ConfigError::Invalid(format!("battery '{}' has an empty device_id", battery.name)));
            }
            if !seen.insert(device_id.clone()) {
                return Err(ConfigError::Invalid(format!("duplicate device_id '{}'", device_id)));
            }
        }

        if !(1..=MAX_INTERVAL_SECONDS).contains(&self.polling.interval_seconds) {
            return Err(ConfigError::Invalid(format!(
                "polling.interval_seconds must be between 1 and {}",
                MAX_INTERVAL_SECONDS
            )));
        }
        let timeout = self.polling.timeout_seconds;
        if !(timeout.is_finite() && timeout > 0.0 && timeout <= MAX_TIMEOUT_SECONDS) {
            return Err(ConfigError::Invalid(format!(
                "polling.timeout_seconds must be positive and at most {}",
                MAX_TIMEOUT_SECONDS
            )));
        }
        if self.polling.max_attempts == 0 {
            return Err(ConfigError::Invalid("polling.max_attempts must be at least 1".into()));
        }
        if self.api.bind_attempts == 0 {
            return Err(ConfigError::Invalid("api.bind_attempts must be at least 1".into()));
        }
        Ok(())
    }
}
