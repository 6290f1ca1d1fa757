//! Marstek Poller - UDP JSON-RPC status poller for Marstek batteries
//!
//! Reads every configured battery over the fixed-port UDP API and
//! republishes the normalized state to MQTT with Home Assistant discovery:
//! - One shared socket on the protocol port, leased per cycle
//! - Echo-aware request/reply matching with per-attempt deadlines
//! - Availability tracking and offline marking on shutdown

pub mod codec;
pub mod config;
pub mod discovery;
pub mod error;
pub mod exchange;
pub mod lease;
pub mod mqtt;
pub mod poll;
pub mod publisher;
pub mod registry;
pub mod scheduler;

pub use config::PollerConfig;
pub use error::{PollerError, Result};
pub use exchange::{ExchangePolicy, RpcClient};
pub use lease::SocketLease;
pub use poll::{BatteryState, Mode, PollResult, Poller};
pub use publisher::{MqttPublisher, Publisher};
pub use registry::{Device, DeviceRegistry};
pub use scheduler::{Scheduler, SchedulerSettings, SchedulerState, StopFlag};
