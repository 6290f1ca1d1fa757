//! One poll cycle: every battery queried once, in registry order

use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::net::SocketAddrV4;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::codec::{status_params, Outcome, STATUS_METHOD};
use crate::error::{PollerError, Result};
use crate::exchange::{ExchangePolicy, RpcClient};
use crate::lease::{BindRetry, SocketLease};
use crate::registry::{Device, DeviceRegistry};

/// Operating mode reported by ES.GetMode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Mode {
    Auto,
    Manual,
    #[serde(rename = "AI")]
    Ai,
    Passive,
    Unknown,
}

impl Mode {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => Mode::Auto,
            "manual" => Mode::Manual,
            "ai" => Mode::Ai,
            "passive" => Mode::Passive,
            _ => Mode::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Auto => "Auto",
            Mode::Manual => "Manual",
            Mode::Ai => "AI",
            Mode::Passive => "Passive",
            Mode::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized state of an answering battery
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatteryState {
    /// State of charge, 0-100 %
    pub soc: u8,
    pub mode: Mode,
    /// Grid-side power in W, signed
    #[serde(rename = "ongrid_power")]
    pub grid_power: i64,
    /// Backup outlet power in W, signed
    #[serde(rename = "offgrid_power")]
    pub offgrid_power: i64,
    pub timestamp: DateTime<Local>,
}

impl BatteryState {
    /// Extracts the state from an ES.GetMode result; missing fields read as 0 / Unknown
    pub fn from_result(result: &Map<String, Value>) -> Self {
        let soc = number(result, "bat_soc")
            .map(|v| v.round().clamp(0.0, 100.0) as u8)
            .unwrap_or(0);
        let mode = result
            .get("mode")
            .and_then(Value::as_str)
            .map(Mode::parse)
            .unwrap_or(Mode::Unknown);

        Self {
            soc,
            mode,
            grid_power: watts(result, "ongrid_power"),
            offgrid_power: watts(result, "offgrid_power"),
            timestamp: Local::now(),
        }
    }
}

fn number(result: &Map<String, Value>, key: &str) -> Option<f64> {
    match result.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn watts(result: &Map<String, Value>, key: &str) -> i64 {
    number(result, key).map(|v| v.round() as i64).unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollResult {
    Online(BatteryState),
    Offline,
}

impl PollResult {
    pub fn is_online(&self) -> bool {
        matches!(self, PollResult::Online(_))
    }
}

/// Human-readable line for one battery, as printed by `--once`
pub fn report_line(device: &Device, result: &PollResult) -> String {
    match result {
        PollResult::Online(state) => format!(
            "{}: SOC={}% mode={} ongrid={}W offgrid={}W",
            device.name, state.soc, state.mode, state.grid_power, state.offgrid_power
        ),
        PollResult::Offline => format!("{}: no response", device.name),
    }
}

/// Runs status reads against the batteries
#[derive(Debug)]
pub struct Poller {
    rpc: RpcClient,
    policy: ExchangePolicy,
    spacing: Duration,
}

impl Poller {
    pub fn new(policy: ExchangePolicy, spacing: Duration) -> Self {
        Self {
            rpc: RpcClient::new(),
            policy,
            spacing,
        }
    }

    /// Status read of a single battery
    pub async fn query(&self, socket: &UdpSocket, device: &Device) -> PollResult {
        let reply = self
            .rpc
            .exchange(socket, device.address, STATUS_METHOD, &status_params(), &self.policy)
            .await;

        match reply {
            Ok(reply) => match reply.outcome {
                Outcome::Success(result) => {
                    let state = BatteryState::from_result(&result);
                    debug!("{}: SOC={}%, Mode={}", device.name, state.soc, state.mode);
                    PollResult::Online(state)
                }
                Outcome::Error(error) => {
                    let err = PollerError::Protocol { device: device.address, error };
                    warn!("{}: {}", device.name, err);
                    PollResult::Offline
                }
            },
            Err(err) => {
                warn!("{} ({}): {}", device.name, device.address, err);
                PollResult::Offline
            }
        }
    }

    /// Queries every battery sequentially over `socket`; always one result per battery
    pub async fn poll_once(&self, socket: &UdpSocket, registry: &mut DeviceRegistry) -> Vec<(Device, PollResult)> {
        let mut results = Vec::with_capacity(registry.len());

        for index in 0..registry.len() {
            if index > 0 && !self.spacing.is_zero() {
                tokio::time::sleep(self.spacing).await;
            }

            let device = registry.devices()[index].clone();
            let result = self.query(socket, &device).await;

            let was_online = registry.set_online(index, result.is_online());
            match (was_online, result.is_online()) {
                (true, false) => warn!("{} went offline", device.name),
                (false, true) => info!("{} is online", device.name),
                _ => {}
            }

            let device = registry.devices()[index].clone();
            results.push((device, result));
        }

        results
    }

    /// Single cycle on a lease of its own, released before returning
    pub async fn poll_standalone(
        &self,
        bind_addr: SocketAddrV4,
        retry: BindRetry,
        registry: &mut DeviceRegistry,
    ) -> Result<Vec<(Device, PollResult)>> {
        let mut lease = SocketLease::acquire(bind_addr, retry).await?;
        let results = self.poll_once(lease.socket()?, registry).await;
        lease.release();
        Ok(results)
    }
}
