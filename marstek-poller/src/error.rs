//! Error taxonomy of the poller core

use std::net::SocketAddr;
use thiserror::Error;

use crate::codec::RpcError;

#[derive(Debug, Error)]
pub enum PollerError {
    /// The fixed local port could not be bound, even after retrying
    #[error("UDP port {addr} is unavailable after {attempts} attempt(s): {source}")]
    BindConflict {
        addr: SocketAddr,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// Every attempt of an exchange ran out without a matching reply
    #[error("no response from {device} after {attempts} attempt(s)")]
    NoResponse { device: SocketAddr, attempts: u32 },

    /// The device answered with an explicit error object
    #[error("{device} rejected the request: {error}")]
    Protocol { device: SocketAddr, error: RpcError },

    #[error("socket lease has been released")]
    LeaseReleased,

    #[error("request encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PollerError>;
