//! Request/response correlation over the shared UDP socket
//!
//! One exchange = up to `max_attempts` requests, each with a fresh id and
//! its own deadline. Datagrams that are not the answer to the current
//! request (echoes, garbage, stale ids, other hosts) are dropped without
//! ending the wait and without extending it.

use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::codec::{self, EncodedRequest, Reply};
use crate::error::{PollerError, Result};

/// Largest datagram the batteries can send
const MAX_DATAGRAM: usize = 65_535;

/// Timing of one exchange
#[derive(Debug, Clone, Copy)]
pub struct ExchangePolicy {
    /// Deadline of a single attempt, counted from the send
    pub timeout: Duration,
    /// Requests sent before giving up, at least 1
    pub max_attempts: u32,
    /// Pause between a timed-out attempt and the next one
    pub backoff: Duration,
}

impl Default for ExchangePolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            max_attempts: 3,
            backoff: Duration::from_millis(300),
        }
    }
}

/// What an inbound datagram means for the request in flight
#[derive(Debug, PartialEq)]
pub enum Verdict {
    /// The answer to the request (success or error object)
    Matched(Reply),
    /// The request sent back verbatim
    Echo,
    /// Not a reply at all
    Undecodable(String),
    /// A reply to some other request id
    Stale(u64),
    /// Sent by a host other than the queried device
    Foreign(SocketAddr),
}

/// Decides what to do with one datagram received while `sent` is outstanding
pub fn classify(datagram: &[u8], source: SocketAddr, device: SocketAddr, sent: &EncodedRequest) -> Verdict {
    if source.ip() != device.ip() {
        return Verdict::Foreign(source);
    }
    if sent.is_echo(datagram) {
        return Verdict::Echo;
    }
    match codec::decode(datagram) {
        Ok(reply) if reply.id == sent.id() => Verdict::Matched(reply),
        Ok(reply) => Verdict::Stale(reply.id),
        Err(e) => Verdict::Undecodable(e.to_string()),
    }
}

/// Next request id; shared by every client so ids never repeat within the process
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Issues requests with process-unique ids
#[derive(Debug)]
pub struct RpcClient;

impl RpcClient {
    pub fn new() -> Self {
        RpcClient
    }

    fn allocate_id(&self) -> u64 {
        NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
    }

    /// Calls `method` on `device` and waits for its reply
    ///
    /// An error object with the matching id is returned as a reply, not
    /// retried. Fails with [`PollerError::NoResponse`] once every attempt
    /// timed out.
    pub async fn exchange(
        &self,
        socket: &UdpSocket,
        device: SocketAddr,
        method: &str,
        params: &Value,
        policy: &ExchangePolicy,
    ) -> Result<Reply> {
        let attempts = policy.max_attempts.max(1);
        let mut buf = vec![0u8; MAX_DATAGRAM];

        for attempt in 1..=attempts {
            let request = codec::encode(method, params, self.allocate_id())?;

            if let Some(reply) = self.attempt(socket, device, &request, policy.timeout, &mut buf).await {
                debug!("{} answered {} (id {}) on attempt {}", device, method, reply.id, attempt);
                return Ok(reply);
            }

            if attempt < attempts {
                debug!("{} attempt {}/{} timed out, backing off", device, attempt, attempts);
                tokio::time::sleep(policy.backoff).await;
            }
        }

        Err(PollerError::NoResponse { device, attempts })
    }

    async fn attempt(
        &self,
        socket: &UdpSocket,
        device: SocketAddr,
        request: &EncodedRequest,
        timeout: Duration,
        buf: &mut [u8],
    ) -> Option<Reply> {
        if let Err(e) = socket.send_to(request.as_bytes(), device).await {
            warn!("send to {} failed: {}", device, e);
            return None;
        }
        let deadline = Instant::now() + timeout;

        loop {
            let (len, source) = match tokio::time::timeout_at(deadline, socket.recv_from(buf)).await {
                Err(_) => return None,
                Ok(Err(e)) => {
                    warn!("receive while waiting for {} failed: {}", device, e);
                    return None;
                }
                Ok(Ok(received)) => received,
            };

            match classify(&buf[..len], source, device, request) {
                Verdict::Matched(reply) => return Some(reply),
                Verdict::Echo => trace!("dropping echo of request {} from {}", request.id(), device),
                Verdict::Stale(id) => {
                    debug!("dropping reply id {} from {} (waiting for {})", id, device, request.id())
                }
                Verdict::Undecodable(reason) => trace!("dropping datagram from {}: {}", source, reason),
                Verdict::Foreign(source) => debug!("dropping datagram from {} while querying {}", source, device),
            }
        }
    }
}

impl Default for RpcClient {
    fn default() -> Self {
        Self::new()
    }
}
