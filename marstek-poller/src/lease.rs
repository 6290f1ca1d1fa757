//! Ownership of the single UDP socket bound to the protocol port
//!
//! Batteries only answer to the exact port they were queried from, so every
//! conversation goes through one socket bound to that port. A bind failure
//! is retried after a short delay and then reported; falling back to another
//! port would silently lose every reply.

use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::error::{PollerError, Result};

/// How hard to try when the port is busy
#[derive(Debug, Clone, Copy)]
pub struct BindRetry {
    /// Total bind attempts, at least 1
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for BindRetry {
    fn default() -> Self {
        Self {
            attempts: 2,
            delay: Duration::from_millis(200),
        }
    }
}

#[derive(Debug)]
pub struct SocketLease {
    addr: SocketAddrV4,
    socket: Option<UdpSocket>,
}

impl SocketLease {
    /// Binds `addr` with address reuse enabled
    pub async fn acquire(addr: SocketAddrV4, retry: BindRetry) -> Result<Self> {
        let attempts = retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            match bind_reusable(addr) {
                Ok(socket) => {
                    info!("UDP socket bound on {}", socket.local_addr()?);
                    return Ok(Self { addr, socket: Some(socket) });
                }
                Err(e) if attempt < attempts => {
                    warn!("bind {} failed ({}), retrying in {:?}", addr, e, retry.delay);
                    tokio::time::sleep(retry.delay).await;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(PollerError::BindConflict {
                        addr: SocketAddr::V4(addr),
                        attempts,
                        source,
                    })
                }
            }
        }
    }

    /// Socket of an active lease
    pub fn socket(&self) -> Result<&UdpSocket> {
        self.socket.as_ref().ok_or(PollerError::LeaseReleased)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket()?.local_addr()?)
    }

    pub fn is_active(&self) -> bool {
        self.socket.is_some()
    }

    /// Closes the socket. Calling it again is a no-op.
    pub fn release(&mut self) {
        if self.socket.take().is_some() {
            debug!("UDP socket on {} released", self.addr);
        }
    }
}

#[cfg(unix)]
fn bind_reusable(addr: SocketAddrV4) -> std::io::Result<UdpSocket> {
    use nix::sys::socket::{bind, setsockopt, socket, sockopt, AddressFamily, SockFlag, SockType, SockaddrIn};
    use std::os::fd::AsRawFd;

    let fd = socket(AddressFamily::Inet, SockType::Datagram, SockFlag::empty(), None)?;
    setsockopt(&fd, sockopt::ReuseAddr, &true)?;
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos", target_os = "freebsd"))]
    setsockopt(&fd, sockopt::ReusePort, &true)?;
    bind(fd.as_raw_fd(), &SockaddrIn::from(addr))?;

    let socket = std::net::UdpSocket::from(fd);
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket)
}

#[cfg(not(unix))]
fn bind_reusable(addr: SocketAddrV4) -> std::io::Result<UdpSocket> {
    let socket = std::net::UdpSocket::bind(addr)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn loopback(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    fn quick_retry() -> BindRetry {
        BindRetry { attempts: 2, delay: Duration::from_millis(10) }
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let mut lease = SocketLease::acquire(loopback(0), quick_retry()).await.unwrap();
        assert!(lease.is_active());
        assert_ne!(lease.local_addr().unwrap().port(), 0);

        lease.release();
        lease.release();

        assert!(!lease.is_active());
        assert!(matches!(lease.socket(), Err(PollerError::LeaseReleased)));
    }

    #[tokio::test]
    async fn test_busy_port_surfaces_bind_conflict() {
        // plain socket without SO_REUSEADDR/SO_REUSEPORT holds the port
        let holder = std::net::UdpSocket::bind(loopback(0)).unwrap();
        let port = holder.local_addr().unwrap().port();

        let err = SocketLease::acquire(loopback(port), quick_retry()).await.unwrap_err();

        match err {
            PollerError::BindConflict { addr, attempts, .. } => {
                assert_eq!(addr.port(), port);
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_port_is_reusable_after_release() {
        let mut first = SocketLease::acquire(loopback(0), quick_retry()).await.unwrap();
        let port = first.local_addr().unwrap().port();
        first.release();

        let second = SocketLease::acquire(loopback(port), quick_retry()).await.unwrap();
        assert_eq!(second.local_addr().unwrap().port(), port);
    }
}
