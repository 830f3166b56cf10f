//! Datagram transport traits
//!
//! A [`Connector`] produces bound [`Link`]s. Sessions and feeders only talk
//! to these traits, so a test can swap UDP for the simulated network.

use crate::socket::{IngestSocket, SocketError};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("address in use: {0}")]
    AddrInUse(SocketAddr),

    #[error("cannot resolve {0}")]
    Unresolved(String),

    #[error("link closed")]
    Closed,

    #[error("socket error: {0}")]
    Socket(#[from] SocketError),
}

/// A bound datagram endpoint
///
/// Both calls are non-blocking.
pub trait Link: Send {
    /// `Ok(false)` when the datagram could not be queued right now
    fn send_to(&self, datagram: &[u8], peer: SocketAddr) -> Result<bool, LinkError>;

    fn recv_from(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, LinkError>;

    fn local_addr(&self) -> SocketAddr;
}

/// Factory for links, injected into sessions and feeders
pub trait Connector: Send + Sync {
    /// Bind a new link; `None` picks any local address
    fn bind(&self, local: Option<SocketAddr>) -> Result<Box<dyn Link>, LinkError>;

    fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr, LinkError>;
}

pub struct UdpLink {
    socket: IngestSocket,
    local: SocketAddr,
}

impl UdpLink {
    pub fn bind(addr: SocketAddr) -> Result<Self, LinkError> {
        let socket = IngestSocket::bind(addr).map_err(|e| {
            if e.is_addr_in_use() {
                LinkError::AddrInUse(addr)
            } else {
                LinkError::Socket(e)
            }
        })?;
        let local = socket.local_addr()?;
        Ok(UdpLink { socket, local })
    }
}

impl Link for UdpLink {
    fn send_to(&self, datagram: &[u8], peer: SocketAddr) -> Result<bool, LinkError> {
        Ok(self.socket.send_to(datagram, peer)?)
    }

    fn recv_from(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, LinkError> {
        Ok(self.socket.recv_from(buf)?)
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

/// Real network
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpConnector;

impl Connector for UdpConnector {
    fn bind(&self, local: Option<SocketAddr>) -> Result<Box<dyn Link>, LinkError> {
        let addr = local.unwrap_or(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
        Ok(Box::new(UdpLink::bind(addr)?))
    }

    fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr, LinkError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }
        (host, port)
            .to_socket_addrs()
            .map_err(|_| LinkError::Unresolved(host.to_string()))?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| LinkError::Unresolved(host.to_string()))
    }
}
