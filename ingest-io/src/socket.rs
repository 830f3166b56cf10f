//! UDP socket wrapper
//!
//! Created and tuned through socket2, then used as a plain non-blocking
//! `std::net::UdpSocket`.

use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, UdpSocket};
use thiserror::Error;

/// Receive and send buffer size requested from the OS
pub const DEFAULT_SOCKET_BUFFER: usize = 4 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum SocketError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid socket address")]
    InvalidAddress,
}

impl SocketError {
    /// Port already bound by another socket
    pub fn is_addr_in_use(&self) -> bool {
        matches!(self, SocketError::Io(e) if e.kind() == ErrorKind::AddrInUse)
    }
}

/// Non-blocking UDP socket
pub struct IngestSocket {
    inner: UdpSocket,
}

impl IngestSocket {
    /// Bind to `addr`; port 0 picks an ephemeral port
    pub fn bind(addr: SocketAddr) -> Result<Self, SocketError> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        socket.set_reuse_address(true)?;
        // Best effort: the OS may clamp or refuse large buffers.
        if let Err(e) = socket.set_recv_buffer_size(DEFAULT_SOCKET_BUFFER) {
            tracing::debug!("recv buffer size not applied: {}", e);
        }
        if let Err(e) = socket.set_send_buffer_size(DEFAULT_SOCKET_BUFFER) {
            tracing::debug!("send buffer size not applied: {}", e);
        }

        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;

        Ok(IngestSocket {
            inner: socket.into(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        Ok(self.inner.local_addr()?)
    }

    pub fn recv_buffer_size(&self) -> Result<usize, SocketError> {
        Ok(socket2::SockRef::from(&self.inner).recv_buffer_size()?)
    }

    /// Send one datagram; `Ok(false)` when the socket buffer is full
    pub fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<bool, SocketError> {
        match self.inner.send_to(buf, target) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(SocketError::Io(e)),
        }
    }

    /// Receive one datagram if one is waiting
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, SocketError> {
        match self.inner.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            // ICMP port unreachable from an earlier send surfaces here on
            // some platforms; the peer may come back.
            Err(e) if e.kind() == ErrorKind::ConnectionReset => Ok(None),
            Err(e) => Err(SocketError::Io(e)),
        }
    }
}
