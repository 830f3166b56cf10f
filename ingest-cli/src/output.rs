//! Where received media goes: stdout or a UDP relay

use std::io::{self, Write};
use std::net::{ToSocketAddrs, UdpSocket};

/// Seven transport stream packets, the usual UDP payload for TS relays
pub const DATAGRAM_PAYLOAD: usize = 1316;

/// Sends everything written as datagrams of at most [`DATAGRAM_PAYLOAD`] bytes
pub struct UdpWriter {
    socket: UdpSocket,
}

impl UdpWriter {
    pub fn connect(host: &str, port: u16) -> io::Result<Self> {
        let target = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address for output host"))?;
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.connect(target)?;
        Ok(UdpWriter { socket })
    }
}

impl Write for UdpWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = buf.len().min(DATAGRAM_PAYLOAD);
        self.socket.send(&buf[..len])
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// UDP when both host and port are given, stdout otherwise
pub fn open_output(host: Option<&str>, port: Option<u16>) -> anyhow::Result<Box<dyn Write>> {
    match (host, port) {
        (Some(host), Some(port)) => {
            tracing::info!("Relaying to udp://{}:{}", host, port);
            let writer = UdpWriter::connect(host, port)
                .map_err(|e| anyhow::anyhow!("Invalid UDP output {}:{}: {}", host, port, e))?;
            Ok(Box::new(writer))
        }
        (None, None) => {
            tracing::info!("Writing to stdout");
            Ok(Box::new(io::stdout()))
        }
        _ => anyhow::bail!("output host and port must be given together"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_writer_splits_datagrams() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = receiver.local_addr().unwrap().port();
        let mut writer = UdpWriter::connect("127.0.0.1", port).unwrap();

        writer.write_all(&vec![0x47; DATAGRAM_PAYLOAD + 188]).unwrap();

        let mut buf = [0u8; 2048];
        assert_eq!(receiver.recv(&mut buf).unwrap(), DATAGRAM_PAYLOAD);
        assert_eq!(receiver.recv(&mut buf).unwrap(), 188);
    }

    #[test]
    fn test_output_needs_both_parts() {
        assert!(open_output(Some("127.0.0.1"), None).is_err());
    }
}
