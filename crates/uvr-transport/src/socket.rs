//! Datagram sockets the fragmenting backends run on.

use std::io;
use std::net::{SocketAddr, UdpSocket};

use tracing::info;
use uvr_core::TransportError;

/// One datagram per call in each direction. Non-blocking receivers report an
/// empty queue as [`io::ErrorKind::WouldBlock`].
pub trait DatagramSocket: Send {
    fn send_datagram(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl DatagramSocket for UdpSocket {
    fn send_datagram(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send(buf)
    }

    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv(buf)
    }
}

/// Sender side: bound to `local` (or an ephemeral port) and connected to `peer`.
pub fn udp_sender(local: Option<SocketAddr>, peer: SocketAddr) -> Result<UdpSocket, TransportError> {
    let local = local.unwrap_or_else(|| match peer {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    });
    let socket = UdpSocket::bind(local).map_err(|source| TransportError::Bind {
        addr: local.to_string(),
        source,
    })?;
    socket.connect(peer).map_err(|source| TransportError::Connect {
        addr: peer.to_string(),
        source,
    })?;
    info!("UDP sender {} -> {}", socket.local_addr().map_err(TransportError::Socket)?, peer);
    Ok(socket)
}

/// Receiver side: bound to `local`, non-blocking.
pub fn udp_receiver(local: SocketAddr) -> Result<UdpSocket, TransportError> {
    let socket = UdpSocket::bind(local).map_err(|source| TransportError::Bind {
        addr: local.to_string(),
        source,
    })?;
    socket.set_nonblocking(true).map_err(TransportError::Socket)?;
    info!("UDP receiver listening on {}", socket.local_addr().map_err(TransportError::Socket)?);
    Ok(socket)
}
