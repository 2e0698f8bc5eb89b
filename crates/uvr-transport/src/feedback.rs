//! Best-effort keyframe feedback over a UDP side channel.
//!
//! The receiver's reassembly engine raises its own recovery signal when it
//! drops a frame. When sender and receiver live in different processes that
//! signal never reaches the encoder, so the receiver also reports the drop as
//! a single datagram carrying the requested counter value (`i32` LE). The
//! sender drains those datagrams before each encode and raises its signal.

use std::io;
use std::net::{SocketAddr, UdpSocket};

use tracing::{debug, info, warn};
use uvr_core::{RecoverySignal, TransportError, RECOVERY_REQUESTED};

const FEEDBACK_DATAGRAM_LEN: usize = 4;

/// Receiver side of the feedback channel.
#[derive(Debug)]
pub struct FeedbackNotifier {
    socket: UdpSocket,
    target: SocketAddr,
}

impl FeedbackNotifier {
    pub fn connect(target: SocketAddr) -> Result<Self, TransportError> {
        let local = match target {
            SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
            SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
        };
        let socket = UdpSocket::bind(local).map_err(|source| TransportError::Bind {
            addr: local.to_string(),
            source,
        })?;
        socket.set_nonblocking(true).map_err(TransportError::Socket)?;
        info!("Keyframe feedback -> {}", target);
        Ok(Self { socket, target })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Reports a dropped frame. Failures are logged and otherwise ignored.
    pub fn notify_stall(&self) {
        let payload = RECOVERY_REQUESTED.to_le_bytes();
        if let Err(e) = self.socket.send_to(&payload, self.target) {
            debug!("Keyframe feedback to {} failed: {}", self.target, e);
        }
    }
}

/// Sender side of the feedback channel.
#[derive(Debug)]
pub struct FeedbackListener {
    socket: UdpSocket,
    signal: RecoverySignal,
}

impl FeedbackListener {
    pub fn bind(addr: SocketAddr, signal: RecoverySignal) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).map_err(|source| TransportError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        socket.set_nonblocking(true).map_err(TransportError::Socket)?;
        info!(
            "Keyframe feedback listening on {}",
            socket.local_addr().map_err(TransportError::Socket)?
        );
        Ok(Self { socket, signal })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.socket.local_addr().map_err(TransportError::Socket)
    }

    pub fn signal(&self) -> &RecoverySignal {
        &self.signal
    }

    /// Drains every pending feedback datagram. Returns `true` when at least
    /// one of them requested a keyframe.
    pub fn poll(&self) -> Result<bool, TransportError> {
        let mut buf = [0u8; 64];
        let mut requested = false;
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((FEEDBACK_DATAGRAM_LEN, from)) => {
                    let mut value = [0u8; FEEDBACK_DATAGRAM_LEN];
                    value.copy_from_slice(&buf[..FEEDBACK_DATAGRAM_LEN]);
                    if i32::from_le_bytes(value) > 0 {
                        debug!("Keyframe requested by {}", from);
                        requested = true;
                    }
                }
                Ok((n, from)) => warn!("Ignoring {} byte feedback datagram from {}", n, from),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::Read(e)),
            }
        }
        if requested {
            self.signal.raise();
        }
        Ok(requested)
    }
}
