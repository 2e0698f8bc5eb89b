//! Reliable, ordered message backend.
//!
//! The peer connection itself (signaling, ICE, data-channel negotiation) is
//! owned by the embedding application and handed in as a [`MessageChannel`].
//! One message carries one whole frame, so there is nothing to fragment or
//! reassemble here.

use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info, trace};
use uvr_core::{BackendKind, FrameBuffer, TimeValue, TransportError};

use crate::{RecvOutcome, ShutdownHandle, Transport, IDLE_POLL_INTERVAL};

/// An established, reliable, in-order message pipe.
pub trait MessageChannel: Send {
    /// Queues one message. A channel that is not yet open drops it silently.
    fn send(&mut self, message: Bytes) -> Result<(), TransportError>;

    /// Returns the next message if one is queued.
    fn try_recv(&mut self) -> Result<Option<Bytes>, TransportError>;

    fn is_open(&self) -> bool;
}

/// A [`MessageChannel`] pair connected through tokio unbounded channels.
#[derive(Debug)]
pub struct InProcessChannel {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl InProcessChannel {
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (Self { tx: a_tx, rx: a_rx }, Self { tx: b_tx, rx: b_rx })
    }
}

impl MessageChannel for InProcessChannel {
    fn send(&mut self, message: Bytes) -> Result<(), TransportError> {
        if self.tx.is_closed() {
            trace!("Peer not connected; dropping {} byte message", message.len());
            return Ok(());
        }
        // The peer may hang up between the check and the send; same outcome.
        let _ = self.tx.send(message);
        Ok(())
    }

    fn try_recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        match self.rx.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TransportError::ChannelClosed),
        }
    }

    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

pub struct MessageTransport {
    channel: Box<dyn MessageChannel>,
    shutdown: ShutdownHandle,
    idle_poll: Duration,
}

impl MessageTransport {
    pub fn new(channel: Box<dyn MessageChannel>) -> Self {
        info!("Reliable-message transport attached (open: {})", channel.is_open());
        Self {
            channel,
            shutdown: ShutdownHandle::new(),
            idle_poll: IDLE_POLL_INTERVAL,
        }
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }
}

impl Transport for MessageTransport {
    fn kind(&self) -> BackendKind {
        BackendKind::ReliableMessage
    }

    fn send(&mut self, frame: &FrameBuffer) -> Result<(), TransportError> {
        if !self.channel.is_open() {
            trace!("Message channel not open; frame of {} bytes skipped", frame.size());
            return Ok(());
        }
        self.channel.send(Bytes::copy_from_slice(frame.as_slice()))
    }

    fn recv(&mut self, frame: &mut FrameBuffer) -> Result<RecvOutcome, TransportError> {
        loop {
            let next = match self.channel.try_recv() {
                Ok(next) => next,
                Err(_) if self.shutdown.is_shutdown() => return Ok(RecvOutcome::Shutdown),
                Err(e) => return Err(e),
            };
            if let Some(message) = next {
                frame.clear();
                frame.append(&message).map_err(|overflow| TransportError::FrameTooLarge {
                    size: message.len(),
                    limit: overflow.limit,
                })?;
                frame.set_timestamp(TimeValue::now());
                return Ok(RecvOutcome::Complete);
            }
            if self.shutdown.is_shutdown() {
                return Ok(RecvOutcome::Shutdown);
            }
            thread::sleep(self.idle_poll);
        }
    }

    fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    fn deinit(&mut self) {
        self.shutdown.shutdown();
        debug!("Reliable-message transport detached");
    }
}
