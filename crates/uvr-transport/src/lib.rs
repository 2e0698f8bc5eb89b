//! Frame transport for the streaming path.
//!
//! A [`Transport`] moves whole encoded frames between one sender and one
//! receiver. Four backends exist:
//!
//! - raw link and UDP split each frame into fragments of at most
//!   [`uvr_core::MAX_FRAGMENT_SIZE`] bytes and rebuild them with the
//!   [`reassembly::Reassembler`], which gives up on a frame after a short
//!   stall and asks the sender for a keyframe;
//! - TCP writes one length prefix per frame on an ordered stream;
//! - the reliable-message backend sends one message per frame over an
//!   externally established channel.

use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use uvr_core::{BackendKind, FrameBuffer, TransportError};

pub mod backend;
pub mod clock;
pub mod datagram;
pub mod feedback;
pub mod message;
pub mod raw;
pub mod reassembly;
pub mod socket;
pub mod tcp;
pub mod wire;

pub use backend::Backend;
pub use datagram::DatagramTransport;
pub use feedback::{FeedbackListener, FeedbackNotifier};
pub use message::{InProcessChannel, MessageChannel, MessageTransport};
pub use raw::RawLinkSocket;
pub use reassembly::{Progress, ReassemblyState, ReassemblyStats, Reassembler};
pub use socket::DatagramSocket;
pub use tcp::TcpTransport;
pub use wire::{DatagramCodec, FragmentHeader, LinkHeader};

/// How long an idle receiver sleeps between polls of a non-blocking socket.
pub(crate) const IDLE_POLL_INTERVAL: Duration = Duration::from_micros(100);

/// What a call to [`Transport::recv`] produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// The frame buffer holds one whole frame (possibly of size 0).
    Complete,
    /// A frame was abandoned; the buffer is empty and a keyframe was requested.
    Dropped,
    /// The transport was shut down while waiting.
    Shutdown,
}

/// The `init / send / recv / deinit` contract every backend implements.
/// `init` is the backend's constructor.
pub trait Transport: Send {
    fn kind(&self) -> BackendKind;

    /// Transmits one frame. Returns once every byte has been handed to the OS.
    fn send(&mut self, frame: &FrameBuffer) -> Result<(), TransportError>;

    /// Fills `frame` with the next frame. Blocks until a frame completes, a
    /// frame is dropped, or the transport is shut down.
    fn recv(&mut self, frame: &mut FrameBuffer) -> Result<RecvOutcome, TransportError>;

    /// A handle another thread can use to end a pending [`Transport::recv`].
    fn shutdown_handle(&self) -> ShutdownHandle;

    /// Time between the first and last byte of the most recent complete
    /// frame, for backends that can see it.
    fn last_frame_span(&self) -> Option<Duration> {
        None
    }

    fn deinit(&mut self);
}

/// Cooperative stop for a receive loop.
///
/// Datagram backends check the flag whenever no frame is in progress. Stream
/// backends also shut the socket down so a blocked read returns.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    stream: Option<Arc<TcpStream>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_stream(stream: TcpStream) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            stream: Some(Arc::new(stream)),
        }
    }

    pub fn shutdown(&self) {
        if self.flag.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(stream) = &self.stream {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
