//! Fragment reassembly for the datagram backends.
//!
//! # State machine (one frame at a time)
//!
//! ```text
//!                 fragment                     offset == total_size
//! AWAITING_SIZE ───────────► ACCUMULATING ─────────────────────────► COMPLETE
//!       ▲                         │                                     │
//!       │                         │ would-block and                     │
//!       │                         │ now - last_fragment > threshold     │
//!       │                         ▼                                     │
//!       └──────────────────── ABORTED ◄─────────────────────────────────┘
//!                       (size = 0, recovery signal raised)
//! ```
//!
//! A would-block before the first fragment of a frame never aborts.
//!
//! # Known limitation
//!
//! Fragments carry no sequence number. Payloads are appended in arrival
//! order, so a network that reorders datagrams produces a corrupted frame
//! rather than a detected error. Only overruns (more bytes than `total_size`
//! or than the buffer limit) are caught; they abort the frame like a stall.
//!
//! Trailing zeros past `total_size`, up to the padding allowance, are link
//! padding on a short final fragment and are discarded instead.

use std::time::{Duration, Instant};

use tracing::{trace, warn};
use uvr_core::{FrameBuffer, RecoverySignal};

use crate::clock::{Clock, MonotonicClock};
use crate::wire::FragmentHeader;

/// Outcome of feeding one receive attempt to the [`Reassembler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Nothing received and no frame in progress.
    Idle,
    /// A frame is partially received.
    Accumulating,
    /// `offset == total_size`; the frame buffer holds the whole frame.
    Complete,
    /// The frame was abandoned; the frame buffer is empty.
    Aborted,
}

/// Observable reassembly state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyState {
    AwaitingSize,
    Accumulating { offset: usize, total_size: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub fragments: u64,
    pub completed: u64,
    pub aborted: u64,
}

#[derive(Debug, Clone, Copy)]
enum State {
    AwaitingSize,
    Accumulating {
        total_size: usize,
        started_at: Instant,
        last_fragment_at: Instant,
    },
}

pub struct Reassembler<C: Clock = MonotonicClock> {
    state: State,
    stall_threshold: Duration,
    signal: RecoverySignal,
    clock: C,
    stats: ReassemblyStats,
    padding_allowance: usize,
    last_span: Option<Duration>,
}

impl Reassembler<MonotonicClock> {
    pub fn new(stall_threshold: Duration, signal: RecoverySignal) -> Self {
        Self::with_clock(stall_threshold, signal, MonotonicClock)
    }
}

impl<C: Clock> Reassembler<C> {
    pub fn with_clock(stall_threshold: Duration, signal: RecoverySignal, clock: C) -> Self {
        Self {
            state: State::AwaitingSize,
            stall_threshold,
            signal,
            clock,
            stats: ReassemblyStats::default(),
            padding_allowance: 0,
            last_span: None,
        }
    }

    /// Tolerate up to `bytes` trailing zeros after the last byte of a frame.
    pub fn with_padding_allowance(mut self, bytes: usize) -> Self {
        self.padding_allowance = bytes;
        self
    }

    pub fn padding_allowance(&self) -> usize {
        self.padding_allowance
    }

    pub fn state(&self, frame: &FrameBuffer) -> ReassemblyState {
        match self.state {
            State::AwaitingSize => ReassemblyState::AwaitingSize,
            State::Accumulating { total_size, .. } => ReassemblyState::Accumulating {
                offset: frame.size(),
                total_size,
            },
        }
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }

    pub fn stall_threshold(&self) -> Duration {
        self.stall_threshold
    }

    /// First to last fragment of the most recently completed frame.
    pub fn last_frame_span(&self) -> Option<Duration> {
        self.last_span
    }

    /// Accepts one fragment's payload.
    ///
    /// `total_size` and the timestamp are taken from every fragment; the last
    /// one seen wins.
    pub fn on_fragment(
        &mut self,
        header: &FragmentHeader,
        payload: &[u8],
        frame: &mut FrameBuffer,
    ) -> Progress {
        let now = self.clock.now();
        let started_at = match self.state {
            State::AwaitingSize => {
                frame.clear();
                now
            }
            State::Accumulating { started_at, .. } => started_at,
        };
        self.stats.fragments += 1;
        frame.set_timestamp(header.timestamp);

        let remaining = header.total_size.saturating_sub(frame.size());
        let payload = if payload.len() > remaining && self.is_padding(&payload[remaining..]) {
            trace!("Discarding {} bytes of link padding", payload.len() - remaining);
            &payload[..remaining]
        } else {
            payload
        };

        if let Err(overflow) = frame.append(payload) {
            warn!("Fragment overruns frame buffer ({}); dropping frame", overflow);
            return self.abort(frame);
        }
        let offset = frame.size();
        if offset > header.total_size {
            warn!(
                "Received {} bytes for a {} byte frame; dropping frame",
                offset, header.total_size
            );
            return self.abort(frame);
        }

        if offset == header.total_size {
            trace!("Frame complete: {} bytes", offset);
            self.last_span = Some(now.saturating_duration_since(started_at));
            self.state = State::AwaitingSize;
            self.stats.completed += 1;
            return Progress::Complete;
        }

        self.state = State::Accumulating {
            total_size: header.total_size,
            started_at,
            last_fragment_at: now,
        };
        Progress::Accumulating
    }

    /// Called when a receive attempt found nothing queued.
    pub fn on_would_block(&mut self, frame: &mut FrameBuffer) -> Progress {
        match self.state {
            State::AwaitingSize => Progress::Idle,
            State::Accumulating {
                total_size,
                last_fragment_at,
                ..
            } => {
                let elapsed = self.clock.now().saturating_duration_since(last_fragment_at);
                if elapsed > self.stall_threshold {
                    warn!(
                        "Stalled {:?} with {}/{} bytes; dropping frame",
                        elapsed,
                        frame.size(),
                        total_size
                    );
                    self.abort(frame)
                } else {
                    Progress::Accumulating
                }
            }
        }
    }

    fn is_padding(&self, excess: &[u8]) -> bool {
        excess.len() <= self.padding_allowance && excess.iter().all(|&b| b == 0)
    }

    fn abort(&mut self, frame: &mut FrameBuffer) -> Progress {
        frame.clear();
        self.signal.raise();
        self.state = State::AwaitingSize;
        self.stats.aborted += 1;
        Progress::Aborted
    }
}
