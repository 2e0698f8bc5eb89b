//! `ReceiverSession`: receive → reassemble → decode on its own thread.
//!
//! ```text
//! Transport::recv ─┬─ Complete (size > 0) → FrameDecoder
//!                  ├─ Complete (size 0)   → skipped
//!                  ├─ Dropped             → counted; keyframe already requested
//!                  └─ Shutdown            → thread exits
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;
use uvr_core::{BackendKind, FrameBuffer, RecoverySignal, Role, RunningAverage, TimeValue, TransportConfig};
use uvr_transport::{Backend, RecvOutcome, ShutdownHandle, Transport};

use crate::decoder::FrameDecoder;

/// Delivered frames between two debug timing lines.
const TIMING_LOG_EVERY: u64 = 300;

/// Counters shared with the receive thread.
///
/// The two timing averages are [`RunningAverage`] values in microseconds,
/// stored as `f64` bits. Only the receive thread writes them.
#[derive(Debug, Default)]
pub struct ReceiverStats {
    delivered: AtomicU64,
    dropped: AtomicU64,
    empty: AtomicU64,
    bytes: AtomicU64,
    receive_us: AtomicU64,
    transfer_us: AtomicU64,
}

impl ReceiverStats {
    /// Frames handed to the decoder.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Frames abandoned by the reassembly engine.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Zero-length frames, which are never passed on.
    pub fn empty(&self) -> u64 {
        self.empty.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Running average of first-to-last-byte time per frame, on backends
    /// that report it.
    pub fn avg_receive_time(&self) -> Duration {
        Duration::from_secs_f64(f64::from_bits(self.receive_us.load(Ordering::Relaxed)).max(0.0) / 1e6)
    }

    /// Running average of arrival time minus the frame's send timestamp.
    /// Negative when the sender's clock runs ahead.
    pub fn avg_transfer_latency_us(&self) -> f64 {
        f64::from_bits(self.transfer_us.load(Ordering::Relaxed))
    }
}

/// Receive-thread side of the timing averages.
#[derive(Debug, Default)]
struct FrameTimings {
    receive: RunningAverage,
    transfer: RunningAverage,
}

impl FrameTimings {
    fn record(&mut self, span: Option<Duration>, sent_at: TimeValue, arrived_at: TimeValue, stats: &ReceiverStats) {
        if let Some(span) = span {
            let avg = self.receive.record(span);
            stats.receive_us.store(avg.to_bits(), Ordering::Relaxed);
        }
        let latency = (arrived_at.as_micros() - sent_at.as_micros()) as f64;
        let avg = self.transfer.record_micros(latency);
        stats.transfer_us.store(avg.to_bits(), Ordering::Relaxed);
    }
}

/// Handle to a running receive thread. Dropping it stops the session.
pub struct ReceiverSession {
    id: Uuid,
    backend: BackendKind,
    signal: RecoverySignal,
    stats: Arc<ReceiverStats>,
    should_exit: Arc<AtomicBool>,
    shutdown: ShutdownHandle,
    handle: Option<JoinHandle<Result<()>>>,
}

impl ReceiverSession {
    /// Opens the backend described by `config` and starts delivering frames
    /// to `decoder`.
    ///
    /// Dropped frames raise [`ReceiverSession::recovery_signal`]; with
    /// `config.feedback_addr` set they are also reported to the sender.
    pub fn start<D>(config: &TransportConfig, decoder: D) -> Result<Self>
    where
        D: FrameDecoder + 'static,
    {
        Self::start_with_signal(config, decoder, RecoverySignal::new())
    }

    /// Like [`start`](Self::start), but dropped frames raise `signal`. Pass
    /// the handle a co-located sender services.
    pub fn start_with_signal<D>(config: &TransportConfig, decoder: D, signal: RecoverySignal) -> Result<Self>
    where
        D: FrameDecoder + 'static,
    {
        let config = TransportConfig {
            role: Role::Receiver,
            ..config.clone()
        };
        let backend = Backend::init(&config, &signal).context("Initializing receiver transport")?;
        Self::spawn(&config, backend, decoder, signal)
    }

    /// Starts receiving over an already initialized transport. `signal` must
    /// be the one the transport raises on dropped frames.
    pub fn spawn<T, D>(config: &TransportConfig, transport: T, decoder: D, signal: RecoverySignal) -> Result<Self>
    where
        T: Transport + 'static,
        D: FrameDecoder + 'static,
    {
        let id = Uuid::new_v4();
        let backend = transport.kind();
        let stats = Arc::new(ReceiverStats::default());
        let should_exit = Arc::new(AtomicBool::new(false));
        let shutdown = transport.shutdown_handle();

        let worker = ReceiveLoop {
            label: format!("Session[{}]", id),
            transport,
            decoder,
            frame: FrameBuffer::with_limit(config.max_frame_size),
            stats: Arc::clone(&stats),
            timings: FrameTimings::default(),
            should_exit: Arc::clone(&should_exit),
        };
        let handle = thread::Builder::new()
            .name("uvr-receiver".to_owned())
            .spawn(move || worker.run())
            .context("Spawning receiver thread")?;

        info!("Session[{}] receiving over {}", id, backend);
        Ok(Self {
            id,
            backend,
            signal,
            stats,
            should_exit,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Raised whenever a frame is dropped. A co-located sender services it.
    pub fn recovery_signal(&self) -> &RecoverySignal {
        &self.signal
    }

    pub fn stats(&self) -> &ReceiverStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        !self.should_exit.load(Ordering::Acquire)
            && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Waits for the receive thread to end on its own, e.g. when the peer
    /// closes a TCP stream.
    pub fn join(mut self) -> Result<()> {
        self.wait()
    }

    /// Stops receiving and returns how the thread ended.
    ///
    /// Datagram backends notice the stop once no frame is in progress; a TCP
    /// stream is shut down so a blocked read returns.
    pub fn stop(mut self) -> Result<()> {
        self.should_exit.store(true, Ordering::Release);
        self.shutdown.shutdown();
        self.wait()
    }

    fn wait(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let result = handle
            .join()
            .map_err(|_| anyhow!("Session[{}] receiver thread panicked", self.id))?;
        info!(
            "Session[{}] stopped: {} delivered, {} dropped, avg receive {:?}, avg transfer {:.0}us",
            self.id,
            self.stats.delivered(),
            self.stats.dropped(),
            self.stats.avg_receive_time(),
            self.stats.avg_transfer_latency_us()
        );
        result
    }
}

impl Drop for ReceiverSession {
    fn drop(&mut self) {
        if self.handle.is_none() {
            return;
        }
        self.should_exit.store(true, Ordering::Release);
        self.shutdown.shutdown();
        if let Err(e) = self.wait() {
            warn!("Session[{}] ended with error: {:#}", self.id, e);
        }
    }
}

// ── Receive loop ──────────────────────────────────────────────────────────────

struct ReceiveLoop<T: Transport, D: FrameDecoder> {
    label: String,
    transport: T,
    decoder: D,
    frame: FrameBuffer,
    stats: Arc<ReceiverStats>,
    timings: FrameTimings,
    should_exit: Arc<AtomicBool>,
}

impl<T: Transport, D: FrameDecoder> ReceiveLoop<T, D> {
    fn run(mut self) -> Result<()> {
        let result = self.receive_frames();
        self.should_exit.store(true, Ordering::Release);
        self.transport.deinit();
        if let Err(e) = &result {
            warn!("{} receiver failed: {:#}", self.label, e);
        }
        result
    }

    fn receive_frames(&mut self) -> Result<()> {
        while !self.should_exit.load(Ordering::Acquire) {
            match self.transport.recv(&mut self.frame).context("Receiving frame")? {
                RecvOutcome::Complete if self.frame.is_empty() => {
                    trace!("{} skipping empty frame", self.label);
                    self.stats.empty.fetch_add(1, Ordering::Relaxed);
                }
                RecvOutcome::Complete => {
                    let frame = self.frame.take();
                    let size = frame.size() as u64;
                    self.timings
                        .record(self.transport.last_frame_span(), frame.timestamp, TimeValue::now(), &self.stats);
                    self.decoder
                        .accept_completed_frame(frame)
                        .with_context(|| format!("Decoding {} byte frame", size))?;
                    let delivered = self.stats.delivered.fetch_add(1, Ordering::Relaxed) + 1;
                    self.stats.bytes.fetch_add(size, Ordering::Relaxed);
                    if delivered % TIMING_LOG_EVERY == 0 {
                        debug!(
                            "{} avg receive {:?}, avg transfer {:.0}us",
                            self.label,
                            self.stats.avg_receive_time(),
                            self.stats.avg_transfer_latency_us()
                        );
                    }
                }
                RecvOutcome::Dropped => {
                    debug!("{} frame dropped; keyframe requested", self.label);
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                }
                RecvOutcome::Shutdown => break,
            }
        }
        Ok(())
    }
}
