//! `SenderSession`: one stream's transport plus its pacer thread.
//!
//! # Status channel
//!
//! An optional [`SenderStatus`] sender is fed with
//! [`try_send`](tokio::sync::mpsc::Sender::try_send) from the pacer thread:
//! a `Streaming` update about once a second, then `Stopped` or `Failed`.
//! A full or closed channel never blocks the pacer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;
use uvr_core::{BackendKind, FrameBuffer, RecoverySignal, Role, TransportConfig};
use uvr_transport::{Backend, FeedbackListener, Transport};

use crate::encoder::FrameEncoder;
use crate::feedback::SessionFeedback;
use crate::pacer::{CycleTimings, FramePacer};

// ── Status ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum SenderStatus {
    Streaming {
        /// Frames per second over the last reporting window.
        fps: f32,
        frames_sent: u64,
        /// Running average of encode-until-ready time.
        encode_time: Duration,
        /// Running average of time spent in the transport's send.
        send_time: Duration,
    },
    /// Stopped cleanly.
    Stopped,
    /// Failed with an error message.
    Failed(String),
}

// ── SenderSession ─────────────────────────────────────────────────────────────

/// Handle to a running pacer thread. Dropping it stops the session.
pub struct SenderSession {
    id: Uuid,
    backend: BackendKind,
    signal: RecoverySignal,
    frames_sent: Arc<AtomicU64>,
    should_exit: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl SenderSession {
    /// Opens the backend described by `config` and starts pacing frames from
    /// `encoder`.
    ///
    /// With `config.feedback_addr` set, a feedback listener is bound there and
    /// polled before every cycle.
    pub fn start<E>(
        config: &TransportConfig,
        encoder: E,
        status_tx: Option<mpsc::Sender<SenderStatus>>,
    ) -> Result<Self>
    where
        E: FrameEncoder + 'static,
    {
        Self::start_with_signal(config, encoder, RecoverySignal::new(), status_tx)
    }

    /// Like [`start`](Self::start), but services `signal` instead of a fresh
    /// one. Pass the handle a co-located receiver raises.
    pub fn start_with_signal<E>(
        config: &TransportConfig,
        encoder: E,
        signal: RecoverySignal,
        status_tx: Option<mpsc::Sender<SenderStatus>>,
    ) -> Result<Self>
    where
        E: FrameEncoder + 'static,
    {
        let config = TransportConfig {
            role: Role::Sender,
            ..config.clone()
        };
        let backend = Backend::init(&config, &signal).context("Initializing sender transport")?;
        let feedback = config
            .feedback_addr
            .map(|addr| FeedbackListener::bind(addr, signal.clone()))
            .transpose()
            .context("Binding keyframe feedback listener")?;
        Self::spawn(&config, backend, encoder, feedback, signal, status_tx)
    }

    /// Starts pacing over an already initialized transport, e.g. a
    /// reliable-message backend built from an external channel. Only the
    /// pacing fields of `config` are used.
    pub fn spawn<T, E, F>(
        config: &TransportConfig,
        transport: T,
        encoder: E,
        feedback: F,
        signal: RecoverySignal,
        status_tx: Option<mpsc::Sender<SenderStatus>>,
    ) -> Result<Self>
    where
        T: Transport + 'static,
        E: FrameEncoder + 'static,
        F: SessionFeedback + 'static,
    {
        let id = Uuid::new_v4();
        let backend = transport.kind();
        let frames_sent = Arc::new(AtomicU64::new(0));
        let should_exit = Arc::new(AtomicBool::new(false));

        let pacer = FramePacer {
            label: format!("Session[{}]", id),
            transport,
            encoder,
            feedback,
            signal: signal.clone(),
            frame: FrameBuffer::with_limit(config.max_frame_size),
            interval: config.frame_interval(),
            frames_sent: Arc::clone(&frames_sent),
            should_exit: Arc::clone(&should_exit),
            status_tx,
            timings: CycleTimings::default(),
        };
        let handle = thread::Builder::new()
            .name("uvr-pacer".to_owned())
            .spawn(move || pacer.run())
            .context("Spawning pacer thread")?;

        info!("Session[{}] sending over {} at {} fps", id, backend, config.target_fps);
        Ok(Self {
            id,
            backend,
            signal,
            frames_sent,
            should_exit,
            handle: Some(handle),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// The signal the pacer services once per cycle. A co-located receiver
    /// raises it directly.
    pub fn recovery_signal(&self) -> &RecoverySignal {
        &self.signal
    }

    /// Total frames sent since start.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// False once stop was requested or the pacer ended on its own.
    pub fn is_running(&self) -> bool {
        !self.should_exit.load(Ordering::Acquire)
            && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops the pacer, waits for it, and returns how it ended. The transport
    /// is deinitialized by the pacer thread before it exits.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.should_exit.store(true, Ordering::Release);
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let result = handle
            .join()
            .map_err(|_| anyhow!("Session[{}] pacer thread panicked", self.id))?;
        info!("Session[{}] stopped after {} frames", self.id, self.frames_sent());
        result
    }
}

impl Drop for SenderSession {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Session[{}] ended with error: {:#}", self.id, e);
        }
    }
}
