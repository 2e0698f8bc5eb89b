//! Fixed-rate encode + send loop.
//!
//! The pacer does not sleep for a whole frame interval. It polls the
//! monotonic clock, divided into `interval`-sized buckets, and runs one cycle
//! each time the bucket index changes, sleeping [`POLL_SLEEP`] between polls.
//! A late cycle therefore never shifts the schedule of the following ones.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uvr_core::{FrameBuffer, FrameKind, RecoverySignal, RunningAverage, TimeValue};
use uvr_transport::clock::{Clock, MonotonicClock};
use uvr_transport::Transport;

use crate::encoder::{EncodeStatus, FrameEncoder};
use crate::feedback::SessionFeedback;
use crate::session::SenderStatus;

pub const POLL_SLEEP: Duration = Duration::from_micros(500);

const STATUS_INTERVAL: Duration = Duration::from_secs(1);

// ── Ticker ────────────────────────────────────────────────────────────────────

pub struct Ticker<C: Clock = MonotonicClock> {
    clock: C,
    origin: Instant,
    interval_ns: u128,
    last_bucket: Option<u128>,
}

impl Ticker<MonotonicClock> {
    pub fn new(interval: Duration) -> Self {
        Self::with_clock(interval, MonotonicClock)
    }
}

impl<C: Clock> Ticker<C> {
    pub fn with_clock(interval: Duration, clock: C) -> Self {
        let origin = clock.now();
        Self {
            clock,
            origin,
            interval_ns: interval.as_nanos().max(1),
            last_bucket: None,
        }
    }

    /// True once per bucket: the first call after the bucket index changed.
    pub fn poll(&mut self) -> bool {
        let bucket = self.clock.now().saturating_duration_since(self.origin).as_nanos() / self.interval_ns;
        if self.last_bucket == Some(bucket) {
            return false;
        }
        self.last_bucket = Some(bucket);
        true
    }

    /// Polls until the next bucket starts. Returns `false` if `should_exit`
    /// was set first.
    pub fn wait(&mut self, should_exit: &AtomicBool) -> bool {
        loop {
            if should_exit.load(Ordering::Acquire) {
                return false;
            }
            if self.poll() {
                return true;
            }
            thread::sleep(POLL_SLEEP);
        }
    }
}

// ── FramePacer ────────────────────────────────────────────────────────────────

pub struct FramePacer<T: Transport, E: FrameEncoder, F: SessionFeedback> {
    pub(crate) label: String,
    pub(crate) transport: T,
    pub(crate) encoder: E,
    pub(crate) feedback: F,
    pub(crate) signal: RecoverySignal,
    pub(crate) frame: FrameBuffer,
    pub(crate) interval: Duration,
    pub(crate) frames_sent: Arc<AtomicU64>,
    pub(crate) should_exit: Arc<AtomicBool>,
    pub(crate) status_tx: Option<mpsc::Sender<SenderStatus>>,
    pub(crate) timings: CycleTimings,
}

impl<T: Transport, E: FrameEncoder, F: SessionFeedback> FramePacer<T, E, F> {
    /// Runs until `should_exit` is set or a cycle fails, then deinitializes
    /// the transport. Sets `should_exit` on the way out either way.
    pub fn run(mut self) -> Result<()> {
        info!("{} pacer started ({:?} interval)", self.label, self.interval);
        let mut ticker = Ticker::new(self.interval);
        let mut fps_counter = FpsCounter::new(Instant::now());
        let mut status_due = Instant::now() + STATUS_INTERVAL;

        let result = loop {
            if !ticker.wait(&self.should_exit) {
                break Ok(());
            }
            match self.cycle() {
                Ok(true) => fps_counter.tick(),
                Ok(false) => break Ok(()),
                Err(e) => break Err(e),
            }
            let now = Instant::now();
            if now >= status_due {
                status_due += STATUS_INTERVAL;
                let (encode_time, send_time) = (self.timings.encode.as_duration(), self.timings.send.as_duration());
                debug!("{} avg encode {:?}, avg send {:?}", self.label, encode_time, send_time);
                self.report(SenderStatus::Streaming {
                    fps: fps_counter.fps(now),
                    frames_sent: self.frames_sent.load(Ordering::Relaxed),
                    encode_time,
                    send_time,
                });
            }
            thread::sleep(POLL_SLEEP);
        };

        self.should_exit.store(true, Ordering::Release);
        self.transport.deinit();
        match &result {
            Ok(()) => {
                info!("{} pacer stopped after {} frames", self.label, self.frames_sent.load(Ordering::Relaxed));
                self.report(SenderStatus::Stopped);
            }
            Err(e) => {
                warn!("{} pacer failed: {:#}", self.label, e);
                self.report(SenderStatus::Failed(format!("{e:#}")));
            }
        }
        result
    }

    /// One encode-until-ready + send. Returns `Ok(false)` if asked to exit
    /// while the encoder was still not ready.
    pub fn cycle(&mut self) -> Result<bool> {
        if let Err(e) = self.feedback.poll() {
            debug!("{} feedback poll failed: {:#}", self.label, e);
        }

        let kind = self.encoder.service_recovery(&self.signal);
        if kind == FrameKind::Key {
            debug!("{} encoding keyframe", self.label);
        }

        self.frame.clear();
        let encode_start = Instant::now();
        loop {
            match self.encoder.process_frame(&mut self.frame, kind).context("Encoding frame")? {
                EncodeStatus::Ready => break,
                EncodeStatus::NotReady => {
                    if self.should_exit.load(Ordering::Acquire) {
                        // No keyframe went out, so the request stays pending.
                        if kind == FrameKind::Key {
                            self.signal.raise();
                        }
                        return Ok(false);
                    }
                    thread::yield_now();
                }
            }
        }
        let encode_avg = self.timings.encode.record(encode_start.elapsed());
        self.frame.set_timestamp(TimeValue::now());

        let send_start = Instant::now();
        self.transport
            .send(&self.frame)
            .with_context(|| format!("Sending {} byte frame", self.frame.size()))?;
        let send_avg = self.timings.send.record(send_start.elapsed());
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        trace!(
            "{} sent {} bytes, avg encode {:.1}us, avg send {:.1}us",
            self.label,
            self.frame.size(),
            encode_avg,
            send_avg
        );
        Ok(true)
    }

    fn report(&self, status: SenderStatus) {
        if let Some(tx) = &self.status_tx {
            let _ = tx.try_send(status);
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Running averages of the two halves of a cycle.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CycleTimings {
    pub(crate) encode: RunningAverage,
    pub(crate) send: RunningAverage,
}

/// Frame rate over windows of at least [`FpsCounter::WINDOW`]. Reading it
/// after the window has elapsed closes the window and starts a new one.
pub(crate) struct FpsCounter {
    frames: u32,
    since: Instant,
    rate: f32,
}

impl FpsCounter {
    const WINDOW: Duration = Duration::from_millis(500);

    pub(crate) fn new(now: Instant) -> Self {
        Self {
            frames: 0,
            since: now,
            rate: 0.0,
        }
    }

    pub(crate) fn tick(&mut self) {
        self.frames += 1;
    }

    /// Rate of the last closed window; 0 until one has closed.
    pub(crate) fn fps(&mut self, now: Instant) -> f32 {
        let elapsed = now.saturating_duration_since(self.since);
        if elapsed >= Self::WINDOW {
            self.rate = self.frames as f32 / elapsed.as_secs_f32();
            self.frames = 0;
            self.since = now;
        }
        self.rate
    }
}
