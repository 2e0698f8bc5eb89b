//! Keyframe recovery signal shared between the receive path and the encoder.
//!
//! A single signed counter with three regions:
//!
//! ```text
//!   > 0   keyframe requested, not yet served
//!   = 0   idle
//!   < 0   cooldown after a keyframe; counts up by one per encode cycle
//! ```
//!
//! Reassembly calls [`RecoverySignal::raise`] when it aborts a stalled frame.
//! The encoder calls [`RecoverySignal::service`] exactly once per cycle. A
//! request of `N` therefore yields one keyframe followed by `N + 1` delta
//! frames of cooldown.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use tracing::debug;

/// Value stored by [`RecoverySignal::raise`].
pub const RECOVERY_REQUESTED: i32 = 5;

/// What the encoder must emit this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Key,
    Delta,
}

/// Cheap to clone; all clones observe the same counter.
#[derive(Debug, Clone, Default)]
pub struct RecoverySignal {
    counter: Arc<AtomicI32>,
}

impl RecoverySignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a keyframe, overwriting any pending request or cooldown.
    pub fn raise(&self) {
        let prev = self.counter.swap(RECOVERY_REQUESTED, Ordering::AcqRel);
        if prev != RECOVERY_REQUESTED {
            debug!("Keyframe requested (counter {} -> {})", prev, RECOVERY_REQUESTED);
        }
    }

    /// Advances the counter by one encode cycle and reports the frame kind.
    pub fn service(&self) -> FrameKind {
        let prev = self
            .counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| match v {
                v if v > 0 => Some(!v),
                v if v < 0 => Some(v + 1),
                _ => None,
            });
        match prev {
            Ok(v) if v > 0 => {
                debug!("Serving keyframe (cooldown {})", !v);
                FrameKind::Key
            }
            _ => FrameKind::Delta,
        }
    }

    pub fn value(&self) -> i32 {
        self.counter.load(Ordering::Acquire)
    }

    pub fn is_requested(&self) -> bool {
        self.value() > 0
    }

    pub fn in_cooldown(&self) -> bool {
        self.value() < 0
    }
}
