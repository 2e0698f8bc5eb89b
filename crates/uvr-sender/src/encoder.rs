use uvr_core::{EncoderError, FrameBuffer, FrameKind, RecoverySignal};

/// Result of one [`FrameEncoder::process_frame`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeStatus {
    /// Nothing produced yet; call again within the same tick.
    NotReady,
    /// The frame buffer holds one encoded frame.
    Ready,
}

/// The video encoder the pacer drives.
pub trait FrameEncoder: Send {
    /// Encodes the next frame into `frame`. `kind` says whether this cycle
    /// must produce a keyframe.
    fn process_frame(&mut self, frame: &mut FrameBuffer, kind: FrameKind) -> Result<EncodeStatus, EncoderError>;

    /// Consumes the recovery signal once per cycle.
    fn service_recovery(&mut self, signal: &RecoverySignal) -> FrameKind {
        signal.service()
    }
}

impl<E: FrameEncoder + ?Sized> FrameEncoder for Box<E> {
    fn process_frame(&mut self, frame: &mut FrameBuffer, kind: FrameKind) -> Result<EncodeStatus, EncoderError> {
        (**self).process_frame(frame, kind)
    }

    fn service_recovery(&mut self, signal: &RecoverySignal) -> FrameKind {
        (**self).service_recovery(signal)
    }
}
