use uvr_core::{CompletedFrame, DecoderError};

/// The video decoder completed frames are handed to. Ownership of the bytes
/// moves to the decoder.
pub trait FrameDecoder: Send {
    fn accept_completed_frame(&mut self, frame: CompletedFrame) -> Result<(), DecoderError>;
}

impl<D: FrameDecoder + ?Sized> FrameDecoder for Box<D> {
    fn accept_completed_frame(&mut self, frame: CompletedFrame) -> Result<(), DecoderError> {
        (**self).accept_completed_frame(frame)
    }
}
