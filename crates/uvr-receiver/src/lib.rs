//! Receiving half of a uvr stream.

pub mod decoder;
pub mod session;

pub use decoder::FrameDecoder;
pub use session::{ReceiverSession, ReceiverStats};
