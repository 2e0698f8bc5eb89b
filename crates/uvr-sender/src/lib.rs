//! Sending half of a uvr stream.
//!
//! A [`SenderSession`] owns one transport backend and one `uvr-pacer`
//! thread. Every frame interval the pacer asks the [`FrameEncoder`] for a
//! frame (a keyframe when the receiver reported a loss) and sends it.

pub mod encoder;
pub mod feedback;
pub mod pacer;
pub mod session;

pub use encoder::{EncodeStatus, FrameEncoder};
pub use feedback::{NoFeedback, SessionFeedback};
pub use pacer::{FramePacer, Ticker, POLL_SLEEP};
pub use session::{SenderSession, SenderStatus};
