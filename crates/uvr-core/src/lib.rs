pub mod config;
pub mod errors;
pub mod recovery;
pub mod types;

pub use config::{
    BackendKind, LinkConfig, MacAddr, Role, TransportConfig, DEFAULT_ETHERTYPE, MAX_FRAGMENT_SIZE,
    RECEIVER_PORT, SENDER_PORT,
};
pub use errors::{
    BufferOverflow, ConfigError, DecoderError, EncoderError, TransportError, UvrError, WireError,
};
pub use recovery::{FrameKind, RecoverySignal, RECOVERY_REQUESTED};
pub use types::*;
