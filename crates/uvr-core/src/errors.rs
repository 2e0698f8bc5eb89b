use std::io;

use thiserror::Error;

use crate::config::BackendKind;

#[derive(Error, Debug)]
pub enum UvrError {
    #[error("Configuration invalid: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Encoder error: {0}")]
    Encoder(#[from] EncoderError),

    #[error("Decoder error: {0}")]
    Decoder(#[from] DecoderError),
}

/// Socket-level failures. Always fatal for the session that owns the socket.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Couldn't create socket: {0}")]
    Socket(#[source] io::Error),

    #[error("Couldn't bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Couldn't connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Read failed: {0}")]
    Read(#[source] io::Error),

    #[error("Write failed: {0}")]
    Write(#[source] io::Error),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Malformed data: {reason}")]
    Malformed { reason: String },

    #[error("Malformed envelope: {0}")]
    Wire(#[from] WireError),

    #[error("Operation not supported by the {backend} backend")]
    Unsupported { backend: BackendKind },

    #[error("Message channel closed")]
    ChannelClosed,
}

/// Envelope parse failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Datagram of {len} bytes is shorter than the {expected} byte envelope header")]
    Truncated { len: usize, expected: usize },

    #[error("Negative total size {0}")]
    NegativeSize(i32),

    #[error("Payload of {len} bytes exceeds the {max} byte fragment size")]
    OversizedFragment { len: usize, max: usize },

    #[error("Frame of {0} bytes does not fit the 32-bit size field")]
    FrameTooLarge(usize),
}

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("Encoder not initialized")]
    NotInitialized,

    #[error("Failed to encode frame: {reason}")]
    EncodeFailed { reason: String },

    #[error("Encoded frame does not fit the frame buffer: {0}")]
    BufferOverflow(#[from] BufferOverflow),
}

#[derive(Error, Debug)]
pub enum DecoderError {
    #[error("Decoder not initialized")]
    NotInitialized,

    #[error("Failed to decode frame: {reason}")]
    DecodeFailed { reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("fragment_size must be between 1 and {max}, got {got}")]
    FragmentSize { got: usize, max: usize },

    #[error("target_fps must be greater than zero")]
    ZeroFrameRate,

    #[error("stall_threshold must be greater than zero")]
    ZeroStallThreshold,

    #[error("max_frame_size must be between 1 and {max}, got {got}")]
    MaxFrameSize { got: usize, max: usize },

    #[error("{field} is required for the {backend} backend")]
    MissingField {
        field: &'static str,
        backend: BackendKind,
    },

    #[error("Invalid configuration document: {0}")]
    Parse(String),
}

/// A write would have gone past the frame buffer's size limit.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("write of {len} bytes at offset {offset} exceeds limit {limit}")]
pub struct BufferOverflow {
    pub offset: usize,
    pub len: usize,
    pub limit: usize,
}
