//! Error taxonomy for the device-streaming engine.
//!
//! Every fallible operation in this crate maps into one of these kinds.
//! The propagation policy lives with the callers (source/pipeline), not
//! here: this type only names what went wrong.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("setup failed: {0}")]
    Setup(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("framing fault: {0}")]
    Framing(#[from] screenbridge_protocol::FramingError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("capacity exceeded: {0}")]
    Capacity(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("client disconnected")]
    ClientDisconnect,
}

impl StreamError {
    /// Framing/io faults on the video stream bring down the whole Source;
    /// every other kind is local to the stream or subscriber it occurred on.
    pub fn is_fatal_to_source(&self) -> bool {
        matches!(self, StreamError::Framing(_) | StreamError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
