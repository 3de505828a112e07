//! Protocol-level error types.

use thiserror::Error;

/// Errors raised while encoding, decoding or framing protocol messages.
///
/// Any of these surfacing from an inbound connection is treated as a
/// protocol violation by the server: the offending peer is disconnected.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The buffer does not describe a valid message or packet.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),
    /// A frame announced a length above [`crate::transport::MAX_FRAME_SIZE`].
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
    /// Underlying transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Shorthand used by the codec when input runs out or is inconsistent.
    pub fn malformed(reason: impl Into<String>) -> Self {
        ProtocolError::MalformedMessage(reason.into())
    }
}
