//! Error types for protocol operations

use thiserror::Error;
use crate::envelope::{ErrorCode, ErrorDetails};

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Payload could not be serialized
    #[error("Encoding error: {0}")]
    Encode(String),

    /// Inbound message is not valid JSON or does not match the envelope shape
    #[error("Decode error: {0}")]
    Decode(String),

    /// Envelope is well-formed JSON but misses a field its type requires
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Message too large
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge {
        /// Actual message size
        size: usize,
        /// Maximum allowed size
        max: usize
    },
}

impl From<ProtocolError> for ErrorDetails {
    fn from(error: ProtocolError) -> Self {
        match error {
            ProtocolError::Encode(msg) => {
                ErrorDetails::new(ErrorCode::InternalError, format!("Failed to encode result: {}", msg))
            }
            ProtocolError::Decode(msg) | ProtocolError::InvalidEnvelope(msg) => {
                ErrorDetails::new(ErrorCode::InvalidRequest, msg)
            }
            ProtocolError::MessageTooLarge { size, max } => {
                ErrorDetails::new(
                    ErrorCode::InternalError,
                    format!("Message too large: {} bytes (max: {})", size, max)
                )
            }
        }
    }
}
