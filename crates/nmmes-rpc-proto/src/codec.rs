//! JSON codec for envelopes
//!
//! The transport is message oriented, so a message is exactly one envelope
//! encoded as UTF-8 JSON with no length prefix.

use crate::envelope::WireEnvelope;
use crate::{Envelope, ProtocolError};
use bytes::Bytes;

/// Maximum message size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Codec for encoding/decoding envelopes to transport payloads
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeCodec {
    /// Maximum message size allowed
    max_message_size: usize,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeCodec {
    /// Create a new codec with default settings
    pub fn new() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Create a new codec with custom max message size
    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    /// Maximum message size this codec accepts
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Encode an envelope to a UTF-8 JSON payload
    pub fn encode(&self, envelope: &Envelope) -> Result<Bytes, ProtocolError> {
        let encoded = serde_json::to_vec(&envelope.to_wire())
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;

        if encoded.len() > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: encoded.len(),
                max: self.max_message_size,
            });
        }

        Ok(Bytes::from(encoded))
    }

    /// Decode one envelope from a payload
    pub fn decode(&self, payload: &[u8]) -> Result<Envelope, ProtocolError> {
        if payload.len() > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: payload.len(),
                max: self.max_message_size,
            });
        }

        let wire: WireEnvelope = serde_json::from_slice(payload)
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Envelope::from_wire(wire)
    }
}
