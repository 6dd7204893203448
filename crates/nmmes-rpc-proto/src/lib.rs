//! # nmmes-rpc protocol
//!
//! Envelope types, argument normalization, and the JSON codec shared by every
//! nmmes-rpc endpoint. One envelope travels per transport message.

#![warn(missing_docs)]

/// Envelope types and argument helpers
pub mod envelope;

/// JSON codec for envelopes
pub mod codec;

/// Error types for protocol operations
pub mod error;

pub use codec::EnvelopeCodec;
pub use envelope::{
    from_args, normalize, to_args, Args, Call, Envelope, ErrorCode, ErrorDetails, MessageType,
    Outcome, Publish, Response,
};
pub use error::ProtocolError;

/// Sub-protocol token negotiated by both ends of a connection
pub const PROTOCOL: &str = "nmmes-rpc";

/// Reserved call a peer issues to join a topic's subscriber set
pub const SUBSCRIBE_NAMESPACE: &str = "__subscribe__";

/// Reserved call a peer issues to leave a topic's subscriber set
pub const UNSUBSCRIBE_NAMESPACE: &str = "__unsubscribe__";
