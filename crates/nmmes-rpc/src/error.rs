//! Error types for nmmes-rpc endpoints

use nmmes_rpc_proto::{ErrorCode, ErrorDetails, ProtocolError};
use nmmes_rpc_transport::TransportError;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced to the issuer of a call or subscription
#[derive(Debug, Error)]
pub enum RpcError {
    /// The peer has no handler for the namespace
    #[error("Call to unregistered namespace \"{namespace}\"")]
    UnregisteredNamespace {
        /// Namespace that was called
        namespace: String,
    },

    /// The peer's handler failed
    #[error("Remote error: {0}")]
    Remote(ErrorDetails),

    /// No response arrived within the call's window
    #[error("Call to \"{namespace}\" timed out after {duration:?}")]
    Timeout {
        /// Namespace that was called
        namespace: String,
        /// Window that was exceeded
        duration: Duration,
    },

    /// The connection went away while the call was outstanding
    #[error("Connection lost")]
    ConnectionLost,

    /// Transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RpcError {
    /// Map an error response to the error the caller sees
    pub fn from_remote(namespace: &str, details: ErrorDetails) -> Self {
        match details.code {
            ErrorCode::UnregisteredNamespace => Self::UnregisteredNamespace {
                namespace: namespace.to_string(),
            },
            _ => Self::Remote(details),
        }
    }

    /// Whether this is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_unregistered_maps_to_kind() {
        let err = RpcError::from_remote("foo.bar", ErrorDetails::unregistered("foo.bar"));
        match err {
            RpcError::UnregisteredNamespace { namespace } => assert_eq!(namespace, "foo.bar"),
            other => panic!("Unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_remote_handler_failure_is_kept() {
        let details = ErrorDetails::new(ErrorCode::HandlerFailed, "boom");
        let err = RpcError::from_remote("math.div", details);
        assert!(matches!(err, RpcError::Remote(ref d) if d.message == "boom"));
        assert_eq!(err.to_string(), "Remote error: boom");
    }

    #[test]
    fn test_timeout_display() {
        let err = RpcError::Timeout {
            namespace: "slow".to_string(),
            duration: Duration::from_millis(250),
        };
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "Call to \"slow\" timed out after 250ms");
    }
}
