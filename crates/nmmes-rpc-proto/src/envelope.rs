//! Envelope types and argument helpers

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use crate::ProtocolError;

/// Positional argument or return value sequence
pub type Args = Vec<Value>;

/// Wire message wrapper
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Invocation of a remote function
    Call(Call),
    /// Answer to a previously sent call
    Response(Response),
    /// Topic event pushed to subscribers
    Publish(Publish),
}

/// A call to a named function on the peer
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    /// Connection-scoped correlation id
    pub id: u64,
    /// Target function
    pub namespace: String,
    /// Positional arguments
    pub data: Args,
}

/// Response to a call, matched by id
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Id of the call this answers
    pub id: u64,
    /// Either the returned values or the failure
    pub outcome: Outcome,
}

/// Result half of a response; exactly one side is ever on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Successful return values
    Result(Args),
    /// Failure description
    Error(ErrorDetails),
}

/// Event published on a topic
#[derive(Debug, Clone, PartialEq)]
pub struct Publish {
    /// Topic
    pub namespace: String,
    /// Payload, normalized to a sequence
    pub data: Args,
}

/// Envelope discriminator as carried in the `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// `call`
    Call,
    /// `response`
    Response,
    /// `publish`
    Publish,
}

impl Envelope {
    /// Create a call envelope
    pub fn call(id: u64, namespace: impl Into<String>, data: Args) -> Self {
        Self::Call(Call { id, namespace: namespace.into(), data })
    }

    /// Create a successful response envelope
    pub fn result(id: u64, result: Args) -> Self {
        Self::Response(Response { id, outcome: Outcome::Result(result) })
    }

    /// Create a failed response envelope
    pub fn error(id: u64, error: ErrorDetails) -> Self {
        Self::Response(Response { id, outcome: Outcome::Error(error) })
    }

    /// Create a publish envelope
    pub fn publish(namespace: impl Into<String>, data: Args) -> Self {
        Self::Publish(Publish { namespace: namespace.into(), data })
    }

    /// Get the message type
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Call(_) => MessageType::Call,
            Self::Response(_) => MessageType::Response,
            Self::Publish(_) => MessageType::Publish,
        }
    }

    /// Get the correlation id; publishes carry none
    pub fn id(&self) -> Option<u64> {
        match self {
            Self::Call(call) => Some(call.id),
            Self::Response(resp) => Some(resp.id),
            Self::Publish(_) => None,
        }
    }

    /// Get the namespace; responses carry none
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Self::Call(call) => Some(&call.namespace),
            Self::Response(_) => None,
            Self::Publish(publish) => Some(&publish.namespace),
        }
    }

    pub(crate) fn to_wire(&self) -> WireEnvelope {
        match self {
            Self::Call(call) => WireEnvelope {
                kind: MessageType::Call,
                id: Some(call.id),
                namespace: Some(call.namespace.clone()),
                data: Some(Value::Array(call.data.clone())),
                result: None,
                error: None,
            },
            Self::Response(resp) => {
                let (result, error) = match &resp.outcome {
                    Outcome::Result(values) => (Some(Value::Array(values.clone())), None),
                    Outcome::Error(details) => (None, Some(details.to_value())),
                };
                WireEnvelope {
                    kind: MessageType::Response,
                    id: Some(resp.id),
                    namespace: None,
                    data: None,
                    result,
                    error,
                }
            }
            Self::Publish(publish) => WireEnvelope {
                kind: MessageType::Publish,
                id: None,
                namespace: Some(publish.namespace.clone()),
                data: Some(Value::Array(publish.data.clone())),
                result: None,
                error: None,
            },
        }
    }

    pub(crate) fn from_wire(wire: WireEnvelope) -> Result<Self, ProtocolError> {
        match wire.kind {
            MessageType::Call => {
                let id = wire.id
                    .ok_or_else(|| ProtocolError::InvalidEnvelope("call without id".to_string()))?;
                let namespace = wire.namespace
                    .ok_or_else(|| ProtocolError::InvalidEnvelope(format!("call {} without namespace", id)))?;
                Ok(Self::call(id, namespace, normalize(wire.data.unwrap_or(Value::Null))))
            }
            MessageType::Response => {
                let id = wire.id
                    .ok_or_else(|| ProtocolError::InvalidEnvelope("response without id".to_string()))?;
                // An error takes precedence when a peer sends both
                match wire.error {
                    Some(error) => Ok(Self::error(id, ErrorDetails::from_value(error))),
                    None => Ok(Self::result(id, normalize(wire.result.unwrap_or(Value::Null)))),
                }
            }
            MessageType::Publish => {
                let namespace = wire.namespace
                    .ok_or_else(|| ProtocolError::InvalidEnvelope("publish without namespace".to_string()))?;
                Ok(Self::publish(namespace, normalize(wire.data.unwrap_or(Value::Null))))
            }
        }
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireEnvelope::deserialize(deserializer)?;
        Self::from_wire(wire).map_err(serde::de::Error::custom)
    }
}

/// Flat on-the-wire shape; every field but `type` is optional
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireEnvelope {
    #[serde(rename = "type")]
    pub(crate) kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) error: Option<Value>,
}

/// Normalize a single value into an argument sequence.
///
/// Arrays are spread, `null` becomes empty, anything else is wrapped.
pub fn normalize(value: Value) -> Args {
    match value {
        Value::Array(values) => values,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

/// Serialize a value and normalize it into an argument sequence.
///
/// Tuples and vectors serialize to arrays and are therefore spread positionally.
pub fn to_args<T: Serialize + ?Sized>(value: &T) -> Result<Args, ProtocolError> {
    serde_json::to_value(value)
        .map(normalize)
        .map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Deserialize an argument sequence into a typed value.
///
/// The whole sequence is tried first (tuples, vectors, tuple structs); a
/// one-element sequence falls back to its sole element so `[3]` reads as `3`.
pub fn from_args<T: DeserializeOwned>(args: Args) -> Result<T, ProtocolError> {
    let whole = Value::Array(args);
    match serde_json::from_value::<T>(whole.clone()) {
        Ok(value) => Ok(value),
        Err(err) => match whole {
            Value::Array(mut values) if values.len() == 1 => {
                serde_json::from_value(values.remove(0))
                    .map_err(|e| ProtocolError::Decode(e.to_string()))
            }
            _ => Err(ProtocolError::Decode(err.to_string())),
        },
    }
}

/// Error details for error responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// Additional context data
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
}

/// Error codes carried in error responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// No handler registered for the called namespace
    UnregisteredNamespace,
    /// The handler returned an error or panicked
    HandlerFailed,
    /// The call itself was malformed
    InvalidRequest,
    /// Internal error on the answering side
    InternalError,
    /// Code sent by a peer that this version does not know
    #[serde(other)]
    Unknown,
}

impl ErrorDetails {
    /// Create a new error details
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: HashMap::new(),
        }
    }

    /// Error reported for a call to a namespace without handler
    pub fn unregistered(namespace: &str) -> Self {
        Self::new(
            ErrorCode::UnregisteredNamespace,
            format!("Call to unregistered namespace \"{}\".", namespace),
        )
        .with_context("namespace", namespace)
    }

    /// Add context to the error
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Interpret whatever error value a peer put on the wire.
    ///
    /// Structured details are kept as-is; bare strings and other values become
    /// a `HandlerFailed` with their text as message.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::String(message) => Self::new(ErrorCode::HandlerFailed, message),
            Value::Object(ref map) => {
                if let Ok(details) = serde_json::from_value::<ErrorDetails>(value.clone()) {
                    return details;
                }
                match map.get("message").and_then(Value::as_str) {
                    Some(message) => Self::new(ErrorCode::HandlerFailed, message),
                    None => Self::new(ErrorCode::HandlerFailed, value.to_string()),
                }
            }
            other => Self::new(ErrorCode::HandlerFailed, other.to_string()),
        }
    }

    /// Serialize into a JSON value for the wire
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self)
            .unwrap_or_else(|_| Value::String(self.message.clone()))
    }
}

impl fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}
