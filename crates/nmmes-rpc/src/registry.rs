//! Handler registry
//!
//! Handlers answer inbound calls. They receive the call's `data` sequence and
//! return a JSON value that is normalized into the response's `result`.
//! Closures of the shape `Fn(Args) -> impl Future<Output = HandlerResult>`
//! are handlers; [`typed`] and [`blocking`] adapt other shapes.

use async_trait::async_trait;
use nmmes_rpc_proto::{from_args, Args, ErrorCode, ErrorDetails, ProtocolError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// What a handler produces
pub type HandlerResult = Result<Value, HandlerError>;

/// Failure raised by a handler, reported to the caller as an error response
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerError {
    details: ErrorDetails,
}

impl HandlerError {
    /// Handler failure with a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            details: ErrorDetails::new(ErrorCode::HandlerFailed, message),
        }
    }

    /// Failure caused by arguments the handler cannot use
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            details: ErrorDetails::new(ErrorCode::InvalidRequest, message),
        }
    }

    /// Failure with explicit details
    pub fn with_details(details: ErrorDetails) -> Self {
        Self { details }
    }

    /// Details sent on the wire
    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Take the details
    pub fn into_details(self) -> ErrorDetails {
        self.details
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.details.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("JSON error: {}", err))
    }
}

impl From<ProtocolError> for HandlerError {
    fn from(err: ProtocolError) -> Self {
        Self::with_details(err.into())
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<crate::RpcError> for HandlerError {
    fn from(err: crate::RpcError) -> Self {
        match err {
            crate::RpcError::Remote(details) => Self::with_details(details),
            other => Self::new(other.to_string()),
        }
    }
}

/// Answers calls to one namespace
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handle one call
    async fn call(&self, args: Args) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn call(&self, args: Args) -> HandlerResult {
        (self)(args).await
    }
}

struct Typed<F, A, R> {
    f: F,
    _marker: PhantomData<fn(A) -> R>,
}

/// Adapt a handler taking deserialized arguments and returning any serializable value.
///
/// A tuple receives the positional arguments, e.g.
/// `typed(|(a, b): (i64, i64)| async move { Ok::<_, HandlerError>(a + b) })`.
/// A single non-tuple type receives the only argument.
pub fn typed<A, R, F, Fut>(f: F) -> impl Handler
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
{
    Typed {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<A, R, F, Fut> Handler for Typed<F, A, R>
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
{
    async fn call(&self, args: Args) -> HandlerResult {
        let input: A = from_args(args)
            .map_err(|e| HandlerError::invalid_request(format!("Invalid arguments: {}", e)))?;
        let output = (self.f)(input).await?;
        Ok(serde_json::to_value(output)?)
    }
}

struct Blocking<F> {
    f: Arc<F>,
}

/// Run a synchronous handler on the blocking thread pool
pub fn blocking<F>(f: F) -> impl Handler
where
    F: Fn(Args) -> HandlerResult + Send + Sync + 'static,
{
    Blocking { f: Arc::new(f) }
}

#[async_trait]
impl<F> Handler for Blocking<F>
where
    F: Fn(Args) -> HandlerResult + Send + Sync + 'static,
{
    async fn call(&self, args: Args) -> HandlerResult {
        let f = self.f.clone();
        tokio::task::spawn_blocking(move || f(args))
            .await
            .map_err(|e| HandlerError::new(format!("Blocking handler failed: {}", e)))?
    }
}

/// Namespace to handler map shared by every connection of an endpoint
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn Handler>>>>,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the namespace
    pub fn register<H: Handler>(&self, namespace: impl Into<String>, handler: H) {
        let namespace = namespace.into();
        debug!("Registering handler for {}", namespace);
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(namespace, Arc::new(handler));
    }

    /// Remove a handler; returns whether one was registered
    pub fn unregister(&self, namespace: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(namespace)
            .is_some()
    }

    /// Look up the handler for a namespace
    pub fn get(&self, namespace: &str) -> Option<Arc<dyn Handler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .cloned()
    }

    /// Whether a handler is registered
    pub fn contains(&self, namespace: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(namespace)
    }

    /// Registered namespaces, sorted
    pub fn namespaces(&self) -> Vec<String> {
        let mut namespaces: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        namespaces.sort();
        namespaces
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("namespaces", &self.namespaces())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_closure_handler() {
        let registry = HandlerRegistry::new();
        registry.register("echo", |args: Args| async move { Ok::<_, HandlerError>(Value::Array(args)) });

        let handler = registry.get("echo").unwrap();
        assert_eq!(handler.call(vec![json!(1), json!("two")]).await.unwrap(), json!([1, "two"]));
    }

    #[tokio::test]
    async fn test_typed_handler_spreads_arguments() {
        let handler = typed(|(a, b): (i64, i64)| async move { Ok::<_, HandlerError>(a + b) });
        assert_eq!(handler.call(vec![json!(1), json!(2)]).await.unwrap(), json!(3));
    }

    #[tokio::test]
    async fn test_typed_handler_single_argument() {
        let handler = typed(|name: String| async move { Ok::<_, HandlerError>(format!("hello {}", name)) });
        assert_eq!(handler.call(vec![json!("ada")]).await.unwrap(), json!("hello ada"));
    }

    #[tokio::test]
    async fn test_typed_handler_rejects_bad_arguments() {
        let handler = typed(|(a, b): (i64, i64)| async move { Ok::<_, HandlerError>(a + b) });
        let err = handler.call(vec![json!("x")]).await.unwrap_err();
        assert_eq!(err.details().code, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn test_blocking_handler() {
        let handler = blocking(|args: Args| Ok(json!(args.len())));
        assert_eq!(handler.call(vec![json!(null), json!(null)]).await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_register_overwrites() {
        let registry = HandlerRegistry::new();
        registry.register("version", |_: Args| async { Ok::<_, HandlerError>(json!(1)) });
        registry.register("version", |_: Args| async { Ok::<_, HandlerError>(json!(2)) });

        let handler = registry.get("version").unwrap();
        assert_eq!(handler.call(vec![]).await.unwrap(), json!(2));
        assert_eq!(registry.namespaces(), vec!["version".to_string()]);
    }

    #[test]
    fn test_unregister() {
        let registry = HandlerRegistry::new();
        registry.register("gone", |_: Args| async { Ok::<_, HandlerError>(Value::Null) });

        assert!(registry.contains("gone"));
        assert!(registry.unregister("gone"));
        assert!(!registry.unregister("gone"));
        assert!(registry.get("gone").is_none());
    }

    #[test]
    fn test_handler_error_conversions() {
        let err: HandlerError = "boom".into();
        assert_eq!(err.details().code, ErrorCode::HandlerFailed);
        assert_eq!(err.to_string(), "boom");

        let err: HandlerError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.into_details().message, "disk full");
    }
}
