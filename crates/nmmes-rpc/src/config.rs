//! Endpoint configuration

use std::time::Duration;

/// Default window for a call to be answered
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Settings shared by client and server endpoints
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// How long a call waits for its response, counted from when it is issued
    pub call_timeout: Duration,
    /// Log responses for unknown call ids at `warn` instead of `trace`
    pub log_unknown_responses: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            log_unknown_responses: false,
        }
    }
}

impl EndpointConfig {
    /// Set the call timeout
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Report unknown response ids loudly
    pub fn with_log_unknown_responses(mut self, enabled: bool) -> Self {
        self.log_unknown_responses = enabled;
        self
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Settings applied to every accepted connection
    pub endpoint: EndpointConfig,
    /// Sub-protocol a connection must negotiate to be managed
    pub protocol: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            protocol: nmmes_rpc_proto::PROTOCOL.to_string(),
        }
    }
}

impl ServerConfig {
    /// Set the endpoint settings
    pub fn with_endpoint(mut self, endpoint: EndpointConfig) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Require a different sub-protocol
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }
}
