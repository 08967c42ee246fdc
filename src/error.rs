//! Error taxonomy shared by the connection manager, sandbox executor and gateway.

use std::time::Duration;
use thiserror::Error;

/// Errors raised below the gateway boundary. The gateway converts each into a structured response.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unknown host '{0}'")]
    UnknownHost(String),

    #[error("transport failure on host '{host}': {message}")]
    Transport { host: String, message: String },

    #[error("authentication rejected by host '{host}' for user '{user}'")]
    AuthenticationRejected { host: String, user: String },

    #[error("command timed out after {}ms", .elapsed.as_millis())]
    Timeout {
        elapsed: Duration,
        /// Output captured before the process was killed.
        partial_output: String,
    },

    #[error("private key error: {0}")]
    Key(String),

    #[error("sandbox backend '{backend}' unavailable: {message}")]
    SandboxUnavailable { backend: String, message: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("connection manager is shut down")]
    ShutDown,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Ssh(#[from] russh::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub fn transport(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Whether another connection attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Transport { .. } | GatewayError::Io(_) => true,
            GatewayError::Ssh(err) => !matches!(err, russh::Error::NotAuthenticated),
            GatewayError::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Stable machine-readable code used in error responses.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::UnknownHost(_) => "unknown_host",
            GatewayError::Transport { .. }
            | GatewayError::AuthenticationRejected { .. }
            | GatewayError::Ssh(_)
            | GatewayError::Key(_) => "transport_failure",
            GatewayError::Timeout { .. } => "timeout",
            GatewayError::SandboxUnavailable { .. } | GatewayError::Configuration(_) => {
                "configuration_failure"
            }
            GatewayError::ShutDown => "shut_down",
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::Io(_) => "execution_failure",
        }
    }
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;
