//! Common error types for Toolgate
//!
//! This module defines all error types used across the Toolgate system.
//! Every error that reaches a caller's completion handle is terminal; the
//! supervisor never retries on its own. Errors carry enough information for
//! the HTTP facade to build an `{"error": {"code", "message"}}` body.

use std::net::AddrParseError;
use thiserror::Error;

/// Main error type for Toolgate
#[derive(Error, Debug)]
pub enum ToolgateError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid input from a caller
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The worker process could not be started
    #[error("Spawn error: {0}")]
    Spawn(String),

    /// Worker not healthy when the request reached the head of the queue
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// No correlated reply within the request timeout
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Worker output could not be parsed as a reply
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Write attempted after the worker's input closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Worker exited while the request was in flight
    #[error("Worker crashed: {0}")]
    WorkerCrashed(String),

    /// Bounded queue at capacity
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// The worker answered with a JSON-RPC error object
    #[error("Worker error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<AddrParseError> for ToolgateError {
    fn from(err: AddrParseError) -> Self {
        ToolgateError::Config(err.to_string())
    }
}

impl ToolgateError {
    /// Stable label for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            ToolgateError::Config(_) => "config",
            ToolgateError::Io(_) => "io",
            ToolgateError::Serialization(_) => "serialization",
            ToolgateError::InvalidInput(_) => "invalid_input",
            ToolgateError::Spawn(_) => "spawn",
            ToolgateError::ServiceUnavailable(_) => "service_unavailable",
            ToolgateError::Timeout(_) => "timeout",
            ToolgateError::MalformedResponse(_) => "malformed_response",
            ToolgateError::ChannelClosed(_) => "channel_closed",
            ToolgateError::WorkerCrashed(_) => "worker_crashed",
            ToolgateError::QueueFull(_) => "queue_full",
            ToolgateError::Rpc { .. } => "rpc_error",
            ToolgateError::Internal(_) => "internal",
        }
    }

    /// JSON-RPC style error code for the facade error body
    ///
    /// Worker errors keep the code the worker sent. Everything else lives in
    /// the implementation-defined server error range (-32000 to -32099).
    pub fn code(&self) -> i64 {
        match self {
            ToolgateError::Rpc { code, .. } => *code,
            ToolgateError::InvalidInput(_) => -32602,
            ToolgateError::Serialization(_) => -32700,
            ToolgateError::ServiceUnavailable(_) | ToolgateError::ChannelClosed(_) => -32001,
            ToolgateError::Timeout(_) => -32002,
            ToolgateError::MalformedResponse(_) => -32003,
            ToolgateError::WorkerCrashed(_) => -32004,
            ToolgateError::QueueFull(_) => -32005,
            ToolgateError::Config(_)
            | ToolgateError::Io(_)
            | ToolgateError::Spawn(_)
            | ToolgateError::Internal(_) => -32603,
        }
    }

    /// HTTP status the facade answers with
    pub fn http_status(&self) -> u16 {
        match self {
            ToolgateError::InvalidInput(_) | ToolgateError::Serialization(_) => 400,
            ToolgateError::ServiceUnavailable(_)
            | ToolgateError::ChannelClosed(_)
            | ToolgateError::WorkerCrashed(_) => 503,
            ToolgateError::QueueFull(_) => 429,
            ToolgateError::Timeout(_) => 504,
            ToolgateError::MalformedResponse(_) | ToolgateError::Rpc { .. } => 502,
            ToolgateError::Config(_)
            | ToolgateError::Io(_)
            | ToolgateError::Spawn(_)
            | ToolgateError::Internal(_) => 500,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        ToolgateError::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        ToolgateError::InvalidInput(msg.into())
    }

    /// Create a spawn error
    pub fn spawn(msg: impl Into<String>) -> Self {
        ToolgateError::Spawn(msg.into())
    }

    /// Create a service unavailable error
    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        ToolgateError::ServiceUnavailable(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        ToolgateError::Timeout(msg.into())
    }

    /// Create a malformed response error
    pub fn malformed_response(msg: impl Into<String>) -> Self {
        ToolgateError::MalformedResponse(msg.into())
    }

    /// Create a channel closed error
    pub fn channel_closed(msg: impl Into<String>) -> Self {
        ToolgateError::ChannelClosed(msg.into())
    }

    /// Create a worker crashed error
    pub fn worker_crashed(msg: impl Into<String>) -> Self {
        ToolgateError::WorkerCrashed(msg.into())
    }

    /// Create a queue full error
    pub fn queue_full(msg: impl Into<String>) -> Self {
        ToolgateError::QueueFull(msg.into())
    }

    /// Create a worker RPC error
    pub fn rpc(code: i64, message: impl Into<String>) -> Self {
        ToolgateError::Rpc {
            code,
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        ToolgateError::Internal(msg.into())
    }
}

/// Result type alias for Toolgate operations
pub type Result<T> = std::result::Result<T, ToolgateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_error_keeps_worker_code() {
        let err = ToolgateError::rpc(-32601, "method not found");
        assert_eq!(err.code(), -32601);
        assert_eq!(err.http_status(), 502);
        assert_eq!(err.kind(), "rpc_error");
    }

    #[test]
    fn test_unavailable_family_maps_to_503() {
        for err in [
            ToolgateError::service_unavailable("starting"),
            ToolgateError::channel_closed("stdin closed"),
            ToolgateError::worker_crashed("exit code 1"),
        ] {
            assert_eq!(err.http_status(), 503, "{}", err);
        }
    }

    #[test]
    fn test_timeout_and_queue_full() {
        assert_eq!(ToolgateError::timeout("30s").http_status(), 504);
        assert_eq!(ToolgateError::queue_full("64").http_status(), 429);
        assert_eq!(ToolgateError::malformed_response("x").code(), -32003);
    }

    #[test]
    fn test_addr_parse_error_is_config() {
        let err: ToolgateError = "not an addr"
            .parse::<std::net::SocketAddr>()
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), "config");
    }
}
