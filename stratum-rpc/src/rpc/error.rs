//! Error types for the Stratum RPC engine.

use serde_json::Value;
use thiserror::Error;

use super::messages::Request;

/// Stratum RPC errors.
///
/// Everything that can go wrong with a call settles through this type. Only
/// the contract violations (`InvalidMethod`, `EmptyBatch`, `NotASubscription`,
/// `InvalidAddress`) are returned synchronously; the rest arrive through the
/// call's [`PendingResult`](super::PendingResult).
#[derive(Error, Debug)]
pub enum RpcError {
    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Server answered the request with an error payload
    #[error("Server error for {}: {error}", request.method)]
    Server {
        /// Error payload as sent by the server
        error: ServerError,
        /// The request that provoked it
        request: Box<Request>,
    },

    /// Connection died before the server answered
    #[error("Connection lost")]
    ConnectionLost,

    /// Could not establish a connection
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// Connect attempt exceeded the configured timeout
    #[error("Timeout waiting for connection")]
    Timeout,

    /// SOCKS proxy refused or garbled the handshake
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// TLS setup or handshake failed
    #[error("TLS error: {0}")]
    Tls(String),

    /// Protocol code the connector cannot speak
    #[error("Unsupported protocol code: {0:?}")]
    UnsupportedProtocol(char),

    /// Server descriptor has no usable port
    #[error("Invalid server: {0}")]
    InvalidServer(String),

    /// Method name is not a dotted identifier
    #[error("Invalid method name: {0:?}")]
    InvalidMethod(String),

    /// Batch call with no items
    #[error("Batch must contain at least one request")]
    EmptyBatch,

    /// `subscribe` used with a method that is not a subscription
    #[error("Not a subscription method: {0:?}")]
    NotASubscription(String),

    /// Legacy address argument could not be converted
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Request id already outstanding
    #[error("Duplicate request id: {0}")]
    DuplicateId(u64),
}

impl RpcError {
    /// True when the call failed because the connection went away rather
    /// than because the server rejected it.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, RpcError::ConnectionLost)
    }

    /// Server error payload, if the server rejected the call.
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            RpcError::Server { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Convenient Result type for Stratum RPC operations.
pub type RpcResult<T> = Result<T, RpcError>;

/// Error payload returned by the server.
///
/// Electrum servers send `{"code": .., "message": ..}` objects while older
/// Stratum servers send `[code, "message", traceback]` arrays. Both are kept
/// verbatim; the accessors understand either shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerError(pub Value);

impl ServerError {
    /// Numeric error code, if present.
    pub fn code(&self) -> Option<i64> {
        match &self.0 {
            Value::Object(obj) => obj.get("code").and_then(Value::as_i64),
            Value::Array(arr) => arr.first().and_then(Value::as_i64),
            _ => None,
        }
    }

    /// Human-readable message, if present.
    pub fn message(&self) -> Option<&str> {
        match &self.0 {
            Value::Object(obj) => obj.get("message").and_then(Value::as_str),
            Value::Array(arr) => arr.get(1).and_then(Value::as_str),
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Raw payload.
    pub fn payload(&self) -> &Value {
        &self.0
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code(), self.message()) {
            (Some(code), Some(msg)) => write!(f, "{} (code {})", msg, code),
            (None, Some(msg)) => write!(f, "{}", msg),
            _ => write!(f, "{}", self.0),
        }
    }
}

/// Problems decoding a single inbound line.
///
/// These never tear down the connection; the line is dropped.
#[derive(Error, Debug)]
pub enum FramingError {
    /// Line is not valid UTF-8
    #[error("Line is not valid UTF-8")]
    InvalidUtf8,

    /// Line is not valid JSON
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    /// Line exceeded the configured limit and was discarded
    #[error("Line exceeds {limit} bytes")]
    LineTooLong {
        /// Configured maximum
        limit: usize,
    },

    /// Stream ended in the middle of a line
    #[error("Stream ended with {len} bytes of partial line")]
    Truncated {
        /// Bytes dropped
        len: usize,
    },
}
