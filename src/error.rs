//! Error types for MCPLens
//!
//! This module defines all error types used throughout the service, using
//! `thiserror` for ergonomic error handling, plus the small wire-level
//! taxonomy (`ErrorCode`) that the HTTP edge reports to clients.

use thiserror::Error;

/// Main error type for MCPLens operations
///
/// This enum encompasses all possible errors that can occur during MCP
/// session management, transport I/O, elicitation brokering, chat turns,
/// and OAuth proxying. Timeouts and cancellations are first-class variants,
/// never control flow by panic.
#[derive(Error, Debug)]
pub enum McpLensError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Missing or invalid bearer credentials on a protected route
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Operation disallowed in the current process mode (e.g. stdio in web mode)
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Unknown server id, elicitation request id, or approval id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed request body or schema violation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Capability the server did not advertise
    #[error("Feature not supported: {0}")]
    FeatureNotSupported(String),

    /// Transport-level I/O failure (open failed or connection severed)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation attempted against a server whose session is not ready
    #[error("Server not connected: {0}")]
    NotConnected(String),

    /// A deadline expired
    #[error("Timeout: server={server}, operation={operation}")]
    Timeout {
        /// Server identifier, or `(none)` for operations not tied to a session
        server: String,
        /// The operation or JSON-RPC method that timed out
        operation: String,
    },

    /// The caller abandoned the operation before it completed
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The session closed while requests were still in flight
    #[error("Session closed: {0}")]
    SessionClosed(String),

    /// MCP protocol version negotiation failure
    #[error("Protocol version mismatch: expected one of {expected:?}, got {got}")]
    ProtocolVersion {
        /// List of accepted versions
        expected: Vec<String>,
        /// Version the server returned
        got: String,
    },

    /// JSON-RPC error returned by the peer
    #[error("RPC error {code}: {message}")]
    Rpc {
        /// Numeric JSON-RPC error code
        code: i64,
        /// Human-readable error description
        message: String,
    },

    /// Elicitation brokering failure or user decline/cancel
    #[error("Elicitation error: {0}")]
    Elicitation(String),

    /// Model driver failure (the LLM stream errored)
    #[error("Driver error: {0}")]
    Driver(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal runtime error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// The wire-level error taxonomy surfaced as `{code, message}` on HTTP
///
/// Every [`McpLensError`] maps onto exactly one of these codes via
/// [`McpLensError::code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Missing/invalid bearer on protected routes
    Unauthorized,
    /// Operation disallowed in current mode
    Forbidden,
    /// Unknown serverId, unknown elicitation requestId
    NotFound,
    /// Malformed JSON body or schema violation
    ValidationError,
    /// Capability the server did not advertise
    FeatureNotSupported,
    /// Transport open failed or was severed
    ServerUnreachable,
    /// Any deadline expiry
    Timeout,
    /// Catchall
    InternalError,
}

impl ErrorCode {
    /// The canonical wire spelling of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::FeatureNotSupported => "FEATURE_NOT_SUPPORTED",
            ErrorCode::ServerUnreachable => "SERVER_UNREACHABLE",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// The HTTP status code this taxonomy entry is reported with.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::Unauthorized => 401,
            ErrorCode::Forbidden => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::ValidationError => 400,
            ErrorCode::FeatureNotSupported => 400,
            ErrorCode::ServerUnreachable => 502,
            ErrorCode::Timeout => 504,
            ErrorCode::InternalError => 500,
        }
    }
}

impl McpLensError {
    /// Maps this error onto the wire taxonomy.
    ///
    /// Cancellation has no dedicated wire code; a cancelled HTTP request never
    /// observes its own response, so it maps to `INTERNAL_ERROR`.
    pub fn code(&self) -> ErrorCode {
        match self {
            McpLensError::Unauthorized(_) => ErrorCode::Unauthorized,
            McpLensError::Forbidden(_) => ErrorCode::Forbidden,
            McpLensError::NotFound(_) => ErrorCode::NotFound,
            McpLensError::Validation(_) | McpLensError::Serialization(_) => {
                ErrorCode::ValidationError
            }
            McpLensError::FeatureNotSupported(_) => ErrorCode::FeatureNotSupported,
            McpLensError::Transport(_)
            | McpLensError::NotConnected(_)
            | McpLensError::SessionClosed(_)
            | McpLensError::Http(_) => ErrorCode::ServerUnreachable,
            McpLensError::Timeout { .. } => ErrorCode::Timeout,
            _ => ErrorCode::InternalError,
        }
    }
}

/// Result type alias for MCPLens operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;

/// Extracts the [`ErrorCode`] from an `anyhow::Error`, walking the chain for
/// a [`McpLensError`]. Unknown error types map to `INTERNAL_ERROR`.
pub fn code_of(err: &anyhow::Error) -> ErrorCode {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<McpLensError>())
        .map(McpLensError::code)
        .next()
        .unwrap_or(ErrorCode::InternalError)
}
