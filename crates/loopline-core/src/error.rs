//! Error types for the loopline IPC layer.
//!
//! Every failure the layer can produce maps onto a stable [`ErrorCode`], a
//! coarse [`ErrorType`] and an HTTP-style status code, so that server-side
//! failures can be carried over the wire as a structured [`ErrorBody`] and
//! client-side failures can be branched on without string matching.

use crate::protocol::ErrorBody;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Stable error identifiers carried in `error_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Client errors
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    Conflict,
    ValidationError,
    RateLimited,

    // Server errors
    InternalError,
    NotImplemented,
    ServiceUnavailable,
    Timeout,

    // Transport errors
    ConnectionLost,
    ProtocolError,
    MessageTooLarge,
    SerializationError,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 16] = [
        ErrorCode::BadRequest,
        ErrorCode::Unauthorized,
        ErrorCode::Forbidden,
        ErrorCode::NotFound,
        ErrorCode::MethodNotAllowed,
        ErrorCode::Conflict,
        ErrorCode::ValidationError,
        ErrorCode::RateLimited,
        ErrorCode::InternalError,
        ErrorCode::NotImplemented,
        ErrorCode::ServiceUnavailable,
        ErrorCode::Timeout,
        ErrorCode::ConnectionLost,
        ErrorCode::ProtocolError,
        ErrorCode::MessageTooLarge,
        ErrorCode::SerializationError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::NotImplemented => "NOT_IMPLEMENTED",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::ConnectionLost => "CONNECTION_LOST",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::MessageTooLarge => "MESSAGE_TOO_LARGE",
            ErrorCode::SerializationError => "SERIALIZATION_ERROR",
        }
    }

    /// Parse a wire identifier. Unknown identifiers yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|code| code.as_str() == s)
    }

    /// HTTP-style status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorCode::BadRequest | ErrorCode::ProtocolError => 400,
            ErrorCode::Unauthorized => 401,
            ErrorCode::Forbidden => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::MethodNotAllowed => 405,
            ErrorCode::Conflict => 409,
            ErrorCode::MessageTooLarge => 413,
            ErrorCode::ValidationError => 422,
            ErrorCode::RateLimited => 429,
            ErrorCode::InternalError | ErrorCode::SerializationError => 500,
            ErrorCode::NotImplemented => 501,
            ErrorCode::ServiceUnavailable | ErrorCode::ConnectionLost => 503,
            ErrorCode::Timeout => 504,
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            ErrorCode::Unauthorized => ErrorType::Authentication,
            ErrorCode::Forbidden => ErrorType::Authorization,
            ErrorCode::RateLimited => ErrorType::RateLimit,
            ErrorCode::ValidationError => ErrorType::Validation,
            ErrorCode::BadRequest
            | ErrorCode::NotFound
            | ErrorCode::MethodNotAllowed
            | ErrorCode::Conflict => ErrorType::Client,
            ErrorCode::InternalError
            | ErrorCode::NotImplemented
            | ErrorCode::ServiceUnavailable
            | ErrorCode::Timeout => ErrorType::Server,
            ErrorCode::ConnectionLost
            | ErrorCode::ProtocolError
            | ErrorCode::MessageTooLarge
            | ErrorCode::SerializationError => ErrorType::Transport,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse error category carried in `error_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Client,
    Server,
    Transport,
    Authentication,
    Authorization,
    RateLimit,
    Validation,
}

/// Main error type for the IPC layer.
#[derive(Debug, Error)]
pub enum IpcError {
    // Transport errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Address already in use: {address}")]
    AddressInUse { address: String },

    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),

    #[error("Connection lost: {message}")]
    ConnectionLost { message: String },

    // Framing errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Frame of {declared} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { declared: usize, max: usize },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Security errors
    #[error("Peer not authenticated: {reason}")]
    Unauthenticated { reason: String },

    #[error("Access forbidden: {reason}")]
    Forbidden { reason: String },

    #[error("Rate limit exceeded, retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    // Routing errors
    #[error("No route for {path}")]
    NotFound { path: String },

    #[error("Method {method} not allowed for {path}")]
    MethodNotAllowed {
        method: String,
        path: String,
        allowed: Vec<String>,
    },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Bad request: {message}")]
    BadRequest { message: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    // Server errors
    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Service unavailable: {message}")]
    Unavailable { message: String },

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Internal error: {0}")]
    Internal(String),

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A structured error returned by the server, as seen by the client.
    #[error("Server returned {status_code} {}: {}", .error.error_code, .error.error_message)]
    Remote { status_code: u16, error: ErrorBody },
}

/// Result type alias for IPC operations.
pub type Result<T> = std::result::Result<T, IpcError>;

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        IpcError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        IpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl IpcError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => IpcError::PermissionDenied(path),
            std::io::ErrorKind::AddrInUse => IpcError::AddressInUse {
                address: path.display().to_string(),
            },
            _ => IpcError::Io {
                message: err.to_string(),
                path: Some(path),
                source: Some(err),
            },
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        IpcError::Protocol {
            message: message.into(),
        }
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        IpcError::ConnectionLost {
            message: message.into(),
        }
    }

    /// Stable error identifier for this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            IpcError::Io { .. } | IpcError::ConnectionLost { .. } => ErrorCode::ConnectionLost,
            IpcError::AddressInUse { .. } => ErrorCode::Conflict,
            IpcError::PermissionDenied(_) => ErrorCode::Forbidden,
            IpcError::Protocol { .. } => ErrorCode::ProtocolError,
            IpcError::FrameTooLarge { .. } => ErrorCode::MessageTooLarge,
            IpcError::Json { .. } => ErrorCode::SerializationError,
            IpcError::Unauthenticated { .. } => ErrorCode::Unauthorized,
            IpcError::Forbidden { .. } => ErrorCode::Forbidden,
            IpcError::RateLimited { .. } => ErrorCode::RateLimited,
            IpcError::NotFound { .. } => ErrorCode::NotFound,
            IpcError::MethodNotAllowed { .. } => ErrorCode::MethodNotAllowed,
            IpcError::Validation { .. } => ErrorCode::ValidationError,
            IpcError::BadRequest { .. } => ErrorCode::BadRequest,
            IpcError::Conflict { .. } => ErrorCode::Conflict,
            IpcError::Timeout(_) => ErrorCode::Timeout,
            IpcError::Unavailable { .. } => ErrorCode::ServiceUnavailable,
            IpcError::NotImplemented(_) => ErrorCode::NotImplemented,
            IpcError::Internal(_) | IpcError::Config { .. } => ErrorCode::InternalError,
            IpcError::Remote { error, .. } => {
                ErrorCode::parse(&error.error_code).unwrap_or(ErrorCode::InternalError)
            }
        }
    }

    /// HTTP-style status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            IpcError::Remote { status_code, .. } => *status_code,
            other => other.error_code().status_code(),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            IpcError::Remote { error, .. } => error.error_type,
            other => other.error_code().error_type(),
        }
    }

    /// Structured context attached to the wire representation.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            IpcError::RateLimited { retry_after_ms } => {
                Some(serde_json::json!({ "retry_after_ms": retry_after_ms }))
            }
            IpcError::FrameTooLarge { declared, max } => {
                Some(serde_json::json!({ "declared": declared, "max": max }))
            }
            IpcError::MethodNotAllowed { allowed, .. } => {
                Some(serde_json::json!({ "allowed_methods": allowed }))
            }
            IpcError::Validation { field, .. } => Some(serde_json::json!({ "field": field })),
            IpcError::Timeout(limit) => {
                Some(serde_json::json!({ "timeout_ms": limit.as_millis() as u64 }))
            }
            IpcError::Remote { error, .. } => error.details.clone(),
            _ => None,
        }
    }

    /// True for failures that violate the framing protocol. These are fatal
    /// to the connection that produced them.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            IpcError::Protocol { .. } | IpcError::FrameTooLarge { .. }
        )
    }

    /// Check if this error should trigger a retry of an idempotent request.
    pub fn is_retryable(&self) -> bool {
        match self {
            IpcError::ConnectionLost { .. }
            | IpcError::Io { .. }
            | IpcError::Timeout(_)
            | IpcError::Unavailable { .. } => true,
            IpcError::Remote { error, .. } => matches!(
                ErrorCode::parse(&error.error_code),
                Some(ErrorCode::ServiceUnavailable) | Some(ErrorCode::Timeout)
            ),
            _ => false,
        }
    }
}
