//! Error types for the job server
//!
//! Crate-level operations return `JobServerResult<T>`. Package resolution has
//! its own cloneable `ResolveError`, since one failure is shared by every
//! caller waiting on the same computation.

use crate::protocol::{ErrorKind, ErrorReply};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for job server operations
pub type JobServerResult<T> = Result<T, JobServerError>;

/// All errors that can occur outside of a single resolution
#[derive(Error, Debug)]
pub enum JobServerError {
    // Bus errors
    #[error("No subscriber for subject: {0}")]
    NoResponders(String),

    #[error("Subject already has a subscriber: {0}")]
    AlreadySubscribed(String),

    #[error("Request on {subject} timed out after {timeout:?}")]
    RequestTimeout { subject: String, timeout: Duration },

    #[error("Responder for {0} dropped the request without replying")]
    NoReply(String),

    #[error("Failed to deliver reply: {0}")]
    ReplyDelivery(String),

    #[error("Bus connection closed")]
    ConnectionClosed,

    #[error("Invalid bus URL: {0}")]
    InvalidUrl(String),

    #[error("Bus frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Operation not supported by this transport: {0}")]
    Unsupported(&'static str),

    // Protocol errors
    #[error("Malformed payload: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Job server replied with {}: {}", .0.kind, .0.message)]
    Remote(ErrorReply),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobServerError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Check if reissuing the same request may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RequestTimeout { .. } | Self::NoReply(_) | Self::ConnectionClosed => true,
            Self::Remote(reply) => matches!(
                reply.kind,
                ErrorKind::Resolution | ErrorKind::Timeout | ErrorKind::Cancelled
            ),
            _ => false,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::NoResponders(_) => Some("Is the job server running? Start it with: jobserver serve"),
            Self::InvalidUrl(_) => Some("Job server URLs look like tcp://127.0.0.1:4222"),
            Self::RequestTimeout { .. } => Some("Retry the request or raise server.request_timeout_secs"),
            _ => None,
        }
    }
}

/// Failure of a single package resolution, as seen by one caller
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("package resolution failed: {0}")]
    Resolution(String),

    #[error("request cancelled before the result was available")]
    Cancelled,

    #[error("request timed out before the result was available")]
    Timeout,

    #[error("resolution was abandoned before it completed")]
    Abandoned,

    #[error("job server is shutting down")]
    Shutdown,
}

impl ResolveError {
    /// Wire classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Resolution(_) => ErrorKind::Resolution,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Timeout => ErrorKind::Timeout,
            Self::Abandoned => ErrorKind::Internal,
            Self::Shutdown => ErrorKind::Unavailable,
        }
    }

    /// Structured reply sent back to the requester
    pub fn to_reply(&self) -> ErrorReply {
        ErrorReply::new(self.kind(), self.to_string())
    }
}
