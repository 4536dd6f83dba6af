//! Wire encoding for bus payloads
//!
//! Requests are plain JSON values. Replies are wrapped in an envelope:
//! `{"ok": <value>}` on success, `{"error": {"kind": ..., "message": ...}}`
//! otherwise.

use crate::error::{JobServerError, JobServerResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of an error reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Request payload could not be decoded
    Decode,
    /// The resolver failed; safe to retry
    Resolution,
    /// The request was cancelled before a result was available
    Cancelled,
    /// The request deadline elapsed
    Timeout,
    /// The server is shutting down
    Unavailable,
    /// Anything else
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::Resolution => "resolution",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::Unavailable => "unavailable",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorReply {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Reply envelope: exactly one of a value or an error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply<T> {
    Ok(T),
    Error(ErrorReply),
}

impl<T> Reply<T> {
    /// Convert into a result, turning error replies into `JobServerError::Remote`
    pub fn into_result(self) -> JobServerResult<T> {
        match self {
            Self::Ok(value) => Ok(value),
            Self::Error(reply) => Err(JobServerError::Remote(reply)),
        }
    }
}

impl<T, E: Into<ErrorReply>> From<Result<T, E>> for Reply<T> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(e) => Self::Error(e.into()),
        }
    }
}

impl From<crate::error::ResolveError> for ErrorReply {
    fn from(err: crate::error::ResolveError) -> Self {
        err.to_reply()
    }
}

impl From<std::convert::Infallible> for ErrorReply {
    fn from(never: std::convert::Infallible) -> Self {
        match never {}
    }
}

/// Serialize a value into a bus payload
pub fn encode<T: Serialize>(value: &T) -> JobServerResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(JobServerError::Encode)
}

/// Deserialize a bus payload
///
/// Malformed input yields `JobServerError::Decode`; this never panics.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> JobServerResult<T> {
    serde_json::from_slice(payload).map_err(JobServerError::Decode)
}
