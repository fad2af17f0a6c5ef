//! Error types for the live-data client.
//!
//! Two families live here:
//! - [`DdpError`]: failures of the connection machinery itself. Decode
//!   problems are logged and dropped by the router; `Invariant` means the
//!   shadow state diverged from what the protocol guarantees and is fatal.
//! - [`MethodError`]: structured application errors delivered to method
//!   callbacks and subscription stop callbacks.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Connection-level errors.
#[derive(Error, Debug)]
pub enum DdpError {
    #[error("Failed to decode DDP message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Failed to encode DDP message: {0}")]
    Encode(String),
    #[error("Internal consistency violation: {0}")]
    Invariant(String),
    #[error("A method named '{0}' is already defined")]
    DuplicateMethod(String),
    #[error("A store for collection '{0}' is already registered")]
    DuplicateStore(String),
    #[error("Exception while simulating '{method}': {source}")]
    Stub {
        method: String,
        #[source]
        source: MethodError,
    },
    #[error("Connection closed")]
    ConnectionClosed,
}

impl DdpError {
    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    /// Whether this error means the connection state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Invariant(_))
    }
}

/// Error code carried by a method error: servers send either a number
/// (HTTP-like status) or a short string tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorCode {
    Number(i64),
    Name(String),
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Name(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ErrorCode {
    fn from(value: &str) -> Self {
        Self::Name(value.to_string())
    }
}

impl From<i64> for ErrorCode {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

/// Structured application error: `{error, reason, details}` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodError {
    pub error: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl fmt::Display for MethodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "{reason} [{}]", self.error),
            None => write!(f, "[{}]", self.error),
        }
    }
}

impl std::error::Error for MethodError {}

impl MethodError {
    pub fn new(error: impl Into<ErrorCode>, reason: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            reason: Some(reason.into()),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Failure synthesized for a `no_retry` method whose message was already
    /// on the wire when the connection dropped.
    pub fn invocation_failed() -> Self {
        Self::new(
            "invocation-failed",
            "Method invocation might have failed due to dropped connection. \
             Failing because the `no_retry` option was set.",
        )
    }

    /// Delivered to pending result futures when the connection task is gone.
    pub fn connection_lost() -> Self {
        Self::new("connection-lost", "Connection closed before the method completed")
    }

    pub fn is_code(&self, code: &str) -> bool {
        matches!(&self.error, ErrorCode::Name(name) if name == code)
    }
}

pub type Result<T, E = DdpError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_error_display() {
        let err = MethodError::new("not-found", "No such document");
        assert_eq!(err.to_string(), "No such document [not-found]");

        let bare = MethodError {
            error: ErrorCode::Number(500),
            reason: None,
            details: None,
        };
        assert_eq!(bare.to_string(), "[500]");
    }

    #[test]
    fn test_error_code_accepts_numbers_and_strings() {
        let numeric: MethodError =
            serde_json::from_str(r#"{"error":404,"reason":"Method not found"}"#).unwrap();
        assert_eq!(numeric.error, ErrorCode::Number(404));

        let named: MethodError = serde_json::from_str(r#"{"error":"denied"}"#).unwrap();
        assert!(named.is_code("denied"));
        assert!(named.reason.is_none());
    }

    #[test]
    fn test_invocation_failed_code() {
        assert!(MethodError::invocation_failed().is_code("invocation-failed"));
    }

    #[test]
    fn test_only_invariant_is_fatal() {
        assert!(DdpError::invariant("lost serverDoc").is_fatal());
        assert!(!DdpError::ConnectionClosed.is_fatal());
        assert!(!DdpError::DuplicateMethod("m".into()).is_fatal());
    }
}
