//! Status codes shared by the management and signal services.
//!
//! Every wire-visible failure is one of these codes plus a human-readable
//! message. Codes travel inside `Failure` frames; handlers on both ends
//! match on the code, never the message.

use serde::{Deserialize, Serialize};

/// Failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    /// Request was malformed (bad key encoding, missing field).
    InvalidArgument,
    /// Referenced account, peer, or key does not exist.
    NotFound,
    /// Caller is known but not allowed to do this (e.g. unregistered peer
    /// logging in without any credential).
    PermissionDenied,
    /// A precondition failed: revoked, expired, or exhausted setup key.
    FailedPrecondition,
    /// The sealed body did not open under the claimed sender key.
    Unauthenticated,
    /// A connection attempt ran out of time.
    DeadlineExceeded,
    /// Transport-level failure; safe to retry.
    Unavailable,
    /// Signal destination has no live stream. Non-fatal; the message was
    /// dropped.
    NotConnected,
    /// Anything that should not happen.
    Internal,
}

/// A failure with its category and context.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct Status {
    code: Code,
    message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Status { code, message: message.into() }
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether a client should retry the operation that produced this.
    pub fn is_retryable(&self) -> bool {
        matches!(self.code, Code::Unavailable | Code::Internal)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Status::new(Code::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Status::new(Code::NotFound, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Status::new(Code::PermissionDenied, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Status::new(Code::FailedPrecondition, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Status::new(Code::Unauthenticated, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Status::new(Code::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Status::new(Code::Internal, message)
    }
}

impl From<std::io::Error> for Status {
    fn from(err: std::io::Error) -> Self {
        Status::new(Code::Unavailable, err.to_string())
    }
}
