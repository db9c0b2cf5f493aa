//! Unified error system for the Warren gateway.
//!
//! One variant per user-visible failure class, so that every public
//! operation can distinguish "retry with different credentials"
//! (`Unauthorized`/`Forbidden`) from "this name can never exist again"
//! (`Conflict`) from "transient, retry later" (`Internal`).

use serde::{Deserialize, Serialize};

/// Unified error type for all gateway operations.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
pub enum Error {
    /// Missing, invalid or revoked credentials, or a signature mismatch
    #[error("unauthorized: {message}")]
    Unauthorized {
        /// What failed to verify
        message: String,
    },

    /// Authenticated, but lacking the capability for the requested access
    #[error("forbidden: {message}")]
    Forbidden {
        /// The capability that was missing
        message: String,
    },

    /// Re-use of a tombstoned name, or a policy-incompatible request
    #[error("conflict: {message}")]
    Conflict {
        /// The conflicting condition
        message: String,
    },

    /// Unknown account or sub-domain, or disallowed auto-creation
    #[error("not found: {message}")]
    NotFound {
        /// What was looked up
        message: String,
    },

    /// Malformed identifier or payload shape
    #[error("bad request: {message}")]
    BadRequest {
        /// What failed validation
        message: String,
    },

    /// Store or registry invariant violation
    #[error("internal error: {message}")]
    Internal {
        /// Description of the violated invariant
        message: String,
    },
}

impl Error {
    /// Create an unauthorized error
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    /// Create a forbidden error
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a bad request error
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// The HTTP status code this error maps to at the request boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Unauthorized { .. } => 401,
            Self::Forbidden { .. } => 403,
            Self::Conflict { .. } => 409,
            Self::NotFound { .. } => 404,
            Self::BadRequest { .. } => 400,
            Self::Internal { .. } => 500,
        }
    }
}

/// Standard Result type for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(err.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::forbidden(err.to_string()),
            _ => Self::internal(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("serialization: {err}"))
    }
}
