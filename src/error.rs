//! Error taxonomy surfaced to chat users
//!
//! Module errors are folded into [`GatewayError`] at the request boundary;
//! each variant has a fixed way of being shown to the user.

use crate::auth::AuthError;
use crate::client::RenderError;
use crate::quota::LedgerError;
use crate::roll::RollError;
use crate::storage::StorageError;
use thiserror::Error;

/// Reply for failures the user cannot act on
pub const GENERIC_FAILURE: &str = "❌ Something went wrong, please try again later.";
/// Reply for synchronous rendering service failures
pub const SERVICE_UNAVAILABLE: &str =
    "❌ The image service is temporarily unavailable, please try again later.";

/// Request-level errors
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed command arguments
    #[error("validation error: {0}")]
    Validation(String),
    /// Duplicate or opposing-list membership
    #[error("conflict: {0}")]
    Conflict(String),
    /// Unknown job, nickname, list entry or button
    #[error("not found: {0}")]
    NotFound(String),
    /// Rendering service failure
    #[error("external service error: {0}")]
    ExternalService(String),
    /// Durable store failure
    #[error("storage error: {0}")]
    Storage(String),
    /// Job dropped after its time-to-live without a terminal status
    #[error("job {0} expired without a terminal status")]
    ExpiredJob(String),
}

impl GatewayError {
    /// Text shown to the user for this error
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg) | Self::NotFound(msg) => format!("❌ {msg}"),
            Self::Conflict(msg) => format!("⚠️ {msg}"),
            Self::ExternalService(_) => SERVICE_UNAVAILABLE.to_string(),
            Self::Storage(_) | Self::ExpiredJob(_) => GENERIC_FAILURE.to_string(),
        }
    }
}

impl From<RollError> for GatewayError {
    fn from(e: RollError) -> Self {
        match e {
            RollError::Duplicate { .. } | RollError::Conflict { .. } => {
                Self::Conflict(e.to_string())
            }
            RollError::IndexOutOfRange { .. } => Self::Validation(e.to_string()),
            RollError::NotFound { .. } => Self::NotFound(e.to_string()),
            RollError::Storage(inner) => Self::Storage(inner.to_string()),
        }
    }
}

impl From<LedgerError> for GatewayError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::NotFound(_) => Self::NotFound(e.to_string()),
            LedgerError::Storage(inner) => Self::Storage(inner.to_string()),
        }
    }
}

impl From<AuthError> for GatewayError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::TooShort | AuthError::Unchanged => Self::Validation(e.to_string()),
            AuthError::Storage(inner) => Self::Storage(inner.to_string()),
        }
    }
}

impl From<RenderError> for GatewayError {
    fn from(e: RenderError) -> Self {
        Self::ExternalService(e.to_string())
    }
}

impl From<StorageError> for GatewayError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e.to_string())
    }
}
