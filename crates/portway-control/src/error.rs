//! Typed errors for the control core
//!
//! A closed set of error kinds so callers branch on the kind instead of
//! string-matching. The API layer maps these onto HTTP statuses; the core
//! never formats responses itself.

use thiserror::Error;

/// Control-core error kinds
#[derive(Debug, Error)]
pub enum ControlError {
    /// A uniqueness invariant would be violated (client id connected,
    /// auth id in use, local port busy, duplicate tunnel)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Caller-supplied input failed validation
    #[error("bad request: {0}")]
    BadRequest(String),

    /// No record under the given id
    #[error("not found: {0}")]
    NotFound(String),

    /// The user may not act on one or more of the target clients
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A collaborator failed or produced malformed data
    #[error("internal: {0}")]
    Internal(String),
}

impl ControlError {
    pub fn conflict(msg: impl Into<String>) -> Self {
        ControlError::Conflict(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        ControlError::BadRequest(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ControlError::NotFound(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        ControlError::Forbidden(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ControlError::Internal(msg.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ControlError::Conflict(_))
    }

    pub fn is_bad_request(&self) -> bool {
        matches!(self, ControlError::BadRequest(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ControlError::NotFound(_))
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self, ControlError::Forbidden(_))
    }
}
