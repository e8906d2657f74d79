//! Error Taxonomy
//!
//! Every lifecycle and policy violation is detected synchronously and
//! surfaced through `PassError`; the HTTP layer maps each variant to a
//! status code. Notification failures are logged, never propagated.

use thiserror::Error;
use uuid::Uuid;

/// Severity tag on eligibility blocks, so callers can distinguish a
/// temporary condition (cooldown) from a hard one (account lockout).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Error)]
pub enum PassError {
    /// Malformed or out-of-policy request. User-correctable.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A guarded update affected zero rows: another actor already moved the
    /// request. Caller should re-fetch and retry or surface "already
    /// processed".
    #[error("state conflict: expected '{expected}', request is '{actual}'")]
    StateConflict {
        expected: &'static str,
        actual: String,
    },

    /// Actor does not hold authority for the targeted stage.
    #[error("not authorized: {0}")]
    Authorization(String),

    /// Trust score, cooldown, pass-block or an active restriction blocks
    /// the action.
    #[error("not eligible: {reason}")]
    Eligibility { severity: Severity, reason: String },

    #[error("{0} not found: {1}")]
    NotFound(&'static str, Uuid),

    /// Persistence or other infrastructure failure.
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl PassError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn eligibility(severity: Severity, reason: impl Into<String>) -> Self {
        Self::Eligibility {
            severity,
            reason: reason.into(),
        }
    }

    /// Stable machine-readable code for API payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::StateConflict { .. } => "state_conflict",
            Self::Authorization(_) => "authorization",
            Self::Eligibility { .. } => "eligibility",
            Self::NotFound(..) => "not_found",
            Self::Storage(_) => "storage",
        }
    }
}
