//! Error taxonomy for the cash operations core.
//!
//! Four recoverable classes plus not-found. Parse failures during
//! normalization are *not* errors at this level: they accumulate into sync
//! error counts and health reports. Invariant violations are never raised
//! either; they are recorded as FAIL results with proof strings.

use thiserror::Error;

/// Domain error carrying a human-readable message and a stable machine code.
#[derive(Debug, Error)]
pub enum DomainError {
    /// Malformed input or a missing required field.
    #[error("input error: {0}")]
    Input(String),

    /// Illegal state-machine transition or a write against a locked snapshot.
    #[error("state error: {0}")]
    State(String),

    /// Action not permitted for the caller's role or the active policy.
    #[error("policy violation: {0}")]
    Policy(String),

    /// Database or connector infrastructure failure. Aborts the current sync.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl DomainError {
    /// Stable machine code identifying the taxonomy class.
    pub fn code(&self) -> &'static str {
        match self {
            DomainError::Input(_) => "INPUT_ERROR",
            DomainError::State(_) => "STATE_ERROR",
            DomainError::Policy(_) => "POLICY_VIOLATION",
            DomainError::Infrastructure(_) => "INFRASTRUCTURE_ERROR",
            DomainError::NotFound(_) => "NOT_FOUND",
        }
    }

    pub fn locked_snapshot() -> Self {
        DomainError::State("Cannot modify locked snapshot".to_string())
    }
}

impl From<rusqlite::Error> for DomainError {
    fn from(e: rusqlite::Error) -> Self {
        DomainError::Infrastructure(e.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(e: serde_json::Error) -> Self {
        DomainError::Infrastructure(format!("json: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(DomainError::Input("x".into()).code(), "INPUT_ERROR");
        assert_eq!(DomainError::locked_snapshot().code(), "STATE_ERROR");
        assert_eq!(
            DomainError::Policy("nope".into()).code(),
            "POLICY_VIOLATION"
        );
    }

    #[test]
    fn test_locked_snapshot_message() {
        let err = DomainError::locked_snapshot();
        assert_eq!(err.to_string(), "state error: Cannot modify locked snapshot");
    }
}
