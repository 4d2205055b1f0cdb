use crate::model::{FlagId, RevisionId};

pub type Result<T> = std::result::Result<T, FlagError>;

/// Errors surfaced by the engine, the stores and the service.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FlagError {
    #[error("feature flag {0} not found")]
    FlagNotFound(FlagId),

    #[error("revision {0} not found")]
    RevisionNotFound(RevisionId),

    #[error("environment '{0}' not found")]
    EnvironmentNotFound(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("invalid {flag_type} value '{value}'")]
    InvalidValue { flag_type: String, value: String },

    /// The stored flag moved on since it was loaded.
    #[error("feature flag {id} was modified concurrently (expected generation {expected}, found {found})")]
    Conflict {
        id: FlagId,
        expected: u64,
        found: u64,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

impl FlagError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            FlagError::FlagNotFound(_)
                | FlagError::RevisionNotFound(_)
                | FlagError::EnvironmentNotFound(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, FlagError::Conflict { .. })
    }
}

impl From<serde_json::Error> for FlagError {
    fn from(e: serde_json::Error) -> Self {
        FlagError::Storage(format!("serialization failed: {}", e))
    }
}
