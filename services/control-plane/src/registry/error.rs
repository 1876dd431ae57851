use thiserror::Error;

use crate::types::ModelRef;

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("checksum mismatch for {model}: expected {expected}, storage reports {actual}")]
    ChecksumMismatch {
        model: ModelRef,
        expected: String,
        actual: String,
    },

    #[error("model {0} is already registered")]
    DuplicateVersion(ModelRef),

    #[error("artifact storage unreachable for '{location}' after {attempts} attempts: {reason}")]
    StorageUnreachable {
        location: String,
        attempts: u32,
        reason: String,
    },

    #[error("benchmark failed for {model}: {reason}")]
    BenchmarkFailed { model: ModelRef, reason: String },

    #[error("model {0} not found")]
    NotFound(ModelRef),

    #[error("model {model} is referenced by {workloads} active workload(s)")]
    InUse { model: ModelRef, workloads: usize },

    #[error("invalid registration: {0}")]
    InvalidInput(String),

    #[error("registry call cancelled")]
    Cancelled,
}

impl RegistryError {
    /// Input errors are rejected synchronously and never retried.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            RegistryError::ChecksumMismatch { .. }
                | RegistryError::DuplicateVersion(_)
                | RegistryError::InvalidInput(_)
        )
    }
}
