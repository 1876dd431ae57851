use thiserror::Error;

use crate::reconciler::ReconcileError;
use crate::registry::RegistryError;
use crate::resources::ResourceError;

pub type ApiResult<T> = Result<T, ApiError>;

/// Errors surfaced to callers of the control plane.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid workload spec: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Resources(#[from] ResourceError),
}

impl ApiError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "invalid_spec",
            ApiError::Reconcile(e) => match e {
                ReconcileError::NotFound(_) => "workload_not_found",
                ReconcileError::NameConflict(_) => "name_conflict",
                ReconcileError::Terminating(_) => "workload_terminating",
                ReconcileError::Registry(e) => registry_code(e),
                ReconcileError::Cancelled => "cancelled",
                _ => "internal",
            },
            ApiError::Registry(e) => registry_code(e),
            ApiError::Resources(_) => "cluster_unavailable",
        }
    }

    /// Whether the same call may succeed if retried unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Validation(_) => false,
            ApiError::Reconcile(ReconcileError::Registry(e)) | ApiError::Registry(e) => {
                matches!(e, RegistryError::StorageUnreachable { .. } | RegistryError::Cancelled)
            }
            ApiError::Reconcile(e) => matches!(e, ReconcileError::Cancelled),
            ApiError::Resources(_) => true,
        }
    }
}

fn registry_code(e: &RegistryError) -> &'static str {
    match e {
        RegistryError::ChecksumMismatch { .. } => "checksum_mismatch",
        RegistryError::DuplicateVersion(_) => "duplicate_version",
        RegistryError::StorageUnreachable { .. } => "storage_unreachable",
        RegistryError::BenchmarkFailed { .. } => "benchmark_failed",
        RegistryError::NotFound(_) => "model_not_found",
        RegistryError::InUse { .. } => "model_in_use",
        RegistryError::InvalidInput(_) => "invalid_input",
        RegistryError::Cancelled => "cancelled",
    }
}
