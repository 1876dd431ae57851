use kiln_id::{InstanceId, WorkloadId};
use thiserror::Error;

use crate::registry::RegistryError;

pub type ReconcileResult<T> = Result<T, ReconcileError>;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("workload {0} not found")]
    NotFound(WorkloadId),

    #[error("workload name '{0}' is already in use")]
    NameConflict(String),

    #[error("workload {0} is being deleted")]
    Terminating(WorkloadId),

    /// A start or stop call failed. Retried per instance.
    #[error("runtime control failed for {instance_id}: {reason}")]
    RuntimeControl {
        instance_id: InstanceId,
        reason: String,
    },

    /// Retries are exhausted; the workload waits for a spec change.
    #[error("workload {workload_id} cannot converge: {reason}")]
    ConvergenceFailure {
        workload_id: WorkloadId,
        reason: String,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("failed to encode workload spec: {0}")]
    SpecEncoding(#[from] serde_json::Error),

    #[error("reconcile cancelled")]
    Cancelled,
}
