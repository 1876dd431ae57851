use thiserror::Error;

use super::filter::InfeasibilityReport;
use super::preemption::PreemptionPlan;

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors that can occur during scheduling.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No healthy node can hold the request. When preemption is enabled
    /// and applicable, `preemption` names the instances to evict.
    #[error("infeasible: {report}")]
    Infeasible {
        report: InfeasibilityReport,
        preemption: Option<PreemptionPlan>,
    },

    #[error("cluster snapshot is stale")]
    StaleSnapshot,

    #[error("placement lost {attempts} consecutive commit races")]
    CommitConflict { attempts: u32 },

    #[error("scheduling cancelled")]
    Cancelled,
}

impl SchedulerError {
    pub fn is_infeasible(&self) -> bool {
        matches!(self, SchedulerError::Infeasible { .. })
    }
}
