use kiln_events::InfeasibleConstraint;
use kiln_id::NodeId;
use thiserror::Error;

pub type ResourceResult<T> = Result<T, ResourceError>;

#[derive(Debug, Error)]
pub enum ResourceError {
    /// The snapshot is not fresh enough to act on.
    #[error("cluster snapshot is stale")]
    StaleSnapshot,

    #[error("node {node} cannot hold the request: {}", join_constraints(.constraints))]
    Insufficient {
        node: NodeId,
        constraints: Vec<InfeasibleConstraint>,
    },

    #[error("node {0} is not known to the ledger")]
    UnknownNode(NodeId),

    #[error("refresh cancelled")]
    Cancelled,

    #[error("cluster metrics unavailable: {0}")]
    Collaborator(String),
}

fn join_constraints(constraints: &[InfeasibleConstraint]) -> String {
    constraints
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
