//! Event envelope, the common wrapper for all events.

use chrono::{DateTime, Utc};
use kiln_id::EventId;
use serde::{Deserialize, Serialize};

use crate::{EventError, EventPayload};

/// Aggregate type for event routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateType {
    Workload,
    Instance,
    Node,
    Model,
}

impl std::fmt::Display for AggregateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AggregateType::Workload => "workload",
            AggregateType::Instance => "instance",
            AggregateType::Node => "node",
            AggregateType::Model => "model",
        };
        write!(f, "{}", s)
    }
}

/// Common metadata for all events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<P = EventPayload> {
    /// Process-wide monotonic event identifier.
    pub event_id: EventId,

    pub occurred_at: DateTime<Utc>,

    pub aggregate_type: AggregateType,

    /// The ID of the aggregate instance.
    pub aggregate_id: String,

    /// The event type (e.g., "workload.submitted", "scheduling.failed").
    pub event_type: String,

    /// Schema version for this event type.
    pub event_version: i32,

    pub payload: P,
}

impl EventEnvelope<EventPayload> {
    /// Wraps a typed payload, taking the event type from the payload itself.
    pub fn for_payload(
        event_id: EventId,
        aggregate_type: AggregateType,
        aggregate_id: impl Into<String>,
        payload: EventPayload,
    ) -> Self {
        Self {
            event_id,
            occurred_at: Utc::now(),
            aggregate_type,
            aggregate_id: aggregate_id.into(),
            event_type: payload.event_type().to_string(),
            event_version: 1,
            payload,
        }
    }
}

impl<P: Serialize> EventEnvelope<P> {
    /// Serializes the envelope for an external sink.
    pub fn to_json(&self) -> Result<serde_json::Value, EventError> {
        Ok(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{event_types, WorkloadDeletedPayload};
    use kiln_id::WorkloadId;

    #[test]
    fn test_aggregate_type_display() {
        assert_eq!(AggregateType::Workload.to_string(), "workload");
        assert_eq!(AggregateType::Model.to_string(), "model");
    }

    #[test]
    fn test_for_payload_derives_event_type() {
        let id = WorkloadId::new();
        let envelope = EventEnvelope::for_payload(
            EventId::new(7),
            AggregateType::Workload,
            id.to_string(),
            EventPayload::WorkloadDeleted(WorkloadDeletedPayload { workload_id: id }),
        );

        assert_eq!(envelope.event_type, event_types::WORKLOAD_DELETED);
        assert_eq!(envelope.event_version, 1);
        let json = envelope.to_json().unwrap();
        assert_eq!(json["aggregate_type"], "workload");
        assert_eq!(json["payload"]["event_type"], "workload.deleted");
    }
}
