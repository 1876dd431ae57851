//! Event emission shared by all components.

use std::sync::Arc;

use kiln_events::{AggregateType, EventEnvelope, EventPayload};
use kiln_id::EventIdSequence;
use tracing::trace;

use crate::collaborators::EventSink;

/// Stamps payloads with a monotonic event id and hands them to the sink.
pub struct EventRecorder {
    sink: Arc<dyn EventSink>,
    sequence: EventIdSequence,
}

impl EventRecorder {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            sequence: EventIdSequence::new(),
        }
    }

    pub fn emit(
        &self,
        aggregate_type: AggregateType,
        aggregate_id: impl Into<String>,
        payload: EventPayload,
    ) {
        let envelope = EventEnvelope::for_payload(
            self.sequence.next_id(),
            aggregate_type,
            aggregate_id,
            payload,
        );
        trace!(
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            aggregate_id = %envelope.aggregate_id,
            "Emitting event"
        );
        self.sink.emit(envelope);
    }
}

impl std::fmt::Debug for EventRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRecorder").finish_non_exhaustive()
    }
}
