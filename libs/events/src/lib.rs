//! # kiln-events
//!
//! Status enums and structured event definitions shared by the kiln
//! control core.
//!
//! ## Event Envelope
//!
//! Every state transition is reported as an [`EventEnvelope`] carrying:
//! - Process-wide ordering (`event_id`)
//! - The aggregate it concerns (`aggregate_type`, `aggregate_id`)
//! - A typed [`EventPayload`]
//!
//! The core never persists or renders events; they are handed to an
//! external sink.
//!
//! ## Event Types
//!
//! - Workload events (`workload.*`)
//! - Instance events (`instance.*`)
//! - Placement and scaling decisions (`scheduling.*`, `scaling.*`)
//! - Registry events (`model.*`)
//! - Cluster events (`node.*`, `rebalance.*`, `ledger.*`)

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
