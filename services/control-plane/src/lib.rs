//! kiln control plane library.
//!
//! Placement and lifecycle core for model-serving workloads. The
//! `control-plane` binary runs it against in-process collaborators; the
//! library surface exists for embedding and integration testing.

pub mod api;
pub mod collaborators;
pub mod config;
pub mod dev;
pub mod events;
pub mod reconciler;
pub mod registry;
pub mod resources;
pub mod scheduler;
pub mod types;
