//! # kiln-id
//!
//! Typed identifiers for the kiln placement and lifecycle core.
//!
//! Identifiers minted by the core (workloads and instances) use a prefixed
//! ULID format: `{prefix}_{ulid}`.
//!
//! Examples:
//! - `wl_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `inst_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! Node identifiers are assigned by the cluster API, so [`NodeId`] wraps a
//! validated name instead of a ULID. Its ordering is the plain lexical
//! ordering of the name, which placement uses as the final tie-break.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
