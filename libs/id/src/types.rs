//! Identifier types used across the control core.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::{define_id, IdError};

// =============================================================================
// Core-minted identifiers
// =============================================================================

define_id!(WorkloadId, "wl");
define_id!(InstanceId, "inst");

// =============================================================================
// Nodes
// =============================================================================

/// Maximum node name length accepted from the cluster API (DNS label rules).
pub const MAX_NODE_NAME_LEN: usize = 253;

/// A cluster-assigned node name.
///
/// Accepts lowercase alphanumerics, `-` and `.`, which covers the names
/// issued by common cluster APIs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(String);

impl NodeId {
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        if s.len() > MAX_NODE_NAME_LEN {
            return Err(IdError::InvalidNodeName {
                name: s.to_string(),
                reason: "longer than 253 characters",
            });
        }
        if !s
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.')
        {
            return Err(IdError::InvalidNodeName {
                name: s.to_string(),
                reason: "only lowercase alphanumerics, '-' and '.' are allowed",
            });
        }
        Ok(Self(s.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for NodeId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for NodeId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for NodeId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Events
// =============================================================================

/// Event ID is a process-local monotonic integer, not ULID-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(i64);

impl EventId {
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for EventId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl serde::Serialize for EventId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for EventId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        i64::deserialize(deserializer).map(Self)
    }
}

/// Hands out strictly increasing [`EventId`]s starting at 1.
#[derive(Debug, Default)]
pub struct EventIdSequence(AtomicI64);

impl EventIdSequence {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    pub fn next_id(&self) -> EventId {
        EventId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

// =============================================================================
// Tests
// =============================================================================
