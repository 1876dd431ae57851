use thiserror::Error;

/// Why an identifier string was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("identifier is empty")]
    Empty,

    #[error("expected '{expected}_' prefix, found '{actual}_'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    #[error("identifier has no '_' between prefix and ULID")]
    MissingSeparator,

    #[error("malformed ULID: {0}")]
    InvalidUlid(String),

    /// Outside `[a-z0-9.-]` or longer than a DNS name.
    #[error("invalid node name '{name}': {reason}")]
    InvalidNodeName { name: String, reason: &'static str },
}
