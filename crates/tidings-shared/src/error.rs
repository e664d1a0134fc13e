use thiserror::Error;

/// Malformed or missing input. Never retried automatically.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{kind} id must not be empty")]
    EmptyId { kind: &'static str },

    #[error("{kind} id exceeds {max} bytes")]
    IdTooLong { kind: &'static str, max: usize },

    #[error("{kind} id contains invalid character {ch:?}")]
    InvalidIdChar { kind: &'static str, ch: char },

    #[error("message must target exactly one of receiver or group")]
    AmbiguousTarget,

    #[error("message body is empty and carries no attachments")]
    EmptyMessage,

    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("{0}")]
    Invalid(String),
}
