//! Error types shared across NotaryDrip crates.

use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, DripError>;

/// Top-level engine error.
#[derive(Debug, Error)]
pub enum DripError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A malformed Sequence or Step configuration. Each variant names one rule;
/// validation stops at the first violated rule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("sequence name must not be empty")]
    EmptyName,

    #[error("delay must be >= 0 (got {0})")]
    NegativeDelay(i64),

    #[error("delay must be at most 365 days (got {value} {unit})")]
    DelayTooLarge { value: i64, unit: &'static str },

    #[error("send window hour out of range (start 0-23, end 1-24): start={start:?} end={end:?}")]
    WindowHourOutOfRange { start: Option<u8>, end: Option<u8> },

    #[error("send window start ({start}) must be before end ({end}); overnight windows are not supported")]
    InvertedWindow { start: u8, end: u8 },

    #[error("template key must not be empty")]
    EmptyTemplateKey,

    #[error("step body template must not be empty")]
    MissingBody,

    #[error("email steps need a subject line")]
    MissingSubject,

    #[error("order index {0} is already used in this sequence")]
    DuplicateOrderIndex(u32),
}
