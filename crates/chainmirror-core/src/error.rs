//! Error types for the chainmirror pipeline.

use thiserror::Error;

/// Errors that can occur while mirroring the chain.
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Event source error: {0}")]
    Source(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// A store failure that may succeed on retry (timeout, connection reset, pool exhaustion).
    #[error("Transient storage error: {0}")]
    TransientStorage(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Mirror aborted: {reason}")]
    Aborted { reason: String },

    #[error("{0}")]
    Other(String),
}

impl MirrorError {
    /// Returns `true` if the operation that produced this error is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStorage(_) | Self::Source(_))
    }

    /// Returns `true` if the error comes from a malformed block payload.
    pub fn is_parse(&self) -> bool {
        matches!(self, Self::Parse(_))
    }

    /// Returns `true` if the error was caused by cancellation.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}

/// A block notification that cannot be turned into a complete set of records.
///
/// The block is dropped as a whole; nothing is written for it.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The payload does not match the block schema (missing field, wrong type).
    #[error("malformed block payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid value for {field}: {value:?}")]
    InvalidValue { field: &'static str, value: String },

    /// The envelope was expected to carry a block but does not.
    #[error("envelope carries no block: {0}")]
    NotABlock(String),
}
