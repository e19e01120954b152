//! Crate-wide error taxonomy.
//!
//! Every public operation returns [`CoreResult`]. Per-file failures during
//! indexing are recovered locally (skip + log) and never surface here;
//! corrupt persisted state falls back to backup or a fresh state with a
//! structured warning attached to the loaded value.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    /// Malformed arguments: weights that don't sum to 1, negative budgets,
    /// an empty root list, a zero-sized cache.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A requested key does not exist (rollback token, cache entry).
    #[error("not found: {0}")]
    NotFound(String),

    /// The entry existed but its TTL has elapsed.
    #[error("expired: {0}")]
    Expired(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Unparsable session file or cache entry.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A worker task exceeded its deadline.
    #[error("task timed out: {0}")]
    Timeout(String),

    /// Cooperative cancellation was observed at a batch boundary.
    #[error("operation cancelled")]
    Cancelled,

    /// A concurrent writer was detected on an append-only structure.
    #[error("conflict: {0}")]
    Conflict(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Short machine-readable kind tag, used in pool stats and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidConfig(_) => "invalid_config",
            CoreError::NotFound(_) => "not_found",
            CoreError::Expired(_) => "expired",
            CoreError::Io(_) => "io",
            CoreError::Corrupt(_) => "corrupt",
            CoreError::Serde(_) => "serde",
            CoreError::Timeout(_) => "timeout",
            CoreError::Cancelled => "cancelled",
            CoreError::Conflict(_) => "conflict",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(CoreError::Cancelled.kind(), "cancelled");
        assert_eq!(CoreError::NotFound("x".into()).kind(), "not_found");
        assert_eq!(CoreError::InvalidConfig("w".into()).kind(), "invalid_config");
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err: CoreError = io.into();
        assert_eq!(err.kind(), "io");
    }
}
