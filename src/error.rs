//! Custom error types for the library.
//!
//! This module defines the primary error type, `StationError`, using the
//! `thiserror` crate. It covers the failures the orchestration engine can
//! detect itself: configuration mistakes caught at registration or entry
//! time, storage problems, and instrument-layer errors surfaced as text.
//!
//! Device I/O failures raised inside a `SweepParameter` or
//! `InstrumentTrace` implementation travel as `anyhow::Error` and abort
//! the in-progress run without being retried here. Interruption is not an
//! error at all; it is a recorded, graceful termination path.

use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type AppResult<T> = std::result::Result<T, StationError>;

/// Errors produced by the sweep orchestration engine itself.
#[derive(Error, Debug)]
pub enum StationError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parameter '{0}' is already followed")]
    DuplicateParameter(String),

    #[error("Trace '{0}' is already followed")]
    DuplicateTrace(String),

    #[error("Parameter '{0}' is read-only and cannot be swept")]
    ReadOnlyParameter(String),

    #[error("Traces are not supported by a {0} run")]
    TracesNotSupported(&'static str),

    #[error("No traces followed; follow at least one before a trace sweep")]
    NoTracesRegistered,

    #[error("Could not allocate a run id below {0}")]
    RunIdsExhausted(u32),

    #[error("Blob name '{0}' is reserved")]
    ReservedBlobName(String),

    #[error("Row has {got} values but the declared schema has {expected} columns")]
    ColumnCountMismatch {
        /// Column count declared in the run metadata.
        expected: usize,
        /// Length of the offending row.
        got: usize,
    },

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StationError::Instrument("lock-in timed out".to_string());
        assert_eq!(err.to_string(), "Instrument error: lock-in timed out");
    }

    #[test]
    fn test_column_count_mismatch_display() {
        let err = StationError::ColumnCountMismatch {
            expected: 4,
            got: 3,
        };
        assert!(err.to_string().contains("4 columns"));
    }
}
