//! Error taxonomy shared by every component of the pipeline.
//!
//! Each variant names one failure category and carries enough context
//! (source, row, gene, path) to point at the offending input.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, SimsError>;

/// Errors raised by schema reconciliation, training and inference
#[derive(Error, Debug)]
pub enum SimsError {
    /// Gene overlap between a source and the schema is empty or degenerate
    #[error("schema mismatch for {origin}: {detail}")]
    SchemaMismatch { origin: String, detail: String },

    /// Label absent from the trained label space
    #[error("unknown label {label:?}{}", locate(.origin, .row))]
    UnknownLabel {
        label: String,
        origin: Option<String>,
        row: Option<usize>,
    },

    /// Malformed network hyperparameters
    #[error("invalid architecture: {0}")]
    InvalidArchitecture(String),

    /// Feature vector length does not match the configured schema length
    #[error("dimension mismatch: expected {expected} features, got {actual}{}", locate(.origin, .row))]
    DimensionMismatch {
        expected: usize,
        actual: usize,
        origin: Option<String>,
        row: Option<usize>,
    },

    /// Dataset or codec access past the end
    #[error("index {index} out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },

    /// Persisted checkpoint failed structural validation
    #[error("corrupt checkpoint: {0}")]
    CheckpointCorruption(String),

    /// Loss became NaN or infinite during optimisation
    #[error("numeric instability at epoch {epoch}, batch {batch}: loss = {value}")]
    NumericInstability { epoch: usize, batch: usize, value: f64 },

    /// Invalid training configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed input file
    #[error("data error in {path:?}: {detail}")]
    Data { path: PathBuf, detail: String },

    /// Checkpoint storage failure
    #[error("storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn locate(origin: &Option<String>, row: &Option<usize>) -> String {
    match (origin, row) {
        (Some(o), Some(r)) => format!(" (source {o}, row {r})"),
        (Some(o), None) => format!(" (source {o})"),
        (None, Some(r)) => format!(" (row {r})"),
        (None, None) => String::new(),
    }
}

impl SimsError {
    /// Process exit code for this error category
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::SchemaMismatch { .. } => 3,
            Self::UnknownLabel { .. } => 4,
            Self::InvalidArchitecture(_) => 5,
            Self::DimensionMismatch { .. } => 6,
            Self::IndexOutOfRange { .. } => 7,
            Self::CheckpointCorruption(_) => 8,
            Self::NumericInstability { .. } => 9,
            Self::InvalidConfig(_) => 10,
            Self::Data { .. } => 11,
            Self::Storage(_) | Self::Io(_) => 12,
        }
    }

    pub(crate) fn data<P: Into<PathBuf>>(path: P, detail: impl Into<String>) -> Self {
        Self::Data {
            path: path.into(),
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let errors = [
            SimsError::SchemaMismatch { origin: "s".into(), detail: "d".into() },
            SimsError::UnknownLabel { label: "x".into(), origin: None, row: None },
            SimsError::InvalidArchitecture("n_steps".into()),
            SimsError::DimensionMismatch { expected: 3, actual: 2, origin: None, row: None },
            SimsError::IndexOutOfRange { index: 5, len: 2 },
            SimsError::CheckpointCorruption("bad magic".into()),
            SimsError::NumericInstability { epoch: 0, batch: 0, value: f64::NAN },
            SimsError::InvalidConfig("batch_size".into()),
            SimsError::data("m.csv", "ragged row"),
            SimsError::Storage("disk full".into()),
        ];

        let mut codes: Vec<i32> = errors.iter().map(|e| e.exit_code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        assert!(codes.iter().all(|&c| c != 0));
    }

    #[test]
    fn test_error_messages_carry_location() {
        let err = SimsError::UnknownLabel {
            label: "T cell".into(),
            origin: Some("pbmc".into()),
            row: Some(17),
        };
        let msg = err.to_string();
        assert!(msg.contains("T cell"));
        assert!(msg.contains("pbmc"));
        assert!(msg.contains("17"));
    }
}
