//! Error taxonomy for the single cell pipeline. Every stage either returns its
//! complete output or one of these errors; the input snapshot is never
//! modified.

use thiserror::Error;

/// Errors raised by the pipeline stages
#[derive(Debug, Error)]
pub enum ScError {
    /// Malformed or missing input files, dimension mismatches on load
    #[error("load error: {0}")]
    Load(String),

    /// A cell with zero total counts reached the normalisation
    #[error("cell '{cell}' has a total count of zero and cannot be normalised")]
    DegenerateCell { cell: String },

    /// Label assignment is missing entries for clusters present in the data
    #[error("no label supplied for cluster(s) {clusters:?}")]
    UnmappedCluster { clusters: Vec<usize> },

    /// A stage received zero cells or zero genes (or too few to proceed)
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// Parameters outside of their valid range
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A stage was invoked before the stage it depends on
    #[error("missing upstream result: {0}")]
    MissingStage(String),

    /// Failure inside a numerical routine (for example the SVD solver)
    #[error("numerical error: {0}")]
    Numerical(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ScError>;

/// Shorthand to build a configuration error.
pub(crate) fn config_err<T>(msg: impl Into<String>) -> Result<T> {
    Err(ScError::Configuration(msg.into()))
}
