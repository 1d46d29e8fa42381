//! Error types for training.

use thiserror::Error;

/// Result type alias for training operations.
pub type Result<T> = std::result::Result<T, TrainError>;

/// Errors that can occur during training.
#[derive(Error, Debug)]
pub enum TrainError {
    /// Model forward pass or loss computation failed.
    #[error("Forward pass failed: {0}")]
    ForwardError(String),

    /// Checkpoint error.
    #[error("Checkpoint error: {0}")]
    CheckpointError(String),

    /// Data error.
    #[error("Data error: {0}")]
    DataError(#[from] pser_data::DataError),

    /// Core error.
    #[error("Core error: {0}")]
    CoreError(#[from] pser_core::CoreError),

    /// OpenMax error.
    #[error("OpenMax error: {0}")]
    OpenMaxError(#[from] pser_openmax::OpenMaxError),

    /// Analysis error.
    #[error("Analysis error: {0}")]
    AnalysisError(#[from] pser_analysis::AnalysisError),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for TrainError {
    fn from(e: serde_json::Error) -> Self {
        TrainError::SerializationError(e.to_string())
    }
}

impl From<csv::Error> for TrainError {
    fn from(e: csv::Error) -> Self {
        TrainError::SerializationError(e.to_string())
    }
}
