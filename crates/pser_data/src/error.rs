//! Error types for pser_data.

use thiserror::Error;

/// Result type alias using [`DataError`].
pub type Result<T> = std::result::Result<T, DataError>;

/// Errors raised while loading, indexing or batching series.
#[derive(Error, Debug)]
pub enum DataError {
    /// Arrays, lengths or targets that do not fit together.
    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    /// A dataset or batch without samples.
    #[error("Dataset is empty")]
    EmptyDataset,

    /// Sample or feature index past the end.
    #[error("Index {index} out of bounds for length {length}")]
    IndexOutOfBounds {
        /// The requested index.
        index: usize,
        /// Number of valid indices.
        length: usize,
    },

    /// Zero batch size.
    #[error("Invalid batch size: {0}")]
    InvalidBatchSize(String),

    /// Unreadable or incomplete `.npz` archive.
    #[error("Archive format error: {0}")]
    FormatError(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
