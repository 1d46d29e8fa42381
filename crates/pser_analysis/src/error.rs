//! Error types for pser_analysis.

use thiserror::Error;

/// Result type alias using [`AnalysisError`].
pub type Result<T> = std::result::Result<T, AnalysisError>;

/// Errors raised while analysing predictions.
#[derive(Error, Debug)]
pub enum AnalysisError {
    /// Predictions and labels differ in length.
    #[error("Length mismatch: {predictions} predictions for {labels} labels")]
    LengthMismatch {
        /// Number of predictions.
        predictions: usize,
        /// Number of labels.
        labels: usize,
    },

    /// A prediction or label is not one of the known classes.
    #[error("Class index {index} outside the {n_classes} known classes")]
    UnknownClass {
        /// Offending index.
        index: usize,
        /// Number of classes.
        n_classes: usize,
    },

    /// Nothing to analyse.
    #[error("No classes or samples to analyse")]
    Empty,
}
