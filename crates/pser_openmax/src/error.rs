//! Error types for pser_openmax.

use thiserror::Error;

/// Result type alias using [`OpenMaxError`].
pub type Result<T> = std::result::Result<T, OpenMaxError>;

/// Errors raised by the OpenMax pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OpenMaxError {
    /// A class has fewer correctly classified samples than the tail size.
    #[error("Class {class}: Weibull tail needs {needed} distances, only {got} available")]
    InsufficientTail {
        /// Class label.
        class: usize,
        /// Configured tail size.
        needed: usize,
        /// Available distances.
        got: usize,
    },

    /// A tail could not be fitted, before class and channel are known.
    #[error("Weibull fit: {0}")]
    Fit(String),

    /// The maximum-likelihood fit did not produce a usable distribution.
    #[error("Class {class}, channel {channel}: Weibull fit failed: {reason}")]
    FitFailed {
        /// Class label.
        class: usize,
        /// Activation channel.
        channel: usize,
        /// Why the fit failed.
        reason: String,
    },

    /// Inconsistent shapes or maps.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Reading tensor data back to the host failed.
    #[error("Tensor error: {0}")]
    Tensor(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}
