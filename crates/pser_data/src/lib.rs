//! # pser_data
//!
//! Data pipeline for pattern-series training.
//!
//! - [`SeriesDataset`]: indexed samples of variable length plus a feature dimensionality
//! - [`LabeledDataset`] and [`ImputationDataset`]: in-memory datasets for the
//!   supervised and masked-reconstruction tasks
//! - [`collate`]: zero-padding of samples into a [`Batch`] with its padding mask
//! - [`PatternLoader`]: seeded, per-epoch reshuffled batching behind the
//!   [`BatchSource`] trait the runners consume
//! - [`read_npz`]: NumPy archive input

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod batch;
mod dataset;
mod error;
mod io;
mod loader;

pub use batch::{collate, Batch, Targets};
pub use dataset::{ImputationDataset, LabeledDataset, Sample, SampleTarget, SeriesDataset};
pub use error::{DataError, Result};
pub use io::{load_imputation, load_labeled, read_npz};
pub use loader::{BatchSource, PatternLoader, PatternLoaderBuilder, PatternLoaderIter};
