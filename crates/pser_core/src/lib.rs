//! # pser_core
//!
//! Core types and traits shared by every pser crate.
//!
//! This crate provides:
//! - [`Seed`] for deterministic shuffling and masking
//! - [`RunConfig`] and [`OpenMaxConfig`], the recognized run options
//! - [`EpochMetrics`], the insertion-ordered metric map produced by every pass
//! - [`PatternModel`] and [`MaskedModel`], the contracts a network must satisfy
//! - Error types and common utilities
//!
//! ## Shape Convention
//!
//! Pattern series follow the convention `(B, L, F)`:
//! - `B`: Batch size (number of samples)
//! - `L`: Sequence length (time steps, padded to the longest sample)
//! - `F`: Features per time step
//!
//! Padding masks are `(B, L)` with `true` marking real time steps.
//!
//! ## Example
//!
//! ```rust,ignore
//! use pser_core::{EpochMetrics, RunConfig, Seed};
//!
//! let config = RunConfig::from_json_file("run.json")?;
//! let seed = Seed::new(config.seed);
//! let mut metrics = EpochMetrics::for_epoch(Some(1));
//! metrics.set("loss", 0.25);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod config;
mod error;
mod metrics;
mod model_trait;
mod seed;

pub use config::{DistanceKind, OpenMaxConfig, RunConfig, RunPaths, Task};
pub use error::{CoreError, Result};
pub use metrics::EpochMetrics;
pub use model_trait::{MaskedModel, PatternModel, SupervisedOutput};
pub use seed::Seed;
