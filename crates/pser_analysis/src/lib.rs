//! # pser_analysis
//!
//! Analysis utilities for classifier outputs:
//! - [`ConfusionMatrix`] with per-class precision, recall and F-beta
//! - [`analyze_classification`], the report used for epoch metrics and for
//!   comparing OpenMax against plain softmax
//! - [`roc_auc`] and [`pr_auc`] for two-class problems

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod confusion;
mod curves;
mod error;
mod report;

pub use confusion::{confusion_matrix, ConfusionMatrix};
pub use curves::{pr_auc, roc_auc};
pub use error::{AnalysisError, Result};
pub use report::{analyze_classification, analyze_classification_with_beta, ClassificationReport, DEFAULT_BETA};
