//! # pser
//!
//! Pattern-series training in Rust with OpenMax open-set recognition.
//!
//! - **Data**: padded batches of variable-length series, `.npz` input, seeded loaders
//! - **Models**: reference convolutional encoders behind the model traits
//! - **Training**: supervised and masked-reconstruction runners, validation with
//!   best-checkpoint selection, learning-rate milestones and the harden schedule
//! - **Open set**: mean activation vectors, Weibull tail fits and OpenMax scores
//! - **Analysis**: confusion matrix, F-beta report, ROC/PR AUC
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pser::prelude::*;
//!
//! let config = RunConfig::from_json_file("run.json")?;
//! let paths = config.setup()?;
//! let train = PatternLoader::builder(load_labeled("train.npz")?).shuffle(true).build()?;
//! let val = PatternLoader::builder(load_labeled("val.npz")?).build()?;
//!
//! let model = PatternSeriesEncoderConfig::new(feat_dim, n_classes).init(&device);
//! let optim = optimizer_config(&config).init();
//! let mut runner = SupervisedRunner::new(model, optim, device, config.lr, RunnerSettings::from_config(&config))?;
//! let out = Trainer::new(config.clone(), paths, 0).fit(&mut runner, &mut train, &mut val, &mut HistorySink::default())?;
//!
//! let weibull = runner.make_weibull_from_trainsets(&train, &config.openmax)?;
//! let scores = runner.openmax(&test, &weibull, &config.openmax)?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

// Re-export all crates
pub use pser_analysis as analysis;
pub use pser_core as core;
pub use pser_data as data;
pub use pser_models as models;
pub use pser_openmax as openmax;
pub use pser_train as train;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use pser::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use pser_core::{EpochMetrics, MaskedModel, OpenMaxConfig, PatternModel, RunConfig, RunPaths, Seed, Task};

    // Data
    pub use pser_data::{
        load_imputation, load_labeled, read_npz, BatchSource, ImputationDataset, LabeledDataset, PatternLoader,
        SeriesDataset,
    };

    // Models
    pub use pser_models::{MaskedEncoder, MaskedEncoderConfig, PatternSeriesEncoder, PatternSeriesEncoderConfig};

    // Training
    pub use pser_train::{
        optimizer_config, validate, BestState, Checkpointer, HistorySink, JsonlSink, MetricSink, Runner,
        RunnerSettings, SupervisedRunner, Trainer, UnsupervisedRunner,
    };

    // Open set
    pub use pser_openmax::{get_scores, ClassIndexMap, OpenSetIndexMap, WeibullModel};

    // Analysis
    pub use pser_analysis::{analyze_classification, ClassificationReport};
}
