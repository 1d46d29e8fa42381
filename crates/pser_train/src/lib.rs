//! # pser_train
//!
//! Training, validation and open-set scoring for pattern-series models.
//!
//! This crate provides:
//! - [`Runner`] with [`SupervisedRunner`] (classification/regression) and
//!   [`UnsupervisedRunner`] (masked reconstruction)
//! - [`validate`] with best-checkpoint selection on a key metric
//! - [`Trainer`] running the epoch loop with learning-rate milestones,
//!   the harden schedule, checkpoints and metric export
//! - OpenMax glue on [`SupervisedRunner`]: Weibull fitting on a training set
//!   and open-set scoring
//!
//! ## Example
//!
//! ```rust,ignore
//! use pser_train::{optimizer_config, RunnerSettings, SupervisedRunner, Trainer, JsonlSink};
//!
//! let optim = optimizer_config(&config).init();
//! let mut runner = SupervisedRunner::new(model, optim, device, config.lr, RunnerSettings::from_config(&config))?;
//! let mut sink = JsonlSink::open(&paths.metrics_log)?;
//! let out = Trainer::new(config, paths, 0).fit(&mut runner, &mut train, &mut val, &mut sink)?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checkpoint;
pub mod error;
pub mod export;
pub mod losses;
pub mod open_set;
pub mod orchestrator;
pub mod record;
pub mod runner;
pub mod scheduler;
pub mod supervised;
pub mod unsupervised;
pub mod validation;

pub use checkpoint::{load_checkpoint, load_meta, load_model_record, save_checkpoint, CheckpointFiles, CheckpointMeta, LoadedCheckpoint};
pub use error::{Result, TrainError};
pub use export::{register_record, write_metrics_csv, RunRecord};
pub use losses::{MaskedSquaredError, PerSampleCrossEntropy, PerSampleSquaredError};
pub use open_set::{ActivationSet, OpenMaxRun};
pub use orchestrator::{FitOutput, Timing, Trainer};
pub use record::{per_sample_metrics, BatchRecord, PerBatchRecord};
pub use runner::{class_indices, optimizer_config, Checkpointer, LossAccumulator, Runner, RunnerSettings, GRAD_CLIP_NORM};
pub use scheduler::{is_harden_epoch, MilestoneSchedule, HARDEN_EPOCHS};
pub use supervised::SupervisedRunner;
pub use unsupervised::{FoldResult, FoldResults, UnsupervisedRunner};
pub use validation::{validate, BestState, HistorySink, JsonlSink, MetricSink, ValidationOutcome};
