//! Run configuration.
//!
//! A run is described by one JSON document. Unknown tasks and inconsistent
//! schedules are rejected when the document is loaded, before any model or
//! data is touched.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// The supervised task a run trains for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    /// Per-sample class logits, cross-entropy loss, confusion-matrix metrics.
    Classification,
    /// Per-sample continuous outputs, squared-error loss.
    Regression,
    /// Masked reconstruction of the input series.
    Imputation,
}

impl Task {
    /// Whether the task is trained with the supervised runner.
    #[must_use]
    pub fn is_supervised(&self) -> bool {
        !matches!(self, Task::Imputation)
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Classification => write!(f, "classification"),
            Task::Regression => write!(f, "regression"),
            Task::Imputation => write!(f, "imputation"),
        }
    }
}

impl FromStr for Task {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "classification" => Ok(Task::Classification),
            "regression" => Ok(Task::Regression),
            "imputation" => Ok(Task::Imputation),
            other => Err(CoreError::Config(format!("Task '{other}' not implemented"))),
        }
    }
}

/// Per-channel distance used between an activation vector and a class MAV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceKind {
    /// `euclid_weight * euclidean + cosine`.
    #[default]
    Eucos,
    /// Plain Euclidean distance.
    Euclidean,
    /// Cosine distance, `1 - cos(a, b)`.
    Cosine,
}

/// Tunable constants of the OpenMax extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenMaxConfig {
    /// Number of top-ranked logits revised per sample. `None` revises
    /// `min(10, num_classes)`.
    pub alpha: Option<usize>,
    /// Number of largest distances used for each Weibull fit.
    pub tail_size: usize,
    /// Weight of the Euclidean term in the eucos distance.
    pub euclid_weight: f64,
    /// Distance used per activation channel.
    pub distance: DistanceKind,
}

impl Default for OpenMaxConfig {
    fn default() -> Self {
        Self {
            alpha: None,
            tail_size: 20,
            euclid_weight: 5e-3,
            distance: DistanceKind::Eucos,
        }
    }
}

impl OpenMaxConfig {
    /// Number of logits to revise for a model with `num_classes` outputs.
    #[must_use]
    pub fn alpha_for(&self, num_classes: usize) -> usize {
        self.alpha.unwrap_or(10).min(num_classes)
    }

    fn validate(&self) -> Result<()> {
        if self.tail_size == 0 {
            return Err(CoreError::Config("openmax.tail_size must be at least 1".into()));
        }
        if self.alpha == Some(0) {
            return Err(CoreError::Config("openmax.alpha must be at least 1".into()));
        }
        if !self.euclid_weight.is_finite() || self.euclid_weight < 0.0 {
            return Err(CoreError::Config(format!(
                "openmax.euclid_weight must be a non-negative number, got {}",
                self.euclid_weight
            )));
        }
        Ok(())
    }
}

/// Recognized options of a training or evaluation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Task; selects the runner, loss and metrics.
    pub task: Task,
    /// Metric governing best-checkpoint selection.
    pub key_metric: String,
    /// Samples per batch.
    pub batch_size: usize,
    /// Accepted for compatibility; batches are produced sequentially.
    pub num_workers: usize,
    /// Log progress every this many batches.
    pub print_interval: usize,
    /// Initial learning rate.
    pub lr: f64,
    /// Milestone epochs of the learning-rate schedule.
    pub lr_step: Vec<usize>,
    /// Multiplicative factor applied at each milestone.
    pub lr_factor: Vec<f64>,
    /// Advance the data sources' difficulty tier at the fixed harden epochs.
    pub harden: bool,
    /// L2 regularization strength.
    pub l2_reg: f64,
    /// Apply `l2_reg` to every parameter as optimizer weight decay instead
    /// of penalizing the output layer only.
    pub global_reg: bool,
    /// Keep a checkpoint for every epoch instead of a rolling `model_last`.
    pub save_all: bool,
    /// Number of training epochs.
    pub epochs: usize,
    /// Freeze every parameter except the output layer.
    pub freeze: bool,
    /// Root directory; must exist. Runs are written to `<output_dir>/<experiment_name>`.
    pub output_dir: PathBuf,
    /// Name of the experiment.
    pub experiment_name: String,
    /// CSV file accumulating one row per finished run.
    pub records_file: PathBuf,
    /// Free-text comment stored with the run record.
    pub comment: String,
    /// Master seed.
    pub seed: u64,
    /// Checkpoint to start from.
    pub load_model: Option<PathBuf>,
    /// Restore epoch counter and optimizer state from `load_model`.
    pub resume: bool,
    /// Reinitialize the output layer when loading a checkpoint trained with
    /// a different number of outputs.
    pub change_output: bool,
    /// Evaluate the last checkpoint on the validation set and skip training.
    pub test_only: bool,
    /// Fraction of values hidden from the model in imputation runs.
    pub masking_ratio: f64,
    /// OpenMax constants.
    pub openmax: OpenMaxConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            task: Task::Classification,
            key_metric: "loss".to_string(),
            batch_size: 64,
            num_workers: 0,
            print_interval: 10,
            lr: 1e-3,
            lr_step: vec![1_000_000],
            lr_factor: vec![0.1],
            harden: false,
            l2_reg: 0.0,
            global_reg: false,
            save_all: false,
            epochs: 400,
            freeze: false,
            output_dir: PathBuf::from("output"),
            experiment_name: "experiment".to_string(),
            records_file: PathBuf::from("records.csv"),
            comment: String::new(),
            seed: 42,
            load_model: None,
            resume: false,
            change_output: false,
            test_only: false,
            masking_ratio: 0.15,
            openmax: OpenMaxConfig::default(),
        }
    }
}

/// Directories of one experiment, created by [`RunConfig::setup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    /// `<output_dir>/<experiment_name>`.
    pub experiment_dir: PathBuf,
    /// Model checkpoints.
    pub checkpoint_dir: PathBuf,
    /// Prediction dumps.
    pub prediction_dir: PathBuf,
    /// Scalar metric log, one JSON object per line.
    pub metrics_log: PathBuf,
}

impl RunPaths {
    /// Paths for an experiment rooted at `experiment_dir`.
    #[must_use]
    pub fn new(experiment_dir: impl Into<PathBuf>) -> Self {
        let experiment_dir = experiment_dir.into();
        Self {
            checkpoint_dir: experiment_dir.join("checkpoints"),
            prediction_dir: experiment_dir.join("predictions"),
            metrics_log: experiment_dir.join("metrics.jsonl"),
            experiment_dir,
        }
    }
}

impl RunConfig {
    /// Parse and validate a configuration document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| CoreError::Config(format!("Failed to parse configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a configuration file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Check option combinations that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(CoreError::Config("batch_size must be at least 1".into()));
        }
        if self.print_interval == 0 {
            return Err(CoreError::Config("print_interval must be at least 1".into()));
        }
        if !self.lr.is_finite() || self.lr <= 0.0 {
            return Err(CoreError::Config(format!("lr must be positive, got {}", self.lr)));
        }
        if self.lr_step.len() != self.lr_factor.len() {
            return Err(CoreError::Config(format!(
                "lr_step has {} milestones but lr_factor has {} factors",
                self.lr_step.len(),
                self.lr_factor.len()
            )));
        }
        if self.key_metric.is_empty() {
            return Err(CoreError::Config("key_metric must not be empty".into()));
        }
        if self.experiment_name.is_empty() {
            return Err(CoreError::Config("experiment_name must not be empty".into()));
        }
        if !(0.0..1.0).contains(&self.masking_ratio) {
            return Err(CoreError::Config(format!(
                "masking_ratio must lie in [0, 1), got {}",
                self.masking_ratio
            )));
        }
        if self.resume && self.load_model.is_none() {
            return Err(CoreError::Config("resume requires load_model".into()));
        }
        self.openmax.validate()
    }

    /// Directories this configuration writes to.
    #[must_use]
    pub fn paths(&self) -> RunPaths {
        RunPaths::new(self.output_dir.join(&self.experiment_name))
    }

    /// Create the experiment directories and store the configuration next
    /// to them as `configuration.json`.
    pub fn setup(&self) -> Result<RunPaths> {
        if !self.output_dir.is_dir() {
            return Err(CoreError::Config(format!(
                "Root directory '{}', where the directory of the experiment will be created, must exist",
                self.output_dir.display()
            )));
        }
        let paths = self.paths();
        std::fs::create_dir_all(&paths.checkpoint_dir)?;
        std::fs::create_dir_all(&paths.prediction_dir)?;

        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.experiment_dir.join("configuration.json"), json)?;
        Ok(paths)
    }
}
