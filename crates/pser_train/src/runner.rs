//! The runner abstraction shared by both training modes.
//!
//! A runner owns a model and its optimizer and turns one pass over a
//! [`BatchSource`] into an [`EpochMetrics`] map. The epoch loss is always
//! the total loss divided by the total active count (samples for supervised
//! runs, target-mask elements for reconstruction), never the mean of batch
//! means.

use std::path::Path;

use burn::grad_clipping::GradientClippingConfig;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::AdamConfig;
use burn::prelude::*;
use ndarray::{Array2, Array3};

use crate::error::{Result, TrainError};
use crate::record::PerBatchRecord;
use pser_analysis::{analyze_classification, pr_auc, roc_auc};
use pser_core::{EpochMetrics, RunConfig, Task};
use pser_data::{BatchSource, DataError};

/// Gradient norm above which gradients are rescaled.
pub const GRAD_CLIP_NORM: f32 = 4.0;

/// One training mode: a gradient pass and an evaluation pass.
pub trait Runner {
    /// One pass over `source` with an optimizer step per batch.
    fn train_epoch(&mut self, source: &dyn BatchSource, epoch: usize) -> Result<(EpochMetrics, PerBatchRecord)>;

    /// One pass over `source` without updates, on the inference model.
    ///
    /// With `keep_all` the raw per-batch arrays are returned as well.
    fn evaluate(
        &self,
        source: &dyn BatchSource,
        epoch: Option<usize>,
        keep_all: bool,
    ) -> Result<(EpochMetrics, Option<PerBatchRecord>)>;
}

/// Learning-rate control and persistence of a runner's state.
pub trait Checkpointer {
    /// Current learning rate.
    fn lr(&self) -> f64;

    /// Learning rate for all subsequent steps.
    fn set_lr(&mut self, lr: f64);

    /// Save the model (and optionally the optimizer) as checkpoint `stem`.
    fn save_checkpoint(&self, stem: &Path, epoch: usize, with_optimizer: bool) -> Result<()>;
}

/// Runner options derived from a [`RunConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerSettings {
    /// Task being solved.
    pub task: Task,
    /// Log progress every this many batches.
    pub print_interval: usize,
    /// Strength of the output-layer L2 penalty added to the batch loss.
    pub output_l2: Option<f64>,
}

impl RunnerSettings {
    /// Settings of `config`.
    ///
    /// The output-layer penalty applies only when `l2_reg` is not handled
    /// globally by the optimizer's weight decay.
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            task: config.task,
            print_interval: config.print_interval.max(1),
            output_l2: (!config.global_reg && config.l2_reg > 0.0).then_some(config.l2_reg),
        }
    }
}

/// Adam with gradient-norm clipping, and weight decay when `global_reg` is set.
pub fn optimizer_config(config: &RunConfig) -> AdamConfig {
    let weight_decay = (config.global_reg && config.l2_reg > 0.0)
        .then(|| WeightDecayConfig::new(config.l2_reg as f32));
    AdamConfig::new()
        .with_weight_decay(weight_decay)
        .with_grad_clipping(Some(GradientClippingConfig::Norm(GRAD_CLIP_NORM)))
}

/// Running total of a pass's loss.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossAccumulator {
    total: f64,
    count: usize,
    skipped: usize,
}

impl LossAccumulator {
    /// Add a batch's summed loss over `count` active units.
    pub fn add(&mut self, batch_total: f64, count: usize) {
        self.total += batch_total;
        self.count += count;
    }

    /// Record a batch without active units.
    pub fn skip(&mut self) {
        self.skipped += 1;
    }

    /// Active units seen so far.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Degenerate batches seen so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Weighted mean loss, `None` when nothing was active.
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.total / self.count as f64)
    }
}

pub(crate) fn log_progress(prefix: &str, i_batch: usize, total_batches: usize, loss: f64) {
    let pct = if total_batches == 0 {
        0.0
    } else {
        100.0 * i_batch as f64 / total_batches as f64
    };
    tracing::info!("{prefix}{pct:5.1}% | batch: {i_batch} of {total_batches} | loss: {loss:.6}");
}

pub(crate) fn warn_degenerate(prefix: &str, i_batch: usize) {
    tracing::warn!(batch = i_batch, "{prefix}skipping batch without active elements");
}

fn host_error<E: std::fmt::Debug>(e: E) -> TrainError {
    TrainError::ForwardError(format!("{e:?}"))
}

pub(crate) fn to_vec1<B: Backend>(t: Tensor<B, 1>) -> Result<Vec<f32>> {
    t.into_data().convert::<f32>().to_vec::<f32>().map_err(host_error)
}

pub(crate) fn to_array2<B: Backend>(t: Tensor<B, 2>) -> Result<Array2<f32>> {
    let [a, b] = t.dims();
    let flat = t.into_data().convert::<f32>().to_vec::<f32>().map_err(host_error)?;
    Array2::from_shape_vec((a, b), flat).map_err(host_error)
}

pub(crate) fn to_array3<B: Backend>(t: Tensor<B, 3>) -> Result<Array3<f32>> {
    let [a, b, c] = t.dims();
    let flat = t.into_data().convert::<f32>().to_vec::<f32>().map_err(host_error)?;
    Array3::from_shape_vec((a, b, c), flat).map_err(host_error)
}

pub(crate) fn scalar<B: Backend>(t: Tensor<B, 1>) -> f64 {
    t.into_scalar().elem::<f64>()
}

/// Class indices of a `(batch, 1)` label matrix.
///
/// Labels must be non-negative integers, below `num_classes` when given.
pub fn class_indices(labels: &Array2<f32>, num_classes: Option<usize>) -> Result<Vec<usize>> {
    if labels.ncols() != 1 {
        return Err(DataError::InvalidShape(format!(
            "class labels must have shape (batch, 1), got {:?}",
            labels.dim()
        ))
        .into());
    }
    labels
        .column(0)
        .iter()
        .map(|&v| {
            if !v.is_finite() || v < 0.0 || v.fract() != 0.0 {
                return Err(DataError::InvalidShape(format!("{v} is not a class index")).into());
            }
            let class = v as usize;
            match num_classes {
                Some(n) if class >= n => Err(DataError::IndexOutOfBounds {
                    index: class,
                    length: n,
                }
                .into()),
                _ => Ok(class),
            }
        })
        .collect()
}

/// Row-wise softmax.
pub(crate) fn softmax_rows(logits: &Array2<f32>) -> Array2<f64> {
    let mut probs = logits.mapv(f64::from);
    for mut row in probs.rows_mut() {
        let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    probs
}

pub(crate) fn argmax_rows(values: &Array2<f64>) -> Vec<usize> {
    values
        .rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) })
                .0
        })
        .collect()
}

/// Add accuracy, macro and per-class precision/recall/F1 to `metrics`.
///
/// Per-class names are `<metric>-cls-<i>` with 1-based `i`. With `curves`
/// and two classes, `AUROC` and `AUPRC` of the class-1 probability are added.
pub(crate) fn add_classification_metrics(
    metrics: &mut EpochMetrics,
    logits: &Array2<f32>,
    labels: &[usize],
    curves: bool,
) -> Result<()> {
    let num_classes = logits.ncols();
    let probs = softmax_rows(logits);
    let predictions = argmax_rows(&probs);
    let class_names: Vec<String> = (0..num_classes).map(|c| c.to_string()).collect();
    let report = analyze_classification(&predictions, labels, &class_names)?;

    metrics.set("accuracy", report.total_accuracy);
    metrics.set("precision", report.prec_avg);
    metrics.set("recall", report.rec_avg);
    metrics.set("f1", report.f1_avg);
    for (name, values) in [
        ("precision", &report.precision),
        ("recall", &report.recall),
        ("f1", &report.f1),
    ] {
        for (i, &v) in values.iter().enumerate() {
            metrics.set(format!("{name}-cls-{}", i + 1), v);
        }
    }

    if curves && num_classes == 2 {
        let positives: Vec<bool> = labels.iter().map(|&l| l == 1).collect();
        let scores: Vec<f64> = probs.column(1).to_vec();
        metrics.insert("AUROC", roc_auc(&positives, &scores));
        metrics.insert("AUPRC", pr_auc(&positives, &scores));
    }
    Ok(())
}
