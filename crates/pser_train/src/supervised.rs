//! Classification and regression runner.

use std::path::Path;

use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use ndarray::Array2;

use crate::checkpoint::{save_checkpoint, CheckpointMeta};
use crate::error::{Result, TrainError};
use crate::losses::{PerSampleCrossEntropy, PerSampleSquaredError};
use crate::record::{BatchRecord, PerBatchRecord};
use crate::runner::{
    add_classification_metrics, class_indices, log_progress, scalar, to_array2, to_array3, to_vec1,
    warn_degenerate, Checkpointer, LossAccumulator, Runner, RunnerSettings,
};
use pser_core::{CoreError, EpochMetrics, PatternModel, SupervisedOutput, Task};
use pser_data::{Batch, BatchSource, DataError, Targets};

/// Forward pass and per-sample loss of one batch.
pub(crate) struct SupervisedStep<B: Backend> {
    pub(crate) output: SupervisedOutput<B>,
    pub(crate) per_sample: Tensor<B, 1>,
    pub(crate) labels: Array2<f32>,
    pub(crate) class_labels: Vec<usize>,
}

/// Run `model` on `batch`. `None` for a batch without samples.
pub(crate) fn supervised_step<B: Backend, M: PatternModel<B>>(
    model: &M,
    batch: &Batch,
    task: Task,
    device: &B::Device,
) -> Result<Option<SupervisedStep<B>>> {
    let Targets::Labels(labels) = &batch.targets else {
        return Err(DataError::InvalidShape("supervised runner needs label targets".into()).into());
    };
    if batch.is_empty() {
        return Ok(None);
    }

    let n = batch.len();
    let num_outputs = model.num_outputs();
    let output = model.forward(batch.x_tensor(device), batch.padding_tensor(device));
    let [rows, cols] = output.predictions.dims();
    if rows != n || cols != num_outputs {
        return Err(TrainError::ForwardError(format!(
            "expected predictions of shape [{n}, {num_outputs}], got [{rows}, {cols}]"
        )));
    }

    let (per_sample, class_labels) = match task {
        Task::Classification => {
            let classes = class_indices(labels, Some(num_outputs))?;
            let idx: Vec<i64> = classes.iter().map(|&c| c as i64).collect();
            let targets = Tensor::<B, 1, Int>::from_data(TensorData::new(idx, [n]), device);
            (PerSampleCrossEntropy::new().forward(output.predictions.clone(), targets), classes)
        }
        Task::Regression => {
            if labels.ncols() != num_outputs {
                return Err(DataError::InvalidShape(format!(
                    "regression targets have {} columns, model predicts {num_outputs}",
                    labels.ncols()
                ))
                .into());
            }
            let targets = batch
                .targets
                .labels_tensor::<B>(device)
                .ok_or_else(|| TrainError::Other("missing label tensor".into()))?;
            (PerSampleSquaredError::new().forward(output.predictions.clone(), targets), Vec::new())
        }
        Task::Imputation => return Err(CoreError::Config("imputation needs the unsupervised runner".into()).into()),
    };

    Ok(Some(SupervisedStep {
        output,
        per_sample,
        labels: labels.clone(),
        class_labels,
    }))
}

/// Runner minimizing per-sample cross entropy or squared error.
pub struct SupervisedRunner<B, M, O>
where
    B: AutodiffBackend,
    M: PatternModel<B> + AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    pub(crate) model: M,
    optim: O,
    pub(crate) device: B::Device,
    lr: f64,
    pub(crate) settings: RunnerSettings,
}

impl<B, M, O> SupervisedRunner<B, M, O>
where
    B: AutodiffBackend,
    M: PatternModel<B> + AutodiffModule<B>,
    M::InnerModule: PatternModel<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    /// Create a runner. Fails for tasks without label targets.
    pub fn new(model: M, optim: O, device: B::Device, lr: f64, settings: RunnerSettings) -> Result<Self> {
        if !settings.task.is_supervised() {
            return Err(CoreError::Config(format!("Task '{}' needs the unsupervised runner", settings.task)).into());
        }
        Ok(Self {
            model,
            optim,
            device,
            lr,
            settings,
        })
    }

    /// Current model.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Take the model out of the runner.
    pub fn into_model(self) -> M {
        self.model
    }

    /// Prediction width.
    pub fn num_outputs(&self) -> usize {
        self.model.num_outputs()
    }

    fn classification(&self) -> bool {
        self.settings.task == Task::Classification
    }
}

impl<B, M, O> Runner for SupervisedRunner<B, M, O>
where
    B: AutodiffBackend,
    M: PatternModel<B> + AutodiffModule<B>,
    M::InnerModule: PatternModel<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    fn train_epoch(&mut self, source: &dyn BatchSource, epoch: usize) -> Result<(EpochMetrics, PerBatchRecord)> {
        let prefix = format!("Training Epoch {epoch} ");
        let total_batches = source.n_batches();
        let mut loss = LossAccumulator::default();
        let mut record = PerBatchRecord::new();
        let mut logits = Vec::new();
        let mut labels = Vec::new();

        for (i, batch) in source.batches().enumerate() {
            let batch = batch?;
            let Some(step) = supervised_step(&self.model, &batch, self.settings.task, &self.device)? else {
                warn_degenerate(&prefix, i);
                loss.skip();
                continue;
            };
            let count = batch.len();
            let predictions = to_array2(step.output.predictions.clone())?;

            let batch_loss = step.per_sample.sum();
            let mean_loss = batch_loss.clone().div_scalar(count as f64);
            let total_loss = match self.settings.output_l2 {
                Some(l2) => mean_loss + self.model.output_l2().mul_scalar(l2),
                None => mean_loss,
            };

            let grads = total_loss.backward();
            let grads = GradientsParams::from_grads(grads, &self.model);
            self.model = self.optim.step(self.lr, self.model.clone(), grads);

            let batch_total = scalar(batch_loss);
            loss.add(batch_total, count);
            if i % self.settings.print_interval == 0 {
                log_progress(&prefix, i, total_batches, batch_total / count as f64);
            }

            if self.classification() {
                logits.push(predictions.clone());
                labels.extend(step.class_labels);
            }
            record.push(BatchRecord {
                targets: Some(step.labels.into_dyn()),
                predictions: Some(predictions.into_dyn()),
                ids: batch.ids,
                ..Default::default()
            });
        }

        let mut metrics = EpochMetrics::for_epoch(Some(epoch));
        metrics.insert("loss", loss.mean());
        if self.classification() && !labels.is_empty() {
            let views: Vec<_> = logits.iter().map(|l| l.view()).collect();
            let stacked = ndarray::concatenate(ndarray::Axis(0), &views).map_err(|e| TrainError::Other(e.to_string()))?;
            add_classification_metrics(&mut metrics, &stacked, &labels, false)?;
        }
        Ok((metrics, record))
    }

    fn evaluate(
        &self,
        source: &dyn BatchSource,
        epoch: Option<usize>,
        keep_all: bool,
    ) -> Result<(EpochMetrics, Option<PerBatchRecord>)> {
        let prefix = match epoch {
            Some(e) => format!("Evaluating Epoch {e} "),
            None => "Evaluating ".to_string(),
        };
        let model = self.model.valid();
        let device: <B::InnerBackend as Backend>::Device = self.device.clone().into();
        let total_batches = source.n_batches();
        let mut loss = LossAccumulator::default();
        let mut record = PerBatchRecord::new();
        let mut logits = Vec::new();
        let mut labels = Vec::new();

        for (i, batch) in source.batches().enumerate() {
            let batch = batch?;
            let Some(step) = supervised_step(&model, &batch, self.settings.task, &device)? else {
                warn_degenerate(&prefix, i);
                loss.skip();
                continue;
            };
            let count = batch.len();
            let per_sample = to_vec1(step.per_sample)?;
            let batch_total: f64 = per_sample.iter().map(|&v| f64::from(v)).sum();
            loss.add(batch_total, count);
            if i % self.settings.print_interval == 0 {
                log_progress(&prefix, i, total_batches, batch_total / count as f64);
            }

            let predictions = to_array2(step.output.predictions)?;
            if self.classification() {
                logits.push(predictions.clone());
                labels.extend(step.class_labels);
            }
            if keep_all {
                let recon = step.output.recon.map(to_array3).transpose()?;
                record.push(BatchRecord {
                    targets: Some(step.labels.into_dyn()),
                    predictions: Some(predictions.into_dyn()),
                    recon,
                    metrics: Some(per_sample.into_iter().map(f64::from).collect()),
                    ids: batch.ids,
                    ..Default::default()
                });
            }
        }

        let mut metrics = EpochMetrics::for_epoch(epoch);
        metrics.insert("loss", loss.mean());
        if self.classification() && !labels.is_empty() {
            let views: Vec<_> = logits.iter().map(|l| l.view()).collect();
            let stacked = ndarray::concatenate(ndarray::Axis(0), &views).map_err(|e| TrainError::Other(e.to_string()))?;
            add_classification_metrics(&mut metrics, &stacked, &labels, true)?;
        }
        Ok((metrics, keep_all.then_some(record)))
    }
}

impl<B, M, O> Checkpointer for SupervisedRunner<B, M, O>
where
    B: AutodiffBackend,
    M: PatternModel<B> + AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    fn lr(&self) -> f64 {
        self.lr
    }

    fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn save_checkpoint(&self, stem: &Path, epoch: usize, with_optimizer: bool) -> Result<()> {
        let meta = CheckpointMeta {
            epoch,
            lr: self.lr,
            num_outputs: Some(self.model.num_outputs()),
        };
        save_checkpoint(stem, &self.model, with_optimizer.then_some(&self.optim), &meta)
    }
}
