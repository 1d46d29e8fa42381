//! Masked-reconstruction runner.

use std::path::Path;

use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use ndarray::{Array3, Zip};
use serde::{Deserialize, Serialize};

use crate::checkpoint::{save_checkpoint, CheckpointMeta};
use crate::error::{Result, TrainError};
use crate::losses::MaskedSquaredError;
use crate::record::{per_sample_metrics, BatchRecord, PerBatchRecord};
use crate::runner::{
    log_progress, scalar, to_array3, warn_degenerate, Checkpointer, LossAccumulator, Runner, RunnerSettings,
};
use pser_core::{EpochMetrics, MaskedModel};
use pser_data::{Batch, BatchSource, DataError, ImputationDataset, PatternLoader, Targets};

/// Forward pass of one masked batch.
struct MaskedStep<B: Backend> {
    predictions: Tensor<B, 3>,
    /// Element-wise squared error, zero outside the active mask.
    errors: Tensor<B, 3>,
    targets: Array3<f32>,
    /// Target mask combined with the padding mask.
    active: Array3<bool>,
    count: usize,
}

fn masked_step<B: Backend, M: MaskedModel<B>>(model: &M, batch: &Batch, device: &B::Device) -> Result<MaskedStep<B>> {
    let Targets::Masked { values, mask } = &batch.targets else {
        return Err(DataError::InvalidShape("masked runner needs reconstruction targets".into()).into());
    };

    let mut active = mask.clone();
    Zip::indexed(&mut active).for_each(|(b, t, _), m| *m = *m && batch.padding_mask[[b, t]]);
    let count = active.iter().filter(|&&m| m).count();

    let active_f = active.mapv(|m| if m { 1.0f32 } else { 0.0 });
    let (a, l, f) = active_f.dim();
    let mask_t = Tensor::<B, 3>::from_data(TensorData::new(active_f.into_raw_vec_and_offset().0, [a, l, f]), device);
    let (targets_t, _) = batch
        .targets
        .masked_tensors::<B>(device)
        .ok_or_else(|| TrainError::Other("missing reconstruction tensors".into()))?;

    let predictions = model.forward(batch.x_tensor(device), batch.padding_tensor(device));
    if predictions.dims() != [a, l, f] {
        return Err(TrainError::ForwardError(format!(
            "expected reconstruction of shape [{a}, {l}, {f}], got {:?}",
            predictions.dims()
        )));
    }
    let errors = MaskedSquaredError::new().forward(predictions.clone(), targets_t, mask_t);

    Ok(MaskedStep {
        predictions,
        errors,
        targets: values.clone(),
        active,
        count,
    })
}

/// Element losses at the active positions, in row-major order.
fn active_elements(errors: &Array3<f32>, active: &Array3<bool>) -> Vec<f64> {
    errors
        .iter()
        .zip(active.iter())
        .filter(|(_, &m)| m)
        .map(|(&e, _)| f64::from(e))
        .collect()
}

/// Runner minimizing the squared error on masked values.
pub struct UnsupervisedRunner<B, M, O>
where
    B: AutodiffBackend,
    M: MaskedModel<B> + AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    model: M,
    optim: O,
    device: B::Device,
    lr: f64,
    settings: RunnerSettings,
}

impl<B, M, O> UnsupervisedRunner<B, M, O>
where
    B: AutodiffBackend,
    M: MaskedModel<B> + AutodiffModule<B>,
    M::InnerModule: MaskedModel<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    /// Create a runner.
    pub fn new(model: M, optim: O, device: B::Device, lr: f64, settings: RunnerSettings) -> Self {
        Self {
            model,
            optim,
            device,
            lr,
            settings,
        }
    }

    /// Current model.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Take the model out of the runner.
    pub fn into_model(self) -> M {
        self.model
    }

    /// Evaluate once per fold, hiding exactly the features of that fold.
    ///
    /// Per-sample losses (sums over each sample's hidden values) of every
    /// fold are written to `out_path` as JSON. Random masking is restored
    /// afterwards, also on error.
    pub fn fold_evaluate(
        &self,
        loader: &mut PatternLoader<ImputationDataset>,
        target_feats: &[Vec<usize>],
        out_path: impl AsRef<Path>,
    ) -> Result<FoldResults> {
        let result = self.evaluate_folds(loader, target_feats);
        loader.dataset_mut().set_mask_feats(None)?;
        let results = result?;
        results.write_json(out_path)?;
        Ok(results)
    }

    fn evaluate_folds(
        &self,
        loader: &mut PatternLoader<ImputationDataset>,
        target_feats: &[Vec<usize>],
    ) -> Result<FoldResults> {
        let mut folds = Vec::with_capacity(target_feats.len());
        for (i, feats) in target_feats.iter().enumerate() {
            loader.dataset_mut().set_mask_feats(Some(feats.clone()))?;
            let (metrics, record) = self.evaluate(&*loader, None, true)?;
            let record = record.ok_or_else(|| TrainError::Other("evaluation kept no record".into()))?;
            let per_sample = per_sample_metrics(&record)?;

            let n = per_sample.len().max(1) as f64;
            let mean = per_sample.iter().sum::<f64>() / n;
            let std = (per_sample.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
            tracing::info!(fold = i, features = ?feats, "Fold {i}: {} | per-sample mean {mean:.6} std {std:.6}", metrics.summary());

            folds.push(FoldResult {
                target_features: feats.clone(),
                loss: metrics.get("loss"),
                ids: record.ids(),
                per_sample,
            });
        }
        Ok(FoldResults { folds })
    }
}

impl<B, M, O> Runner for UnsupervisedRunner<B, M, O>
where
    B: AutodiffBackend,
    M: MaskedModel<B> + AutodiffModule<B>,
    M::InnerModule: MaskedModel<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    fn train_epoch(&mut self, source: &dyn BatchSource, epoch: usize) -> Result<(EpochMetrics, PerBatchRecord)> {
        let prefix = format!("Training Epoch {epoch} ");
        let total_batches = source.n_batches();
        let mut loss = LossAccumulator::default();

        for (i, batch) in source.batches().enumerate() {
            let batch = batch?;
            let step = masked_step(&self.model, &batch, &self.device)?;
            if step.count == 0 {
                warn_degenerate(&prefix, i);
                loss.skip();
                continue;
            }

            let batch_loss = step.errors.sum();
            let mean_loss = batch_loss.clone().div_scalar(step.count as f64);
            let total_loss = match self.settings.output_l2 {
                Some(l2) => mean_loss + self.model.output_l2().mul_scalar(l2),
                None => mean_loss,
            };

            let grads = total_loss.backward();
            let grads = GradientsParams::from_grads(grads, &self.model);
            self.model = self.optim.step(self.lr, self.model.clone(), grads);

            let batch_total = scalar(batch_loss);
            loss.add(batch_total, step.count);
            if i % self.settings.print_interval == 0 {
                log_progress(&prefix, i, total_batches, batch_total / step.count as f64);
            }
        }

        let mut metrics = EpochMetrics::for_epoch(Some(epoch));
        metrics.insert("loss", loss.mean());
        Ok((metrics, PerBatchRecord::new()))
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

        for (i, batch) in source.batches().enumerate() {
            let batch = batch?;
            let step = masked_step(&model, &batch, &device)?;
            if step.count == 0 {
                warn_degenerate(&prefix, i);
                loss.skip();
                continue;
            }

            let errors = to_array3(step.errors)?;
            let elements = active_elements(&errors, &step.active);
            let batch_total: f64 = elements.iter().sum();
            loss.add(batch_total, step.count);
            if i % self.settings.print_interval == 0 {
                log_progress(&prefix, i, total_batches, batch_total / step.count as f64);
            }

            if keep_all {
                record.push(BatchRecord {
                    target_masks: Some(step.active),
                    targets: Some(step.targets.into_dyn()),
                    predictions: Some(to_array3(step.predictions)?.into_dyn()),
                    metrics: Some(elements),
                    ids: batch.ids,
                    ..Default::default()
                });
            }
        }

        let mut metrics = EpochMetrics::for_epoch(epoch);
        metrics.insert("loss", loss.mean());
        Ok((metrics, keep_all.then_some(record)))
    }
}

impl<B, M, O> Checkpointer for UnsupervisedRunner<B, M, O>
where
    B: AutodiffBackend,
    M: MaskedModel<B> + AutodiffModule<B>,
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
            num_outputs: None,
        };
        save_checkpoint(stem, &self.model, with_optimizer.then_some(&self.optim), &meta)
    }
}

/// Evaluation of one fold of target features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldResult {
    /// Features hidden in this fold.
    pub target_features: Vec<usize>,
    /// Mean loss per hidden value.
    pub loss: Option<f64>,
    /// Sample identifiers, aligned with `per_sample`.
    #[serde(rename = "IDs")]
    pub ids: Vec<String>,
    /// Summed loss of each sample's hidden values.
    pub per_sample: Vec<f64>,
}

/// Results of [`UnsupervisedRunner::fold_evaluate`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FoldResults {
    /// One entry per fold, in the given order.
    pub folds: Vec<FoldResult>,
}

impl FoldResults {
    /// Write as pretty JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path.as_ref(), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::optimizer_config;
    use burn_autodiff::Autodiff;
    use burn_ndarray::NdArray;
    use pser_core::{RunConfig, Seed, Task};
    use pser_models::{MaskedEncoder, MaskedEncoderConfig};

    type TestBackend = Autodiff<NdArray>;

    fn loader(n: usize, ratio: f64) -> PatternLoader<ImputationDataset> {
        let x = Array3::from_shape_fn((n, 6, 3), |(i, t, f)| ((i + t) as f32 * 0.3 + f as f32).sin());
        let dataset = ImputationDataset::new(x, ratio, Seed::new(11))
            .unwrap()
            .with_lengths((0..n).map(|i| if i % 2 == 0 { 6 } else { 4 }).collect())
            .unwrap();
        PatternLoader::builder(dataset).batch_size(3).build().unwrap()
    }

    fn runner() -> UnsupervisedRunner<
        TestBackend,
        MaskedEncoder<TestBackend>,
        impl Optimizer<MaskedEncoder<TestBackend>, TestBackend>,
    > {
        let config = RunConfig {
            task: Task::Imputation,
            lr: 1e-2,
            ..Default::default()
        };
        let device = Default::default();
        let model = MaskedEncoderConfig::new(3).with_filters(8).init::<TestBackend>(&device);
        let optim = optimizer_config(&config).init::<TestBackend, MaskedEncoder<TestBackend>>();
        UnsupervisedRunner::new(model, optim, device, config.lr, RunnerSettings::from_config(&config))
    }

    #[test]
    fn test_active_mask_excludes_padding() {
        let source = loader(4, 0.5);
        let runner = runner();
        let (_, record) = runner.evaluate(&source, Some(0), true).unwrap();
        let record = record.unwrap();
        for batch in record.batches() {
            let masks = batch.target_masks.as_ref().unwrap();
            let n_active = masks.iter().filter(|&&m| m).count();
            assert_eq!(batch.metrics.as_ref().unwrap().len(), n_active);
        }
        // samples 1 and 3 have four valid steps
        let masks = record.batches()[0].target_masks.as_ref().unwrap();
        assert!(masks.slice(ndarray::s![1, 4.., ..]).iter().all(|&m| !m));
    }

    #[test]
    fn test_train_epoch_has_only_loss() {
        let mut source = loader(6, 0.3);
        let mut runner = runner();
        source.set_epoch(1);
        let (metrics, record) = runner.train_epoch(&source, 1).unwrap();
        assert_eq!(metrics.names().collect::<Vec<_>>(), vec!["epoch", "loss"]);
        assert!(metrics.get("loss").unwrap() >= 0.0);
        assert!(record.is_empty());
    }

    #[test]
    fn test_fold_evaluate_restores_random_masking() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("folds.json");
        let mut source = loader(4, 0.2);
        let runner = runner();

        let results = runner.fold_evaluate(&mut source, &[vec![0], vec![1, 2]], &out).unwrap();
        assert_eq!(results.folds.len(), 2);
        assert_eq!(results.folds[1].target_features, vec![1, 2]);
        assert_eq!(results.folds[0].per_sample.len(), 4);
        assert!(out.is_file());

        // an out-of-range feature fails, masking is reset either way
        assert!(runner.fold_evaluate(&mut source, &[vec![7]], &out).is_err());
        let (metrics, _) = runner.evaluate(&source, None, false).unwrap();
        assert!(metrics.contains("loss"));
    }
}
