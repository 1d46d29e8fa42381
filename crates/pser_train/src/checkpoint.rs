//! Model and optimizer checkpoints.
//!
//! A checkpoint named `model_best` inside a directory consists of
//!
//! - `model_best.mpk` - model record (named MessagePack)
//! - `model_best_optim.mpk` - optimizer record, only for resumable checkpoints
//! - `model_best.json` - [`CheckpointMeta`]

use std::path::{Path, PathBuf};

use burn::module::AutodiffModule;
use burn::optim::Optimizer;
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};
use pser_core::PatternModel;

/// Metadata stored next to a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Epoch after which the checkpoint was written (0 before training).
    pub epoch: usize,
    /// Learning rate in effect at that epoch.
    pub lr: f64,
    /// Prediction width of a supervised model.
    pub num_outputs: Option<usize>,
}

/// Paths of the files of checkpoint `stem` (a path without extension).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointFiles {
    /// Model record.
    pub model: PathBuf,
    /// Optimizer record.
    pub optimizer: PathBuf,
    /// Metadata.
    pub meta: PathBuf,
}

impl CheckpointFiles {
    /// Files of the checkpoint at `stem`.
    pub fn new(stem: impl AsRef<Path>) -> Self {
        let stem = stem.as_ref();
        let name = stem
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            model: stem.with_file_name(format!("{name}.mpk")),
            optimizer: stem.with_file_name(format!("{name}_optim.mpk")),
            meta: stem.with_file_name(format!("{name}.json")),
        }
    }

    /// Strip a `.mpk` or `.json` extension from a user-given checkpoint path.
    pub fn stem_of(path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("mpk") | Some("json") => path.with_extension(""),
            _ => path.to_path_buf(),
        }
    }
}

fn recorder() -> NamedMpkFileRecorder<FullPrecisionSettings> {
    NamedMpkFileRecorder::<FullPrecisionSettings>::new()
}

/// Save a model record and its metadata, plus the optimizer when given.
pub fn save_checkpoint<B, M, O>(
    stem: impl AsRef<Path>,
    model: &M,
    optimizer: Option<&O>,
    meta: &CheckpointMeta,
) -> Result<()>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let files = CheckpointFiles::new(stem);
    if let Some(parent) = files.model.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // the recorder sets the `.mpk` extension itself
    recorder()
        .record(model.clone().into_record(), files.model.with_extension(""))
        .map_err(|e| TrainError::CheckpointError(format!("Failed to save model: {e}")))?;

    if let Some(optimizer) = optimizer {
        recorder()
            .record(optimizer.to_record(), files.optimizer.with_extension(""))
            .map_err(|e| TrainError::CheckpointError(format!("Failed to save optimizer: {e}")))?;
    }

    std::fs::write(&files.meta, serde_json::to_string_pretty(meta)?)?;
    Ok(())
}

/// Read the metadata of checkpoint `stem`.
pub fn load_meta(stem: impl AsRef<Path>) -> Result<CheckpointMeta> {
    let files = CheckpointFiles::new(stem);
    let text = std::fs::read_to_string(&files.meta).map_err(|e| {
        TrainError::CheckpointError(format!("Failed to read {}: {e}", files.meta.display()))
    })?;
    Ok(serde_json::from_str(&text)?)
}

/// A checkpoint loaded into a model and optimizer.
pub struct LoadedCheckpoint<M, O> {
    /// Model with the checkpoint's parameters.
    pub model: M,
    /// Optimizer, with its state restored when requested and available.
    pub optimizer: O,
    /// Checkpoint metadata.
    pub meta: CheckpointMeta,
    /// Whether the optimizer state was restored.
    pub optimizer_restored: bool,
}

/// Load checkpoint `stem` into `model` (and `optimizer` when `resume`).
///
/// A checkpoint whose prediction width differs from `model` is an error
/// unless `change_output` is set, in which case the output layer of `model`
/// is kept and the optimizer state is not restored.
pub fn load_checkpoint<B, M, O>(
    stem: impl AsRef<Path>,
    model: M,
    optimizer: O,
    resume: bool,
    change_output: bool,
    device: &B::Device,
) -> Result<LoadedCheckpoint<M, O>>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + PatternModel<B>,
    O: Optimizer<M, B>,
{
    let stem = stem.as_ref();
    let files = CheckpointFiles::new(stem);
    let meta = load_meta(stem)?;

    let width_changed = meta.num_outputs.is_some_and(|n| n != model.num_outputs());
    if width_changed && !change_output {
        return Err(TrainError::CheckpointError(format!(
            "checkpoint predicts {} outputs but the model predicts {}; set change_output to replace the output layer",
            meta.num_outputs.unwrap_or_default(),
            model.num_outputs()
        )));
    }

    let record = recorder()
        .load(files.model.with_extension(""), device)
        .map_err(|e| TrainError::CheckpointError(format!("Failed to load model: {e}")))?;
    let fresh = model.clone();
    let mut model = model.load_record(record);
    if width_changed {
        model = model.with_output_of(fresh);
        tracing::info!(path = %stem.display(), "Loaded checkpoint with a new output layer");
    }

    let mut optimizer = optimizer;
    let mut optimizer_restored = false;
    if resume && !width_changed {
        if files.optimizer.is_file() {
            let record = recorder()
                .load(files.optimizer.with_extension(""), device)
                .map_err(|e| TrainError::CheckpointError(format!("Failed to load optimizer: {e}")))?;
            optimizer = optimizer.load_record(record);
            optimizer_restored = true;
        } else {
            tracing::warn!(path = %files.optimizer.display(), "No optimizer state to resume from");
        }
    }

    tracing::info!(path = %stem.display(), epoch = meta.epoch, "Loaded model");
    Ok(LoadedCheckpoint {
        model,
        optimizer,
        meta,
        optimizer_restored,
    })
}

/// Load only the model record of checkpoint `stem` into a non-autodiff model.
pub fn load_model_record<B, M>(stem: impl AsRef<Path>, model: M, device: &B::Device) -> Result<M>
where
    B: Backend,
    M: Module<B>,
{
    let files = CheckpointFiles::new(stem);
    let record = recorder()
        .load(files.model.with_extension(""), device)
        .map_err(|e| TrainError::CheckpointError(format!("Failed to load model: {e}")))?;
    Ok(model.load_record(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::optim::AdamConfig;
    use burn_autodiff::Autodiff;
    use burn_ndarray::NdArray;
    use pser_models::{PatternSeriesEncoder, PatternSeriesEncoderConfig};

    type TestBackend = Autodiff<NdArray>;

    fn model(outputs: usize) -> PatternSeriesEncoder<TestBackend> {
        PatternSeriesEncoderConfig::new(2, outputs)
            .with_filters(4, 4)
            .with_hidden(4)
            .init(&Default::default())
    }

    #[test]
    fn test_files_of_stem() {
        let files = CheckpointFiles::new("/tmp/run/model_best");
        assert_eq!(files.model, PathBuf::from("/tmp/run/model_best.mpk"));
        assert_eq!(files.optimizer, PathBuf::from("/tmp/run/model_best_optim.mpk"));
        assert_eq!(files.meta, PathBuf::from("/tmp/run/model_best.json"));
        assert_eq!(CheckpointFiles::stem_of("a/model_7.mpk"), PathBuf::from("a/model_7"));
    }

    #[test]
    fn test_save_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let stem = dir.path().join("model_last");
        let device = Default::default();
        let optim = AdamConfig::new().init::<TestBackend, PatternSeriesEncoder<TestBackend>>();
        let meta = CheckpointMeta { epoch: 7, lr: 0.01, num_outputs: Some(3) };

        save_checkpoint::<TestBackend, _, _>(&stem, &model(3), Some(&optim), &meta).unwrap();
        assert!(CheckpointFiles::new(&stem).optimizer.is_file());

        let loaded = load_checkpoint::<TestBackend, _, _>(&stem, model(3), optim, true, false, &device).unwrap();
        assert_eq!(loaded.meta, meta);
        assert!(loaded.optimizer_restored);
    }

    #[test]
    fn test_output_width_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let stem = dir.path().join("model_best");
        let device = Default::default();
        let meta = CheckpointMeta { epoch: 1, lr: 0.01, num_outputs: Some(3) };
        let optim = || AdamConfig::new().init::<TestBackend, PatternSeriesEncoder<TestBackend>>();
        save_checkpoint::<TestBackend, _, _>(&stem, &model(3), Some(&optim()), &meta).unwrap();

        assert!(load_checkpoint::<TestBackend, _, _>(&stem, model(5), optim(), false, false, &device).is_err());

        let loaded = load_checkpoint::<TestBackend, _, _>(&stem, model(5), optim(), true, true, &device).unwrap();
        assert_eq!(loaded.model.num_outputs(), 5);
        assert!(!loaded.optimizer_restored);
    }
}
