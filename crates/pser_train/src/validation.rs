//! Validation passes and best-checkpoint selection.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use crate::error::Result;
use crate::record::PerBatchRecord;
use crate::runner::{Checkpointer, Runner};
use pser_core::{EpochMetrics, RunPaths};
use pser_data::BatchSource;

/// Receiver of scalar validation metrics.
pub trait MetricSink {
    /// Record every defined metric of `metrics` at `epoch`.
    fn log_scalars(&mut self, metrics: &EpochMetrics, epoch: usize) -> Result<()>;
}

/// Keeps logged metrics in memory.
#[derive(Debug, Clone, Default)]
pub struct HistorySink {
    /// `(epoch, metrics)` in logging order.
    pub entries: Vec<(usize, EpochMetrics)>,
}

impl MetricSink for HistorySink {
    fn log_scalars(&mut self, metrics: &EpochMetrics, epoch: usize) -> Result<()> {
        self.entries.push((epoch, metrics.clone()));
        Ok(())
    }
}

/// Appends one JSON object per validation to a file.
///
/// Keys are `<metric>/val` plus `epoch`; undefined metrics are left out.
pub struct JsonlSink {
    writer: BufWriter<File>,
}

impl JsonlSink {
    /// Open `path` for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path.as_ref())?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl MetricSink for JsonlSink {
    fn log_scalars(&mut self, metrics: &EpochMetrics, epoch: usize) -> Result<()> {
        let mut row = Map::new();
        row.insert("epoch".into(), Value::from(epoch));
        for (name, value) in metrics.iter().filter(|(n, _)| *n != "epoch") {
            if let Some(v) = value {
                row.insert(format!("{name}/val"), Value::from(v));
            }
        }
        serde_json::to_writer(&mut self.writer, &Value::Object(row))?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Best key-metric value seen so far and the metrics it came with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BestState {
    /// Best value, `None` before the first defined value.
    pub value: Option<f64>,
    /// Full metrics of the best validation.
    pub metrics: Option<EpochMetrics>,
}

impl BestState {
    /// Whether `value` of `key_metric` strictly improves on the best so far.
    ///
    /// `loss` is lower-is-better, every other metric higher-is-better. An
    /// undefined value never improves.
    pub fn improves(&self, key_metric: &str, value: Option<f64>) -> bool {
        let Some(value) = value.filter(|v| v.is_finite()) else {
            return false;
        };
        match self.value {
            None => true,
            Some(best) if key_metric == "loss" => value < best,
            Some(best) => value > best,
        }
    }
}

/// Outcome of one [`validate`] call.
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    /// Metrics of this validation.
    pub metrics: EpochMetrics,
    /// Best state after this validation.
    pub best: BestState,
    /// Raw per-batch outputs of this validation.
    pub per_batch: PerBatchRecord,
    /// Whether this validation became the new best.
    pub improved: bool,
    /// Wall time of the evaluation pass.
    pub runtime: Duration,
}

/// Evaluate `runner` on `source` and keep the best checkpoint.
///
/// Scalars go to `sink`. On strict improvement of `key_metric` the model is
/// saved as `<checkpoint_dir>/model_best` (without optimizer state) and the
/// raw per-batch outputs as `<prediction_dir>/best_predictions.json`.
pub fn validate<R: Runner + Checkpointer>(
    runner: &R,
    source: &dyn BatchSource,
    sink: &mut dyn MetricSink,
    key_metric: &str,
    paths: &RunPaths,
    best: BestState,
    epoch: usize,
) -> Result<ValidationOutcome> {
    tracing::info!("Evaluating on validation set ...");
    let start = Instant::now();
    let (metrics, record) = runner.evaluate(source, Some(epoch), true)?;
    let per_batch = record.unwrap_or_default();
    let runtime = start.elapsed();
    tracing::info!("Validation runtime: {:.2}s", runtime.as_secs_f64());

    sink.log_scalars(&metrics, epoch)?;
    tracing::info!("Epoch {epoch} Validation Summary: {}", metrics.summary());

    let value = metrics.get(key_metric);
    if value.is_none() {
        tracing::warn!(key_metric, "Key metric undefined for this validation");
    }
    let improved = best.improves(key_metric, value);
    let best = if improved {
        runner.save_checkpoint(&paths.checkpoint_dir.join("model_best"), epoch, false)?;
        per_batch.write_json(paths.prediction_dir.join("best_predictions.json"))?;
        BestState {
            value,
            metrics: Some(metrics.clone()),
        }
    } else {
        best
    };

    Ok(ValidationOutcome {
        metrics,
        best,
        per_batch,
        improved,
        runtime,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::path::PathBuf;

    use crate::record::BatchRecord;
    use pser_data::Batch;

    /// Returns one scripted `loss` per evaluation and records every save.
    struct ScriptedRunner {
        losses: Vec<Option<f64>>,
        calls: Cell<usize>,
        saves: RefCell<Vec<(PathBuf, usize, bool)>>,
    }

    impl ScriptedRunner {
        fn new(losses: Vec<Option<f64>>) -> Self {
            Self {
                losses,
                calls: Cell::new(0),
                saves: RefCell::new(Vec::new()),
            }
        }
    }

    impl Runner for ScriptedRunner {
        fn train_epoch(&mut self, _source: &dyn BatchSource, epoch: usize) -> Result<(EpochMetrics, PerBatchRecord)> {
            Ok((EpochMetrics::for_epoch(Some(epoch)), PerBatchRecord::new()))
        }

        fn evaluate(
            &self,
            _source: &dyn BatchSource,
            epoch: Option<usize>,
            keep_all: bool,
        ) -> Result<(EpochMetrics, Option<PerBatchRecord>)> {
            let call = self.calls.get();
            self.calls.set(call + 1);
            let mut m = EpochMetrics::for_epoch(epoch);
            m.insert("loss", self.losses[call]);
            let mut record = PerBatchRecord::new();
            record.push(BatchRecord {
                ids: vec![format!("call-{call}")],
                ..Default::default()
            });
            Ok((m, keep_all.then_some(record)))
        }
    }

    impl Checkpointer for ScriptedRunner {
        fn lr(&self) -> f64 {
            1e-3
        }

        fn set_lr(&mut self, _lr: f64) {}

        fn save_checkpoint(&self, stem: &Path, epoch: usize, with_optimizer: bool) -> Result<()> {
            std::fs::write(stem.with_extension("mpk"), epoch.to_string())?;
            self.saves.borrow_mut().push((stem.to_path_buf(), epoch, with_optimizer));
            Ok(())
        }
    }

    struct NoBatches;

    impl BatchSource for NoBatches {
        fn batches(&self) -> Box<dyn Iterator<Item = pser_data::Result<Batch>> + '_> {
            Box::new(std::iter::empty())
        }

        fn n_batches(&self) -> usize {
            0
        }

        fn n_samples(&self) -> usize {
            0
        }
    }

    fn metrics(loss: f64) -> EpochMetrics {
        let mut m = EpochMetrics::for_epoch(Some(1));
        m.set("loss", loss);
        m
    }

    #[test]
    fn test_loss_lower_is_better() {
        let best = BestState {
            value: Some(0.5),
            metrics: None,
        };
        assert!(!best.improves("loss", Some(0.6)));
        assert!(best.improves("loss", Some(0.4)));
        assert!(!best.improves("loss", Some(0.5)));
    }

    #[test]
    fn test_other_metrics_higher_is_better() {
        let best = BestState {
            value: Some(0.8),
            metrics: None,
        };
        assert!(best.improves("accuracy", Some(0.9)));
        assert!(!best.improves("accuracy", Some(0.8)));
        assert!(!best.improves("accuracy", Some(0.7)));
    }

    #[test]
    fn test_undefined_never_improves() {
        let best = BestState::default();
        assert!(!best.improves("loss", None));
        assert!(!best.improves("loss", Some(f64::NAN)));
        assert!(best.improves("loss", Some(1e9)));
    }

    #[test]
    fn test_validate_keeps_best_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RunPaths::new(dir.path());
        std::fs::create_dir_all(&paths.checkpoint_dir).unwrap();
        std::fs::create_dir_all(&paths.prediction_dir).unwrap();
        let dump = paths.prediction_dir.join("best_predictions.json");
        let stored = paths.checkpoint_dir.join("model_best.mpk");

        let runner = ScriptedRunner::new(vec![
            Some(0.5),
            Some(0.4),
            Some(0.4),
            Some(0.6),
            Some(f64::NAN),
            None,
            Some(0.3),
        ]);
        let mut sink = HistorySink::default();
        let mut best = BestState::default();
        let mut improvements = Vec::new();
        for epoch in 0..7 {
            let outcome = validate(&runner, &NoBatches, &mut sink, "loss", &paths, best.clone(), epoch).unwrap();
            if !outcome.improved {
                assert_eq!(outcome.best, best);
            }
            improvements.push(outcome.improved);
            best = outcome.best;

            let dumped = PerBatchRecord::read_json(&dump).unwrap();
            let best_epoch = best.metrics.as_ref().and_then(|m| m.get("epoch")).unwrap() as usize;
            assert_eq!(dumped.ids(), vec![format!("call-{best_epoch}")]);
            assert_eq!(std::fs::read_to_string(&stored).unwrap(), best_epoch.to_string());
        }

        assert_eq!(improvements, vec![true, true, false, false, false, false, true]);
        assert_eq!(best.value, Some(0.3));
        assert_eq!(sink.entries.len(), 7);

        let saves = runner.saves.borrow();
        assert_eq!(saves.len(), 3);
        assert!(saves.iter().all(|(stem, _, with_optimizer)| stem.ends_with("model_best") && !with_optimizer));
        assert_eq!(saves.iter().map(|(_, e, _)| *e).collect::<Vec<_>>(), vec![0, 1, 6]);
    }

    #[test]
    fn test_validate_without_defined_metric_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RunPaths::new(dir.path());
        let runner = ScriptedRunner::new(vec![None, Some(f64::INFINITY)]);
        let mut sink = HistorySink::default();

        let first = validate(&runner, &NoBatches, &mut sink, "loss", &paths, BestState::default(), 0).unwrap();
        let second = validate(&runner, &NoBatches, &mut sink, "loss", &paths, first.best.clone(), 1).unwrap();

        assert!(!first.improved && !second.improved);
        assert_eq!(second.best, BestState::default());
        assert!(runner.saves.borrow().is_empty());
        assert!(!paths.prediction_dir.join("best_predictions.json").exists());
    }

    #[test]
    fn test_jsonl_sink_suffixes_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        let mut sink = JsonlSink::open(&path).unwrap();
        sink.log_scalars(&metrics(0.25), 1).unwrap();
        let mut undefined = EpochMetrics::for_epoch(Some(2));
        undefined.insert("loss", None);
        sink.log_scalars(&undefined, 2).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["loss/val"], 0.25);
        assert_eq!(lines[0]["epoch"], 1);
        assert!(lines[1].get("loss/val").is_none());
    }

    #[test]
    fn test_history_sink() {
        let mut sink = HistorySink::default();
        sink.log_scalars(&metrics(1.0), 3).unwrap();
        assert_eq!(sink.entries[0].0, 3);
    }
}
