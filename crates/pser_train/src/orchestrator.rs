//! The epoch loop tying runners, validation, checkpoints and schedules together.

use std::time::{Duration, Instant};

use chrono::{DateTime, Local};

use crate::error::Result;
use crate::export::{register_record, write_metrics_csv, RunRecord};
use crate::runner::{Checkpointer, Runner};
use crate::scheduler::{is_harden_epoch, MilestoneSchedule};
use crate::validation::{validate, BestState, MetricSink};
use pser_core::{EpochMetrics, RunConfig, RunPaths};
use pser_data::BatchSource;

/// Wall-time bookkeeping of a fit.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timing {
    train_time: Duration,
    epochs: usize,
    batches: usize,
    samples: usize,
    val_time: Duration,
    validations: usize,
}

fn mean_duration(total: Duration, n: usize) -> Duration {
    if n == 0 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(total.as_secs_f64() / n as f64)
    }
}

impl Timing {
    fn add_epoch(&mut self, elapsed: Duration, batches: usize, samples: usize) {
        self.train_time += elapsed;
        self.epochs += 1;
        self.batches += batches;
        self.samples += samples;
    }

    fn add_validation(&mut self, elapsed: Duration) {
        self.val_time += elapsed;
        self.validations += 1;
    }

    /// Mean training time per epoch.
    pub fn avg_epoch(&self) -> Duration {
        mean_duration(self.train_time, self.epochs)
    }

    /// Mean training time per batch.
    pub fn avg_batch(&self) -> Duration {
        mean_duration(self.train_time, self.batches)
    }

    /// Mean training time per sample.
    pub fn avg_sample(&self) -> Duration {
        mean_duration(self.train_time, self.samples)
    }

    /// Mean time per validation.
    pub fn avg_validation(&self) -> Duration {
        mean_duration(self.val_time, self.validations)
    }
}

/// Result of [`Trainer::fit`].
#[derive(Debug, Clone)]
pub struct FitOutput {
    /// Best value of the key metric, `None` if it was never defined.
    pub best_value: Option<f64>,
    /// Validation metrics of the best epoch.
    pub best_metrics: Option<EpochMetrics>,
    /// Training metrics, one row per epoch.
    pub train_history: Vec<EpochMetrics>,
    /// Validation metrics, starting with the validation before training.
    pub val_history: Vec<EpochMetrics>,
    /// Timing averages.
    pub timing: Timing,
}

/// Drives a runner through the configured epochs.
pub struct Trainer {
    config: RunConfig,
    paths: RunPaths,
    start_epoch: usize,
    started: DateTime<Local>,
}

impl Trainer {
    /// Create a trainer. `start_epoch` is the epoch a resumed checkpoint was saved at, else 0.
    pub fn new(config: RunConfig, paths: RunPaths, start_epoch: usize) -> Self {
        Self {
            config,
            paths,
            start_epoch,
            started: Local::now(),
        }
    }

    /// Configuration of this run.
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// When this trainer was created; stamps the run record.
    pub fn started(&self) -> DateTime<Local> {
        self.started
    }

    /// Validate, then train and validate every epoch up to `config.epochs`.
    ///
    /// After each epoch the runner is checkpointed as `model_last` (or
    /// `model_<epoch>` with `save_all`), learning-rate milestones are applied
    /// and, with `harden`, both sources are hardened at the harden epochs.
    /// Finally both metric histories are exported next to the experiment
    /// directories and the run is appended to the records file.
    pub fn fit<R: Runner + Checkpointer>(
        &mut self,
        runner: &mut R,
        train: &mut dyn BatchSource,
        val: &mut dyn BatchSource,
        sink: &mut dyn MetricSink,
    ) -> Result<FitOutput> {
        let config = &self.config;
        let mut schedule = MilestoneSchedule::new(config.lr_step.clone(), config.lr_factor.clone())?;
        if self.start_epoch > 0 {
            // the restored rate already carries these decays, only the pointer moves
            schedule.fast_forward(self.start_epoch, runner.lr());
            tracing::info!(epoch = self.start_epoch, lr = runner.lr(), "Resuming training");
        }

        let mut timing = Timing::default();
        let mut train_history = Vec::new();
        let mut val_history = Vec::new();

        let outcome = validate(
            &*runner,
            &*val,
            sink,
            &config.key_metric,
            &self.paths,
            BestState::default(),
            self.start_epoch,
        )?;
        timing.add_validation(outcome.runtime);
        let mut best = outcome.best;
        val_history.push(outcome.metrics);

        tracing::info!("Starting training...");
        for epoch in self.start_epoch + 1..=config.epochs {
            train.set_epoch(epoch);
            let start = Instant::now();
            let (metrics, _) = runner.train_epoch(&*train, epoch)?;
            let elapsed = start.elapsed();
            timing.add_epoch(elapsed, train.n_batches(), train.n_samples());

            tracing::info!("Epoch {epoch} Training Summary: {}", metrics.summary());
            tracing::info!(
                "Epoch runtime: {:.2}s | avg epoch {:.2}s | avg batch {:.4}s | avg sample {:.6}s",
                elapsed.as_secs_f64(),
                timing.avg_epoch().as_secs_f64(),
                timing.avg_batch().as_secs_f64(),
                timing.avg_sample().as_secs_f64()
            );
            train_history.push(metrics);

            let outcome = validate(&*runner, &*val, sink, &config.key_metric, &self.paths, best, epoch)?;
            timing.add_validation(outcome.runtime);
            tracing::info!("Avg validation time: {:.2}s", timing.avg_validation().as_secs_f64());
            best = outcome.best;
            val_history.push(outcome.metrics);

            let mark = if config.save_all { epoch.to_string() } else { "last".to_string() };
            runner.save_checkpoint(&self.paths.checkpoint_dir.join(format!("model_{mark}")), epoch, true)?;

            if let Some(lr) = schedule.step(epoch, runner.lr()) {
                runner.save_checkpoint(&self.paths.checkpoint_dir.join(format!("model_{epoch}")), epoch, true)?;
                tracing::info!("Learning rate updated to: {lr}");
                runner.set_lr(lr);
            }

            if config.harden && is_harden_epoch(epoch) {
                train.harden();
                val.harden();
            }
        }

        self.export(&train_history, &val_history, &best)?;
        tracing::info!(
            "Best {} was {}. Other metrics: {}",
            config.key_metric,
            best.value.map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
            best.metrics.as_ref().map(|m| m.summary()).unwrap_or_default()
        );

        Ok(FitOutput {
            best_value: best.value,
            best_metrics: best.metrics,
            train_history,
            val_history,
            timing,
        })
    }

    fn export(&self, train_history: &[EpochMetrics], val_history: &[EpochMetrics], best: &BestState) -> Result<()> {
        let Some(header) = val_history.first() else {
            return Ok(());
        };
        let name = &self.config.experiment_name;
        write_metrics_csv(
            self.config.output_dir.join(format!("metrics_train_{name}.csv")),
            header,
            train_history,
        )?;
        write_metrics_csv(
            self.config.output_dir.join(format!("metrics_val_{name}.csv")),
            header,
            val_history,
        )?;
        register_record(
            &self.config.records_file,
            &RunRecord {
                timestamp: self.started,
                experiment: name,
                best: best.metrics.as_ref(),
                last: val_history.last(),
                comment: &self.config.comment,
            },
        )?;
        Ok(())
    }
}
