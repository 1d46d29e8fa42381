//! pser CLI for training, testing and open-set scoring of pattern-series models.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use burn::module::AutodiffModule;
use burn::optim::Optimizer;
use burn::prelude::Device;
use burn::tensor::backend::AutodiffBackend;
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;
use pser_core::{PatternModel, RunConfig, RunPaths, Seed, Task};
use pser_data::{load_imputation, load_labeled, BatchSource, PatternLoader, SeriesDataset};
use pser_models::{MaskedEncoder, MaskedEncoderConfig, PatternSeriesEncoder, PatternSeriesEncoderConfig};
use pser_train::{
    load_checkpoint, optimizer_config, CheckpointFiles, Checkpointer, JsonlSink, Runner, RunnerSettings,
    SupervisedRunner, Trainer, UnsupervisedRunner,
};

/// Backend type for training.
type TrainBackend = Autodiff<NdArray>;

#[derive(Parser)]
#[command(name = "pser")]
#[command(author, version)]
#[command(about = "Train pattern-series classifiers and score them with OpenMax")]
#[command(long_about = "pser: training, validation and OpenMax open-set scoring for pattern-series models.

Datasets are .npz archives holding `x` (samples, length, features), `y` (samples, outputs)
for supervised tasks, and optionally `lengths` (samples,).

EXAMPLES:
  # Train with the options of a configuration file
  pser train --config run.json --train train.npz --val val.npz

  # Evaluate the last checkpoint of an experiment
  pser test --config run.json --val val.npz

  # Fit Weibull tails on the training set and score a test set
  pser openmax --config run.json --train train.npz --test test.npz

  # Evaluate an imputation model with features 0 and then 1,2 hidden
  pser folds --config run.json --val val.npz --feats 0 --feats 1,2")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model
    Train {
        /// JSON run configuration
        #[arg(long, value_name = "FILE")]
        config: PathBuf,

        /// Training set archive
        #[arg(long, value_name = "FILE")]
        train: PathBuf,

        /// Validation set archive
        #[arg(long, value_name = "FILE")]
        val: PathBuf,
    },
    /// Evaluate a checkpoint on a validation set
    Test {
        /// JSON run configuration
        #[arg(long, value_name = "FILE")]
        config: PathBuf,

        /// Validation set archive
        #[arg(long, value_name = "FILE")]
        val: PathBuf,

        /// Checkpoint to evaluate (defaults to the experiment's `model_last`)
        #[arg(long, value_name = "FILE")]
        checkpoint: Option<PathBuf>,
    },
    /// Fit Weibull tail models and compute OpenMax scores
    Openmax {
        /// JSON run configuration
        #[arg(long, value_name = "FILE")]
        config: PathBuf,

        /// Archive the tail models are fitted on
        #[arg(long, value_name = "FILE")]
        train: PathBuf,

        /// Archive to score; labels beyond the trained classes count as unknown
        #[arg(long, value_name = "FILE")]
        test: PathBuf,

        /// Checkpoint to score with (defaults to the experiment's `model_best`)
        #[arg(long, value_name = "FILE")]
        checkpoint: Option<PathBuf>,
    },
    /// Evaluate an imputation model once per group of hidden features
    Folds {
        /// JSON run configuration
        #[arg(long, value_name = "FILE")]
        config: PathBuf,

        /// Validation set archive
        #[arg(long, value_name = "FILE")]
        val: PathBuf,

        /// Comma-separated feature indices of one fold; repeat per fold
        #[arg(long = "feats", value_name = "LIST", required = true)]
        feats: Vec<String>,

        /// Checkpoint to evaluate (defaults to the experiment's `model_best`)
        #[arg(long, value_name = "FILE")]
        checkpoint: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::filter::LevelFilter::from_level(log_level))
        .init();

    match cli.command {
        Commands::Train { config, train, val } => {
            let config = load_config(&config)?;
            if config.test_only {
                handle_test(config, &val, None)
            } else {
                handle_train(config, &train, &val)
            }
        }
        Commands::Test {
            config,
            val,
            checkpoint,
        } => handle_test(load_config(&config)?, &val, checkpoint),
        Commands::Openmax {
            config,
            train,
            test,
            checkpoint,
        } => handle_openmax(load_config(&config)?, &train, &test, checkpoint),
        Commands::Folds {
            config,
            val,
            feats,
            checkpoint,
        } => handle_folds(load_config(&config)?, &val, &feats, checkpoint),
    }
}

fn load_config(path: &Path) -> Result<RunConfig> {
    RunConfig::from_json_file(path).with_context(|| format!("Failed to load configuration '{}'", path.display()))
}

fn loader<D: SeriesDataset>(dataset: D, config: &RunConfig, shuffle: bool) -> Result<PatternLoader<D>> {
    Ok(PatternLoader::builder(dataset)
        .batch_size(config.batch_size)
        .shuffle(shuffle)
        .seed(Seed::new(config.seed))
        .build()?)
}

/// Runner over a supervised model loaded from `stem` when given.
fn supervised_runner(
    config: &RunConfig,
    feat_dim: usize,
    num_outputs: usize,
    stem: Option<&Path>,
    resume: bool,
) -> Result<(
    SupervisedRunner<TrainBackend, PatternSeriesEncoder<TrainBackend>, impl Optimizer<PatternSeriesEncoder<TrainBackend>, TrainBackend>>,
    usize,
)> {
    let device: Device<TrainBackend> = Default::default();
    let model = PatternSeriesEncoderConfig::new(feat_dim, num_outputs).init::<TrainBackend>(&device);
    let optim = optimizer_config(config).init::<TrainBackend, PatternSeriesEncoder<TrainBackend>>();
    let (model, optim, lr, start_epoch) = restore::<TrainBackend, _, _>(stem, model, optim, config, resume, &device)?;
    let model = if config.freeze {
        tracing::info!("Freezing every layer except the output layer");
        model.freeze_backbone()
    } else {
        model
    };
    let runner = SupervisedRunner::new(model, optim, device, lr, RunnerSettings::from_config(config))?;
    Ok((runner, start_epoch))
}

fn masked_runner(
    config: &RunConfig,
    feat_dim: usize,
    stem: Option<&Path>,
    resume: bool,
) -> Result<(
    UnsupervisedRunner<TrainBackend, MaskedEncoder<TrainBackend>, impl Optimizer<MaskedEncoder<TrainBackend>, TrainBackend>>,
    usize,
)> {
    let device: Device<TrainBackend> = Default::default();
    let model = MaskedEncoderConfig::new(feat_dim).init::<TrainBackend>(&device);
    let optim = optimizer_config(config).init::<TrainBackend, MaskedEncoder<TrainBackend>>();
    let (model, optim, lr, start_epoch) = match stem {
        Some(stem) => {
            let stem = CheckpointFiles::stem_of(stem);
            let model = pser_train::load_model_record::<TrainBackend, _>(&stem, model, &device)?;
            let meta = pser_train::load_meta(&stem)?;
            if resume {
                tracing::warn!("Masked models resume with a fresh optimizer");
                (model, optim, meta.lr, meta.epoch)
            } else {
                (model, optim, config.lr, 0)
            }
        }
        None => (model, optim, config.lr, 0),
    };
    Ok((
        UnsupervisedRunner::new(model, optim, device, lr, RunnerSettings::from_config(config)),
        start_epoch,
    ))
}

/// Load checkpoint `stem` into a supervised model; returns the learning rate and start epoch.
fn restore<B, M, O>(
    stem: Option<&Path>,
    model: M,
    optim: O,
    config: &RunConfig,
    resume: bool,
    device: &B::Device,
) -> Result<(M, O, f64, usize)>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + PatternModel<B>,
    O: Optimizer<M, B>,
{
    let Some(stem) = stem else {
        return Ok((model, optim, config.lr, 0));
    };
    let stem = CheckpointFiles::stem_of(stem);
    let loaded = load_checkpoint(&stem, model, optim, resume, config.change_output, device)?;
    if resume {
        Ok((loaded.model, loaded.optimizer, loaded.meta.lr, loaded.meta.epoch))
    } else {
        Ok((loaded.model, loaded.optimizer, config.lr, 0))
    }
}

fn handle_train(config: RunConfig, train_path: &Path, val_path: &Path) -> Result<()> {
    let paths = config.setup()?;
    tracing::info!(experiment = %paths.experiment_dir.display(), task = %config.task, "Starting run");
    let stem = config.load_model.clone();

    match config.task {
        Task::Classification | Task::Regression => {
            let train = load_labeled(train_path).context("Failed to load training set")?;
            let val = load_labeled(val_path).context("Failed to load validation set")?;
            let num_outputs = match config.task {
                Task::Classification => train.num_classes().max(val.num_classes()),
                _ => train.labels().ncols(),
            };
            tracing::info!(
                train = train.len(),
                val = val.len(),
                features = train.feat_dim(),
                outputs = num_outputs,
                "Loaded datasets"
            );
            let (mut runner, start_epoch) =
                supervised_runner(&config, train.feat_dim(), num_outputs, stem.as_deref(), config.resume)?;
            let mut train = loader(train, &config, true)?;
            let mut val = loader(val, &config, false)?;
            fit(config, paths, start_epoch, &mut runner, &mut train, &mut val)
        }
        Task::Imputation => {
            let seed = Seed::new(config.seed);
            let train = load_imputation(train_path, config.masking_ratio, seed.derive("train"))
                .context("Failed to load training set")?;
            let val = load_imputation(val_path, config.masking_ratio, seed.derive("val"))
                .context("Failed to load validation set")?;
            let (mut runner, start_epoch) = masked_runner(&config, train.feat_dim(), stem.as_deref(), config.resume)?;
            let mut train = loader(train, &config, true)?;
            let mut val = loader(val, &config, false)?;
            fit(config, paths, start_epoch, &mut runner, &mut train, &mut val)
        }
    }
}

fn fit<R: Runner + Checkpointer>(
    config: RunConfig,
    paths: RunPaths,
    start_epoch: usize,
    runner: &mut R,
    train: &mut dyn BatchSource,
    val: &mut dyn BatchSource,
) -> Result<()> {
    let mut sink = JsonlSink::open(&paths.metrics_log)?;
    let key_metric = config.key_metric.clone();
    let out = Trainer::new(config, paths, start_epoch).fit(runner, train, val, &mut sink)?;
    match out.best_value {
        Some(v) => println!("Best {key_metric}: {v:.6}"),
        None => println!("Best {key_metric}: -"),
    }
    println!(
        "Average epoch time: {:.2}s | average validation time: {:.2}s",
        out.timing.avg_epoch().as_secs_f64(),
        out.timing.avg_validation().as_secs_f64()
    );
    Ok(())
}

fn default_stem(paths: &RunPaths, explicit: Option<PathBuf>, name: &str) -> PathBuf {
    explicit.unwrap_or_else(|| paths.checkpoint_dir.join(name))
}

fn handle_test(config: RunConfig, val_path: &Path, checkpoint: Option<PathBuf>) -> Result<()> {
    let paths = config.paths();
    let stem = default_stem(&paths, checkpoint.or_else(|| config.load_model.clone()), "model_last");
    std::fs::create_dir_all(&paths.prediction_dir)?;

    let (metrics, record) = match config.task {
        Task::Classification | Task::Regression => {
            let val = load_labeled(val_path).context("Failed to load validation set")?;
            let meta = pser_train::load_meta(CheckpointFiles::stem_of(&stem))?;
            let num_outputs = meta.num_outputs.unwrap_or_else(|| val.num_classes());
            let (runner, _) = supervised_runner(&config, val.feat_dim(), num_outputs, Some(&stem), false)?;
            runner.evaluate(&loader(val, &config, false)?, None, true)?
        }
        Task::Imputation => {
            let val = load_imputation(val_path, config.masking_ratio, Seed::new(config.seed).derive("val"))
                .context("Failed to load validation set")?;
            let (runner, _) = masked_runner(&config, val.feat_dim(), Some(&stem), false)?;
            runner.evaluate(&loader(val, &config, false)?, None, true)?
        }
    };

    if let Some(record) = record {
        record.write_json(paths.prediction_dir.join("test_predictions.json"))?;
    }
    println!("Test Summary: {}", metrics.summary());
    Ok(())
}

fn handle_openmax(config: RunConfig, train_path: &Path, test_path: &Path, checkpoint: Option<PathBuf>) -> Result<()> {
    if config.task != Task::Classification {
        bail!("OpenMax needs a classification run, got task '{}'", config.task);
    }
    let paths = config.paths();
    let stem = default_stem(&paths, checkpoint, "model_best");
    let meta = pser_train::load_meta(CheckpointFiles::stem_of(&stem))?;
    let Some(num_outputs) = meta.num_outputs else {
        bail!("Checkpoint '{}' is not a supervised model", stem.display());
    };

    let train = load_labeled(train_path).context("Failed to load training set")?;
    let test = load_labeled(test_path).context("Failed to load test set")?;
    let (runner, _) = supervised_runner(&config, train.feat_dim(), num_outputs, Some(&stem), false)?;
    let train = loader(train, &config, false)?;
    let test = loader(test, &config, false)?;

    let weibull = runner.make_weibull_from_trainsets(&train, &config.openmax)?;
    let weibull_path = paths.experiment_dir.join("weibull.json");
    std::fs::create_dir_all(&paths.experiment_dir)?;
    std::fs::write(&weibull_path, weibull.to_json()?)?;
    tracing::info!(path = %weibull_path.display(), "Saved Weibull model");

    let run = runner.openmax(&test, &weibull, &config.openmax)?;
    if run.scores.skipped > 0 {
        tracing::warn!(skipped = run.scores.skipped, "Ranks without a valid tail model were left unrevised");
    }
    let scores_path = paths.experiment_dir.join("openmax_scores.json");
    let scores = serde_json::json!({
        "openmax": &run.scores.openmax,
        "softmax": &run.scores.softmax,
        "labels": &run.labels,
        "class_names": run.class_names(),
    });
    std::fs::write(&scores_path, serde_json::to_string(&scores)?)?;

    println!("OpenMax\n{}", run.openmax_report()?.to_string_table());
    println!("Softmax\n{}", run.softmax_report()?.to_string_table());
    Ok(())
}

fn parse_feats(list: &str) -> Result<Vec<usize>> {
    list.split(',')
        .map(|s| s.trim().parse::<usize>().with_context(|| format!("'{s}' is not a feature index")))
        .collect()
}

fn handle_folds(config: RunConfig, val_path: &Path, feats: &[String], checkpoint: Option<PathBuf>) -> Result<()> {
    if config.task != Task::Imputation {
        bail!("Fold evaluation needs an imputation run, got task '{}'", config.task);
    }
    let paths = config.paths();
    let stem = default_stem(&paths, checkpoint, "model_best");
    let folds = feats.iter().map(|f| parse_feats(f)).collect::<Result<Vec<_>>>()?;

    let val = load_imputation(val_path, config.masking_ratio, Seed::new(config.seed).derive("val"))
        .context("Failed to load validation set")?;
    let (runner, _) = masked_runner(&config, val.feat_dim(), Some(&stem), false)?;
    let mut val = loader(val, &config, false)?;

    std::fs::create_dir_all(&paths.prediction_dir)?;
    let out = paths.prediction_dir.join("fold_results.json");
    let results = runner.fold_evaluate(&mut val, &folds, &out)?;
    for (fold, result) in folds.iter().zip(&results.folds) {
        let loss = result.loss.map(|l| format!("{l:.6}")).unwrap_or_else(|| "-".into());
        println!("features {fold:?}: loss {loss}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_feats() {
        assert_eq!(parse_feats("0, 2,5").unwrap(), vec![0, 2, 5]);
        assert!(parse_feats("a").is_err());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["pser", "-v", "folds", "--config", "c.json", "--val", "v.npz", "--feats", "0", "--feats", "1,2"]).unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Commands::Folds { feats, .. } => assert_eq!(feats, vec!["0", "1,2"]),
            _ => panic!("expected folds"),
        }
    }
}
