use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use mtrec_optimizer::{describe, SearchController, SearchSpace, TrialJournal};
use mtrec_trainer::{evaluate, optim, ExperimentLogger, JsonlLogger, SyntheticModel};
use mtrec_types::{load_configuration, MtError, RunConfig};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod runner;

use runner::SyntheticRunner;

#[derive(Parser)]
#[command(name = "mtrec")]
#[command(about = "Multi-task news recommendation training and hyperparameter search", long_about = None)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[arg(long, short, global = true, help = "Show verbose debug output")]
    verbose: bool,

    #[arg(
        long,
        global = true,
        env = "MTREC_CONFIG_DIR",
        default_value = "configs",
        help = "Directory searched for named configurations"
    )]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Train one configuration")]
    Train {
        #[arg(long, short, help = "Configuration name or path")]
        config: String,

        #[arg(long, default_value = "0", help = "Seed for the synthetic model and dataset")]
        seed: u64,

        #[arg(long, help = "Append experiment metrics to this JSONL file")]
        metrics_log: Option<PathBuf>,
    },

    #[command(about = "Run the hyperparameter search declared by a configuration")]
    Search {
        #[arg(long, short, help = "Configuration name or path")]
        config: String,

        #[arg(long, default_value = "0", help = "Seed for the synthetic model and dataset")]
        seed: u64,

        #[arg(long, help = "Append experiment metrics to this JSONL file")]
        metrics_log: Option<PathBuf>,
    },

    #[command(about = "Score the validation split with a saved checkpoint")]
    Predict {
        #[arg(long, short, help = "Configuration name or path")]
        config: String,

        #[arg(long, help = "Checkpoint directory (a run<N> directory under save_dir)")]
        checkpoint: PathBuf,

        #[arg(long, default_value = "0", help = "Seed for the synthetic model and dataset")]
        seed: u64,
    },

    #[command(about = "Validate a configuration and show what it would run")]
    Check {
        #[arg(long, short, help = "Configuration name or path")]
        config: String,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/// Exit status for a failed invocation.
fn exit_code(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<MtError>() {
        Some(MtError::Validation { .. }) => 2,
        Some(MtError::Configuration(_) | MtError::UnsupportedOptimizer { .. }) => 3,
        Some(MtError::AllTrialsFailed { .. }) => 4,
        _ => 1,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            if let Some(field) = error.downcast_ref::<MtError>().and_then(MtError::field) {
                eprintln!("error in `{field}`: {error:#}");
            } else {
                eprintln!("error: {error:#}");
            }
            ExitCode::from(exit_code(&error))
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Train {
            config,
            seed,
            metrics_log,
        } => {
            let config = load(&config, &cli.config_dir)?;
            let runner = with_metrics_log(SyntheticRunner::new(seed), metrics_log.as_deref())?;
            let report = runner.train(&config, &config.name)?;

            info!(
                best_epoch = ?report.best_epoch.map(|e| e + 1),
                best = ?report.best_value,
                "run complete"
            );
            println!("{}", serde_json::to_string_pretty(&report.metrics())?);
            if let Some(dir) = &report.checkpoint {
                println!("checkpoint: {}", dir.display());
            }
        }
        Commands::Search {
            config,
            seed,
            metrics_log,
        } => {
            let config = load(&config, &cli.config_dir)?;
            let runner = with_metrics_log(SyntheticRunner::new(seed), metrics_log.as_deref())?;
            let mut controller = SearchController::new(&config, runner)?;
            if let Some(dir) = config.hypertuning.as_ref().and_then(|h| h.journal_dir.as_ref()) {
                controller = controller.with_journal(TrialJournal::create(dir)?);
            }
            let outcome = controller.run()?;

            println!(
                "best trial {} of {} (score {}): {}",
                outcome.best_trial.number + 1,
                outcome.trials.len(),
                outcome.best_score,
                describe(&outcome.best_trial.parameters)
            );
            println!("{} completed, {} failed", outcome.completed, outcome.failed);
        }
        Commands::Predict {
            config,
            checkpoint,
            seed,
        } => {
            let config = load(&config, &cli.config_dir)?;
            let impressions = SyntheticRunner::new(seed).predict(&config, &checkpoint)?;
            println!("{}", serde_json::to_string_pretty(&evaluate(&impressions))?);
        }
        Commands::Check { config } => {
            let config = load(&config, &cli.config_dir)?;
            check(&config)?;
        }
    }
    Ok(())
}

fn load(name: &str, dir: &Path) -> Result<RunConfig> {
    let config = load_configuration(name, dir)?;
    info!(name = %config.name, "configuration loaded");
    Ok(config)
}

fn with_metrics_log(runner: SyntheticRunner, path: Option<&Path>) -> Result<SyntheticRunner> {
    let Some(path) = path else {
        return Ok(runner);
    };
    let logger = JsonlLogger::create(path)
        .with_context(|| format!("failed to open metrics log {}", path.display()))?;
    let logger: Arc<dyn ExperimentLogger> = Arc::new(logger);
    Ok(runner.with_logger(logger))
}

fn check(config: &RunConfig) -> Result<()> {
    let tasks = config.trainer.active_tasks()?;
    let optimizer = optim::build(&SyntheticModel::new(config, 0), config)?;

    println!("configuration: {}", config.name);
    println!(
        "tasks: {}",
        tasks.iter().map(|t| t.name()).collect::<Vec<_>>().join(", ")
    );
    println!("ner labels: {}", config.ner_label_count());
    println!("scoring: {}", config.trainer.scoring);
    println!("optimizer: {}", optimizer.kind());
    for group in optimizer.groups() {
        println!(
            "  {:<13} lr {:<10} {} tensors",
            group.kind,
            group.learning_rate,
            group.len()
        );
    }

    if let Some(tuning) = &config.hypertuning {
        let space = SearchSpace::from_config(tuning);
        println!(
            "search: {} trials, {:?} strategy, {} {:?}",
            tuning.n_trials,
            tuning.strategy,
            tuning.objective.metric.key(),
            tuning.objective.direction
        );
        for param in &space.parameters {
            println!("  {:<11} {:?}", param.dimension, param.kind);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_exit_codes() {
        let cases: [(MtError, u8); 5] = [
            (mtrec_types::validation_error!("trainer.epochs", "must be at least 1"), 2),
            (MtError::Configuration("all tasks skipped".into()), 3),
            (MtError::UnsupportedOptimizer { name: "lamb".into() }, 3),
            (MtError::AllTrialsFailed { n_trials: 4 }, 4),
            (MtError::Training("no usable batches".into()), 1),
        ];
        for (error, code) in cases {
            assert_eq!(exit_code(&anyhow::Error::new(error)), code);
        }
        assert_eq!(exit_code(&anyhow::anyhow!("plain")), 1);
    }

    #[test]
    fn bundled_configurations_pass_check() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../configs");
        for name in ["default", "test_hypertune"] {
            let config = load(name, &dir).unwrap();
            check(&config).unwrap();
        }
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["mtrec", "search", "--config", "test_hypertune", "--seed", "4"]).unwrap();
        match cli.command {
            Commands::Search { config, seed, metrics_log } => {
                assert_eq!(config, "test_hypertune");
                assert_eq!(seed, 4);
                assert!(metrics_log.is_none());
            }
            _ => panic!("expected search"),
        }

        let cli = Cli::try_parse_from(["mtrec", "predict", "-c", "default", "--checkpoint", "saved/run0"]).unwrap();
        match cli.command {
            Commands::Predict { config, checkpoint, seed } => {
                assert_eq!(config, "default");
                assert_eq!(checkpoint, PathBuf::from("saved/run0"));
                assert_eq!(seed, 0);
            }
            _ => panic!("expected predict"),
        }
        assert!(Cli::try_parse_from(["mtrec", "predict", "--config", "default"]).is_err());
    }
}
