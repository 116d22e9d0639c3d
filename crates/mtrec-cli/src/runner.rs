//! Trains configurations on the synthetic collaborators.

use mtrec_optimizer::{Trial, TrialRunner};
use mtrec_trainer::{
    load_checkpoint, predict, ExperimentLogger, Impression, SyntheticDataset, SyntheticModel, Trainer,
    TrainingReport,
};
use mtrec_types::{MtResult, RunConfig};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

pub struct SyntheticRunner {
    seed: u64,
    logger: Option<Arc<dyn ExperimentLogger>>,
    /// Trial number to the training steps its model survives.
    failing: BTreeMap<usize, u64>,
}

impl SyntheticRunner {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            logger: None,
            failing: BTreeMap::new(),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn ExperimentLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Make trial `number` hit an out-of-memory error after `steps`
    /// training steps.
    pub fn with_failing_trial(mut self, number: usize, steps: u64) -> Self {
        self.failing.insert(number, steps);
        self
    }

    /// One full training run of `config`.
    pub fn train(&self, config: &RunConfig, run_id: &str) -> MtResult<TrainingReport> {
        self.train_model(config, run_id, None)
    }

    fn train_model(&self, config: &RunConfig, run_id: &str, fail_after: Option<u64>) -> MtResult<TrainingReport> {
        let mut model = SyntheticModel::new(config, self.seed);
        if let Some(steps) = fail_after {
            model = model.with_failure_after(steps);
        }
        let data = SyntheticDataset::new(config, self.seed);
        let mut trainer = Trainer::new(config, model, data)?.with_run_id(run_id);
        if let Some(logger) = &self.logger {
            trainer = trainer.with_logger(Arc::clone(logger));
        }
        let report = trainer.run();
        if let Some(logger) = &self.logger {
            if let Err(e) = logger.flush() {
                tracing::warn!(error = %e, "experiment logger flush failed");
            }
        }
        report
    }

    /// Score the validation split with the weights saved in `checkpoint`.
    pub fn predict(&self, config: &RunConfig, checkpoint: &Path) -> MtResult<Vec<Impression>> {
        let mut model = SyntheticModel::new(config, self.seed);
        let report = load_checkpoint(checkpoint, &mut model)?;
        tracing::info!(epoch = %report["epoch"], "predicting from checkpoint");
        let mut data = SyntheticDataset::new(config, self.seed);
        predict(&mut model, &mut data)
    }
}

impl TrialRunner for SyntheticRunner {
    fn run_trial(&mut self, trial: &Trial, config: &RunConfig) -> MtResult<BTreeMap<String, f64>> {
        let run_id = format!("{}-trial{}", config.name, trial.number);
        let fail_after = self.failing.get(&trial.number).copied();
        Ok(self.train_model(config, &run_id, fail_after)?.metrics())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtrec_optimizer::{SearchController, TrialStatus};
    use mtrec_trainer::{evaluate, MemoryLogger};
    use mtrec_types::Scoring;

    fn config(save_dir: &std::path::Path) -> RunConfig {
        let mut config =
            RunConfig::from_yaml_str(include_str!("../../../configs/test_hypertune.yaml")).unwrap();
        config.trainer.save_dir = Some(save_dir.to_path_buf());
        config.hypertuning.as_mut().unwrap().n_trials = 3;
        config
    }

    #[test]
    fn training_reports_the_objective_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Arc::new(MemoryLogger::new());
        let runner = SyntheticRunner::new(3).with_logger(logger.clone());

        let report = runner.train(&config(dir.path()), "unit").unwrap();
        let metrics = report.metrics();
        assert!(metrics.contains_key("auc"));
        assert!(metrics.contains_key("val_loss"));
        assert!(report.checkpoint.unwrap().starts_with(dir.path()));
        assert!(!logger.is_empty());
    }

    #[test]
    fn search_over_synthetic_trials() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let outcome = SearchController::new(&config, SyntheticRunner::new(5))
            .unwrap()
            .run()
            .unwrap();
        assert_eq!(outcome.trials.len(), 3);
        assert!(outcome.best_score.is_finite());
        // Every trial checkpoints into its own run directory.
        assert!(dir.path().join("run0").is_dir());
    }

    #[test]
    fn device_failures_fail_only_their_trials() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.hypertuning.as_mut().unwrap().n_trials = 4;
        let runner = SyntheticRunner::new(6)
            .with_failing_trial(0, 1)
            .with_failing_trial(2, 1);
        let outcome = SearchController::new(&config, runner).unwrap().run().unwrap();

        assert_eq!((outcome.completed, outcome.failed), (2, 2));
        for number in [0, 2] {
            let trial = &outcome.trials[number];
            assert_eq!(trial.status, TrialStatus::Failed);
            assert_eq!(trial.score, Some(f64::NEG_INFINITY));
            assert!(trial.error.as_deref().unwrap().contains("synthetic:0"));
        }
        for number in [1, 3] {
            let trial = &outcome.trials[number];
            assert_eq!(trial.status, TrialStatus::Completed);
            assert!(trial.score.unwrap().is_finite());
        }
        assert!([1, 3].contains(&outcome.best_trial.number));
    }

    #[test]
    fn checkpoints_predict_what_validation_saw() {
        for scoring in [Scoring::CrossProduct, Scoring::CosineSim] {
            let dir = tempfile::tempdir().unwrap();
            let mut config = config(dir.path());
            config.trainer.scoring = scoring;
            // Uncapped validation, so it covers the whole split like prediction does.
            config.max_val_bs = 1_000;
            let runner = SyntheticRunner::new(9);
            let report = runner.train(&config, "unit").unwrap();

            let impressions = runner.predict(&config, &report.checkpoint.clone().unwrap()).unwrap();
            let predicted = evaluate(&impressions);
            let validated = report.best_validation().unwrap().ranking;
            assert_eq!(predicted.impressions, validated.impressions);
            assert!((predicted.auc.unwrap() - validated.auc.unwrap()).abs() < 1e-12, "{scoring}");
            if scoring == Scoring::CosineSim {
                assert!(impressions.iter().flat_map(|i| &i.scores).all(|s| s.abs() <= 1.0 + 1e-12));
            }
        }
    }

    #[test]
    fn predicting_without_a_checkpoint_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        assert!(SyntheticRunner::new(0).predict(&config, dir.path()).is_err());
    }
}
