use mtrec_types::{config_error, HypertuningConfig, MtResult, RunConfig};
use std::collections::BTreeMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::journal::TrialJournal;
use crate::search::{build_strategy, describe, Point, SearchSpace, SearchStrategy};
use crate::trial::{SearchAccumulator, SearchOutcome, Trial};

/// Trains one sampled configuration and returns its validation metrics.
pub trait TrialRunner {
    fn run_trial(&mut self, trial: &Trial, config: &RunConfig) -> MtResult<BTreeMap<String, f64>>;
}

impl<F> TrialRunner for F
where
    F: FnMut(&Trial, &RunConfig) -> MtResult<BTreeMap<String, f64>>,
{
    fn run_trial(&mut self, trial: &Trial, config: &RunConfig) -> MtResult<BTreeMap<String, f64>> {
        self(trial, config)
    }
}

/// Apply a sampled point to `base`. Every dimension must be declared in
/// `space`.
pub fn materialize(base: &RunConfig, space: &SearchSpace, point: &Point) -> MtResult<RunConfig> {
    let mut config = base.clone();
    for (dimension, value) in point {
        if !space.contains(*dimension) {
            return Err(config_error!("sampled dimension `{dimension}` is not declared in the search space"));
        }
        config = config.with_override(*dimension, &value.to_json())?;
    }
    Ok(config)
}

/// Runs a fixed number of trials against a base configuration and keeps the
/// best one.
pub struct SearchController<R: TrialRunner> {
    base: RunConfig,
    tuning: HypertuningConfig,
    space: SearchSpace,
    strategy: Box<dyn SearchStrategy>,
    runner: R,
    journal: Option<TrialJournal>,
    study_id: Uuid,
}

impl<R: TrialRunner> SearchController<R> {
    /// The base configuration must carry a `hypertuning` block.
    pub fn new(base: &RunConfig, runner: R) -> MtResult<Self> {
        let tuning = base
            .hypertuning
            .clone()
            .ok_or_else(|| config_error!("configuration `{}` has no hypertuning block", base.name))?;
        let space = SearchSpace::from_config(&tuning);
        Ok(Self {
            base: base.clone(),
            strategy: build_strategy(&tuning),
            tuning,
            space,
            runner,
            journal: None,
            study_id: Uuid::new_v4(),
        })
    }

    pub fn with_strategy(mut self, strategy: Box<dyn SearchStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_journal(mut self, journal: TrialJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn study_id(&self) -> Uuid {
        self.study_id
    }

    pub fn space(&self) -> &SearchSpace {
        &self.space
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Run exactly `n_trials` trials.
    ///
    /// Device and training failures mark the trial failed and the search
    /// moves on. Any other error ends the search.
    pub fn run(&mut self) -> MtResult<SearchOutcome> {
        let n_trials = self.tuning.n_trials;
        info!(
            study = %self.study_id,
            n_trials,
            strategy = self.strategy.name(),
            objective = self.tuning.objective.metric.key(),
            "starting hyperparameter search"
        );

        let mut acc = SearchAccumulator::new(self.tuning.objective.direction);
        for number in 0..n_trials {
            acc = self.run_one(number, acc)?;
        }

        info!(
            completed = acc.completed(),
            failed = acc.failed(),
            best = ?acc.best_score(),
            "search finished"
        );
        let outcome = acc.into_outcome(self.study_id)?;
        if let Some(journal) = &self.journal {
            journal.write_best(&outcome)?;
        }
        Ok(outcome)
    }

    fn run_one(&mut self, number: usize, acc: SearchAccumulator) -> MtResult<SearchAccumulator> {
        let point = self.strategy.suggest();
        let config = materialize(&self.base, &self.space, &point)?;
        let mut trial = Trial::new(self.study_id, number, point);
        trial.mark_running()?;
        info!(
            trial = number + 1,
            of = self.tuning.n_trials,
            params = %describe(&trial.parameters),
            "trial started"
        );

        let objective = self.tuning.objective;
        let sentinel = objective.direction.sentinel();
        match self.runner.run_trial(&trial, &config) {
            Ok(metrics) => match metrics.get(objective.metric.key()).copied() {
                Some(value) if value.is_finite() => {
                    info!(trial = number + 1, objective = value, "trial completed");
                    self.strategy.report(&trial.parameters, value);
                    trial.mark_completed(value, metrics)?;
                }
                other => {
                    warn!(trial = number + 1, value = ?other, "objective missing or non-finite");
                    trial.mark_failed(
                        format!("objective `{}` missing or non-finite", objective.metric.key()),
                        sentinel,
                    )?;
                }
            },
            Err(e) if e.is_trial_scoped() => {
                warn!(trial = number + 1, error = %e, "trial failed");
                trial.mark_failed(e.to_string(), sentinel)?;
            }
            Err(e) => return Err(e),
        }

        if let Some(journal) = &mut self.journal {
            journal.append(&trial)?;
        }
        let acc = acc.record(trial, config);
        info!(
            trial = number + 1,
            of = self.tuning.n_trials,
            completed = acc.completed(),
            failed = acc.failed(),
            best = ?acc.best_score(),
            "search progress"
        );
        Ok(acc)
    }
}
