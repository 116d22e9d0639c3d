use chrono::{DateTime, Utc};
use mtrec_types::{internal_error, MtError, MtResult, ObjectiveDirection, RunConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::search::Point;

/// Lifecycle of a single trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TrialStatus {
    pub fn is_finalized(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Metrics produced by a completed trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub trial_id: Uuid,
    /// Value of the objective metric.
    pub objective: f64,
    pub metrics: BTreeMap<String, f64>,
    pub duration_seconds: Option<f64>,
}

/// One sampled configuration and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: Uuid,
    pub study_id: Uuid,
    /// Zero-based position in the search.
    pub number: usize,
    pub parameters: Point,
    pub status: TrialStatus,
    /// Objective for completed trials, the direction's sentinel for failed ones.
    pub score: Option<f64>,
    pub result: Option<TrialResult>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Trial {
    pub fn new(study_id: Uuid, number: usize, parameters: Point) -> Self {
        Self {
            id: Uuid::new_v4(),
            study_id,
            number,
            parameters,
            status: TrialStatus::Pending,
            score: None,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn mark_running(&mut self) -> MtResult<()> {
        if self.status != TrialStatus::Pending {
            return Err(internal_error!("trial {} started twice", self.number));
        }
        self.status = TrialStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_completed(&mut self, objective: f64, metrics: BTreeMap<String, f64>) -> MtResult<()> {
        self.finish(TrialStatus::Completed)?;
        self.score = Some(objective);
        self.result = Some(TrialResult {
            trial_id: self.id,
            objective,
            metrics,
            duration_seconds: self.duration_seconds(),
        });
        Ok(())
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, sentinel: f64) -> MtResult<()> {
        self.finish(TrialStatus::Failed)?;
        self.score = Some(sentinel);
        self.error = Some(error.into());
        Ok(())
    }

    fn finish(&mut self, status: TrialStatus) -> MtResult<()> {
        if self.status != TrialStatus::Running {
            return Err(internal_error!(
                "trial {} cannot move from {:?} to {status:?}",
                self.number,
                self.status
            ));
        }
        self.status = status;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn is_completed(&self) -> bool {
        self.status == TrialStatus::Completed
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

/// Search history threaded through the trial loop.
///
/// Each trial's outcome is folded in with [`SearchAccumulator::record`]; the
/// best completed trial is replaced only on strict improvement.
#[derive(Debug, Clone)]
pub struct SearchAccumulator {
    direction: ObjectiveDirection,
    trials: Vec<Trial>,
    best: Option<(usize, RunConfig)>,
}

impl SearchAccumulator {
    pub fn new(direction: ObjectiveDirection) -> Self {
        Self {
            direction,
            trials: Vec::new(),
            best: None,
        }
    }

    /// Fold in a finalized trial together with the configuration it ran.
    pub fn record(mut self, trial: Trial, config: RunConfig) -> Self {
        if let (true, Some(score)) = (trial.is_completed(), trial.score) {
            let better = match &self.best {
                None => true,
                Some((idx, _)) => self
                    .trials[*idx]
                    .score
                    .map_or(true, |current| self.direction.improves(score, current)),
            };
            if better {
                self.best = Some((self.trials.len(), config));
            }
        }
        self.trials.push(trial);
        self
    }

    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    pub fn completed(&self) -> usize {
        self.trials.iter().filter(|t| t.is_completed()).count()
    }

    pub fn failed(&self) -> usize {
        self.trials.len() - self.completed()
    }

    pub fn best(&self) -> Option<&Trial> {
        self.best.as_ref().map(|(idx, _)| &self.trials[*idx])
    }

    pub fn best_score(&self) -> Option<f64> {
        self.best().and_then(|t| t.score)
    }

    /// Finish the search. Fails when no trial completed.
    pub fn into_outcome(self, study_id: Uuid) -> MtResult<SearchOutcome> {
        let completed = self.completed();
        let Some((idx, best_config)) = self.best else {
            return Err(MtError::AllTrialsFailed {
                n_trials: self.trials.len(),
            });
        };
        let best_trial = self.trials[idx].clone();
        Ok(SearchOutcome {
            study_id,
            best_score: best_trial.score.unwrap_or(f64::NAN),
            best_trial,
            best_config,
            completed,
            failed: self.trials.len() - completed,
            trials: self.trials,
        })
    }
}

/// Result of a finished search.
#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub study_id: Uuid,
    pub best_trial: Trial,
    pub best_score: f64,
    pub best_config: RunConfig,
    pub completed: usize,
    pub failed: usize,
    pub trials: Vec<Trial>,
}
