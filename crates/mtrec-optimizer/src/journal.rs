//! On-disk record of a search: one JSON line per finalized trial plus the
//! winning configuration.

use mtrec_types::MtResult;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use crate::search::Point;
use crate::trial::{SearchOutcome, Trial};

pub const TRIALS_FILE: &str = "trials.jsonl";
pub const BEST_FILE: &str = "best.json";

#[derive(Debug)]
pub struct TrialJournal {
    dir: PathBuf,
    trials: File,
}

#[derive(Serialize)]
struct BestRecord<'a> {
    study_id: Uuid,
    trial_id: Uuid,
    trial_number: usize,
    score: f64,
    parameters: &'a Point,
    config: &'a mtrec_types::RunConfig,
}

impl TrialJournal {
    /// Open `dir/trials.jsonl` for appending, creating `dir` if needed.
    pub fn create(dir: impl Into<PathBuf>) -> MtResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let trials = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(TRIALS_FILE))?;
        info!(path = %dir.display(), "journaling trials");
        Ok(Self { dir, trials })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append one finalized trial. Each line is written whole so an
    /// interrupted search leaves every earlier trial readable.
    pub fn append(&mut self, trial: &Trial) -> MtResult<()> {
        let mut line = serde_json::to_vec(trial)?;
        line.push(b'\n');
        self.trials.write_all(&line)?;
        self.trials.flush()?;
        debug!(trial = trial.number, "trial journaled");
        Ok(())
    }

    pub fn write_best(&self, outcome: &SearchOutcome) -> MtResult<()> {
        let record = BestRecord {
            study_id: outcome.study_id,
            trial_id: outcome.best_trial.id,
            trial_number: outcome.best_trial.number,
            score: outcome.best_score,
            parameters: &outcome.best_trial.parameters,
            config: &outcome.best_config,
        };
        fs::write(self.dir.join(BEST_FILE), serde_json::to_string_pretty(&record)?)?;
        Ok(())
    }

    /// Read back every journaled trial in `dir`.
    pub fn read_trials(dir: &Path) -> MtResult<Vec<Trial>> {
        let reader = BufReader::new(File::open(dir.join(TRIALS_FILE))?);
        let mut trials = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            trials.push(serde_json::from_str(&line)?);
        }
        Ok(trials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{ParameterValue, SearchSpace};
    use mtrec_types::HyperDimension;
    use serde_json::json;

    fn completed(number: usize) -> Trial {
        let point = Point::from([(HyperDimension::LrBert, ParameterValue::Float(0.00002))]);
        let mut trial = Trial::new(Uuid::nil(), number, point);
        trial.mark_running().unwrap();
        trial
            .mark_completed(0.6, [("auc".to_string(), 0.6)].into())
            .unwrap();
        trial
    }

    #[test]
    fn trials_are_appended_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");

        let mut journal = TrialJournal::create(&path).unwrap();
        journal.append(&completed(0)).unwrap();
        drop(journal);

        let mut journal = TrialJournal::create(&path).unwrap();
        journal.append(&completed(1)).unwrap();

        let trials = TrialJournal::read_trials(&path).unwrap();
        assert_eq!(trials.len(), 2);
        assert_eq!(trials[1].number, 1);
        assert_eq!(
            trials[0].parameters[&HyperDimension::LrBert],
            ParameterValue::Float(0.00002)
        );
    }

    #[test]
    fn choice_values_survive_a_reread() {
        let space = SearchSpace::new()
            .add_choice(HyperDimension::BatchSize, vec![json!(8), json!(16), json!(32)])
            .add_choice(HyperDimension::Optimizer, vec![json!("adam"), json!("sgd")])
            .add_int(HyperDimension::NumLayers, 1, 3)
            .add_log_uniform(HyperDimension::Lr, 0.01, 0.1);
        let point = Point::from([
            (HyperDimension::BatchSize, ParameterValue::Json(json!(16))),
            (HyperDimension::Optimizer, ParameterValue::Json(json!("adam"))),
            (HyperDimension::NumLayers, ParameterValue::Int(2)),
            (HyperDimension::Lr, ParameterValue::Float(0.0625)),
        ]);

        let dir = tempfile::tempdir().unwrap();
        let mut journal = TrialJournal::create(dir.path()).unwrap();
        let mut trial = Trial::new(Uuid::nil(), 0, point.clone());
        trial.mark_running().unwrap();
        trial.mark_completed(0.5, [("auc".to_string(), 0.5)].into()).unwrap();
        journal.append(&trial).unwrap();

        let reread = TrialJournal::read_trials(dir.path()).unwrap();
        assert_eq!(reread.len(), 1);
        assert_eq!(reread[0].parameters, point);
        for (dimension, value) in &reread[0].parameters {
            let kind = space.get(*dimension).unwrap();
            assert!(kind.admits(value), "{dimension} = {value} left the space");
        }
    }
}
