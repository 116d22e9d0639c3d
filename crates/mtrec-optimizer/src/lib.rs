//! # mtrec-optimizer
//!
//! Hyperparameter search for MTRec.
//!
//! Provides search spaces built from a configuration's `hypertuning` block,
//! random and adaptive sampling strategies, trial tracking, and the
//! controller that trains each sampled configuration through a
//! [`TrialRunner`].

mod controller;
mod journal;
mod search;
mod trial;

pub use controller::{materialize, SearchController, TrialRunner};
pub use journal::{TrialJournal, BEST_FILE, TRIALS_FILE};
pub use search::{
    build_strategy, describe, AdaptiveSearch, ParameterDef, ParameterKind, ParameterValue, Point,
    RandomSearch, SearchSpace, SearchStrategy,
};
pub use trial::{SearchAccumulator, SearchOutcome, Trial, TrialResult, TrialStatus};
