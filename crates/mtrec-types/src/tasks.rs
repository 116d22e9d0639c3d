//! Task vocabulary shared by the loss composer, the models and the trainer.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::errors::MtResult;
use crate::config_error;

/// One training objective of the multi-task model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Click ranking over the in-view candidates.
    Main,
    /// Category classification of every encoded article.
    #[serde(rename = "cat")]
    Category,
    /// Token-level named-entity recognition.
    Ner,
    /// Auxiliary "GS" objective.
    Gs,
}

impl TaskKind {
    pub const ALL: [TaskKind; 4] = [Self::Main, Self::Category, Self::Ner, Self::Gs];

    /// Short name, matching the `skip_<name>` configuration flags.
    pub fn name(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Category => "cat",
            Self::Ner => "ner",
            Self::Gs => "gs",
        }
    }

    /// Auxiliary tasks are down-weighted by `aux_scaler`.
    pub fn is_auxiliary(self) -> bool {
        !matches!(self, Self::Main)
    }

    fn index(self) -> usize {
        match self {
            Self::Main => 0,
            Self::Category => 1,
            Self::Ner => 2,
            Self::Gs => 3,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Scalar loss produced for one task on one batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaskLoss {
    pub task: TaskKind,
    pub value: f64,
}

/// Per-task losses of a single forward pass.
///
/// Models may report losses for tasks that are not active; the composer
/// ignores them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskLosses {
    losses: BTreeMap<TaskKind, f64>,
}

impl TaskLosses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, task: TaskKind, value: f64) -> Self {
        self.insert(task, value);
        self
    }

    pub fn insert(&mut self, task: TaskKind, value: f64) {
        self.losses.insert(task, value);
    }

    pub fn get(&self, task: TaskKind) -> Option<TaskLoss> {
        self.losses
            .get(&task)
            .map(|&value| TaskLoss { task, value })
    }

    pub fn iter(&self) -> impl Iterator<Item = TaskLoss> + '_ {
        self.losses
            .iter()
            .map(|(&task, &value)| TaskLoss { task, value })
    }

    pub fn len(&self) -> usize {
        self.losses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.losses.is_empty()
    }
}

impl FromIterator<TaskLoss> for TaskLosses {
    fn from_iter<I: IntoIterator<Item = TaskLoss>>(iter: I) -> Self {
        let mut losses = Self::new();
        for loss in iter {
            losses.insert(loss.task, loss.value);
        }
        losses
    }
}

/// The set of tasks that contribute gradient, computed once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTasks {
    tasks: BTreeSet<TaskKind>,
}

impl ActiveTasks {
    /// Build the active set from the enabled tasks. An empty set is rejected:
    /// a run with nothing to optimize would produce a constant zero loss.
    pub fn new(tasks: impl IntoIterator<Item = TaskKind>) -> MtResult<Self> {
        let tasks: BTreeSet<TaskKind> = tasks.into_iter().collect();
        if tasks.is_empty() {
            return Err(config_error!(
                "every task is skipped (skip_main, skip_cat, skip_ner and skip_gs are all true)"
            ));
        }
        Ok(Self { tasks })
    }

    /// Build the active set from a predicate telling whether a task is skipped.
    pub fn from_skip_flags(is_skipped: impl Fn(TaskKind) -> bool) -> MtResult<Self> {
        Self::new(TaskKind::ALL.into_iter().filter(|&task| !is_skipped(task)))
    }

    pub fn contains(&self, task: TaskKind) -> bool {
        self.tasks.contains(&task)
    }

    pub fn iter(&self) -> impl Iterator<Item = TaskKind> + '_ {
        self.tasks.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Weight applied to every task's loss in the composite objective.
/// Inactive tasks weigh exactly zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossWeights {
    weights: [f64; 4],
}

impl LossWeights {
    pub fn new(active: &ActiveTasks, aux_scaler: f64) -> Self {
        let mut weights = [0.0; 4];
        for task in active.iter() {
            weights[task.index()] = if task.is_auxiliary() { aux_scaler } else { 1.0 };
        }
        Self { weights }
    }

    pub fn weight(&self, task: TaskKind) -> f64 {
        self.weights[task.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (TaskKind, f64)> + '_ {
        TaskKind::ALL.into_iter().map(|task| (task, self.weight(task)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_set_follows_skip_flags() {
        let active =
            ActiveTasks::from_skip_flags(|task| matches!(task, TaskKind::Ner | TaskKind::Gs))
                .unwrap();
        assert_eq!(
            active.iter().collect::<Vec<_>>(),
            vec![TaskKind::Main, TaskKind::Category]
        );
        assert!(!active.contains(TaskKind::Ner));
    }

    #[test]
    fn empty_active_set_is_a_configuration_error() {
        let err = ActiveTasks::from_skip_flags(|_| true).unwrap_err();
        assert!(matches!(err, crate::MtError::Configuration(_)));
    }

    #[test]
    fn weights_scale_only_auxiliary_tasks() {
        let active = ActiveTasks::new([TaskKind::Main, TaskKind::Category, TaskKind::Gs]).unwrap();
        let weights = LossWeights::new(&active, 0.3);
        assert_eq!(weights.weight(TaskKind::Main), 1.0);
        assert_eq!(weights.weight(TaskKind::Category), 0.3);
        assert_eq!(weights.weight(TaskKind::Ner), 0.0);
        assert_eq!(weights.weight(TaskKind::Gs), 0.3);
    }

    #[test]
    fn task_losses_collect_and_lookup() {
        let losses: TaskLosses = [
            TaskLoss { task: TaskKind::Main, value: 1.25 },
            TaskLoss { task: TaskKind::Ner, value: 0.5 },
        ]
        .into_iter()
        .collect();
        assert_eq!(losses.len(), 2);
        assert_eq!(losses.get(TaskKind::Ner).map(|l| l.value), Some(0.5));
        assert!(losses.get(TaskKind::Gs).is_none());
    }

    #[test]
    fn task_names_match_skip_flags() {
        let names: Vec<_> = TaskKind::ALL.iter().map(|t| t.to_string()).collect();
        assert_eq!(names, ["main", "cat", "ner", "gs"]);
    }
}
