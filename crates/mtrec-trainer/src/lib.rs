//! Training side of MTRec.
//!
//! Provides:
//! - Composite multi-task loss with per-task toggles
//! - Parameter-group optimizers with per-group learning rates
//! - The epoch/validation loop with checkpointing and experiment logging
//! - Synthetic model and dataset collaborators

pub mod checkpoint;
pub mod logger;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod synthetic;
pub mod trainer;

pub use checkpoint::{allocate_run_dir, load_checkpoint, save_checkpoint};
pub use logger::{ExperimentLogger, JsonlLogger, LogRecord, MemoryLogger, MetricMap, TracingLogger};
pub use loss::{compose, LossComposer};
pub use metrics::{evaluate, RankingSummary, ValidationReport};
pub use model::{BatchSource, BatchStream, ForwardOutput, Impression, MultiTaskModel, Parameter};
pub use optim::{OptimizerHandle, ParameterGroup, ParameterGroupKind};
pub use synthetic::{SyntheticBatch, SyntheticDataset, SyntheticModel};
pub use trainer::{predict, EpochReport, Trainer, TrainerState, TrainingReport};

#[cfg(test)]
pub(crate) mod testing {
    use mtrec_types::RunConfig;

    pub(crate) fn config() -> RunConfig {
        RunConfig::from_yaml_str(include_str!("../../../configs/default.yaml")).unwrap()
    }
}
