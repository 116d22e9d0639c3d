//! Training loop driver.
//!
//! A [`Trainer`] owns one trial's model, dataset, optimizer state and loss
//! composer and runs the configured number of epochs. Per-batch errors are
//! skipped with a warning; device failures end the run in
//! [`TrainerState::Failed`] and are never retried here.

use chrono::{DateTime, Utc};
use mtrec_types::{MtError, MtResult, Objective, RunConfig, TaskKind};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{allocate_run_dir, save_checkpoint};
use crate::logger::{ExperimentLogger, MetricMap, TracingLogger};
use crate::loss::LossComposer;
use crate::metrics::{evaluate, ValidationReport};
use crate::model::{BatchSource, Impression, MultiTaskModel};
use crate::optim::{self, OptimizerHandle};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TrainerState {
    Idle,
    Training { epoch: usize, step: usize },
    Validating { epoch: usize },
    Done,
    Failed { reason: String },
}

impl TrainerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed { .. })
    }
}

/// Summary of one epoch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochReport {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_main_loss: Option<f64>,
    pub train_batches: usize,
    pub skipped_batches: usize,
    pub validation: Option<ValidationReport>,
    /// Objective metric read from this epoch's validation.
    pub objective_value: Option<f64>,
    pub improved: bool,
}

/// Outcome of a full training run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingReport {
    pub run_id: String,
    pub objective: Objective,
    pub epochs: Vec<EpochReport>,
    pub best_epoch: Option<usize>,
    pub best_value: Option<f64>,
    pub checkpoint: Option<PathBuf>,
    pub total_steps: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TrainingReport {
    /// Validation of the best epoch, else the last validation that ran.
    pub fn best_validation(&self) -> Option<&ValidationReport> {
        let best = self
            .best_epoch
            .and_then(|e| self.epochs.iter().find(|r| r.epoch == e))
            .and_then(|r| r.validation.as_ref());
        best.or_else(|| self.epochs.iter().rev().find_map(|r| r.validation.as_ref()))
    }

    /// Validation metrics handed to the search as the trial result.
    pub fn metrics(&self) -> BTreeMap<String, f64> {
        let mut metrics = self.best_validation().map(ValidationReport::to_map).unwrap_or_default();
        if let Some(last) = self.epochs.last() {
            metrics.insert("train_loss".to_string(), last.train_loss);
        }
        metrics
    }
}

#[derive(Default)]
struct Running {
    loss: f64,
    main: f64,
    main_count: usize,
    batches: usize,
    skipped: usize,
}

impl Running {
    fn add(&mut self, loss: f64, main: Option<f64>) {
        self.loss += loss;
        self.batches += 1;
        if let Some(m) = main.filter(|m| m.is_finite()) {
            self.main += m;
            self.main_count += 1;
        }
    }

    fn mean_loss(&self) -> f64 {
        self.loss / self.batches.max(1) as f64
    }

    fn mean_main(&self) -> Option<f64> {
        (self.main_count > 0).then(|| self.main / self.main_count as f64)
    }
}

pub struct Trainer<M, D> {
    config: RunConfig,
    model: M,
    data: D,
    optimizer: OptimizerHandle,
    composer: LossComposer,
    logger: Arc<dyn ExperimentLogger>,
    objective: Objective,
    run_id: String,
    state: TrainerState,
    global_step: u64,
}

impl<M, D> Trainer<M, D>
where
    M: MultiTaskModel,
    D: BatchSource<Batch = M::Batch>,
{
    pub fn new(config: &RunConfig, model: M, data: D) -> MtResult<Self> {
        let composer = LossComposer::new(config)?;
        let optimizer = optim::build(&model, config)?;
        let objective = config
            .hypertuning
            .as_ref()
            .map(|h| h.objective)
            .unwrap_or_default();
        info!(
            run = %config.name,
            optimizer = %optimizer.kind(),
            groups = optimizer.groups().len(),
            "trainer ready"
        );
        Ok(Self {
            config: config.clone(),
            model,
            data,
            optimizer,
            composer,
            logger: Arc::new(TracingLogger),
            objective,
            run_id: config.name.clone(),
            state: TrainerState::Idle,
            global_step: 0,
        })
    }

    pub fn with_logger(mut self, logger: Arc<dyn ExperimentLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_objective(mut self, objective: Objective) -> Self {
        self.objective = objective;
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn optimizer(&self) -> &OptimizerHandle {
        &self.optimizer
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Train for the configured number of epochs.
    pub fn run(&mut self) -> MtResult<TrainingReport> {
        if self.state != TrainerState::Idle {
            return Err(mtrec_types::internal_error!("trainer already ran ({:?})", self.state));
        }
        match self.run_epochs() {
            Ok(report) => {
                self.state = TrainerState::Done;
                info!(run_id = %self.run_id, steps = report.total_steps, best = ?report.best_value, "training finished");
                Ok(report)
            }
            Err(e) => {
                error!(run_id = %self.run_id, error = %e, "training failed");
                self.state = TrainerState::Failed { reason: e.to_string() };
                Err(e)
            }
        }
    }

    fn run_epochs(&mut self) -> MtResult<TrainingReport> {
        let started_at = Utc::now();
        let epochs = self.config.trainer.epochs;
        let val_every = self.config.trainer.val_every;
        let mut reports = Vec::with_capacity(epochs);
        let mut best: Option<(usize, f64)> = None;
        let mut checkpoint: Option<PathBuf> = None;

        for epoch in 0..epochs {
            info!(epoch = epoch + 1, epochs, "epoch");
            let train = self.train_epoch(epoch)?;

            let validation = if (epoch + 1) % val_every == 0 || epoch + 1 == epochs {
                Some(self.validate(epoch)?)
            } else {
                None
            };
            let objective_value = validation
                .as_ref()
                .and_then(|v| v.metric(self.objective.metric));

            let mut report = EpochReport {
                epoch,
                train_loss: train.mean_loss(),
                train_main_loss: train.mean_main(),
                train_batches: train.batches,
                skipped_batches: train.skipped,
                validation,
                objective_value,
                improved: false,
            };

            if let Some(value) = objective_value.filter(|v| v.is_finite()) {
                let improved = best.map_or(true, |(_, b)| self.objective.direction.improves(value, b));
                if improved {
                    best = Some((epoch, value));
                    report.improved = true;
                    if let Some(save_dir) = &self.config.trainer.save_dir {
                        let dir = match &checkpoint {
                            Some(dir) => dir.clone(),
                            None => allocate_run_dir(save_dir)?,
                        };
                        save_checkpoint(&dir, &self.model, &report)?;
                        info!(epoch = epoch + 1, path = %dir.display(), "checkpoint saved");
                        checkpoint = Some(dir);
                    }
                }
            }

            self.log_epoch(&report);
            reports.push(report);
        }

        Ok(TrainingReport {
            run_id: self.run_id.clone(),
            objective: self.objective,
            epochs: reports,
            best_epoch: best.map(|(e, _)| e),
            best_value: best.map(|(_, v)| v),
            checkpoint,
            total_steps: self.global_step,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// One optimization step: forward, compose, clear, backward, update.
    fn train_step(
        model: &mut M,
        optimizer: &mut OptimizerHandle,
        composer: &LossComposer,
        batch: &M::Batch,
    ) -> MtResult<(f64, Option<f64>)> {
        let output = model.forward(batch)?;
        let loss = composer.compose(&output.losses)?;
        optimizer.zero_grad(model.parameters_mut());
        model.backward(composer.weights())?;
        optimizer.step(model.parameters_mut())?;
        Ok((loss, output.losses.get(TaskKind::Main).map(|l| l.value)))
    }

    fn train_epoch(&mut self, epoch: usize) -> MtResult<Running> {
        self.state = TrainerState::Training { epoch, step: 0 };
        self.model.set_training(true);
        let mut running = Running::default();

        let stream = self.data.train_batches(epoch)?;
        for (index, item) in stream.enumerate() {
            let outcome = item.and_then(|batch| {
                Self::train_step(&mut self.model, &mut self.optimizer, &self.composer, &batch)
            });
            match outcome {
                Ok((loss, main)) => {
                    running.add(loss, main);
                    self.global_step += 1;
                    self.state = TrainerState::Training { epoch, step: running.batches };
                    let mut metrics = MetricMap::from([("train_loss".to_string(), loss)]);
                    if let Some(m) = main {
                        metrics.insert("train_main_loss".to_string(), m);
                    }
                    log_metrics(&*self.logger, &self.run_id, self.global_step, &metrics);
                }
                Err(e) if e.is_batch_error() => {
                    warn!(epoch = epoch + 1, batch = index, error = %e, "skipping training batch");
                    running.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        if running.batches == 0 {
            return Err(MtError::Training(format!(
                "epoch {} produced no usable training batch ({} skipped)",
                epoch + 1,
                running.skipped
            )));
        }
        debug!(
            epoch = epoch + 1,
            loss = running.mean_loss(),
            batches = running.batches,
            skipped = running.skipped,
            "epoch trained"
        );
        Ok(running)
    }

    fn validate(&mut self, epoch: usize) -> MtResult<ValidationReport> {
        self.state = TrainerState::Validating { epoch };
        self.model.set_training(false);
        let mut running = Running::default();
        let mut impressions = Vec::new();

        let cap = self.config.max_val_bs;
        let stream = self.data.validation_batches()?;
        for (index, item) in stream.take(cap).enumerate() {
            let outcome = item.and_then(|batch| {
                let output = self.model.forward(&batch)?;
                let loss = self.composer.compose(&output.losses)?;
                Ok((output, loss))
            });
            match outcome {
                Ok((output, loss)) => {
                    running.add(loss, output.losses.get(TaskKind::Main).map(|l| l.value));
                    impressions.extend(output.impressions);
                }
                Err(e) if e.is_batch_error() => {
                    warn!(epoch = epoch + 1, batch = index, error = %e, "skipping validation batch");
                    running.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        self.model.set_training(true);

        if running.batches == 0 {
            return Err(MtError::Training(format!(
                "validation after epoch {} produced no usable batch ({} skipped)",
                epoch + 1,
                running.skipped
            )));
        }

        let report = ValidationReport {
            loss: running.mean_loss(),
            main_loss: running.mean_main(),
            ranking: evaluate(&impressions),
            batches: running.batches,
            skipped: running.skipped,
        };
        info!(
            epoch = epoch + 1,
            val_loss = report.loss,
            auc = ?report.ranking.auc,
            batches = report.batches,
            "validation"
        );
        Ok(report)
    }

    fn log_epoch(&self, report: &EpochReport) {
        let mut metrics = report
            .validation
            .as_ref()
            .map(ValidationReport::to_map)
            .unwrap_or_default();
        metrics.insert("epoch".to_string(), (report.epoch + 1) as f64);
        metrics.insert("epoch_train_loss".to_string(), report.train_loss);
        metrics.insert("skipped_batches".to_string(), report.skipped_batches as f64);
        log_metrics(&*self.logger, &self.run_id, self.global_step, &metrics);
    }
}

/// Score every validation impression of `data` with `model` in evaluation
/// mode. Unlike validation during training the pass is not capped; batch
/// errors are skipped.
pub fn predict<M, D>(model: &mut M, data: &mut D) -> MtResult<Vec<Impression>>
where
    M: MultiTaskModel,
    D: BatchSource<Batch = M::Batch>,
{
    model.set_training(false);
    let mut impressions = Vec::new();
    let mut skipped = 0usize;
    for (index, item) in data.validation_batches()?.enumerate() {
        match item.and_then(|batch| model.forward(&batch)) {
            Ok(output) => impressions.extend(output.impressions),
            Err(e) if e.is_batch_error() => {
                warn!(batch = index, error = %e, "skipping prediction batch");
                skipped += 1;
            }
            Err(e) => return Err(e),
        }
    }
    info!(impressions = impressions.len(), skipped, "prediction finished");
    Ok(impressions)
}

fn log_metrics(logger: &dyn ExperimentLogger, run_id: &str, step: u64, metrics: &MetricMap) {
    if let Err(e) = logger.log(run_id, step, metrics) {
        warn!(run_id, step, error = %e, "experiment logger failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::MemoryLogger;
    use crate::model::{BatchStream, ForwardOutput, Impression, Parameter};
    use crate::testing;
    use mtrec_types::{BatchError, DeviceError, LossWeights, ObjectiveDirection, ObjectiveMetric, TaskLosses};

    #[derive(Debug, Clone)]
    enum Step {
        Good(f64),
        /// Rejected by the model.
        Corrupt,
        /// Rejected by the dataset before reaching the model.
        Unreadable,
        Oom,
    }

    struct MockModel {
        params: Vec<Parameter>,
        weights_seen: Vec<LossWeights>,
        forwards: usize,
        training_flags: Vec<bool>,
    }

    impl MockModel {
        fn new() -> Self {
            Self {
                params: vec![
                    Parameter::new("bert.encoder.lora_A", "bert.encoder", vec![0.0; 2]),
                    Parameter::new("user_encoder.W", "user_encoder", vec![0.0; 2]),
                    Parameter::new("news_encoder.cat_net.weight", "news_encoder.cat_net", vec![0.0; 2]),
                ],
                weights_seen: Vec::new(),
                forwards: 0,
                training_flags: Vec::new(),
            }
        }
    }

    impl MultiTaskModel for MockModel {
        type Batch = Step;

        fn forward(&mut self, batch: &Step) -> MtResult<ForwardOutput> {
            self.forwards += 1;
            match batch {
                Step::Good(v) => Ok(ForwardOutput {
                    losses: TaskLosses::new()
                        .with(TaskKind::Main, *v)
                        .with(TaskKind::Category, 2.0 * v)
                        .with(TaskKind::Ner, f64::NAN)
                        .with(TaskKind::Gs, 100.0),
                    impressions: vec![Impression { scores: vec![*v, 0.0], labels: vec![1.0, 0.0] }],
                }),
                Step::Corrupt => Err(BatchError::ShapeMismatch { message: "bad tensor".into() }.into()),
                Step::Unreadable => unreachable!("filtered by the dataset"),
                Step::Oom => Err(DeviceError::OutOfMemory {
                    device: "cuda:0".into(),
                    message: "allocation failed".into(),
                }
                .into()),
            }
        }

        fn backward(&mut self, weights: &LossWeights) -> MtResult<()> {
            self.weights_seen.push(*weights);
            for p in &mut self.params {
                p.grad.iter_mut().for_each(|g| *g += 1.0);
            }
            Ok(())
        }

        fn parameters(&self) -> &[Parameter] {
            &self.params
        }

        fn parameters_mut(&mut self) -> &mut [Parameter] {
            &mut self.params
        }

        fn set_training(&mut self, training: bool) {
            self.training_flags.push(training);
        }
    }

    struct MockData {
        train: Vec<Step>,
        validation: Vec<Step>,
    }

    fn stream(steps: &[Step]) -> BatchStream<'_, Step> {
        Box::new(steps.iter().cloned().map(|s| match s {
            Step::Unreadable => Err(BatchError::Malformed { message: "truncated record".into() }.into()),
            other => Ok(other),
        }))
    }

    impl BatchSource for MockData {
        type Batch = Step;

        fn train_batches(&mut self, _epoch: usize) -> MtResult<BatchStream<'_, Step>> {
            Ok(stream(&self.train))
        }

        fn validation_batches(&mut self) -> MtResult<BatchStream<'_, Step>> {
            Ok(stream(&self.validation))
        }
    }

    fn config() -> RunConfig {
        let mut config = testing::config();
        config.trainer.epochs = 2;
        config.trainer.skip_main = false;
        config.trainer.skip_cat = false;
        config.trainer.skip_ner = true;
        config.trainer.skip_gs = true;
        config.trainer.aux_scaler = 0.3;
        config.trainer.val_every = 1;
        config.trainer.save_dir = None;
        config.max_val_bs = 3;
        config
    }

    fn trainer(config: &RunConfig, train: Vec<Step>, validation: Vec<Step>) -> Trainer<MockModel, MockData> {
        Trainer::new(config, MockModel::new(), MockData { train, validation }).unwrap()
    }

    #[test]
    fn runs_all_epochs_and_composes_active_tasks_only() {
        let logger = Arc::new(MemoryLogger::new());
        let mut t = trainer(&config(), vec![Step::Good(1.0), Step::Good(2.0)], vec![Step::Good(0.5)])
            .with_logger(logger.clone());
        let report = t.run().unwrap();

        assert_eq!(t.state(), &TrainerState::Done);
        assert_eq!(report.epochs.len(), 2);
        assert_eq!(report.total_steps, 4);
        // (1 + 0.3 * 2) and (2 + 0.3 * 4)
        assert!((report.epochs[0].train_loss - (1.6 + 3.2) / 2.0).abs() < 1e-12);
        assert_eq!(report.epochs[0].train_main_loss, Some(1.5));
        let weights = &t.model().weights_seen[0];
        assert_eq!(weights.weight(TaskKind::Ner), 0.0);
        assert_eq!(weights.weight(TaskKind::Category), 0.3);
        // 4 step records and 2 epoch records
        assert_eq!(logger.len(), 6);
    }

    #[test]
    fn corrupt_batches_are_skipped() {
        let mut t = trainer(
            &config(),
            vec![Step::Corrupt, Step::Good(1.0), Step::Unreadable],
            vec![Step::Unreadable, Step::Good(1.0)],
        );
        let report = t.run().unwrap();
        assert_eq!(report.epochs[0].train_batches, 1);
        assert_eq!(report.epochs[0].skipped_batches, 2);
        let validation = report.epochs[0].validation.as_ref().unwrap();
        assert_eq!((validation.batches, validation.skipped), (1, 1));
    }

    #[test]
    fn epoch_without_usable_batches_fails_the_run() {
        let mut t = trainer(&config(), vec![Step::Corrupt, Step::Unreadable], vec![Step::Good(1.0)]);
        let err = t.run().unwrap_err();
        assert!(matches!(err, MtError::Training(_)));
        assert!(err.is_trial_scoped());
        assert!(matches!(t.state(), TrainerState::Failed { .. }));
    }

    #[test]
    fn device_errors_abort_without_retry() {
        let mut t = trainer(&config(), vec![Step::Good(1.0), Step::Oom, Step::Good(1.0)], vec![Step::Good(1.0)]);
        let err = t.run().unwrap_err();
        assert!(matches!(err, MtError::Device(DeviceError::OutOfMemory { .. })));
        assert_eq!(t.model().forwards, 2);
        match t.state() {
            TrainerState::Failed { reason } => assert!(reason.contains("cuda:0")),
            other => panic!("unexpected state {other:?}"),
        }
        assert!(t.run().is_err());
    }

    #[test]
    fn validation_is_capped_and_follows_cadence() {
        let mut config = config();
        config.trainer.epochs = 3;
        config.trainer.val_every = 2;
        config.max_val_bs = 2;
        let mut t = trainer(&config, vec![Step::Good(1.0)], vec![Step::Good(1.0); 5]);
        let report = t.run().unwrap();
        let validated: Vec<bool> = report.epochs.iter().map(|e| e.validation.is_some()).collect();
        // Epoch 2 by cadence, epoch 3 because it is the last.
        assert_eq!(validated, [false, true, true]);
        assert_eq!(report.epochs[1].validation.as_ref().unwrap().batches, 2);
        // 3 training forwards plus 2 capped validation passes of 2
        assert_eq!(t.model().forwards, 7);
    }

    #[test]
    fn best_epoch_follows_objective_direction() {
        let mut config = config();
        config.trainer.epochs = 2;
        let objective = Objective { metric: ObjectiveMetric::ValLoss, direction: ObjectiveDirection::Minimize };
        let mut t = trainer(&config, vec![Step::Good(1.0)], vec![Step::Good(1.0)]).with_objective(objective);
        let report = t.run().unwrap();
        // Equal validation losses: the earlier epoch stays best.
        assert_eq!(report.best_epoch, Some(0));
        assert!(report.epochs[0].improved && !report.epochs[1].improved);
        assert!((report.metrics()["val_loss"] - 1.6).abs() < 1e-12);
    }

    #[test]
    fn improvements_are_checkpointed_into_one_run_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.trainer.save_dir = Some(dir.path().to_path_buf());
        std::fs::create_dir(dir.path().join("run0")).unwrap();
        let objective = Objective { metric: ObjectiveMetric::Auc, direction: ObjectiveDirection::Maximize };
        let mut t = trainer(&config, vec![Step::Good(1.0)], vec![Step::Good(1.0)]).with_objective(objective);
        let report = t.run().unwrap();

        let run_dir = dir.path().join("run1");
        assert_eq!(report.checkpoint.as_deref(), Some(run_dir.as_path()));
        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(run_dir.join("report.json")).unwrap()).unwrap();
        assert_eq!(saved["epoch"], 0);
        assert!(!dir.path().join("run2").exists());
    }

    #[test]
    fn model_is_put_back_into_training_mode_after_validation() {
        let mut t = trainer(&config(), vec![Step::Good(1.0)], vec![Step::Good(1.0)]);
        t.run().unwrap();
        assert_eq!(t.model().training_flags, [true, false, true, true, false, true]);
    }

    #[test]
    fn prediction_scores_every_impression_without_a_cap() {
        let mut model = MockModel::new();
        let mut data = MockData {
            train: Vec::new(),
            validation: vec![Step::Good(0.5), Step::Corrupt, Step::Good(2.0), Step::Unreadable, Step::Good(1.0)],
        };
        let impressions = predict(&mut model, &mut data).unwrap();
        let scores: Vec<f64> = impressions.iter().map(|i| i.scores[0]).collect();
        assert_eq!(scores, [0.5, 2.0, 1.0]);
        assert_eq!(model.training_flags, [false]);

        data.validation.push(Step::Oom);
        assert!(matches!(predict(&mut model, &mut data), Err(MtError::Device(_))));
    }
}
