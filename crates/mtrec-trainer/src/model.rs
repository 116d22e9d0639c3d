//! Interfaces of the external collaborators: the multi-task model and the
//! dataset provider.

use mtrec_types::{config_error, LossWeights, MtResult, TaskLosses};
use std::path::Path;

/// A named tensor of the model, flattened.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    /// Fully qualified name (e.g. "news_encoder.cat_net.weight").
    pub name: String,
    /// Module path the parameter belongs to (e.g. "news_encoder.cat_net").
    pub module: String,
    /// Frozen parameters are never handed to the optimizer.
    pub trainable: bool,
    pub data: Vec<f64>,
    pub grad: Vec<f64>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, module: impl Into<String>, data: Vec<f64>) -> Self {
        let grad = vec![0.0; data.len()];
        Self {
            name: name.into(),
            module: module.into(),
            trainable: true,
            data,
            grad,
        }
    }

    pub fn frozen(name: impl Into<String>, module: impl Into<String>, data: Vec<f64>) -> Self {
        Self {
            trainable: false,
            ..Self::new(name, module, data)
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn zero_grad(&mut self) {
        self.grad.iter_mut().for_each(|g| *g = 0.0);
    }
}

/// Click scores and labels of one impression (one user, several candidates).
#[derive(Debug, Clone, PartialEq)]
pub struct Impression {
    pub scores: Vec<f64>,
    pub labels: Vec<f64>,
}

/// Everything a forward pass produces.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForwardOutput {
    /// Losses of every task the model computed, active or not.
    pub losses: TaskLosses,
    pub impressions: Vec<Impression>,
}

/// The multi-task model: shared backbone, user encoder, news encoder heads.
pub trait MultiTaskModel {
    type Batch;

    /// Compute per-task losses and candidate scores for a batch.
    ///
    /// Malformed input is reported as `MtError::Batch`; accelerator failures
    /// as `MtError::Device`.
    fn forward(&mut self, batch: &Self::Batch) -> MtResult<ForwardOutput>;

    /// Accumulate into each parameter's `grad` the gradient of
    /// `sum(weight(task) * loss(task))` for the last forward pass.
    fn backward(&mut self, weights: &LossWeights) -> MtResult<()>;

    fn parameters(&self) -> &[Parameter];

    fn parameters_mut(&mut self) -> &mut [Parameter];

    /// `(module path, parameter)` pairs in `parameters()` order. The
    /// optimizer groups parameters by these paths.
    fn named_parameters(&self) -> Box<dyn Iterator<Item = (&str, &Parameter)> + '_> {
        Box::new(self.parameters().iter().map(|p| (p.module.as_str(), p)))
    }

    fn set_training(&mut self, _training: bool) {}

    /// Persist the model's weights into `dir`.
    fn save(&self, _dir: &Path) -> MtResult<()> {
        Ok(())
    }

    /// Restore weights written by [`MultiTaskModel::save`].
    fn load(&mut self, dir: &Path) -> MtResult<()> {
        Err(config_error!("model cannot load checkpoints (from {})", dir.display()))
    }
}

/// A lazy, finite sequence of batches. Items that fail with `MtError::Batch`
/// are skipped by the trainer.
pub type BatchStream<'a, B> = Box<dyn Iterator<Item = MtResult<B>> + 'a>;

/// Dataset provider yielding labeled batches.
pub trait BatchSource {
    type Batch;

    /// Training batches for `epoch`. Restartable: every call starts over.
    fn train_batches(&mut self, epoch: usize) -> MtResult<BatchStream<'_, Self::Batch>>;

    /// Validation batches. The trainer caps how many it consumes.
    fn validation_batches(&mut self) -> MtResult<BatchStream<'_, Self::Batch>>;
}
