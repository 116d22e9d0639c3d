//! Parameter-group optimizer.
//!
//! The pretrained backbone is fine-tuned through its low-rank adapters and
//! needs a much smaller step than the freshly initialized heads, so trainable
//! parameters are partitioned by module into three groups with their own
//! learning rates. The optimizer family is shared by all groups.

use mtrec_types::{
    config_error, BatchError, MtResult, OptimizerKind, OptimizerSettings, RunConfig,
    TrainerConfig,
};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, warn};

use crate::model::{MultiTaskModel, Parameter};

/// Architectural partition of the trainable parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterGroupKind {
    /// Pretrained encoder and its adapters (`lr_bert`).
    Backbone,
    /// User encoder attention (`lr_user`).
    UserEncoder,
    /// News encoder heads: category, NER and GS (`lr_news`).
    NewsEncoder,
}

impl ParameterGroupKind {
    pub const ALL: [ParameterGroupKind; 3] = [Self::Backbone, Self::UserEncoder, Self::NewsEncoder];

    pub fn name(self) -> &'static str {
        match self {
            Self::Backbone => "backbone",
            Self::UserEncoder => "user_encoder",
            Self::NewsEncoder => "news_encoder",
        }
    }

    /// Group of a module path, decided by its first segment.
    pub fn classify(module: &str) -> Option<Self> {
        match module.split('.').next().unwrap_or_default() {
            "bert" | "backbone" => Some(Self::Backbone),
            "user_encoder" => Some(Self::UserEncoder),
            "news_encoder" => Some(Self::NewsEncoder),
            _ => None,
        }
    }

    pub fn learning_rate(self, trainer: &TrainerConfig) -> f64 {
        match self {
            Self::Backbone => trainer.lr_bert,
            Self::UserEncoder => trainer.lr_user,
            Self::NewsEncoder => trainer.lr_news,
        }
    }
}

impl fmt::Display for ParameterGroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// One group: indices into the model's parameter list plus its rate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterGroup {
    pub kind: ParameterGroupKind,
    pub learning_rate: f64,
    pub indices: Vec<usize>,
    pub names: Vec<String>,
}

impl ParameterGroup {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

#[derive(Debug, Clone)]
enum SlotState {
    Momentum { velocity: Option<Vec<f64>> },
    Moments { m: Vec<f64>, v: Vec<f64> },
}

/// Optimizer instance for one trial. Owns all moment state; dropping it at
/// the end of a trial discards that state.
#[derive(Debug, Clone)]
pub struct OptimizerHandle {
    settings: OptimizerSettings,
    groups: Vec<ParameterGroup>,
    /// Per parameter index; `None` for frozen parameters.
    state: Vec<Option<SlotState>>,
    layout: Vec<(String, usize)>,
    steps: u64,
}

/// Build the optimizer for `model` under `config`.
pub fn build<M: MultiTaskModel + ?Sized>(model: &M, config: &RunConfig) -> MtResult<OptimizerHandle> {
    OptimizerHandle::from_named(model.named_parameters(), &config.trainer)
}

impl OptimizerHandle {
    /// Group `params` by their own `module` paths.
    pub fn new(params: &[Parameter], trainer: &TrainerConfig) -> MtResult<Self> {
        Self::from_named(params.iter().map(|p| (p.module.as_str(), p)), trainer)
    }

    /// Group `(module path, parameter)` pairs, in model parameter order.
    pub fn from_named<'a>(
        named: impl IntoIterator<Item = (&'a str, &'a Parameter)>,
        trainer: &TrainerConfig,
    ) -> MtResult<Self> {
        let named: Vec<(&str, &Parameter)> = named.into_iter().collect();
        let mut seen = HashSet::new();
        let mut members: Vec<Vec<usize>> = vec![Vec::new(); ParameterGroupKind::ALL.len()];

        for (index, &(module, param)) in named.iter().enumerate() {
            if !seen.insert(param.name.as_str()) {
                return Err(config_error!("parameter `{}` is registered twice", param.name));
            }
            if param.grad.len() != param.data.len() {
                return Err(config_error!(
                    "parameter `{}` has {} values but {} gradient slots",
                    param.name,
                    param.data.len(),
                    param.grad.len()
                ));
            }
            if !param.trainable {
                continue;
            }
            let kind = ParameterGroupKind::classify(module).ok_or_else(|| {
                config_error!(
                    "trainable parameter `{}` (module `{module}`) belongs to no parameter group",
                    param.name
                )
            })?;
            members[kind as usize].push(index);
        }

        let mut groups = Vec::new();
        for (kind, indices) in ParameterGroupKind::ALL.into_iter().zip(members) {
            if indices.is_empty() {
                warn!(group = %kind, "parameter group is empty");
                continue;
            }
            let learning_rate = kind.learning_rate(trainer);
            debug!(group = %kind, parameters = indices.len(), learning_rate, "parameter group");
            groups.push(ParameterGroup {
                kind,
                learning_rate,
                names: indices.iter().map(|&i| named[i].1.name.clone()).collect(),
                indices,
            });
        }

        let settings = trainer.optimizer.clone();
        let state = named
            .iter()
            .map(|&(_, p)| {
                p.trainable.then(|| match settings.kind {
                    OptimizerKind::Sgd => SlotState::Momentum { velocity: None },
                    OptimizerKind::Adam | OptimizerKind::AdamW => SlotState::Moments {
                        m: vec![0.0; p.len()],
                        v: vec![0.0; p.len()],
                    },
                })
            })
            .collect();

        Ok(Self {
            settings,
            groups,
            state,
            layout: named.iter().map(|(_, p)| (p.name.clone(), p.len())).collect(),
            steps: 0,
        })
    }

    pub fn kind(&self) -> OptimizerKind {
        self.settings.kind
    }

    pub fn groups(&self) -> &[ParameterGroup] {
        &self.groups
    }

    pub fn group(&self, kind: ParameterGroupKind) -> Option<&ParameterGroup> {
        self.groups.iter().find(|g| g.kind == kind)
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn zero_grad(&self, params: &mut [Parameter]) {
        params.iter_mut().for_each(Parameter::zero_grad);
    }

    /// Apply one update to every group. A non-finite gradient rejects the
    /// whole step before any weight is touched.
    pub fn step(&mut self, params: &mut [Parameter]) -> MtResult<()> {
        self.check_layout(params)?;
        for group in &self.groups {
            for &index in &group.indices {
                if let Some(bad) = params[index].grad.iter().find(|g| !g.is_finite()) {
                    return Err(BatchError::Malformed {
                        message: format!("gradient of `{}` is {bad}", params[index].name),
                    }
                    .into());
                }
            }
        }

        self.steps += 1;
        let t = self.steps as i32;
        let s = &self.settings;
        let weight_decay = s.effective_weight_decay();
        let bias1 = 1.0 - s.beta1.powi(t);
        let bias2 = 1.0 - s.beta2.powi(t);

        for group in &self.groups {
            let lr = group.learning_rate;
            for &index in &group.indices {
                let param = &mut params[index];
                let Some(slot) = self.state[index].as_mut() else {
                    continue;
                };
                match slot {
                    SlotState::Momentum { velocity } => {
                        let grads: Vec<f64> = param
                            .grad
                            .iter()
                            .zip(&param.data)
                            .map(|(g, w)| g + weight_decay * w)
                            .collect();
                        let buf = match velocity {
                            Some(buf) => {
                                for (b, g) in buf.iter_mut().zip(&grads) {
                                    *b = s.momentum * *b + g;
                                }
                                buf
                            }
                            None => velocity.insert(grads),
                        };
                        for (w, b) in param.data.iter_mut().zip(buf.iter()) {
                            *w -= lr * b;
                        }
                    }
                    SlotState::Moments { m, v } => {
                        let decoupled = s.kind == OptimizerKind::AdamW;
                        for i in 0..param.data.len() {
                            let mut g = param.grad[i];
                            if decoupled {
                                param.data[i] -= lr * weight_decay * param.data[i];
                            } else {
                                g += weight_decay * param.data[i];
                            }
                            m[i] = s.beta1 * m[i] + (1.0 - s.beta1) * g;
                            v[i] = s.beta2 * v[i] + (1.0 - s.beta2) * g * g;
                            let m_hat = m[i] / bias1;
                            let v_hat = v[i] / bias2;
                            param.data[i] -= lr * m_hat / (v_hat.sqrt() + s.eps);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn check_layout(&self, params: &[Parameter]) -> MtResult<()> {
        let matches = params.len() == self.layout.len()
            && params
                .iter()
                .zip(&self.layout)
                .all(|(p, (name, len))| &p.name == name && p.len() == *len);
        if !matches {
            return Err(mtrec_types::internal_error!(
                "parameters changed since the optimizer was built"
            ));
        }
        Ok(())
    }
}
