//! Composite training objective.
//!
//! [`LossComposer`] turns the per-task losses of a forward pass into the single
//! scalar that is backpropagated. Which tasks contribute is decided once per
//! run from the configuration's skip flags; models are free to compute every
//! head and the composer simply ignores inactive ones.
//!
//! The reference loss functions at the bottom return the loss together with
//! its gradient with respect to the inputs, for collaborators that compute
//! their own gradients.

use mtrec_types::{ActiveTasks, BatchError, LossWeights, MtResult, RunConfig, Scoring, TaskLosses};

const NORM_EPS: f64 = 1e-8;

/// Weights and active set for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct LossComposer {
    active: ActiveTasks,
    weights: LossWeights,
}

impl LossComposer {
    pub fn new(config: &RunConfig) -> MtResult<Self> {
        let active = config.trainer.active_tasks()?;
        Ok(Self::from_parts(active, config.trainer.aux_scaler))
    }

    pub fn from_parts(active: ActiveTasks, aux_scaler: f64) -> Self {
        let weights = LossWeights::new(&active, aux_scaler);
        Self { active, weights }
    }

    pub fn active(&self) -> &ActiveTasks {
        &self.active
    }

    pub fn weights(&self) -> &LossWeights {
        &self.weights
    }

    /// Weighted sum of the active tasks' losses.
    pub fn compose(&self, losses: &TaskLosses) -> MtResult<f64> {
        let mut total = 0.0;
        for task in self.active.iter() {
            let loss = losses.get(task).ok_or_else(|| BatchError::MissingTaskLoss {
                task: task.to_string(),
            })?;
            if !loss.value.is_finite() {
                return Err(BatchError::NonFiniteLoss {
                    task: task.to_string(),
                    value: loss.value,
                }
                .into());
            }
            total += self.weights.weight(task) * loss.value;
        }
        Ok(total)
    }
}

/// Compose `losses` under the task toggles and auxiliary scale of `config`.
pub fn compose(losses: &TaskLosses, config: &RunConfig) -> MtResult<f64> {
    LossComposer::new(config)?.compose(losses)
}

/// Numerically stable softmax.
pub fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Click score of a candidate `news` vector for a `user` vector.
///
/// Returns the score and its gradients with respect to `user` and `news`.
/// Cosine norms are clamped at a small epsilon, as torch does.
pub fn click_score(scoring: Scoring, user: &[f64], news: &[f64]) -> MtResult<(f64, Vec<f64>, Vec<f64>)> {
    if user.len() != news.len() {
        return Err(BatchError::ShapeMismatch {
            message: format!("user vector of {} against news vector of {}", user.len(), news.len()),
        }
        .into());
    }
    let dot: f64 = user.iter().zip(news).map(|(u, n)| u * n).sum();
    match scoring {
        Scoring::CrossProduct => Ok((dot, news.to_vec(), user.to_vec())),
        Scoring::CosineSim => {
            let norm = |v: &[f64]| v.iter().map(|x| x * x).sum::<f64>().sqrt();
            let (norm_u, norm_n) = (norm(user), norm(news));
            let (clamp_u, clamp_n) = (norm_u.max(NORM_EPS), norm_n.max(NORM_EPS));
            let score = dot / (clamp_u * clamp_n);
            // d/da of a.b / (|a||b|) = b / (|a||b|) - score * a / |a|^2
            let grad = |a: &[f64], b: &[f64], norm_a: f64, clamp_a: f64| -> Vec<f64> {
                a.iter()
                    .zip(b)
                    .map(|(&x, &y)| {
                        let radial = if norm_a > NORM_EPS { score * x / (clamp_a * clamp_a) } else { 0.0 };
                        y / (clamp_u * clamp_n) - radial
                    })
                    .collect()
            };
            Ok((score, grad(user, news, norm_u, clamp_u), grad(news, user, norm_n, clamp_n)))
        }
    }
}

/// Listwise click loss for one impression: cross-entropy between the softmax
/// of the candidate scores and the normalized click labels.
///
/// Returns the loss and its gradient with respect to `scores`.
pub fn ranking_loss(scores: &[f64], labels: &[f64]) -> MtResult<(f64, Vec<f64>)> {
    if scores.is_empty() || scores.len() != labels.len() {
        return Err(BatchError::ShapeMismatch {
            message: format!("{} scores for {} labels", scores.len(), labels.len()),
        }
        .into());
    }
    let positives: f64 = labels.iter().sum();
    if positives <= 0.0 {
        return Err(BatchError::Malformed {
            message: "impression without a clicked candidate".to_string(),
        }
        .into());
    }
    let probs = softmax(scores);
    let mut loss = 0.0;
    let mut grad = Vec::with_capacity(scores.len());
    for (p, &y) in probs.iter().zip(labels) {
        let target = y / positives;
        if target > 0.0 {
            loss -= target * p.max(f64::MIN_POSITIVE).ln();
        }
        grad.push(p - target);
    }
    Ok((loss, grad))
}

/// Categorical cross-entropy of `logits` against class `target`.
pub fn cross_entropy(logits: &[f64], target: usize) -> MtResult<(f64, Vec<f64>)> {
    if target >= logits.len() {
        return Err(BatchError::ShapeMismatch {
            message: format!("label {target} outside {} classes", logits.len()),
        }
        .into());
    }
    let mut grad = softmax(logits);
    let loss = -grad[target].max(f64::MIN_POSITIVE).ln();
    grad[target] -= 1.0;
    Ok((loss, grad))
}

/// Token-level cross-entropy averaged over unmasked positions. Masked
/// positions contribute neither loss nor gradient.
pub fn masked_cross_entropy(
    logits: &[Vec<f64>],
    targets: &[usize],
    mask: &[bool],
) -> MtResult<(f64, Vec<Vec<f64>>)> {
    if logits.len() != targets.len() || logits.len() != mask.len() {
        return Err(BatchError::ShapeMismatch {
            message: format!(
                "{} token logits, {} targets, {} mask entries",
                logits.len(),
                targets.len(),
                mask.len()
            ),
        }
        .into());
    }
    let count = mask.iter().filter(|&&m| m).count();
    if count == 0 {
        return Err(BatchError::Malformed {
            message: "no unmasked tokens".to_string(),
        }
        .into());
    }
    let scale = 1.0 / count as f64;
    let mut total = 0.0;
    let mut grads = Vec::with_capacity(logits.len());
    for ((row, &target), &keep) in logits.iter().zip(targets).zip(mask) {
        if !keep {
            grads.push(vec![0.0; row.len()]);
            continue;
        }
        let (loss, mut grad) = cross_entropy(row, target)?;
        total += loss;
        grad.iter_mut().for_each(|g| *g *= scale);
        grads.push(grad);
    }
    Ok((total * scale, grads))
}
