//! Synthetic collaborators.
//!
//! [`SyntheticDataset`] generates impressions from a hidden linear ground
//! truth and [`SyntheticModel`] is a small linear model with the same
//! parameter layout as the real encoder stack (LoRA adapters on a frozen
//! backbone, a user encoder, category/NER/GS heads). Together they let the
//! trainer and the search run end to end without an accelerator.

use mtrec_types::{
    config_error, internal_error, BatchError, DeviceError, LossWeights, MtResult, RunConfig,
    Scoring, TaskKind, TaskLosses,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::loss::{click_score, cross_entropy, masked_cross_entropy, ranking_loss};
use crate::model::{BatchSource, BatchStream, ForwardOutput, Impression, MultiTaskModel, Parameter};

pub const FEATURE_DIM: usize = 8;
pub const WEIGHTS_FILE: &str = "model.json";
pub const DEFAULT_TRAIN_IMPRESSIONS: usize = 256;
pub const DEFAULT_VALIDATION_IMPRESSIONS: usize = 128;

const TRAIN_SPLIT: u64 = 1;
const VALIDATION_SPLIT: u64 = 2;

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn argmax(values: impl Iterator<Item = f64>) -> usize {
    values
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (i, v)| if v > best.1 { (i, v) } else { best })
        .0
}

fn uniform(rng: &mut StdRng, len: usize, bound: f64) -> Vec<f64> {
    (0..len).map(|_| rng.random_range(-bound..bound)).collect()
}

/// One news article as seen by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct Article {
    pub features: Vec<f64>,
    pub category: usize,
    /// Title token features, padded to the configured title length.
    pub tokens: Vec<Vec<f64>>,
    pub entity_labels: Vec<usize>,
    pub token_mask: Vec<bool>,
    /// GS regression target.
    pub sentiment: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticImpression {
    /// Feature vectors of previously clicked articles.
    pub history: Vec<Vec<f64>>,
    pub candidates: Vec<Article>,
    /// One clicked candidate, `npratio` unclicked ones.
    pub labels: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticBatch {
    pub impressions: Vec<SyntheticImpression>,
}

impl SyntheticBatch {
    pub fn len(&self) -> usize {
        self.impressions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.impressions.is_empty()
    }
}

#[derive(Debug, Clone)]
struct GroundTruth {
    click: Vec<f64>,
    interest: Vec<f64>,
    category: Vec<Vec<f64>>,
    entity: Vec<Vec<f64>>,
    sentiment: Vec<f64>,
}

/// Deterministic, lazily generated impressions.
#[derive(Debug, Clone)]
pub struct SyntheticDataset {
    seed: u64,
    truth: GroundTruth,
    batch_size: usize,
    npratio: usize,
    history_size: usize,
    title_length: usize,
    train_fraction: f64,
    test_fraction: f64,
    train_base: usize,
    validation_base: usize,
    corrupt_every: Option<usize>,
}

impl SyntheticDataset {
    pub fn new(config: &RunConfig, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let categories = config.news_encoder.cat.output_size;
        let entities = config.ner_label_count();
        let truth = GroundTruth {
            click: uniform(&mut rng, FEATURE_DIM, 1.0),
            interest: uniform(&mut rng, FEATURE_DIM, 1.0),
            category: (0..categories).map(|_| uniform(&mut rng, FEATURE_DIM, 1.0)).collect(),
            entity: (0..entities).map(|_| uniform(&mut rng, FEATURE_DIM, 1.0)).collect(),
            sentiment: uniform(&mut rng, FEATURE_DIM, 1.0),
        };
        let d = &config.dataset;
        Self {
            seed,
            truth,
            batch_size: config.trainer.batch_size,
            npratio: d.npratio,
            history_size: d.history_size,
            title_length: d.max_title_length,
            train_fraction: d.train_fraction,
            test_fraction: d.test_fraction,
            train_base: DEFAULT_TRAIN_IMPRESSIONS,
            validation_base: DEFAULT_VALIDATION_IMPRESSIONS,
            corrupt_every: None,
        }
    }

    /// Impression counts before the dataset fractions are applied.
    pub fn with_impressions(mut self, train: usize, validation: usize) -> Self {
        self.train_base = train;
        self.validation_base = validation;
        self
    }

    /// Poison every `n`-th training batch with a non-finite feature.
    pub fn with_corrupt_every(mut self, n: usize) -> Self {
        self.corrupt_every = (n > 0).then_some(n);
        self
    }

    pub fn train_len(&self) -> usize {
        ((self.train_base as f64 * self.train_fraction).round() as usize).max(1)
    }

    pub fn validation_len(&self) -> usize {
        ((self.validation_base as f64 * self.test_fraction).round() as usize).max(1)
    }

    fn article(&self, rng: &mut StdRng) -> Article {
        let features = uniform(rng, FEATURE_DIM, 1.0);
        let category = argmax(self.truth.category.iter().map(|row| dot(row, &features)));
        let length = rng.random_range(1..=self.title_length);
        let mut tokens = Vec::with_capacity(self.title_length);
        let mut entity_labels = Vec::with_capacity(self.title_length);
        for _ in 0..self.title_length {
            let token: Vec<f64> = features.iter().map(|f| f + rng.random_range(-0.5f64..0.5)).collect();
            entity_labels.push(argmax(self.truth.entity.iter().map(|row| dot(row, &token))));
            tokens.push(token);
        }
        Article {
            sentiment: dot(&self.truth.sentiment, &features),
            category,
            tokens,
            entity_labels,
            token_mask: (0..self.title_length).map(|t| t < length).collect(),
            features,
        }
    }

    fn impression(&self, split: u64, index: usize) -> SyntheticImpression {
        let stream = (split << 40) ^ index as u64;
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ stream);

        let history: Vec<Vec<f64>> = (0..self.history_size)
            .map(|_| uniform(&mut rng, FEATURE_DIM, 1.0))
            .collect();
        let user = mean_vector(&history);
        let candidates: Vec<Article> = (0..=self.npratio).map(|_| self.article(&mut rng)).collect();

        let clicked = argmax(candidates.iter().map(|a| {
            let interest: f64 = (0..FEATURE_DIM)
                .map(|f| self.truth.interest[f] * a.features[f] * user[f])
                .sum();
            dot(&self.truth.click, &a.features) + interest
        }));
        let labels = (0..candidates.len())
            .map(|j| if j == clicked { 1.0 } else { 0.0 })
            .collect();

        SyntheticImpression { history, candidates, labels }
    }

    fn batch(&self, split: u64, indices: &[usize]) -> SyntheticBatch {
        SyntheticBatch {
            impressions: indices.iter().map(|&i| self.impression(split, i)).collect(),
        }
    }
}

impl BatchSource for SyntheticDataset {
    type Batch = SyntheticBatch;

    fn train_batches(&mut self, epoch: usize) -> MtResult<BatchStream<'_, SyntheticBatch>> {
        let mut order: Vec<usize> = (0..self.train_len()).collect();
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64 + 1));
        order.shuffle(&mut rng);
        let chunks: Vec<Vec<usize>> = order.chunks(self.batch_size).map(<[usize]>::to_vec).collect();
        debug!(epoch, batches = chunks.len(), "synthetic training epoch");

        let this: &Self = self;
        Ok(Box::new(chunks.into_iter().enumerate().map(move |(i, indices)| {
            let mut batch = this.batch(TRAIN_SPLIT, &indices);
            if this.corrupt_every.is_some_and(|n| (i + 1) % n == 0) {
                if let Some(article) = batch.impressions.first_mut().and_then(|imp| imp.candidates.first_mut()) {
                    article.features[0] = f64::NAN;
                }
            }
            Ok(batch)
        })))
    }

    fn validation_batches(&mut self) -> MtResult<BatchStream<'_, SyntheticBatch>> {
        let len = self.validation_len();
        let this: &Self = self;
        let starts = (0..len).step_by(this.batch_size);
        Ok(Box::new(starts.map(move |start| {
            let indices: Vec<usize> = (start..(start + this.batch_size).min(len)).collect();
            Ok(this.batch(VALIDATION_SPLIT, &indices))
        })))
    }
}

fn mean_vector(rows: &[Vec<f64>]) -> Vec<f64> {
    let mut mean = vec![0.0; FEATURE_DIM];
    for row in rows {
        for (m, v) in mean.iter_mut().zip(row) {
            *m += v;
        }
    }
    let n = rows.len().max(1) as f64;
    mean.iter_mut().for_each(|m| *m /= n);
    mean
}

const EMBEDDINGS: usize = 0;
const LORA_A: usize = 1;
const LORA_B: usize = 2;
const USER_W: usize = 3;
const USER_Q: usize = 4;
const CAT_HEAD: usize = 5;
const NER_HEAD: usize = 6;
const GS_HEAD: usize = 7;

type Gradients = Vec<(usize, Vec<f64>)>;

/// Linear multi-task model over [`SyntheticBatch`]es with exact gradients.
///
/// The user vector for history mean `u` is `(W + s * A^T B) + q * u`, `s`
/// being the LoRA scaling. A candidate `x` is scored against it with the
/// configured [`Scoring`]; under `cross_product` that is
/// `(W + s * A^T B) . x + q . (x * u)`.
#[derive(Debug, Clone)]
pub struct SyntheticModel {
    params: Vec<Parameter>,
    categories: usize,
    entities: usize,
    rank: usize,
    scaling: f64,
    scoring: Scoring,
    training: bool,
    training_forwards: u64,
    fail_after: Option<u64>,
    cache: Option<Vec<(TaskKind, Gradients)>>,
}

impl SyntheticModel {
    pub fn new(config: &RunConfig, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed ^ 0x5EED);
        let categories = config.news_encoder.cat.output_size;
        let entities = config.ner_label_count();
        let rank = config.lora.rank;
        let params = vec![
            Parameter::frozen("bert.embeddings.word_embeddings", "bert.embeddings", vec![1.0; FEATURE_DIM]),
            Parameter::new("bert.encoder.lora_A", "bert.encoder", uniform(&mut rng, rank * FEATURE_DIM, 0.1)),
            Parameter::new("bert.encoder.lora_B", "bert.encoder", vec![0.0; rank]),
            Parameter::new("user_encoder.W", "user_encoder", uniform(&mut rng, FEATURE_DIM, 0.1)),
            Parameter::new("user_encoder.q", "user_encoder", vec![0.0; FEATURE_DIM]),
            Parameter::new(
                "news_encoder.cat_net.weight",
                "news_encoder.cat_net",
                uniform(&mut rng, categories * FEATURE_DIM, 0.1),
            ),
            Parameter::new(
                "news_encoder.ner_net.weight",
                "news_encoder.ner_net",
                uniform(&mut rng, entities * FEATURE_DIM, 0.1),
            ),
            Parameter::new("news_encoder.gs_net.weight", "news_encoder.gs_net", vec![0.0; FEATURE_DIM]),
        ];
        Self {
            params,
            categories,
            entities,
            rank,
            scaling: config.lora.scaling(),
            scoring: config.trainer.scoring,
            training: true,
            training_forwards: 0,
            fail_after: None,
            cache: None,
        }
    }

    /// Fail every training forward pass after the first `steps` with an
    /// out-of-memory error.
    pub fn with_failure_after(mut self, steps: u64) -> Self {
        self.fail_after = Some(steps);
        self
    }

    fn embed(&self, x: &[f64]) -> Vec<f64> {
        x.iter().zip(&self.params[EMBEDDINGS].data).map(|(a, e)| a * e).collect()
    }

    fn effective_click_weights(&self) -> Vec<f64> {
        let a = &self.params[LORA_A].data;
        let b = &self.params[LORA_B].data;
        (0..FEATURE_DIM)
            .map(|f| {
                let update: f64 = (0..self.rank).map(|k| a[k * FEATURE_DIM + f] * b[k]).sum();
                self.params[USER_W].data[f] + self.scaling * update
            })
            .collect()
    }

    fn check(batch: &SyntheticBatch) -> MtResult<()> {
        if batch.is_empty() {
            return Err(BatchError::Malformed { message: "empty batch".to_string() }.into());
        }
        for imp in &batch.impressions {
            let finite = imp.history.iter().flatten().all(|v| v.is_finite())
                && imp.candidates.iter().all(|a| {
                    a.features.iter().all(|v| v.is_finite()) && a.sentiment.is_finite()
                });
            if !finite {
                return Err(BatchError::Malformed {
                    message: "non-finite input features".to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    fn main_task(&self, batch: &SyntheticBatch) -> MtResult<(f64, Gradients, Vec<Impression>)> {
        let w = self.effective_click_weights();
        let q = &self.params[USER_Q].data;
        let n = batch.len() as f64;
        let mut loss = 0.0;
        let mut g_w = vec![0.0; FEATURE_DIM];
        let mut g_q = vec![0.0; FEATURE_DIM];
        let mut impressions = Vec::with_capacity(batch.len());

        for imp in &batch.impressions {
            let history = mean_vector(&imp.history);
            let user: Vec<f64> = (0..FEATURE_DIM).map(|f| w[f] + q[f] * history[f]).collect();
            let mut scores = Vec::with_capacity(imp.candidates.len());
            let mut user_grads = Vec::with_capacity(imp.candidates.len());
            for article in &imp.candidates {
                let (score, g_user, _) = click_score(self.scoring, &user, &self.embed(&article.features))?;
                scores.push(score);
                user_grads.push(g_user);
            }
            let (l, g_scores) = ranking_loss(&scores, &imp.labels)?;
            loss += l / n;
            for (g_user, g) in user_grads.iter().zip(&g_scores) {
                for f in 0..FEATURE_DIM {
                    g_w[f] += g * g_user[f] / n;
                    g_q[f] += g * g_user[f] * history[f] / n;
                }
            }
            impressions.push(Impression { scores, labels: imp.labels.clone() });
        }

        let a = &self.params[LORA_A].data;
        let b = &self.params[LORA_B].data;
        let mut g_a = vec![0.0; self.rank * FEATURE_DIM];
        let mut g_b = vec![0.0; self.rank];
        for k in 0..self.rank {
            for f in 0..FEATURE_DIM {
                g_a[k * FEATURE_DIM + f] = self.scaling * b[k] * g_w[f];
                g_b[k] += self.scaling * a[k * FEATURE_DIM + f] * g_w[f];
            }
        }
        let grads = vec![(USER_W, g_w), (USER_Q, g_q), (LORA_A, g_a), (LORA_B, g_b)];
        Ok((loss, grads, impressions))
    }

    fn category_task(&self, articles: &[(&Article, Vec<f64>)]) -> MtResult<(f64, Gradients)> {
        let head = &self.params[CAT_HEAD].data;
        let n = articles.len() as f64;
        let mut loss = 0.0;
        let mut grad = vec![0.0; head.len()];
        for (article, x) in articles {
            let logits: Vec<f64> = (0..self.categories)
                .map(|c| dot(&head[c * FEATURE_DIM..(c + 1) * FEATURE_DIM], x))
                .collect();
            let (l, g) = cross_entropy(&logits, article.category)?;
            loss += l / n;
            for c in 0..self.categories {
                for f in 0..FEATURE_DIM {
                    grad[c * FEATURE_DIM + f] += g[c] * x[f] / n;
                }
            }
        }
        Ok((loss, vec![(CAT_HEAD, grad)]))
    }

    fn ner_task(&self, articles: &[(&Article, Vec<f64>)]) -> MtResult<(f64, Gradients)> {
        let head = &self.params[NER_HEAD].data;
        let n = articles.len() as f64;
        let mut loss = 0.0;
        let mut grad = vec![0.0; head.len()];
        for (article, _) in articles {
            if article.entity_labels.iter().any(|&e| e >= self.entities) {
                return Err(BatchError::ShapeMismatch {
                    message: format!("entity label outside {} NER classes", self.entities),
                }
                .into());
            }
            let tokens: Vec<Vec<f64>> = article.tokens.iter().map(|t| self.embed(t)).collect();
            let logits: Vec<Vec<f64>> = tokens
                .iter()
                .map(|t| {
                    (0..self.entities)
                        .map(|e| dot(&head[e * FEATURE_DIM..(e + 1) * FEATURE_DIM], t))
                        .collect()
                })
                .collect();
            let (l, token_grads) = masked_cross_entropy(&logits, &article.entity_labels, &article.token_mask)?;
            loss += l / n;
            for (token, g) in tokens.iter().zip(&token_grads) {
                for e in 0..self.entities {
                    for f in 0..FEATURE_DIM {
                        grad[e * FEATURE_DIM + f] += g[e] * token[f] / n;
                    }
                }
            }
        }
        Ok((loss, vec![(NER_HEAD, grad)]))
    }

    fn gs_task(&self, articles: &[(&Article, Vec<f64>)]) -> (f64, Gradients) {
        let head = &self.params[GS_HEAD].data;
        let n = articles.len() as f64;
        let mut loss = 0.0;
        let mut grad = vec![0.0; FEATURE_DIM];
        for (article, x) in articles {
            let residual = dot(head, x) - article.sentiment;
            loss += residual * residual / n;
            for f in 0..FEATURE_DIM {
                grad[f] += 2.0 * residual * x[f] / n;
            }
        }
        (loss, vec![(GS_HEAD, grad)])
    }
}

impl MultiTaskModel for SyntheticModel {
    type Batch = SyntheticBatch;

    fn forward(&mut self, batch: &SyntheticBatch) -> MtResult<ForwardOutput> {
        if self.training {
            self.training_forwards += 1;
            if self.fail_after.is_some_and(|n| self.training_forwards > n) {
                return Err(DeviceError::OutOfMemory {
                    device: "synthetic:0".to_string(),
                    message: format!("allocation failed at step {}", self.training_forwards),
                }
                .into());
            }
        }
        Self::check(batch)?;

        let articles: Vec<(&Article, Vec<f64>)> = batch
            .impressions
            .iter()
            .flat_map(|imp| imp.candidates.iter())
            .map(|a| (a, self.embed(&a.features)))
            .collect();

        let (main, main_grads, impressions) = self.main_task(batch)?;
        let (cat, cat_grads) = self.category_task(&articles)?;
        let (ner, ner_grads) = self.ner_task(&articles)?;
        let (gs, gs_grads) = self.gs_task(&articles);

        self.cache = self.training.then(|| {
            vec![
                (TaskKind::Main, main_grads),
                (TaskKind::Category, cat_grads),
                (TaskKind::Ner, ner_grads),
                (TaskKind::Gs, gs_grads),
            ]
        });

        Ok(ForwardOutput {
            losses: TaskLosses::new()
                .with(TaskKind::Main, main)
                .with(TaskKind::Category, cat)
                .with(TaskKind::Ner, ner)
                .with(TaskKind::Gs, gs),
            impressions,
        })
    }

    fn backward(&mut self, weights: &LossWeights) -> MtResult<()> {
        let cache = self
            .cache
            .take()
            .ok_or_else(|| internal_error!("backward called without a training forward pass"))?;
        for (task, grads) in cache {
            let weight = weights.weight(task);
            if weight == 0.0 {
                continue;
            }
            for (index, values) in grads {
                let param = &mut self.params[index];
                if !param.trainable {
                    continue;
                }
                for (g, v) in param.grad.iter_mut().zip(values) {
                    *g += weight * v;
                }
            }
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
        self.training = training;
    }

    fn save(&self, dir: &Path) -> MtResult<()> {
        let weights: BTreeMap<&str, &[f64]> = self
            .params
            .iter()
            .map(|p| (p.name.as_str(), p.data.as_slice()))
            .collect();
        fs::write(dir.join(WEIGHTS_FILE), serde_json::to_vec_pretty(&weights)?)?;
        Ok(())
    }

    fn load(&mut self, dir: &Path) -> MtResult<()> {
        let path = dir.join(WEIGHTS_FILE);
        let mut weights: BTreeMap<String, Vec<f64>> = serde_json::from_slice(&fs::read(&path)?)?;
        // Validate everything before touching the live parameters.
        let mut restored = Vec::with_capacity(self.params.len());
        for param in &self.params {
            let data = weights
                .remove(&param.name)
                .ok_or_else(|| config_error!("checkpoint {} has no `{}`", path.display(), param.name))?;
            if data.len() != param.len() {
                return Err(config_error!(
                    "checkpoint `{}` has {} values, model expects {}",
                    param.name,
                    data.len(),
                    param.len()
                ));
            }
            restored.push(data);
        }
        if let Some(extra) = weights.keys().next() {
            return Err(config_error!("checkpoint {} has unknown parameter `{extra}`", path.display()));
        }
        for (param, data) in self.params.iter_mut().zip(restored) {
            param.data = data;
            param.zero_grad();
        }
        self.cache = None;
        debug!(path = %path.display(), "synthetic weights restored");
        Ok(())
    }
}
