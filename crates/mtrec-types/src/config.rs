//! Run configuration.
//!
//! Configuration documents are parsed in two stages: serde reads the YAML into
//! the loosely-typed [`RawRunConfig`] (unknown fields are rejected there), then
//! [`RunConfig::from_raw`] checks every numeric domain and cross-field rule and
//! produces the strongly-typed [`RunConfig`] consumed by the rest of the
//! system. Nothing downstream ever sees an unvalidated value.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

use crate::errors::{MtError, MtResult};
use crate::tasks::{ActiveTasks, TaskKind};
use crate::validation_error;

// ---------------------------------------------------------------------------
// Raw document
// ---------------------------------------------------------------------------

/// The configuration document exactly as written on disk.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawRunConfig {
    pub name: String,
    pub max_val_bs: i64,
    pub user_encoder: RawUserEncoder,
    pub news_encoder: RawNewsEncoder,
    pub trainer: RawTrainer,
    pub dataset: RawDataset,
    pub model: RawModel,
    pub lora_config: RawLora,
    #[serde(default)]
    pub hypertuning: Option<RawHypertuning>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawUserEncoder {
    pub hidden_size: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawNewsEncoder {
    pub cfg_cat: RawHead,
    pub cfg_ner: RawNerHead,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawHead {
    pub hidden_size: i64,
    pub num_layers: i64,
    pub output_size: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawNerHead {
    pub hidden_size: i64,
    pub num_layers: i64,
    pub output_size: i64,
    #[serde(default)]
    pub extend_output_size: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawTrainer {
    pub optimizer: String,
    pub epochs: i64,
    pub lr_user: f64,
    pub lr_news: f64,
    pub lr_bert: f64,
    pub batch_size: i64,
    #[serde(default)]
    pub skip_main: bool,
    #[serde(default)]
    pub skip_cat: bool,
    #[serde(default)]
    pub skip_ner: bool,
    #[serde(default)]
    pub skip_gs: bool,
    pub aux_scaler: f64,
    #[serde(default)]
    pub val_every: Option<i64>,
    #[serde(default)]
    pub save_dir: Option<PathBuf>,
    #[serde(default)]
    pub momentum: Option<f64>,
    #[serde(default)]
    pub beta1: Option<f64>,
    #[serde(default)]
    pub beta2: Option<f64>,
    #[serde(default)]
    pub eps: Option<f64>,
    #[serde(default)]
    pub weight_decay: Option<f64>,
    #[serde(default)]
    pub scoring: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawDataset {
    pub data_dir: PathBuf,
    pub history_size: i64,
    pub max_title_length: i64,
    pub npratio: i64,
    pub train_fraction: f64,
    pub test_fraction: f64,
    #[serde(rename = "extended_NER", default)]
    pub extended_ner: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawModel {
    pub pretrained_model_name: String,
    pub hidden_size: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawLora {
    pub r: i64,
    pub lora_alpha: f64,
    pub target_modules: Vec<String>,
    pub lora_dropout: f64,
    #[serde(default)]
    pub bias: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawHypertuning {
    pub n_trials: i64,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub exploration_weight: Option<f64>,
    #[serde(default)]
    pub objective: Option<String>,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub lr_scale: Option<String>,
    #[serde(default)]
    pub journal_dir: Option<PathBuf>,
    /// Read per dimension by [`RawDimension::from_yaml`] so errors name the
    /// dimension.
    pub space: BTreeMap<String, serde_yaml::Value>,
}

/// A search dimension: either a list of choices or a `{min, max}` range.
#[derive(Debug, Clone, PartialEq)]
pub enum RawDimension {
    Choices(Vec<serde_json::Value>),
    Range(RawRange),
}

impl RawDimension {
    pub fn from_yaml(field: &str, value: &serde_yaml::Value) -> MtResult<Self> {
        match value {
            serde_yaml::Value::Sequence(_) => serde_yaml::from_value(value.clone())
                .map(Self::Choices)
                .map_err(|e| validation_error!(field, "{e}")),
            serde_yaml::Value::Mapping(_) => serde_yaml::from_value(value.clone())
                .map(Self::Range)
                .map_err(|e| validation_error!(field, "{e}")),
            _ => Err(validation_error!(
                field,
                "expected a list of choices or a {{min, max[, scale]}} range"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawRange {
    pub min: f64,
    pub max: f64,
    #[serde(default)]
    pub scale: Option<String>,
}

// ---------------------------------------------------------------------------
// Validated configuration
// ---------------------------------------------------------------------------

/// Immutable snapshot of every setting of one training run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunConfig {
    pub name: String,
    /// Maximum number of validation batches per validation pass.
    pub max_val_bs: usize,
    pub user_encoder: UserEncoderConfig,
    pub news_encoder: NewsEncoderConfig,
    pub trainer: TrainerConfig,
    pub dataset: DatasetConfig,
    pub model: ModelConfig,
    pub lora: LoraConfig,
    pub hypertuning: Option<HypertuningConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserEncoderConfig {
    pub hidden_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewsEncoderConfig {
    pub cat: HeadConfig,
    pub ner: HeadConfig,
    /// Extra NER labels added on top of `ner.output_size` when the dataset
    /// uses the extended label set.
    pub ner_extension: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeadConfig {
    pub hidden_size: usize,
    pub num_layers: usize,
    pub output_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainerConfig {
    pub optimizer: OptimizerSettings,
    pub epochs: usize,
    pub lr_user: f64,
    pub lr_news: f64,
    pub lr_bert: f64,
    pub batch_size: usize,
    pub skip_main: bool,
    pub skip_cat: bool,
    pub skip_ner: bool,
    pub skip_gs: bool,
    pub aux_scaler: f64,
    /// Validate every `val_every` epochs (the final epoch always validates).
    pub val_every: usize,
    pub save_dir: Option<PathBuf>,
    pub scoring: Scoring,
}

impl TrainerConfig {
    pub fn is_skipped(&self, task: TaskKind) -> bool {
        match task {
            TaskKind::Main => self.skip_main,
            TaskKind::Category => self.skip_cat,
            TaskKind::Ner => self.skip_ner,
            TaskKind::Gs => self.skip_gs,
        }
    }

    pub fn active_tasks(&self) -> MtResult<ActiveTasks> {
        ActiveTasks::from_skip_flags(|task| self.is_skipped(task))
    }
}

/// Optimizer family. The same family is used for every parameter group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    /// Gradient descent with momentum.
    Sgd,
    Adam,
    /// Adam with decoupled weight decay.
    AdamW,
}

impl OptimizerKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Sgd => "sgd",
            Self::Adam => "adam",
            Self::AdamW => "adamw",
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OptimizerKind {
    type Err = MtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sgd" => Ok(Self::Sgd),
            "adam" => Ok(Self::Adam),
            "adamw" => Ok(Self::AdamW),
            _ => Err(MtError::UnsupportedOptimizer { name: s.to_string() }),
        }
    }
}

/// How the user vector and a candidate news vector combine into a click
/// score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scoring {
    /// Dot product.
    #[default]
    CrossProduct,
    /// Cosine similarity, bounded to [-1, 1].
    CosineSim,
}

impl Scoring {
    pub fn name(self) -> &'static str {
        match self {
            Self::CrossProduct => "cross_product",
            Self::CosineSim => "cosine_sim",
        }
    }
}

impl fmt::Display for Scoring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

impl FromStr for Scoring {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cross_product" => Ok(Self::CrossProduct),
            "cosine_sim" => Ok(Self::CosineSim),
            other => Err(format!("unknown scoring `{other}` (expected cross_product or cosine_sim)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizerSettings {
    pub kind: OptimizerKind,
    pub momentum: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    /// `None` selects the family default (0.01 for AdamW, 0 otherwise).
    pub weight_decay: Option<f64>,
}

impl OptimizerSettings {
    pub fn effective_weight_decay(&self) -> f64 {
        self.weight_decay.unwrap_or(match self.kind {
            OptimizerKind::AdamW => 0.01,
            OptimizerKind::Sgd | OptimizerKind::Adam => 0.0,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetConfig {
    pub data_dir: PathBuf,
    pub history_size: usize,
    pub max_title_length: usize,
    /// Negatives sampled per positive click.
    pub npratio: usize,
    pub train_fraction: f64,
    pub test_fraction: f64,
    pub extended_ner: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelConfig {
    pub pretrained_model_name: String,
    pub hidden_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoraBias {
    None,
    All,
    LoraOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoraConfig {
    pub rank: usize,
    pub alpha: f64,
    pub target_modules: Vec<String>,
    pub dropout: f64,
    pub bias: LoraBias,
}

impl LoraConfig {
    /// Multiplier applied to the low-rank update (`alpha / rank`).
    pub fn scaling(&self) -> f64 {
        self.alpha / self.rank as f64
    }
}

// ---------------------------------------------------------------------------
// Hypertuning block
// ---------------------------------------------------------------------------

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ObjectiveDirection {
    #[default]
    Maximize,
    Minimize,
}

impl ObjectiveDirection {
    /// Score recorded for failed trials: worse than any real score.
    pub fn sentinel(self) -> f64 {
        match self {
            Self::Maximize => f64::NEG_INFINITY,
            Self::Minimize => f64::INFINITY,
        }
    }

    /// Strict improvement, so ties keep the earlier value.
    pub fn improves(self, candidate: f64, current: f64) -> bool {
        match self {
            Self::Maximize => candidate > current,
            Self::Minimize => candidate < current,
        }
    }
}

/// Validation metric a search optimizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectiveMetric {
    #[serde(rename = "auc")]
    Auc,
    #[serde(rename = "mrr")]
    Mrr,
    #[serde(rename = "ndcg@5")]
    Ndcg5,
    #[serde(rename = "ndcg@10")]
    Ndcg10,
    #[serde(rename = "val_loss")]
    ValLoss,
    #[serde(rename = "val_main_loss")]
    ValMainLoss,
}

impl ObjectiveMetric {
    pub const ALL: [ObjectiveMetric; 6] = [
        Self::Auc,
        Self::Mrr,
        Self::Ndcg5,
        Self::Ndcg10,
        Self::ValLoss,
        Self::ValMainLoss,
    ];

    /// Key of the metric in validation reports.
    pub fn key(self) -> &'static str {
        match self {
            Self::Auc => "auc",
            Self::Mrr => "mrr",
            Self::Ndcg5 => "ndcg@5",
            Self::Ndcg10 => "ndcg@10",
            Self::ValLoss => "val_loss",
            Self::ValMainLoss => "val_main_loss",
        }
    }

    pub fn natural_direction(self) -> ObjectiveDirection {
        match self {
            Self::ValLoss | Self::ValMainLoss => ObjectiveDirection::Minimize,
            _ => ObjectiveDirection::Maximize,
        }
    }
}

impl FromStr for ObjectiveMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|metric| metric.key() == s)
            .ok_or_else(|| {
                let known: Vec<_> = Self::ALL.iter().map(|m| m.key()).collect();
                format!("unknown objective `{s}` (expected one of: {})", known.join(", "))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Objective {
    pub metric: ObjectiveMetric,
    pub direction: ObjectiveDirection,
}

impl Default for Objective {
    fn default() -> Self {
        Self {
            metric: ObjectiveMetric::Auc,
            direction: ObjectiveDirection::Maximize,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchStrategyKind {
    #[default]
    Random,
    /// Explore randomly or perturb the best observed point.
    Adaptive,
}

/// Sampling scale of a continuous range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scale {
    Linear,
    Log,
}

impl FromStr for Scale {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" => Ok(Self::Linear),
            "log" => Ok(Self::Log),
            other => Err(format!("unknown scale `{other}` (expected linear or log)")),
        }
    }
}

/// A tunable setting the sampler knows how to apply to a [`RunConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HyperDimension {
    /// Hidden size of the category head, the NER head and the user encoder.
    HiddenSize,
    /// Layer count of the category and NER heads.
    NumLayers,
    BatchSize,
    /// Learning rate of both freshly initialized head groups. Cannot be
    /// declared alongside `LrUser` or `LrNews`.
    Lr,
    LrUser,
    LrNews,
    LrBert,
    Optimizer,
    AuxScaler,
}

impl HyperDimension {
    pub const ALL: [HyperDimension; 9] = [
        Self::HiddenSize,
        Self::NumLayers,
        Self::BatchSize,
        Self::Lr,
        Self::LrUser,
        Self::LrNews,
        Self::LrBert,
        Self::Optimizer,
        Self::AuxScaler,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::HiddenSize => "hidden_size",
            Self::NumLayers => "num_layers",
            Self::BatchSize => "batch_size",
            Self::Lr => "lr",
            Self::LrUser => "lr_user",
            Self::LrNews => "lr_news",
            Self::LrBert => "lr_bert",
            Self::Optimizer => "optimizer",
            Self::AuxScaler => "aux_scaler",
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(self, Self::HiddenSize | Self::NumLayers | Self::BatchSize)
    }

    pub fn is_learning_rate(self) -> bool {
        matches!(self, Self::Lr | Self::LrUser | Self::LrNews | Self::LrBert)
    }

    /// Dimensions that only accept a list of choices.
    pub fn is_categorical(self) -> bool {
        matches!(self, Self::Optimizer)
    }
}

impl fmt::Display for HyperDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

impl FromStr for HyperDimension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|dim| dim.name() == s)
            .ok_or_else(|| {
                let known: Vec<_> = Self::ALL.iter().map(|d| d.name()).collect();
                format!("unknown dimension `{s}` (expected one of: {})", known.join(", "))
            })
    }
}

/// Domain of one search dimension.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DimensionDomain {
    Choices(Vec<serde_json::Value>),
    /// Inclusive integer interval.
    IntRange { min: i64, max: i64 },
    FloatRange { min: f64, max: f64 },
    LogRange { min: f64, max: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DimensionSpec {
    pub dimension: HyperDimension,
    pub domain: DimensionDomain,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HypertuningConfig {
    pub n_trials: usize,
    pub seed: Option<u64>,
    pub strategy: SearchStrategyKind,
    pub exploration_weight: f64,
    pub objective: Objective,
    /// Default scale for learning-rate ranges without an explicit `scale`.
    pub lr_scale: Scale,
    pub journal_dir: Option<PathBuf>,
    pub dimensions: Vec<DimensionSpec>,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn positive(field: &str, value: i64) -> MtResult<usize> {
    if value < 1 {
        return Err(validation_error!(field, "must be at least 1, got {value}"));
    }
    usize::try_from(value).map_err(|_| validation_error!(field, "value {value} is too large"))
}

fn positive_f64(field: &str, value: f64) -> MtResult<f64> {
    if !value.is_finite() || value <= 0.0 {
        return Err(validation_error!(field, "must be a finite number > 0, got {value}"));
    }
    Ok(value)
}

fn non_negative_f64(field: &str, value: f64) -> MtResult<f64> {
    if !value.is_finite() || value < 0.0 {
        return Err(validation_error!(field, "must be a finite number >= 0, got {value}"));
    }
    Ok(value)
}

/// Fraction in (0, 1].
fn fraction(field: &str, value: f64) -> MtResult<f64> {
    if !(value > 0.0 && value <= 1.0) {
        return Err(validation_error!(field, "must lie in (0, 1], got {value}"));
    }
    Ok(value)
}

/// Coefficient in [0, 1).
fn coefficient(field: &str, value: f64) -> MtResult<f64> {
    if !(0.0..1.0).contains(&value) {
        return Err(validation_error!(field, "must lie in [0, 1), got {value}"));
    }
    Ok(value)
}

fn non_empty(field: &str, value: &str) -> MtResult<()> {
    if value.trim().is_empty() {
        return Err(validation_error!(field, "must not be empty"));
    }
    Ok(())
}

/// Turn a serde_yaml failure into a validation error naming the offending
/// field. serde_yaml prefixes messages with the dotted path of the value
/// being read (`trainer.epochs: invalid type ...`).
fn yaml_error(error: serde_yaml::Error) -> MtError {
    let message = error.to_string();
    let (path, detail) = match message.split_once(": ") {
        Some((head, rest)) if !head.contains(' ') => (head.to_string(), rest.to_string()),
        _ => (String::new(), message.clone()),
    };
    let named = ["missing field `", "unknown field `"]
        .iter()
        .find_map(|marker| {
            let start = detail.find(marker)? + marker.len();
            let end = detail[start..].find('`')? + start;
            Some(detail[start..end].to_string())
        });
    let field = match (path.is_empty(), named) {
        (true, Some(name)) => name,
        (false, Some(name)) => format!("{path}.{name}"),
        (false, None) => path,
        (true, None) => "<document>".to_string(),
    };
    MtError::Validation {
        field,
        message: detail,
    }
}

impl RunConfig {
    /// Parse and validate a YAML configuration document.
    pub fn from_yaml_str(text: &str) -> MtResult<Self> {
        let raw: RawRunConfig = serde_yaml::from_str(text).map_err(yaml_error)?;
        Self::from_raw(raw)
    }

    /// Validate a raw document into a run configuration.
    pub fn from_raw(raw: RawRunConfig) -> MtResult<Self> {
        non_empty("name", &raw.name)?;

        let extended_ner = raw.dataset.extended_ner;
        let ner_extension = match (raw.news_encoder.cfg_ner.extend_output_size, extended_ner) {
            (Some(_), false) => {
                return Err(validation_error!(
                    "news_encoder.cfg_ner.extend_output_size",
                    "is only meaningful when dataset.extended_NER is true"
                ))
            }
            (Some(extra), true) => Some(positive("news_encoder.cfg_ner.extend_output_size", extra)?),
            (None, true) => {
                return Err(validation_error!(
                    "news_encoder.cfg_ner.extend_output_size",
                    "is required when dataset.extended_NER is true"
                ))
            }
            (None, false) => None,
        };

        let head = |prefix: &str, h: &RawHead| -> MtResult<HeadConfig> {
            Ok(HeadConfig {
                hidden_size: positive(&format!("{prefix}.hidden_size"), h.hidden_size)?,
                num_layers: positive(&format!("{prefix}.num_layers"), h.num_layers)?,
                output_size: positive(&format!("{prefix}.output_size"), h.output_size)?,
            })
        };
        let ner = &raw.news_encoder.cfg_ner;
        let news_encoder = NewsEncoderConfig {
            cat: head("news_encoder.cfg_cat", &raw.news_encoder.cfg_cat)?,
            ner: head(
                "news_encoder.cfg_ner",
                &RawHead {
                    hidden_size: ner.hidden_size,
                    num_layers: ner.num_layers,
                    output_size: ner.output_size,
                },
            )?,
            ner_extension,
        };

        let t = &raw.trainer;
        let optimizer = OptimizerSettings {
            kind: t.optimizer.parse()?,
            momentum: coefficient("trainer.momentum", t.momentum.unwrap_or(0.9))?,
            beta1: coefficient("trainer.beta1", t.beta1.unwrap_or(0.9))?,
            beta2: coefficient("trainer.beta2", t.beta2.unwrap_or(0.999))?,
            eps: positive_f64("trainer.eps", t.eps.unwrap_or(1e-8))?,
            weight_decay: t
                .weight_decay
                .map(|wd| non_negative_f64("trainer.weight_decay", wd))
                .transpose()?,
        };
        let trainer = TrainerConfig {
            optimizer,
            epochs: positive("trainer.epochs", t.epochs)?,
            lr_user: positive_f64("trainer.lr_user", t.lr_user)?,
            lr_news: positive_f64("trainer.lr_news", t.lr_news)?,
            lr_bert: positive_f64("trainer.lr_bert", t.lr_bert)?,
            batch_size: positive("trainer.batch_size", t.batch_size)?,
            skip_main: t.skip_main,
            skip_cat: t.skip_cat,
            skip_ner: t.skip_ner,
            skip_gs: t.skip_gs,
            aux_scaler: non_negative_f64("trainer.aux_scaler", t.aux_scaler)?,
            val_every: positive("trainer.val_every", t.val_every.unwrap_or(1))?,
            save_dir: t.save_dir.clone(),
            scoring: t
                .scoring
                .as_deref()
                .map_or(Ok(Scoring::default()), str::parse)
                .map_err(|e: String| validation_error!("trainer.scoring", "{e}"))?,
        };
        trainer.active_tasks()?;

        let d = &raw.dataset;
        let dataset = DatasetConfig {
            data_dir: d.data_dir.clone(),
            history_size: positive("dataset.history_size", d.history_size)?,
            max_title_length: positive("dataset.max_title_length", d.max_title_length)?,
            npratio: positive("dataset.npratio", d.npratio)?,
            train_fraction: fraction("dataset.train_fraction", d.train_fraction)?,
            test_fraction: fraction("dataset.test_fraction", d.test_fraction)?,
            extended_ner,
        };

        non_empty("model.pretrained_model_name", &raw.model.pretrained_model_name)?;
        let model = ModelConfig {
            pretrained_model_name: raw.model.pretrained_model_name.clone(),
            hidden_size: positive("model.hidden_size", raw.model.hidden_size)?,
        };

        let l = &raw.lora_config;
        if l.target_modules.is_empty() {
            return Err(validation_error!("lora_config.target_modules", "must name at least one module"));
        }
        let bias = match l.bias.as_deref().unwrap_or("none") {
            "none" => LoraBias::None,
            "all" => LoraBias::All,
            "lora_only" => LoraBias::LoraOnly,
            other => {
                return Err(validation_error!(
                    "lora_config.bias",
                    "unknown bias policy `{other}` (expected none, all or lora_only)"
                ))
            }
        };
        let lora = LoraConfig {
            rank: positive("lora_config.r", l.r)?,
            alpha: positive_f64("lora_config.lora_alpha", l.lora_alpha)?,
            target_modules: l.target_modules.clone(),
            dropout: coefficient("lora_config.lora_dropout", l.lora_dropout)?,
            bias,
        };

        let mut config = Self {
            name: raw.name.clone(),
            max_val_bs: positive("max_val_bs", raw.max_val_bs)?,
            user_encoder: UserEncoderConfig {
                hidden_size: positive("user_encoder.hidden_size", raw.user_encoder.hidden_size)?,
            },
            news_encoder,
            trainer,
            dataset,
            model,
            lora,
            hypertuning: None,
        };

        if let Some(h) = &raw.hypertuning {
            config.hypertuning = Some(config.validate_hypertuning(h)?);
        }
        debug!(name = %config.name, "configuration validated");
        Ok(config)
    }

    fn validate_hypertuning(&self, h: &RawHypertuning) -> MtResult<HypertuningConfig> {
        let n_trials = positive("hypertuning.n_trials", h.n_trials)?;
        let strategy = match h.strategy.as_deref().unwrap_or("random") {
            "random" => SearchStrategyKind::Random,
            "adaptive" => SearchStrategyKind::Adaptive,
            other => {
                return Err(validation_error!(
                    "hypertuning.strategy",
                    "unknown strategy `{other}` (expected random or adaptive)"
                ))
            }
        };
        let exploration_weight = h.exploration_weight.unwrap_or(0.3);
        if !(0.0..=1.0).contains(&exploration_weight) {
            return Err(validation_error!(
                "hypertuning.exploration_weight",
                "must lie in [0, 1], got {exploration_weight}"
            ));
        }
        let metric: ObjectiveMetric = h
            .objective
            .as_deref()
            .unwrap_or("auc")
            .parse()
            .map_err(|e: String| validation_error!("hypertuning.objective", "{e}"))?;
        let direction = match h.direction.as_deref() {
            None => metric.natural_direction(),
            Some("maximize") => ObjectiveDirection::Maximize,
            Some("minimize") => ObjectiveDirection::Minimize,
            Some(other) => {
                return Err(validation_error!(
                    "hypertuning.direction",
                    "unknown direction `{other}` (expected maximize or minimize)"
                ))
            }
        };
        let lr_scale: Scale = h
            .lr_scale
            .as_deref()
            .unwrap_or("log")
            .parse()
            .map_err(|e: String| validation_error!("hypertuning.lr_scale", "{e}"))?;

        if h.space.is_empty() {
            return Err(validation_error!("hypertuning.space", "must declare at least one dimension"));
        }
        let mut dimensions = Vec::with_capacity(h.space.len());
        for (name, value) in &h.space {
            let field = format!("hypertuning.space.{name}");
            let dimension: HyperDimension = name
                .parse()
                .map_err(|e: String| validation_error!(&field, "{e}"))?;
            let raw_dim = RawDimension::from_yaml(&field, value)?;
            let domain = self.validate_dimension(&field, dimension, &raw_dim, lr_scale)?;
            dimensions.push(DimensionSpec { dimension, domain });
        }
        let declared = |dim: HyperDimension| dimensions.iter().any(|d| d.dimension == dim);
        if declared(HyperDimension::Lr) {
            if let Some(per_group) = [HyperDimension::LrUser, HyperDimension::LrNews]
                .into_iter()
                .find(|&dim| declared(dim))
            {
                return Err(validation_error!(
                    "hypertuning.space.lr",
                    "cannot be searched together with `{per_group}`; both set {per_group}"
                ));
            }
        }

        Ok(HypertuningConfig {
            n_trials,
            seed: h.seed,
            strategy,
            exploration_weight,
            objective: Objective { metric, direction },
            lr_scale,
            journal_dir: h.journal_dir.clone(),
            dimensions,
        })
    }

    fn validate_dimension(
        &self,
        field: &str,
        dimension: HyperDimension,
        raw: &RawDimension,
        lr_scale: Scale,
    ) -> MtResult<DimensionDomain> {
        // Every admissible value must also be a valid override of this config.
        let check = |value: serde_json::Value| -> MtResult<()> {
            self.with_override(dimension, &value).map(|_| ()).map_err(|e| match e {
                MtError::Validation { message, .. } => validation_error!(field, "{message}"),
                MtError::UnsupportedOptimizer { name } => {
                    validation_error!(field, "unsupported optimizer `{name}`")
                }
                other => other,
            })
        };

        match raw {
            RawDimension::Choices(values) => {
                if values.is_empty() {
                    return Err(validation_error!(field, "choice list must not be empty"));
                }
                for value in values {
                    check(value.clone())?;
                }
                Ok(DimensionDomain::Choices(values.clone()))
            }
            RawDimension::Range(range) => {
                if dimension.is_categorical() {
                    return Err(validation_error!(field, "only accepts a list of choices"));
                }
                if !(range.min.is_finite() && range.max.is_finite()) || range.min > range.max {
                    return Err(validation_error!(
                        field,
                        "range must satisfy min <= max, got [{}, {}]",
                        range.min,
                        range.max
                    ));
                }
                let scale = match &range.scale {
                    Some(s) => s.parse().map_err(|e: String| validation_error!(field, "{e}"))?,
                    None if dimension.is_learning_rate() => lr_scale,
                    None => Scale::Linear,
                };
                if dimension.is_integer() {
                    if scale == Scale::Log {
                        return Err(validation_error!(field, "integer ranges are sampled linearly"));
                    }
                    if range.min.fract() != 0.0 || range.max.fract() != 0.0 {
                        return Err(validation_error!(field, "integer range bounds must be whole numbers"));
                    }
                    let (min, max) = (range.min as i64, range.max as i64);
                    check(serde_json::json!(min))?;
                    check(serde_json::json!(max))?;
                    return Ok(DimensionDomain::IntRange { min, max });
                }
                if scale == Scale::Log && range.min <= 0.0 {
                    return Err(validation_error!(field, "log-scaled ranges need min > 0"));
                }
                check(serde_json::json!(range.min))?;
                check(serde_json::json!(range.max))?;
                Ok(match scale {
                    Scale::Log => DimensionDomain::LogRange { min: range.min, max: range.max },
                    Scale::Linear => DimensionDomain::FloatRange { min: range.min, max: range.max },
                })
            }
        }
    }

    /// Number of NER labels: the base label set plus the extension when the
    /// dataset uses extended NER labels.
    pub fn ner_label_count(&self) -> usize {
        let base = self.news_encoder.ner.output_size;
        if self.dataset.extended_ner {
            base + self.news_encoder.ner_extension.unwrap_or(0)
        } else {
            base
        }
    }

    /// Copy of this configuration with one sampled dimension applied.
    pub fn with_override(&self, dimension: HyperDimension, value: &serde_json::Value) -> MtResult<Self> {
        let field = format!("hypertuning.space.{dimension}");
        let as_int = || -> MtResult<i64> {
            match value.as_i64() {
                Some(v) => Ok(v),
                None => match value.as_f64() {
                    Some(f) if f.fract() == 0.0 => Ok(f as i64),
                    _ => Err(validation_error!(&field, "expected an integer, got {value}")),
                },
            }
        };
        let as_f64 = || -> MtResult<f64> {
            value
                .as_f64()
                .ok_or_else(|| validation_error!(&field, "expected a number, got {value}"))
        };

        let mut next = self.clone();
        match dimension {
            HyperDimension::HiddenSize => {
                let size = positive("news_encoder.cfg_cat.hidden_size", as_int()?)?;
                next.news_encoder.cat.hidden_size = size;
                next.news_encoder.ner.hidden_size = size;
                next.user_encoder.hidden_size = size;
            }
            HyperDimension::NumLayers => {
                let layers = positive("news_encoder.cfg_cat.num_layers", as_int()?)?;
                next.news_encoder.cat.num_layers = layers;
                next.news_encoder.ner.num_layers = layers;
            }
            HyperDimension::BatchSize => {
                next.trainer.batch_size = positive("trainer.batch_size", as_int()?)?;
            }
            HyperDimension::Lr => {
                let lr = positive_f64("trainer.lr_user", as_f64()?)?;
                next.trainer.lr_user = lr;
                next.trainer.lr_news = lr;
            }
            HyperDimension::LrUser => {
                next.trainer.lr_user = positive_f64("trainer.lr_user", as_f64()?)?;
            }
            HyperDimension::LrNews => {
                next.trainer.lr_news = positive_f64("trainer.lr_news", as_f64()?)?;
            }
            HyperDimension::LrBert => {
                next.trainer.lr_bert = positive_f64("trainer.lr_bert", as_f64()?)?;
            }
            HyperDimension::Optimizer => {
                let name = value
                    .as_str()
                    .ok_or_else(|| validation_error!(&field, "expected an optimizer name, got {value}"))?;
                next.trainer.optimizer.kind = name.parse()?;
            }
            HyperDimension::AuxScaler => {
                next.trainer.aux_scaler = non_negative_f64("trainer.aux_scaler", as_f64()?)?;
            }
        }
        Ok(next)
    }
}

/// Resolve a named configuration to a file and load it. `name` may be a path
/// to an existing file or the stem of `<dir>/<name>.yaml`.
pub fn load_configuration(name: &str, dir: &Path) -> MtResult<RunConfig> {
    let direct = Path::new(name);
    let candidates = [
        direct.to_path_buf(),
        dir.join(format!("{name}.yaml")),
        dir.join(format!("{name}.yml")),
    ];
    let path = candidates
        .iter()
        .find(|p| p.is_file())
        .ok_or_else(|| {
            validation_error!(
                "config",
                "no configuration named `{name}` (looked for {})",
                candidates[1].display()
            )
        })?;
    debug!(path = %path.display(), "loading configuration");
    let text = std::fs::read_to_string(path)?;
    RunConfig::from_yaml_str(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE_YAML: &str = r#"
name: unit
max_val_bs: 5
user_encoder:
  hidden_size: 64
news_encoder:
  cfg_cat:
    hidden_size: 64
    num_layers: 2
    output_size: 18
  cfg_ner:
    hidden_size: 64
    num_layers: 2
    output_size: 17
trainer:
  optimizer: adam
  epochs: 2
  lr_user: 0.001
  lr_news: 0.001
  lr_bert: 0.00001
  batch_size: 8
  skip_ner: true
  skip_gs: true
  aux_scaler: 0.3
dataset:
  data_dir: data/ebnerd_demo
  history_size: 10
  max_title_length: 30
  npratio: 4
  train_fraction: 1.0
  test_fraction: 0.5
model:
  pretrained_model_name: bert-base-multilingual-cased
  hidden_size: 768
lora_config:
  r: 8
  lora_alpha: 16.0
  target_modules: [query, value]
  lora_dropout: 0.1
"#;

    fn with_hypertuning(block: &str) -> String {
        format!("{BASE_YAML}hypertuning:\n{block}")
    }

    #[test]
    fn parses_base_document() {
        let config = RunConfig::from_yaml_str(BASE_YAML).unwrap();
        assert_eq!(config.name, "unit");
        assert_eq!(config.trainer.optimizer.kind, OptimizerKind::Adam);
        assert_eq!(config.trainer.epochs, 2);
        assert_eq!(config.trainer.val_every, 1);
        assert!(config.trainer.skip_ner && config.trainer.skip_gs);
        assert!(!config.trainer.skip_main && !config.trainer.skip_cat);
        assert_eq!(config.lora.bias, LoraBias::None);
        assert_eq!(config.lora.scaling(), 2.0);
        assert_eq!(config.ner_label_count(), 17);
        assert!(config.hypertuning.is_none());
    }

    #[test]
    fn negative_epochs_are_rejected() {
        let yaml = BASE_YAML.replace("epochs: 2", "epochs: -1");
        let err = RunConfig::from_yaml_str(&yaml).unwrap_err();
        assert_eq!(err.field(), Some("trainer.epochs"));
    }

    #[test]
    fn missing_field_names_the_field() {
        let yaml = BASE_YAML.replace("  batch_size: 8\n", "");
        let err = RunConfig::from_yaml_str(&yaml).unwrap_err();
        match err {
            MtError::Validation { field, message } => {
                assert!(field.ends_with("batch_size"), "field was {field}");
                assert!(message.contains("batch_size"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let yaml = BASE_YAML.replace("  aux_scaler: 0.3\n", "  aux_scaler: 0.3\n  warmup: 3\n");
        let err = RunConfig::from_yaml_str(&yaml).unwrap_err();
        match err {
            MtError::Validation { field, .. } => assert!(field.ends_with("warmup"), "field was {field}"),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn extension_without_extended_ner_is_ambiguous() {
        let yaml = BASE_YAML.replace("    output_size: 17\n", "    output_size: 17\n    extend_output_size: 4\n");
        let err = RunConfig::from_yaml_str(&yaml).unwrap_err();
        assert_eq!(err.field(), Some("news_encoder.cfg_ner.extend_output_size"));
    }

    #[test]
    fn extended_ner_adds_to_base_label_count() {
        let yaml = BASE_YAML
            .replace("    output_size: 17\n", "    output_size: 17\n    extend_output_size: 4\n")
            .replace("  test_fraction: 0.5\n", "  test_fraction: 0.5\n  extended_NER: true\n");
        let config = RunConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(config.ner_label_count(), 21);
    }

    #[test]
    fn unsupported_optimizer_fails_fast() {
        let yaml = BASE_YAML.replace("optimizer: adam", "optimizer: lbfgs");
        let err = RunConfig::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(err, MtError::UnsupportedOptimizer { ref name } if name == "lbfgs"));
    }

    #[test]
    fn all_tasks_skipped_is_a_configuration_error() {
        let yaml = BASE_YAML.replace(
            "  skip_ner: true\n",
            "  skip_ner: true\n  skip_main: true\n  skip_cat: true\n",
        );
        let err = RunConfig::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(err, MtError::Configuration(_)));
    }

    #[test]
    fn fractions_must_stay_in_unit_interval() {
        let yaml = BASE_YAML.replace("train_fraction: 1.0", "train_fraction: 1.5");
        let err = RunConfig::from_yaml_str(&yaml).unwrap_err();
        assert_eq!(err.field(), Some("dataset.train_fraction"));
    }

    #[test]
    fn hypertuning_block_is_typed() {
        let yaml = with_hypertuning(
            "  n_trials: 12\n  seed: 7\n  space:\n    hidden_size: [8, 16, 32]\n    num_layers: {min: 1, max: 3}\n    lr: {min: 0.000001, max: 0.005}\n    optimizer: [adam, sgd]\n",
        );
        let config = RunConfig::from_yaml_str(&yaml).unwrap();
        let h = config.hypertuning.unwrap();
        assert_eq!(h.n_trials, 12);
        assert_eq!(h.seed, Some(7));
        assert_eq!(h.objective, Objective::default());
        assert_eq!(h.lr_scale, Scale::Log);

        let domain = |dim: HyperDimension| {
            h.dimensions
                .iter()
                .find(|d| d.dimension == dim)
                .map(|d| d.domain.clone())
                .unwrap()
        };
        assert_eq!(domain(HyperDimension::NumLayers), DimensionDomain::IntRange { min: 1, max: 3 });
        assert_eq!(
            domain(HyperDimension::Lr),
            DimensionDomain::LogRange { min: 0.000001, max: 0.005 }
        );
        assert!(matches!(domain(HyperDimension::HiddenSize), DimensionDomain::Choices(ref v) if v.len() == 3));
    }

    #[test]
    fn linear_lr_policy_is_honoured() {
        let yaml = with_hypertuning("  n_trials: 3\n  lr_scale: linear\n  space:\n    lr_bert: {min: 0.000001, max: 0.00005}\n");
        let h = RunConfig::from_yaml_str(&yaml).unwrap().hypertuning.unwrap();
        assert!(matches!(h.dimensions[0].domain, DimensionDomain::FloatRange { .. }));
    }

    #[test]
    fn loss_objective_defaults_to_minimize() {
        let yaml = with_hypertuning("  n_trials: 3\n  objective: val_loss\n  space:\n    batch_size: [8, 16]\n");
        let h = RunConfig::from_yaml_str(&yaml).unwrap().hypertuning.unwrap();
        assert_eq!(h.objective.direction, ObjectiveDirection::Minimize);
    }

    #[test]
    fn undeclared_dimensions_are_rejected() {
        let yaml = with_hypertuning("  n_trials: 3\n  space:\n    dropout: [0.1, 0.2]\n");
        let err = RunConfig::from_yaml_str(&yaml).unwrap_err();
        assert_eq!(err.field(), Some("hypertuning.space.dropout"));
    }

    #[test]
    fn invalid_choices_are_rejected_before_search() {
        let yaml = with_hypertuning("  n_trials: 3\n  space:\n    optimizer: [adam, lbfgs]\n");
        let err = RunConfig::from_yaml_str(&yaml).unwrap_err();
        assert_eq!(err.field(), Some("hypertuning.space.optimizer"));

        let yaml = with_hypertuning("  n_trials: 3\n  space:\n    batch_size: [0, 16]\n");
        let err = RunConfig::from_yaml_str(&yaml).unwrap_err();
        assert_eq!(err.field(), Some("hypertuning.space.batch_size"));
    }

    #[test]
    fn inverted_and_empty_ranges_are_rejected() {
        let yaml = with_hypertuning("  n_trials: 3\n  space:\n    num_layers: {min: 3, max: 1}\n");
        assert!(RunConfig::from_yaml_str(&yaml).is_err());

        let yaml = with_hypertuning("  n_trials: 3\n  space:\n    hidden_size: []\n");
        assert!(RunConfig::from_yaml_str(&yaml).is_err());

        let yaml = with_hypertuning("  n_trials: 0\n  space:\n    hidden_size: [8]\n");
        let err = RunConfig::from_yaml_str(&yaml).unwrap_err();
        assert_eq!(err.field(), Some("hypertuning.n_trials"));
    }

    #[test]
    fn overrides_touch_only_the_sampled_dimension() {
        let base = RunConfig::from_yaml_str(BASE_YAML).unwrap();
        let next = base
            .with_override(HyperDimension::HiddenSize, &serde_json::json!(32))
            .unwrap();
        assert_eq!(next.news_encoder.cat.hidden_size, 32);
        assert_eq!(next.news_encoder.ner.hidden_size, 32);
        assert_eq!(next.user_encoder.hidden_size, 32);
        assert_eq!(next.trainer, base.trainer);

        let next = base
            .with_override(HyperDimension::Lr, &serde_json::json!(0.0005))
            .unwrap();
        assert_eq!(next.trainer.lr_user, 0.0005);
        assert_eq!(next.trainer.lr_news, 0.0005);
        assert_eq!(next.trainer.lr_bert, base.trainer.lr_bert);

        let next = base
            .with_override(HyperDimension::Optimizer, &serde_json::json!("sgd"))
            .unwrap();
        assert_eq!(next.trainer.optimizer.kind, OptimizerKind::Sgd);
    }

    #[test]
    fn loads_named_configuration_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("unit.yaml"), BASE_YAML).unwrap();
        let config = load_configuration("unit", dir.path()).unwrap();
        assert_eq!(config.name, "unit");

        let err = load_configuration("absent", dir.path()).unwrap_err();
        assert_eq!(err.field(), Some("config"));
    }

    #[test]
    fn malformed_ranges_name_their_dimension() {
        let yaml = with_hypertuning("  n_trials: 3\n  space:\n    num_layers: {min: 1, max: 3, step: 1}\n");
        match RunConfig::from_yaml_str(&yaml).unwrap_err() {
            MtError::Validation { field, message } => {
                assert_eq!(field, "hypertuning.space.num_layers");
                assert!(message.contains("step"), "message was {message}");
            }
            other => panic!("expected validation error, got {other:?}"),
        }

        let yaml = with_hypertuning("  n_trials: 3\n  space:\n    lr: 0.001\n");
        let err = RunConfig::from_yaml_str(&yaml).unwrap_err();
        assert_eq!(err.field(), Some("hypertuning.space.lr"));
    }

    #[test]
    fn shared_and_per_group_learning_rates_are_exclusive() {
        for per_group in ["lr_user", "lr_news"] {
            let yaml = with_hypertuning(&format!(
                "  n_trials: 3\n  space:\n    lr: {{min: 0.0001, max: 0.01}}\n    {per_group}: [0.001, 0.002]\n"
            ));
            let err = RunConfig::from_yaml_str(&yaml).unwrap_err();
            assert_eq!(err.field(), Some("hypertuning.space.lr"));
            assert!(err.to_string().contains(per_group));
        }

        let yaml = with_hypertuning(
            "  n_trials: 3\n  space:\n    lr_user: [0.001, 0.002]\n    lr_news: {min: 0.0001, max: 0.01}\n",
        );
        assert_eq!(RunConfig::from_yaml_str(&yaml).unwrap().hypertuning.unwrap().dimensions.len(), 2);
    }

    #[test]
    fn scoring_defaults_to_cross_product() {
        let config = RunConfig::from_yaml_str(BASE_YAML).unwrap();
        assert_eq!(config.trainer.scoring, Scoring::CrossProduct);

        let yaml = BASE_YAML.replace("  aux_scaler: 0.3\n", "  aux_scaler: 0.3\n  scoring: cosine_sim\n");
        let config = RunConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(config.trainer.scoring, Scoring::CosineSim);

        let yaml = BASE_YAML.replace("  aux_scaler: 0.3\n", "  aux_scaler: 0.3\n  scoring: euclidean\n");
        let err = RunConfig::from_yaml_str(&yaml).unwrap_err();
        assert_eq!(err.field(), Some("trainer.scoring"));
        assert!(err.to_string().contains("euclidean"));
    }
}
