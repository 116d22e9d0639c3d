//! Search space definitions and sampling strategies.

use mtrec_types::{
    DimensionDomain, HyperDimension, HypertuningConfig, ObjectiveDirection, SearchStrategyKind,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single dimension of the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    pub dimension: HyperDimension,
    pub kind: ParameterKind,
}

/// Describes how a dimension is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Continuous uniform range [low, high].
    FloatRange { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
    /// Categorical choices.
    Choice { values: Vec<serde_json::Value> },
}

impl ParameterKind {
    /// Whether `value` could have been produced by sampling this kind.
    pub fn admits(&self, value: &ParameterValue) -> bool {
        match (self, value) {
            (Self::FloatRange { low, high } | Self::LogUniform { low, high }, ParameterValue::Float(v)) => {
                (*low..=*high).contains(v)
            }
            (Self::IntRange { low, high }, ParameterValue::Int(v)) => (*low..=*high).contains(v),
            (Self::Choice { values }, ParameterValue::Json(v)) => values.contains(v),
            _ => false,
        }
    }
}

/// A concrete value produced by a search strategy.
///
/// Serialized with an explicit `kind` tag: a choice of `16` and an integer
/// range draw of `16` are different values to [`ParameterKind::admits`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Json(serde_json::Value),
}

impl ParameterValue {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Float(v) => serde_json::json!(v),
            Self::Int(v) => serde_json::json!(v),
            Self::Json(v) => v.clone(),
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Json(serde_json::Value::String(s)) => f.write_str(s),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

/// One sampled point: a value per declared dimension.
pub type Point = BTreeMap<HyperDimension, ParameterValue>;

/// Render a point as `name=value` pairs.
pub fn describe(point: &Point) -> String {
    point
        .iter()
        .map(|(dim, value)| format!("{dim}={value}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// The full search space: an ordered list of dimensions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Space declared by a validated hypertuning block.
    pub fn from_config(config: &HypertuningConfig) -> Self {
        let parameters = config
            .dimensions
            .iter()
            .map(|declared| ParameterDef {
                dimension: declared.dimension,
                kind: match &declared.domain {
                    DimensionDomain::Choices(values) => ParameterKind::Choice { values: values.clone() },
                    DimensionDomain::IntRange { min, max } => ParameterKind::IntRange { low: *min, high: *max },
                    DimensionDomain::FloatRange { min, max } => ParameterKind::FloatRange { low: *min, high: *max },
                    DimensionDomain::LogRange { min, max } => ParameterKind::LogUniform { low: *min, high: *max },
                },
            })
            .collect();
        Self { parameters }
    }

    pub fn add_float(self, dimension: HyperDimension, low: f64, high: f64) -> Self {
        self.add(dimension, ParameterKind::FloatRange { low, high })
    }

    pub fn add_int(self, dimension: HyperDimension, low: i64, high: i64) -> Self {
        self.add(dimension, ParameterKind::IntRange { low, high })
    }

    pub fn add_log_uniform(self, dimension: HyperDimension, low: f64, high: f64) -> Self {
        self.add(dimension, ParameterKind::LogUniform { low, high })
    }

    pub fn add_choice(self, dimension: HyperDimension, values: Vec<serde_json::Value>) -> Self {
        self.add(dimension, ParameterKind::Choice { values })
    }

    fn add(mut self, dimension: HyperDimension, kind: ParameterKind) -> Self {
        self.parameters.push(ParameterDef { dimension, kind });
        self
    }

    pub fn get(&self, dimension: HyperDimension) -> Option<&ParameterKind> {
        self.parameters
            .iter()
            .find(|p| p.dimension == dimension)
            .map(|p| &p.kind)
    }

    pub fn contains(&self, dimension: HyperDimension) -> bool {
        self.get(dimension).is_some()
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }
}

fn sample(kind: &ParameterKind, rng: &mut StdRng) -> ParameterValue {
    match kind {
        ParameterKind::FloatRange { low, high } => ParameterValue::Float(rng.random_range(*low..=*high)),
        ParameterKind::IntRange { low, high } => ParameterValue::Int(rng.random_range(*low..=*high)),
        ParameterKind::LogUniform { low, high } => {
            let log_val: f64 = rng.random_range(low.ln()..=high.ln());
            ParameterValue::Float(log_val.exp().clamp(*low, *high))
        }
        ParameterKind::Choice { values } => {
            let idx = rng.random_range(0..values.len());
            ParameterValue::Json(values[idx].clone())
        }
    }
}

fn rng_from(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

// ---------------------------------------------------------------------------
// Search strategies
// ---------------------------------------------------------------------------

/// Common trait for all search strategies.
pub trait SearchStrategy {
    /// Propose the next point to evaluate.
    fn suggest(&mut self) -> Point;

    /// Report a completed trial so adaptive strategies can learn.
    fn report(&mut self, _point: &Point, _objective: f64) {}

    fn name(&self) -> &str;
}

/// Strategy selected by a hypertuning block.
pub fn build_strategy(config: &HypertuningConfig) -> Box<dyn SearchStrategy> {
    let space = SearchSpace::from_config(config);
    match config.strategy {
        SearchStrategyKind::Random => Box::new(RandomSearch::new(space, config.seed)),
        SearchStrategyKind::Adaptive => Box::new(AdaptiveSearch::new(
            space,
            config.seed,
            config.exploration_weight,
            config.objective.direction,
        )),
    }
}

// ---- Random search ----

/// Independent random sampling across the search space.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    space: SearchSpace,
    rng: StdRng,
}

impl RandomSearch {
    pub fn new(space: SearchSpace, seed: Option<u64>) -> Self {
        Self { space, rng: rng_from(seed) }
    }
}

impl SearchStrategy for RandomSearch {
    fn suggest(&mut self) -> Point {
        self.space
            .parameters
            .iter()
            .map(|p| (p.dimension, sample(&p.kind, &mut self.rng)))
            .collect()
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- Adaptive search ----

/// Explores with probability `exploration_weight`, otherwise perturbs the
/// best point observed so far.
#[derive(Debug, Clone)]
pub struct AdaptiveSearch {
    space: SearchSpace,
    rng: StdRng,
    observations: Vec<(Point, f64)>,
    exploration_weight: f64,
    direction: ObjectiveDirection,
}

impl AdaptiveSearch {
    pub fn new(
        space: SearchSpace,
        seed: Option<u64>,
        exploration_weight: f64,
        direction: ObjectiveDirection,
    ) -> Self {
        Self {
            space,
            rng: rng_from(seed),
            observations: Vec::new(),
            exploration_weight,
            direction,
        }
    }

    fn explore(&mut self) -> Point {
        self.space
            .parameters
            .iter()
            .map(|p| (p.dimension, sample(&p.kind, &mut self.rng)))
            .collect()
    }

    fn best(&self) -> Option<&Point> {
        let mut best: Option<&(Point, f64)> = None;
        for obs in &self.observations {
            let better = match best {
                None => true,
                Some(current) => self.direction.improves(obs.1, current.1),
            };
            if better {
                best = Some(obs);
            }
        }
        best.map(|(point, _)| point)
    }

    /// Perturb the best-known point within each dimension's bounds.
    fn exploit(&mut self) -> Point {
        let Some(base) = self.best().cloned() else {
            return self.explore();
        };

        let mut perturbed = Point::new();
        for param in &self.space.parameters {
            let value = match (&param.kind, base.get(&param.dimension)) {
                (ParameterKind::FloatRange { low, high }, Some(ParameterValue::Float(v))) => {
                    let noise = self.rng.random_range(-0.1f64..=0.1) * (high - low);
                    ParameterValue::Float((v + noise).clamp(*low, *high))
                }
                (ParameterKind::IntRange { low, high }, Some(ParameterValue::Int(v))) => {
                    let delta: i64 = self.rng.random_range(-1..=1);
                    ParameterValue::Int((v + delta).clamp(*low, *high))
                }
                (ParameterKind::LogUniform { low, high }, Some(ParameterValue::Float(v))) => {
                    let log_range = high.ln() - low.ln();
                    let noise = self.rng.random_range(-0.1f64..=0.1) * log_range;
                    ParameterValue::Float((v.ln() + noise).exp().clamp(*low, *high))
                }
                (ParameterKind::Choice { .. }, Some(current @ ParameterValue::Json(_)))
                    if self.rng.random::<f64>() >= 0.2 =>
                {
                    current.clone()
                }
                (kind, _) => sample(kind, &mut self.rng),
            };
            perturbed.insert(param.dimension, value);
        }
        perturbed
    }
}

impl SearchStrategy for AdaptiveSearch {
    fn suggest(&mut self) -> Point {
        if self.observations.is_empty() || self.rng.random::<f64>() < self.exploration_weight {
            self.explore()
        } else {
            self.exploit()
        }
    }

    fn report(&mut self, point: &Point, objective: f64) {
        self.observations.push((point.clone(), objective));
    }

    fn name(&self) -> &str {
        "adaptive"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_space() -> SearchSpace {
        SearchSpace::new()
            .add_choice(HyperDimension::HiddenSize, vec![json!(8), json!(16), json!(32)])
            .add_int(HyperDimension::NumLayers, 1, 3)
            .add_log_uniform(HyperDimension::Lr, 0.0001, 0.01)
            .add_float(HyperDimension::AuxScaler, 0.1, 0.5)
    }

    fn assert_within(space: &SearchSpace, point: &Point) {
        assert_eq!(point.len(), space.len());
        for (dim, value) in point {
            let kind = space.get(*dim).unwrap();
            assert!(kind.admits(value), "{dim}={value} outside {kind:?}");
        }
    }

    #[test]
    fn random_samples_stay_in_their_domains() {
        let space = sample_space();
        let mut rs = RandomSearch::new(space.clone(), Some(3));
        let mut layers = std::collections::BTreeSet::new();
        for _ in 0..200 {
            let point = rs.suggest();
            assert_within(&space, &point);
            if let Some(ParameterValue::Int(v)) = point.get(&HyperDimension::NumLayers) {
                layers.insert(*v);
            }
        }
        // Inclusive integer interval: both ends are reachable.
        assert_eq!(layers.into_iter().collect::<Vec<_>>(), [1, 2, 3]);
    }

    #[test]
    fn seeded_strategies_are_reproducible() {
        let mut a = RandomSearch::new(sample_space(), Some(11));
        let mut b = RandomSearch::new(sample_space(), Some(11));
        for _ in 0..10 {
            assert_eq!(a.suggest(), b.suggest());
        }
    }

    #[test]
    fn log_uniform_covers_orders_of_magnitude() {
        let space = SearchSpace::new().add_log_uniform(HyperDimension::LrBert, 0.000001, 0.01);
        let mut rs = RandomSearch::new(space, Some(5));
        let below: usize = (0..400)
            .filter(|_| match rs.suggest()[&HyperDimension::LrBert] {
                ParameterValue::Float(v) => v < 0.0001,
                _ => false,
            })
            .count();
        // Half of the log range lies below 1e-4; a linear sampler would put
        // about 1% there.
        assert!(below > 120, "only {below} samples below 1e-4");
    }

    #[test]
    fn adaptive_search_starts_with_exploration() {
        let space = sample_space();
        let mut search = AdaptiveSearch::new(space.clone(), Some(1), 0.3, ObjectiveDirection::Maximize);
        for _ in 0..10 {
            assert_within(&space, &search.suggest());
        }
    }

    #[test]
    fn adaptive_search_exploits_the_best_point() {
        let space = SearchSpace::new()
            .add_float(HyperDimension::AuxScaler, 0.0, 1.0)
            .add_int(HyperDimension::NumLayers, 1, 10);
        let mut search = AdaptiveSearch::new(space.clone(), Some(9), 0.0, ObjectiveDirection::Minimize);

        let good = Point::from([
            (HyperDimension::AuxScaler, ParameterValue::Float(0.5)),
            (HyperDimension::NumLayers, ParameterValue::Int(5)),
        ]);
        let bad = Point::from([
            (HyperDimension::AuxScaler, ParameterValue::Float(0.95)),
            (HyperDimension::NumLayers, ParameterValue::Int(9)),
        ]);
        search.report(&bad, 2.0);
        search.report(&good, 1.0);

        for _ in 0..50 {
            let point = search.suggest();
            assert_within(&space, &point);
            match (&point[&HyperDimension::AuxScaler], &point[&HyperDimension::NumLayers]) {
                (ParameterValue::Float(a), ParameterValue::Int(n)) => {
                    assert!((0.4..=0.6).contains(a), "aux_scaler {a}");
                    assert!((4..=6).contains(n), "num_layers {n}");
                }
                other => panic!("unexpected point {other:?}"),
            }
        }
    }

    #[test]
    fn parameter_values_render_for_overrides() {
        assert_eq!(ParameterValue::Int(16).to_json(), json!(16));
        assert_eq!(ParameterValue::Json(json!("adamw")).to_string(), "adamw");
        let point = Point::from([
            (HyperDimension::BatchSize, ParameterValue::Int(8)),
            (HyperDimension::Optimizer, ParameterValue::Json(json!("sgd"))),
        ]);
        assert_eq!(describe(&point), "batch_size=8 optimizer=sgd");
    }
}
