//! Ranking metrics over validation impressions.

use mtrec_types::ObjectiveMetric;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::Impression;

/// Area under the ROC curve of one impression. Ties count half.
/// `None` unless the impression has both clicked and unclicked candidates.
pub fn auc(scores: &[f64], labels: &[f64]) -> Option<f64> {
    let mut pairs = 0usize;
    let mut wins = 0.0;
    for (sp, _) in scores.iter().zip(labels).filter(|&(_, &y)| y > 0.0) {
        for (sn, _) in scores.iter().zip(labels).filter(|&(_, &y)| y <= 0.0) {
            pairs += 1;
            if sp > sn {
                wins += 1.0;
            } else if sp == sn {
                wins += 0.5;
            }
        }
    }
    (pairs > 0).then(|| wins / pairs as f64)
}

/// Candidate positions sorted by descending score; ties keep input order.
fn ranking(scores: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    order
}

/// Mean reciprocal rank of the clicked candidates.
pub fn mrr(scores: &[f64], labels: &[f64]) -> Option<f64> {
    let clicked: f64 = labels.iter().sum();
    if clicked <= 0.0 {
        return None;
    }
    let rr: f64 = ranking(scores)
        .iter()
        .enumerate()
        .map(|(rank, &i)| labels[i] / (rank + 1) as f64)
        .sum();
    Some(rr / clicked)
}

fn dcg(gains: impl Iterator<Item = f64>, k: usize) -> f64 {
    gains
        .take(k)
        .enumerate()
        .map(|(rank, rel)| (2f64.powf(rel) - 1.0) / ((rank + 2) as f64).log2())
        .sum()
}

/// Normalized discounted cumulative gain at `k`.
pub fn ndcg(scores: &[f64], labels: &[f64], k: usize) -> Option<f64> {
    let mut ideal = labels.to_vec();
    ideal.sort_by(|a, b| b.total_cmp(a));
    let best = dcg(ideal.into_iter(), k);
    if best <= 0.0 {
        return None;
    }
    let actual = dcg(ranking(scores).into_iter().map(|i| labels[i]), k);
    Some(actual / best)
}

/// Impression-averaged ranking metrics. A metric is `None` when no
/// impression could be scored for it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RankingSummary {
    pub auc: Option<f64>,
    pub mrr: Option<f64>,
    pub ndcg5: Option<f64>,
    pub ndcg10: Option<f64>,
    pub impressions: usize,
}

#[derive(Default)]
struct Sums {
    auc: (f64, usize),
    mrr: (f64, usize),
    ndcg5: (f64, usize),
    ndcg10: (f64, usize),
}

fn add(acc: &mut (f64, usize), value: Option<f64>) {
    if let Some(v) = value {
        acc.0 += v;
        acc.1 += 1;
    }
}

fn merge(a: (f64, usize), b: (f64, usize)) -> (f64, usize) {
    (a.0 + b.0, a.1 + b.1)
}

fn mean((sum, n): (f64, usize)) -> Option<f64> {
    (n > 0).then(|| sum / n as f64)
}

/// Score every impression in parallel and average.
pub fn evaluate(impressions: &[Impression]) -> RankingSummary {
    let sums = impressions
        .par_iter()
        .fold(Sums::default, |mut acc, imp| {
            add(&mut acc.auc, auc(&imp.scores, &imp.labels));
            add(&mut acc.mrr, mrr(&imp.scores, &imp.labels));
            add(&mut acc.ndcg5, ndcg(&imp.scores, &imp.labels, 5));
            add(&mut acc.ndcg10, ndcg(&imp.scores, &imp.labels, 10));
            acc
        })
        .reduce(Sums::default, |a, b| Sums {
            auc: merge(a.auc, b.auc),
            mrr: merge(a.mrr, b.mrr),
            ndcg5: merge(a.ndcg5, b.ndcg5),
            ndcg10: merge(a.ndcg10, b.ndcg10),
        });

    RankingSummary {
        auc: mean(sums.auc),
        mrr: mean(sums.mrr),
        ndcg5: mean(sums.ndcg5),
        ndcg10: mean(sums.ndcg10),
        impressions: impressions.len(),
    }
}

/// Outcome of one validation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Mean composite loss over the scored batches.
    pub loss: f64,
    /// Mean main-task loss, when the model reported one.
    pub main_loss: Option<f64>,
    pub ranking: RankingSummary,
    pub batches: usize,
    pub skipped: usize,
}

impl ValidationReport {
    pub fn metric(&self, metric: ObjectiveMetric) -> Option<f64> {
        match metric {
            ObjectiveMetric::Auc => self.ranking.auc,
            ObjectiveMetric::Mrr => self.ranking.mrr,
            ObjectiveMetric::Ndcg5 => self.ranking.ndcg5,
            ObjectiveMetric::Ndcg10 => self.ranking.ndcg10,
            ObjectiveMetric::ValLoss => Some(self.loss),
            ObjectiveMetric::ValMainLoss => self.main_loss,
        }
    }

    /// Metric map keyed by [`ObjectiveMetric::key`]; absent metrics are left out.
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        ObjectiveMetric::ALL
            .into_iter()
            .filter_map(|m| self.metric(m).map(|v| (m.key().to_string(), v)))
            .collect()
    }
}
