use std::{
    collections::{HashMap, HashSet},
    fmt,
    str::FromStr,
};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::Interaction;

/// Scored recommendation for a user.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Original user identifier.
    pub user: u32,
    /// Original item identifier.
    pub item: u32,
    /// Predicted preference; higher ranks first.
    pub score: f32,
}

impl Prediction {
    /// Creates a prediction.
    #[must_use]
    pub const fn new(user: u32, item: u32, score: f32) -> Self {
        Self { user, item, score }
    }
}

/// Ranking metric selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Mean average precision at k.
    Map,
    /// Normalized discounted cumulative gain at k.
    Ndcg,
    /// Precision at k.
    Precision,
    /// Recall at k.
    Recall,
}

impl Metric {
    /// Every metric, in reporting order.
    pub const ALL: [Self; 4] = [Self::Map, Self::Ndcg, Self::Precision, Self::Recall];

    /// Evaluates this metric.
    #[must_use]
    pub fn evaluate(self, rating_true: &[Interaction], rating_pred: &[Prediction], k: usize) -> f64 {
        let ctx = RankingContext::new(rating_true, rating_pred, k);
        match self {
            Self::Map => ctx.map(MapNormalization::TopK),
            Self::Ndcg => ctx.ndcg(),
            Self::Precision => ctx.precision(),
            Self::Recall => ctx.recall(),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Map => "map",
            Self::Ndcg => "ndcg",
            Self::Precision => "precision",
            Self::Recall => "recall",
        })
    }
}

impl FromStr for Metric {
    type Err = MetricError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "map" | "map_at_k" => Ok(Self::Map),
            "ndcg" | "ndcg_at_k" => Ok(Self::Ndcg),
            "precision" | "precision_at_k" => Ok(Self::Precision),
            "recall" | "recall_at_k" => Ok(Self::Recall),
            other => Err(MetricError::Unknown(other.to_string())),
        }
    }
}

/// The four ranking metrics computed in one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RankingMetrics {
    /// MAP@k.
    pub map: f64,
    /// NDCG@k.
    pub ndcg: f64,
    /// Precision@k.
    pub precision: f64,
    /// Recall@k.
    pub recall: f64,
}

impl RankingMetrics {
    /// Computes every metric over the same top-k lists.
    #[must_use]
    pub fn compute(rating_true: &[Interaction], rating_pred: &[Prediction], k: usize) -> Self {
        let ctx = RankingContext::new(rating_true, rating_pred, k);
        Self {
            map: ctx.map(MapNormalization::TopK),
            ndcg: ctx.ndcg(),
            precision: ctx.precision(),
            recall: ctx.recall(),
        }
    }

    /// Value of one metric.
    #[must_use]
    pub const fn get(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Map => self.map,
            Metric::Ndcg => self.ndcg,
            Metric::Precision => self.precision,
            Metric::Recall => self.recall,
        }
    }
}

/// Precision@k averaged over users present in both inputs.
#[must_use]
pub fn precision_at_k(rating_true: &[Interaction], rating_pred: &[Prediction], k: usize) -> f64 {
    RankingContext::new(rating_true, rating_pred, k).precision()
}

/// Recall@k averaged over users present in both inputs.
#[must_use]
pub fn recall_at_k(rating_true: &[Interaction], rating_pred: &[Prediction], k: usize) -> f64 {
    RankingContext::new(rating_true, rating_pred, k).recall()
}

/// NDCG@k with binary relevance.
#[must_use]
pub fn ndcg_at_k(rating_true: &[Interaction], rating_pred: &[Prediction], k: usize) -> f64 {
    RankingContext::new(rating_true, rating_pred, k).ndcg()
}

/// MAP@k; each user's average precision is divided by `min(|relevant|, k)`.
#[must_use]
pub fn map_at_k(rating_true: &[Interaction], rating_pred: &[Prediction], k: usize) -> f64 {
    RankingContext::new(rating_true, rating_pred, k).map(MapNormalization::TopK)
}

/// MAP over the top-k lists; each user's average precision is divided by `|relevant|`.
#[must_use]
pub fn map(rating_true: &[Interaction], rating_pred: &[Prediction], k: usize) -> f64 {
    RankingContext::new(rating_true, rating_pred, k).map(MapNormalization::Relevant)
}

#[derive(Clone, Copy)]
enum MapNormalization {
    TopK,
    Relevant,
}

struct UserRanking {
    relevant: usize,
    // 1-based ranks of hits within the top-k list, ascending.
    hit_ranks: Vec<usize>,
}

struct RankingContext {
    k: usize,
    users: Vec<UserRanking>,
}

impl RankingContext {
    fn new(rating_true: &[Interaction], rating_pred: &[Prediction], k: usize) -> Self {
        let mut truth: HashMap<u32, HashSet<u32>> = HashMap::new();
        for row in rating_true {
            truth.entry(row.user).or_default().insert(row.item);
        }
        // Users are visited in prediction order so averages are reproducible.
        let mut predicted: IndexMap<u32, Vec<&Prediction>> = IndexMap::new();
        for pred in rating_pred {
            predicted.entry(pred.user).or_default().push(pred);
        }

        let mut users = Vec::new();
        for (user, mut preds) in predicted {
            let Some(relevant) = truth.get(&user) else {
                continue;
            };
            // Stable sort keeps input order among equal scores.
            preds.sort_by(|a, b| b.score.total_cmp(&a.score));
            let mut seen = HashSet::new();
            let hit_ranks = preds
                .iter()
                .filter(|p| seen.insert(p.item))
                .take(k)
                .enumerate()
                .filter(|(_, p)| relevant.contains(&p.item))
                .map(|(idx, _)| idx + 1)
                .collect();
            users.push(UserRanking {
                relevant: relevant.len(),
                hit_ranks,
            });
        }
        Self { k, users }
    }

    #[allow(clippy::cast_precision_loss)]
    fn mean(&self, per_user: impl Fn(&UserRanking) -> f64) -> f64 {
        if self.users.is_empty() || self.k == 0 {
            return 0.0;
        }
        self.users.iter().map(per_user).sum::<f64>() / self.users.len() as f64
    }

    #[allow(clippy::cast_precision_loss)]
    fn precision(&self) -> f64 {
        let k = self.k as f64;
        self.mean(|u| u.hit_ranks.len() as f64 / k)
    }

    #[allow(clippy::cast_precision_loss)]
    fn recall(&self) -> f64 {
        self.mean(|u| u.hit_ranks.len() as f64 / u.relevant as f64)
    }

    fn ndcg(&self) -> f64 {
        self.mean(|u| {
            let dcg: f64 = u.hit_ranks.iter().map(|&rank| discount(rank)).sum();
            let idcg: f64 = (1..=u.relevant.min(self.k)).map(discount).sum();
            if idcg > 0.0 {
                dcg / idcg
            } else {
                0.0
            }
        })
    }

    #[allow(clippy::cast_precision_loss)]
    fn map(&self, normalization: MapNormalization) -> f64 {
        self.mean(|u| {
            let sum: f64 = u
                .hit_ranks
                .iter()
                .enumerate()
                .map(|(hits_so_far, &rank)| (hits_so_far + 1) as f64 / rank as f64)
                .sum();
            let denom = match normalization {
                MapNormalization::TopK => u.relevant.min(self.k),
                MapNormalization::Relevant => u.relevant,
            };
            sum / denom.max(1) as f64
        })
    }
}

#[allow(clippy::cast_precision_loss)]
fn discount(rank: usize) -> f64 {
    1.0 / ((rank + 1) as f64).log2()
}

/// Errors raised when parsing metric names.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetricError {
    /// Unrecognized metric name.
    #[error("unknown metric `{0}`")]
    Unknown(String),
}
