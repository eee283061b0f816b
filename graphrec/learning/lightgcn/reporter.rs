use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::metrics::RankingMetrics;

/// Summary of one training epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    /// 1-based epoch number.
    pub epoch: usize,
    /// Mean total loss over the epoch's batches.
    pub loss: f32,
    /// Mean BPR term.
    pub mf_loss: f32,
    /// Mean regularization term.
    pub emb_loss: f32,
    /// Batches that contributed.
    pub batches: usize,
    /// Wall time spent training, in milliseconds.
    pub train_ms: u128,
    /// Test metrics, when the epoch was evaluated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<RankingMetrics>,
}

/// Report summarizing a complete `fit` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingReport {
    /// Run identifier.
    pub id: Uuid,
    /// Start of training.
    pub started_at: DateTime<Utc>,
    /// End of training.
    pub finished_at: DateTime<Utc>,
    /// Per-epoch summaries in order.
    pub epochs: Vec<EpochReport>,
}

impl TrainingReport {
    /// Epoch with the lowest loss.
    #[must_use]
    pub fn best(&self) -> Option<&EpochReport> {
        self.epochs.iter().min_by(|a, b| a.loss.total_cmp(&b.loss))
    }

    /// Last epoch.
    #[must_use]
    pub fn last(&self) -> Option<&EpochReport> {
        self.epochs.last()
    }

    /// Epochs that carry test metrics.
    pub fn evaluations(&self) -> impl Iterator<Item = (usize, &RankingMetrics)> {
        self.epochs
            .iter()
            .filter_map(|e| e.evaluation.as_ref().map(|m| (e.epoch, m)))
    }

    /// One-line summary.
    #[must_use]
    pub fn summary(&self) -> String {
        match self.last() {
            Some(last) => format!(
                "[LightGCN] epochs={} loss={:.5} mf={:.5} emb={:.5}",
                self.epochs.len(),
                last.loss,
                last.mf_loss,
                last.emb_loss
            ),
            None => "[LightGCN] no epochs run".to_string(),
        }
    }
}
