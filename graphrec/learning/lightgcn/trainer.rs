use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use thiserror::Error;
use uuid::Uuid;

use super::{
    model::{LightGcn, ModelError},
    optimizer::{Adam, AdamConfig},
    reporter::{EpochReport, TrainingReport},
    savor::CheckpointSavor,
};
use crate::{
    dataset::ImplicitCf,
    graph::NormalizedAdjacency,
    metrics::{Metric, RankingMetrics},
    recommend::{recommend_for_test_users, RecommendError},
    telemetry::{self, LearningTelemetry},
};

/// Training hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Adam learning rate.
    pub learning_rate: f32,
    /// Number of epochs.
    pub epochs: usize,
    /// Triplets per mini-batch.
    pub batch_size: usize,
    /// Evaluate on the test split every this many epochs.
    pub eval_epoch: Option<usize>,
    /// Write a checkpoint every this many epochs.
    pub save_epoch: Option<usize>,
    /// Checkpoints retained on disk.
    pub max_to_keep: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.005,
            epochs: 50,
            batch_size: 1024,
            eval_epoch: None,
            save_epoch: None,
            max_to_keep: 5,
        }
    }
}

/// Ranking evaluation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Recommendation list length.
    pub top_k: usize,
    /// Metrics to report.
    pub metrics: Vec<Metric>,
    /// Exclude training items from recommendations.
    pub remove_seen: bool,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            metrics: Metric::ALL.to_vec(),
            remove_seen: true,
        }
    }
}

/// Runs mini-batch BPR optimization of a [`LightGcn`] model.
#[derive(Debug)]
pub struct Trainer {
    config: TrainingConfig,
    optimizer: Adam,
}

impl Trainer {
    /// Creates a new trainer.
    #[must_use]
    pub fn new(config: TrainingConfig) -> Self {
        let optimizer = Adam::new(AdamConfig {
            learning_rate: config.learning_rate,
            ..AdamConfig::default()
        });
        Self { config, optimizer }
    }

    /// Training hyperparameters.
    #[must_use]
    pub const fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Trains `model` on `data`, evaluating and checkpointing as configured.
    ///
    /// Each epoch runs `train_len / batch_size + 1` batches. The model's final
    /// embeddings are refreshed before returning, so it is ready to score.
    pub fn fit(
        &mut self,
        model: &mut LightGcn,
        data: &mut ImplicitCf,
        adj: &NormalizedAdjacency,
        evaluation: &EvaluationConfig,
        mut savor: Option<&mut CheckpointSavor>,
        telemetry: Option<&LearningTelemetry>,
    ) -> Result<TrainingReport, TrainError> {
        if self.config.batch_size == 0 {
            return Err(TrainError::InvalidConfig("batch_size must be positive"));
        }
        let started_at = Utc::now();
        let n_batches = data.train_len() / self.config.batch_size + 1;
        telemetry::log(
            telemetry,
            LogLevel::Info,
            "training_started",
            json!({
                "epochs": self.config.epochs,
                "batch_size": self.config.batch_size,
                "batches_per_epoch": n_batches,
                "n_users": data.n_users(),
                "n_items": data.n_items(),
            }),
        );

        let mut epochs = Vec::with_capacity(self.config.epochs);
        for epoch in 1..=self.config.epochs {
            let timer = Instant::now();
            let (mut loss, mut mf_loss, mut emb_loss) = (0.0_f32, 0.0_f32, 0.0_f32);
            let mut batches = 0usize;
            for _ in 0..n_batches {
                let batch = data.sample_batch(self.config.batch_size);
                if batch.is_empty() {
                    continue;
                }
                let (step, grad) = model.bpr_gradients(adj, &batch)?;
                self.optimizer.step(model.embeddings_mut(), &grad);
                loss += step.total();
                mf_loss += step.mf_loss;
                emb_loss += step.emb_loss;
                batches += 1;
            }
            if batches == 0 {
                return Err(TrainError::NoTrainablePairs);
            }
            #[allow(clippy::cast_precision_loss)]
            let denom = batches as f32;
            let mut report = EpochReport {
                epoch,
                loss: loss / denom,
                mf_loss: mf_loss / denom,
                emb_loss: emb_loss / denom,
                batches,
                train_ms: timer.elapsed().as_millis(),
                evaluation: None,
            };

            if is_due(self.config.eval_epoch, epoch) {
                model.refresh(adj)?;
                let predictions =
                    recommend_for_test_users(model, data, evaluation.top_k, evaluation.remove_seen)?;
                let metrics =
                    RankingMetrics::compute(data.test().rows(), &predictions, evaluation.top_k);
                let selected: serde_json::Map<String, serde_json::Value> = evaluation
                    .metrics
                    .iter()
                    .map(|m| (m.to_string(), json!(metrics.get(*m))))
                    .collect();
                telemetry::event(
                    telemetry,
                    "training.evaluated",
                    json!({ "epoch": epoch, "top_k": evaluation.top_k, "metrics": selected }),
                );
                report.evaluation = Some(metrics);
            }

            telemetry::log(
                telemetry,
                LogLevel::Info,
                "epoch_completed",
                json!({
                    "epoch": epoch,
                    "loss": report.loss,
                    "mf_loss": report.mf_loss,
                    "emb_loss": report.emb_loss,
                    "train_ms": u64::try_from(report.train_ms).unwrap_or(u64::MAX),
                    "evaluation": report.evaluation,
                }),
            );
            telemetry::event(
                telemetry,
                "training.epoch_completed",
                json!({ "epoch": epoch, "loss": report.loss }),
            );

            if is_due(self.config.save_epoch, epoch) {
                if let Some(savor) = savor.as_deref_mut() {
                    let saved = savor.store(model, epoch, report.loss)?;
                    telemetry::log(
                        telemetry,
                        LogLevel::Debug,
                        "checkpoint_saved",
                        json!({ "epoch": epoch, "path": saved.path }),
                    );
                }
            }
            epochs.push(report);
        }

        model.refresh(adj)?;
        let report = TrainingReport {
            id: Uuid::new_v4(),
            started_at,
            finished_at: Utc::now(),
            epochs,
        };
        telemetry::log(
            telemetry,
            LogLevel::Info,
            "training_completed",
            json!({
                "run_id": report.id,
                "epochs": report.epochs.len(),
                "final_loss": report.last().map(|e| e.loss),
            }),
        );
        Ok(report)
    }
}

fn is_due(every: Option<usize>, epoch: usize) -> bool {
    matches!(every, Some(n) if n > 0 && epoch % n == 0)
}

/// Errors raised during training.
#[derive(Debug, Error)]
pub enum TrainError {
    /// Unusable hyperparameters.
    #[error("invalid training config: {0}")]
    InvalidConfig(&'static str),
    /// No user has both a positive and a negative item.
    #[error("no user has a sampleable (positive, negative) pair")]
    NoTrainablePairs,
    /// Model failure (divergence, shape mismatch, checkpoint I/O).
    #[error(transparent)]
    Model(#[from] ModelError),
    /// Periodic evaluation failed.
    #[error(transparent)]
    Recommend(#[from] RecommendError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::{Interaction, InteractionTable},
        lightgcn::model::LightGcnConfig,
    };
    use shared_event_bus::MemoryEventBus;
    use std::sync::Arc;
    use tempfile::tempdir;

    // Two communities: users 1-3 like items 10-13, users 4-6 like items 20-23.
    fn communities() -> ImplicitCf {
        let mut train = Vec::new();
        let mut test = Vec::new();
        for (users, items) in [(1..=3u32, 10..=13u32), (4..=6, 20..=23)] {
            for user in users {
                for item in items.clone() {
                    let row = Interaction::new(user, item, 5.0, 0);
                    if (user + item) % 4 == 0 {
                        test.push(row);
                    } else {
                        train.push(row);
                    }
                }
            }
        }
        ImplicitCf::new(InteractionTable::new(train), InteractionTable::new(test), 5).unwrap()
    }

    fn model_for(data: &ImplicitCf) -> LightGcn {
        LightGcn::new(
            data.n_users(),
            data.n_items(),
            LightGcnConfig {
                embed_size: 8,
                n_layers: 2,
                decay: 1e-4,
                seed: 3,
            },
        )
    }

    #[test]
    fn fit_reduces_loss_and_evaluates() {
        let mut data = communities();
        let adj = NormalizedAdjacency::build(&data);
        let mut model = model_for(&data);
        let mut trainer = Trainer::new(TrainingConfig {
            learning_rate: 0.05,
            epochs: 40,
            batch_size: 4,
            eval_epoch: Some(20),
            ..TrainingConfig::default()
        });
        let evaluation = EvaluationConfig {
            top_k: 2,
            ..EvaluationConfig::default()
        };
        let report = trainer
            .fit(&mut model, &mut data, &adj, &evaluation, None, None)
            .unwrap();

        assert_eq!(report.epochs.len(), 40);
        let first = report.epochs.first().unwrap().loss;
        let last = report.last().unwrap().loss;
        assert!(last < first * 0.8, "first {first} last {last}");
        assert_eq!(report.evaluations().count(), 2);
        assert!(model.is_ready());
    }

    #[test]
    fn fit_emits_events_and_checkpoints() {
        let mut data = communities();
        let adj = NormalizedAdjacency::build(&data);
        let mut model = model_for(&data);
        let dir = tempdir().unwrap();
        let bus = Arc::new(MemoryEventBus::new(64));
        let telemetry = LearningTelemetry::builder("graphrec")
            .log_path(dir.path().join("train.log"))
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        let mut savor = CheckpointSavor::new(dir.path().join("model"), 2);
        let mut trainer = Trainer::new(TrainingConfig {
            epochs: 4,
            batch_size: 8,
            save_epoch: Some(1),
            max_to_keep: 2,
            ..TrainingConfig::default()
        });
        trainer
            .fit(
                &mut model,
                &mut data,
                &adj,
                &EvaluationConfig::default(),
                Some(&mut savor),
                Some(&telemetry),
            )
            .unwrap();

        assert_eq!(bus.by_prefix("training.epoch_completed").len(), 4);
        assert!(bus.by_prefix("training.evaluated").is_empty());
        assert_eq!(savor.iter().map(|c| c.epoch).collect::<Vec<_>>(), vec![3, 4]);
        assert!(dir.path().join("model/epoch_4.json").exists());
        let log = std::fs::read_to_string(dir.path().join("train.log")).unwrap();
        assert!(log.contains("training_completed"));
        assert!(log.contains("\"train_ms\":"));
    }

    #[test]
    fn rejects_zero_batch_size() {
        let mut data = communities();
        let adj = NormalizedAdjacency::build(&data);
        let mut model = model_for(&data);
        let mut trainer = Trainer::new(TrainingConfig {
            batch_size: 0,
            ..TrainingConfig::default()
        });
        let err = trainer
            .fit(&mut model, &mut data, &adj, &EvaluationConfig::default(), None, None)
            .unwrap_err();
        assert!(matches!(err, TrainError::InvalidConfig(_)));
    }

    #[test]
    fn due_schedule() {
        assert!(is_due(Some(5), 10));
        assert!(!is_due(Some(5), 11));
        assert!(!is_due(Some(0), 3));
        assert!(!is_due(None, 3));
    }
}
