//! End-to-end LightGCN experiment: load, split, build the graph, train, evaluate, export.

use std::{fs, path::Path, sync::Arc, time::Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use ndarray::Axis;
use serde_json::json;
use shared_event_bus::FileEventPublisher;
use shared_logging::LogLevel;
use uuid::Uuid;

use crate::{
    config::{ExperimentConfig, OutputConfig},
    data::{load_movielens, MovieLensSize},
    dataset::ImplicitCf,
    graph::{CacheOutcome, NormalizedAdjacency},
    lightgcn::{model::embedding_norms, CheckpointSavor, LightGcn, Trainer, TrainingReport},
    metrics::RankingMetrics,
    recommend::{infer_embedding, recommend_for_test_users},
    split::stratified_split,
    telemetry::{self, LearningTelemetry},
};

/// File name of the final model inside `output.model_dir`.
pub const FINAL_MODEL_FILE: &str = "final.json";

/// Test-split evaluation of a finished experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    /// Experiment identifier.
    pub run_id: Uuid,
    /// Dataset variant.
    pub dataset: MovieLensSize,
    /// Recommendation list length.
    pub top_k: usize,
    /// Users in the training graph.
    pub n_users: usize,
    /// Items in the training graph.
    pub n_items: usize,
    /// Training interactions.
    pub train_rows: usize,
    /// Test interactions kept after filtering unknown ids.
    pub test_rows: usize,
    /// Epochs trained.
    pub epochs: usize,
    /// Mean loss of the last epoch.
    pub final_loss: Option<f32>,
    /// Whether the adjacency came from cache.
    pub adjacency: String,
    /// Configured metrics, by name.
    pub metrics: IndexMap<String, f64>,
    /// All four metrics.
    pub ranking: RankingMetrics,
    /// Total wall time in milliseconds.
    pub elapsed_ms: u64,
    /// Completion time.
    pub finished_at: DateTime<Utc>,
}

impl EvaluationReport {
    /// One-line summary.
    #[must_use]
    pub fn summary(&self) -> String {
        let metrics = self
            .metrics
            .iter()
            .map(|(name, value)| format!("{name}@{}={value:.4}", self.top_k))
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "[{}] users={} items={} epochs={} {metrics}",
            self.dataset, self.n_users, self.n_items, self.epochs
        )
    }
}

/// Everything produced by [`Experiment::run`].
#[derive(Debug)]
pub struct ExperimentOutcome {
    /// Trained model with propagated embeddings.
    pub model: LightGcn,
    /// Training data and id maps.
    pub data: ImplicitCf,
    /// Per-epoch history.
    pub training: TrainingReport,
    /// Final evaluation.
    pub report: EvaluationReport,
}

/// Runs a configured experiment.
#[derive(Debug)]
pub struct Experiment {
    config: ExperimentConfig,
    telemetry: Option<LearningTelemetry>,
}

impl Experiment {
    /// Creates an experiment without telemetry.
    #[must_use]
    pub const fn new(config: ExperimentConfig) -> Self {
        Self {
            config,
            telemetry: None,
        }
    }

    /// Attaches telemetry sinks.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: LearningTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Builds telemetry from the config's output section and attaches it.
    pub fn with_configured_telemetry(self) -> Result<Self> {
        match build_telemetry(&self.config.output)? {
            Some(telemetry) => Ok(self.with_telemetry(telemetry)),
            None => Ok(self),
        }
    }

    /// Experiment configuration.
    #[must_use]
    pub const fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Loads and splits the ratings, returning the indexed training data.
    ///
    /// Deterministic for a given config, so a saved model can be paired with
    /// the same id maps later.
    pub fn prepare_data(&self) -> Result<ImplicitCf> {
        let data = &self.config.data;
        let table = load_movielens(&data.path, data.format)
            .with_context(|| format!("loading {} ratings from {}", data.format, data.path.display()))?;
        telemetry::log(
            self.telemetry.as_ref(),
            LogLevel::Info,
            "data_loaded",
            json!({ "path": data.path, "format": data.format, "rows": table.len() }),
        );
        let (train, test) = stratified_split(&table, data.ratio, data.min_rating, data.seed)?;
        telemetry::log(
            self.telemetry.as_ref(),
            LogLevel::Info,
            "data_split",
            json!({ "train_rows": train.len(), "test_rows": test.len(), "ratio": data.ratio }),
        );
        Ok(ImplicitCf::new(train, test, data.seed)?)
    }

    /// Trains and evaluates, writing every configured artifact.
    pub fn run(&self) -> Result<ExperimentOutcome> {
        let timer = Instant::now();
        let run_id = Uuid::new_v4();
        telemetry::event(
            self.telemetry.as_ref(),
            "experiment.started",
            json!({ "run_id": run_id, "dataset": self.config.data.format }),
        );

        let mut data = self.prepare_data()?;
        let (adj, outcome) = self.adjacency(&data)?;
        telemetry::log(
            self.telemetry.as_ref(),
            LogLevel::Info,
            "adjacency_ready",
            json!({ "nodes": adj.n_nodes(), "nnz": adj.matrix().nnz(), "source": cache_label(outcome) }),
        );

        let mut model = LightGcn::new(data.n_users(), data.n_items(), self.config.model.clone());
        let mut trainer = Trainer::new(self.config.training.clone());
        let mut savor = self
            .config
            .output
            .model_dir
            .as_ref()
            .map(|dir| CheckpointSavor::new(dir, self.config.training.max_to_keep));
        let trainer_telemetry = self.telemetry.as_ref().map(|t| t.scoped("trainer"));
        let training = trainer.fit(
            &mut model,
            &mut data,
            &adj,
            &self.config.evaluation,
            savor.as_mut(),
            trainer_telemetry.as_ref(),
        )?;

        let evaluation = &self.config.evaluation;
        let predictions =
            recommend_for_test_users(&model, &data, evaluation.top_k, evaluation.remove_seen)?;
        let ranking = RankingMetrics::compute(data.test().rows(), &predictions, evaluation.top_k);
        let metrics = evaluation
            .metrics
            .iter()
            .map(|m| (m.to_string(), ranking.get(*m)))
            .collect();

        self.export(&model, &data)?;

        let report = EvaluationReport {
            run_id,
            dataset: self.config.data.format,
            top_k: evaluation.top_k,
            n_users: data.n_users(),
            n_items: data.n_items(),
            train_rows: data.train_len(),
            test_rows: data.test().len(),
            epochs: training.epochs.len(),
            final_loss: training.last().map(|e| e.loss),
            adjacency: cache_label(outcome).to_string(),
            metrics,
            ranking,
            elapsed_ms: u64::try_from(timer.elapsed().as_millis()).unwrap_or(u64::MAX),
            finished_at: Utc::now(),
        };
        if let Some(path) = &self.config.output.report {
            write_json(path, &report)?;
        }
        telemetry::log(
            self.telemetry.as_ref(),
            LogLevel::Info,
            "experiment_completed",
            json!({ "run_id": run_id, "summary": report.summary() }),
        );
        telemetry::event(
            self.telemetry.as_ref(),
            "experiment.completed",
            json!({ "run_id": run_id, "metrics": report.metrics, "top_k": report.top_k }),
        );

        Ok(ExperimentOutcome {
            model,
            data,
            training,
            report,
        })
    }

    fn adjacency(&self, data: &ImplicitCf) -> Result<(NormalizedAdjacency, CacheOutcome)> {
        match &self.config.output.adjacency_cache {
            Some(dir) => NormalizedAdjacency::load_or_build(data, dir)
                .with_context(|| format!("adjacency cache {}", dir.display())),
            None => Ok((NormalizedAdjacency::build(data), CacheOutcome::Built)),
        }
    }

    fn export(&self, model: &LightGcn, data: &ImplicitCf) -> Result<()> {
        let output = &self.config.output;
        if let Some(dir) = &output.model_dir {
            let path = dir.join(FINAL_MODEL_FILE);
            model.save(&path)?;
            telemetry::log(
                self.telemetry.as_ref(),
                LogLevel::Info,
                "model_saved",
                json!({ "path": path }),
            );
        }
        if let (Some(users), Some(items)) = (&output.user_embeddings, &output.item_embeddings) {
            infer_embedding(model, data, users, items)?;
            let norms = embedding_norms(model.embeddings());
            let (user_norms, item_norms) = norms.view().split_at(Axis(0), data.n_users());
            telemetry::log(
                self.telemetry.as_ref(),
                LogLevel::Info,
                "embeddings_exported",
                json!({
                    "users": users,
                    "items": items,
                    "mean_user_norm": user_norms.mean(),
                    "mean_item_norm": item_norms.mean(),
                }),
            );
        }
        Ok(())
    }
}

/// Telemetry writing to the log and event files named in `output`, if any.
pub fn build_telemetry(output: &OutputConfig) -> Result<Option<LearningTelemetry>> {
    if output.log_path.is_none() && output.event_log.is_none() {
        return Ok(None);
    }
    let mut builder = LearningTelemetry::builder("graphrec");
    if let Some(path) = &output.log_path {
        builder = builder.log_path(path);
    }
    if let Some(level) = output.log_level {
        builder = builder.min_level(level);
    }
    if let Some(path) = &output.event_log {
        builder = builder.event_publisher(Arc::new(FileEventPublisher::new(path)?));
    }
    builder.build().map(Some)
}

const fn cache_label(outcome: CacheOutcome) -> &'static str {
    match outcome {
        CacheOutcome::Loaded => "loaded",
        CacheOutcome::Built => "built",
        CacheOutcome::Rebuilt => "rebuilt",
    }
}

fn write_json(path: &Path, value: &impl Serialize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_vec_pretty(value)?)
        .with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DataConfig,
        lightgcn::{EvaluationConfig, LightGcnConfig, TrainingConfig},
        metrics::Metric,
        recommend::read_embeddings,
    };
    use std::fmt::Write as _;
    use tempfile::tempdir;

    // Users 1-6 rate items 1-8, users 7-12 rate items 11-18.
    fn write_ml100k(dir: &Path) {
        let mut raw = String::new();
        for user in 1..=12u32 {
            let base = if user <= 6 { 0 } else { 10 };
            for item in base + 1..=base + 8 {
                writeln!(raw, "{user}\t{item}\t4\t{}", user * 100 + item).unwrap();
            }
        }
        fs::write(dir.join("u.data"), raw).unwrap();
    }

    fn config(dir: &Path) -> ExperimentConfig {
        ExperimentConfig {
            data: DataConfig {
                path: dir.to_path_buf(),
                format: MovieLensSize::Ml100k,
                ratio: 0.75,
                min_rating: 1,
                seed: 11,
            },
            model: LightGcnConfig {
                embed_size: 8,
                n_layers: 2,
                ..LightGcnConfig::default()
            },
            training: TrainingConfig {
                learning_rate: 0.05,
                epochs: 5,
                batch_size: 16,
                ..TrainingConfig::default()
            },
            evaluation: EvaluationConfig {
                top_k: 3,
                metrics: vec![Metric::Ndcg, Metric::Precision],
                remove_seen: true,
            },
            output: OutputConfig {
                model_dir: Some(dir.join("model")),
                adjacency_cache: Some(dir.join("cache")),
                user_embeddings: Some(dir.join("emb/users.tsv")),
                item_embeddings: Some(dir.join("emb/items.tsv")),
                report: Some(dir.join("report.json")),
                log_path: Some(dir.join("run.log")),
                log_level: None,
                event_log: Some(dir.join("events.jsonl")),
            },
        }
    }

    #[test]
    fn runs_end_to_end_and_writes_artifacts() {
        let dir = tempdir().unwrap();
        write_ml100k(dir.path());
        let experiment = Experiment::new(config(dir.path()))
            .with_configured_telemetry()
            .unwrap();
        let outcome = experiment.run().unwrap();
        let report = &outcome.report;

        assert_eq!(report.n_users, 12);
        assert_eq!(report.train_rows, 72);
        assert_eq!(report.epochs, 5);
        assert_eq!(report.adjacency, "built");
        assert_eq!(
            report.metrics.keys().cloned().collect::<Vec<_>>(),
            vec!["ndcg".to_string(), "precision".to_string()]
        );
        for value in report.metrics.values() {
            assert!((0.0..=1.0).contains(value));
        }

        let saved: EvaluationReport =
            serde_json::from_slice(&fs::read(dir.path().join("report.json")).unwrap()).unwrap();
        assert_eq!(saved.run_id, report.run_id);
        assert_eq!(saved.metrics.len(), 2);
        let restored = LightGcn::load(dir.path().join("model").join(FINAL_MODEL_FILE)).unwrap();
        assert!(restored.is_ready());
        let users = read_embeddings(dir.path().join("emb/users.tsv")).unwrap();
        assert_eq!(users.len(), 12);
        assert_eq!(users[&1].len(), 8);

        let events = fs::read_to_string(dir.path().join("events.jsonl")).unwrap();
        assert!(events.contains("experiment.completed"));
        assert!(events.contains("training.epoch_completed"));
        let log = fs::read_to_string(dir.path().join("run.log")).unwrap();
        assert!(log.contains("adjacency_ready"));
        assert!(log.contains("mean_user_norm"));
    }

    #[test]
    fn reuses_cached_adjacency() {
        let dir = tempdir().unwrap();
        write_ml100k(dir.path());
        let mut cfg = config(dir.path());
        cfg.training.epochs = 1;
        cfg.output.log_path = None;
        cfg.output.event_log = None;
        Experiment::new(cfg.clone()).run().unwrap();
        let second = Experiment::new(cfg).run().unwrap();
        assert_eq!(second.report.adjacency, "loaded");
    }

    #[test]
    fn fixed_seeds_reproduce_metrics() {
        let dir = tempdir().unwrap();
        write_ml100k(dir.path());
        let mut cfg = config(dir.path());
        cfg.training.epochs = 3;
        cfg.output = OutputConfig::default();
        let first = Experiment::new(cfg.clone()).run().unwrap();
        let second = Experiment::new(cfg).run().unwrap();
        assert_eq!(first.report.ranking, second.report.ranking);
        assert_eq!(first.report.final_loss, second.report.final_loss);
        assert_eq!(first.data.train().rows(), second.data.train().rows());
        assert_eq!(first.model.embeddings(), second.model.embeddings());
    }

    #[test]
    fn missing_ratings_is_an_error() {
        let dir = tempdir().unwrap();
        let err = Experiment::new(config(dir.path())).run().unwrap_err();
        assert!(err.to_string().contains("loading 100k ratings"));
    }
}
