#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]
#![allow(clippy::module_name_repetitions, clippy::cast_precision_loss)]

//! GraphRec learning stack: LightGCN collaborative filtering over implicit
//! feedback, from MovieLens loading through graph propagation, BPR training
//! and top-k ranking evaluation.

/// Experiment configuration loaded from TOML.
#[path = "../config.rs"]
pub mod config;

/// Interaction tables and MovieLens loaders.
#[path = "../data.rs"]
pub mod data;

/// Per-user stratified train/test split.
#[path = "../split.rs"]
pub mod split;

/// Indexed implicit-feedback dataset and BPR sampling.
#[path = "../dataset.rs"]
pub mod dataset;

/// Normalized user-item adjacency.
#[path = "../graph.rs"]
pub mod graph;

/// LightGCN model, optimizer and trainer.
#[path = "../lightgcn/main.rs"]
pub mod lightgcn;

/// Ranking metrics.
#[path = "../metrics.rs"]
pub mod metrics;

/// Top-k recommendation and embedding export.
#[path = "../recommend.rs"]
pub mod recommend;

/// Run manifest.
#[path = "../runs.rs"]
pub mod runs;

/// Telemetry helpers for logging/event emission.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// End-to-end experiment runner.
#[path = "../main.rs"]
pub mod experiment;

pub use config::{DataConfig, ExperimentConfig, OutputConfig};
pub use data::{load_csv, load_movielens, DataError, Interaction, InteractionTable, MovieLensSize};
pub use dataset::{Batch, DatasetError, IdMap, ImplicitCf};
pub use experiment::{build_telemetry, EvaluationReport, Experiment, ExperimentOutcome};
pub use graph::{CacheOutcome, CsrMatrix, GraphError, NormalizedAdjacency};
pub use lightgcn::{
    CheckpointSavor, EvaluationConfig, LightGcn, LightGcnConfig, ModelError, TrainError,
    Trainer, TrainingConfig, TrainingReport,
};
pub use metrics::{Metric, Prediction, RankingMetrics};
pub use recommend::{infer_embedding, read_embeddings, recommend_k_items, RecommendError};
pub use runs::{RunManifest, RunRecord, RunStatus};
pub use split::{stratified_split, stratified_split_multi, SplitError};
pub use telemetry::{LearningTelemetry, LearningTelemetryBuilder};
