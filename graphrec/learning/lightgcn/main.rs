//! LightGCN model, optimizer and training loop.

/// Embedding model, propagation and BPR gradients.
pub mod model;
/// Adam optimizer.
pub mod optimizer;
/// Epoch and run reports.
pub mod reporter;
/// Checkpoint rotation.
pub mod savor;
/// Mini-batch training loop.
pub mod trainer;

pub use model::{LightGcn, LightGcnConfig, ModelError, StepLoss};
pub use optimizer::{Adam, AdamConfig};
pub use reporter::{EpochReport, TrainingReport};
pub use savor::{CheckpointSavor, SavedCheckpoint};
pub use trainer::{EvaluationConfig, TrainError, Trainer, TrainingConfig};
