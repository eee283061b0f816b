use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use shared_logging::LogLevel;

use crate::{
    data::MovieLensSize,
    lightgcn::{EvaluationConfig, LightGcnConfig, TrainingConfig},
};

/// Complete experiment description loaded from TOML.
///
/// ```toml
/// [data]
/// path = "data/ml-100k"
/// format = "100k"
///
/// [model]
/// embed_size = 64
/// n_layers = 3
///
/// [training]
/// epochs = 50
/// eval_epoch = 5
///
/// [evaluation]
/// top_k = 10
/// metrics = ["map", "ndcg", "precision", "recall"]
///
/// [output]
/// model_dir = "runs/model"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Input table and split.
    pub data: DataConfig,
    /// Architecture hyperparameters.
    #[serde(default)]
    pub model: LightGcnConfig,
    /// Optimization hyperparameters.
    #[serde(default)]
    pub training: TrainingConfig,
    /// Ranking evaluation settings.
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    /// Artifacts and telemetry sinks.
    #[serde(default)]
    pub output: OutputConfig,
}

/// Input dataset and split settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Ratings file or extracted dataset directory.
    pub path: PathBuf,
    /// MovieLens variant.
    #[serde(default = "default_format")]
    pub format: MovieLensSize,
    /// Fraction of each user's rows placed in train.
    #[serde(default = "default_ratio")]
    pub ratio: f64,
    /// Users with fewer interactions are dropped before splitting.
    #[serde(default = "default_min_rating")]
    pub min_rating: usize,
    /// Seed for the split and the mini-batch sampler.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

/// Artifact locations; every entry is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory for periodic checkpoints and the final model.
    pub model_dir: Option<PathBuf>,
    /// Directory caching the normalized adjacency.
    pub adjacency_cache: Option<PathBuf>,
    /// TSV of final user embeddings.
    pub user_embeddings: Option<PathBuf>,
    /// TSV of final item embeddings.
    pub item_embeddings: Option<PathBuf>,
    /// JSON evaluation report.
    pub report: Option<PathBuf>,
    /// JSON-lines log.
    pub log_path: Option<PathBuf>,
    /// Minimum level written to `log_path`.
    pub log_level: Option<LogLevel>,
    /// JSON-lines event log.
    pub event_log: Option<PathBuf>,
}

impl ExperimentConfig {
    /// Loads and validates a TOML file; relative paths resolve against its directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading experiment config {}", path.display()))?;
        let mut config = Self::from_toml(&raw).with_context(|| format!("parsing {}", path.display()))?;
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        config.resolve_paths(&base);
        Ok(config)
    }

    /// Parses and validates TOML text without touching paths.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<()> {
        if !(self.data.ratio > 0.0 && self.data.ratio < 1.0) {
            bail!("data.ratio must be in (0, 1), got {}", self.data.ratio);
        }
        if self.model.embed_size == 0 {
            bail!("model.embed_size must be positive");
        }
        if !(self.model.decay.is_finite() && self.model.decay >= 0.0) {
            bail!("model.decay must be a non-negative number");
        }
        if self.training.batch_size == 0 {
            bail!("training.batch_size must be positive");
        }
        if !(self.training.learning_rate.is_finite() && self.training.learning_rate > 0.0) {
            bail!("training.learning_rate must be positive");
        }
        if self.training.eval_epoch == Some(0) || self.training.save_epoch == Some(0) {
            bail!("training.eval_epoch and training.save_epoch must be positive when set");
        }
        if self.training.save_epoch.is_some() && self.output.model_dir.is_none() {
            bail!("training.save_epoch requires output.model_dir");
        }
        if self.evaluation.top_k == 0 {
            bail!("evaluation.top_k must be positive");
        }
        if self.evaluation.metrics.is_empty() {
            bail!("evaluation.metrics must name at least one metric");
        }
        if self.output.user_embeddings.is_some() != self.output.item_embeddings.is_some() {
            bail!("output.user_embeddings and output.item_embeddings must be set together");
        }
        Ok(())
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.data.path);
        let output = &mut self.output;
        for slot in [
            &mut output.model_dir,
            &mut output.adjacency_cache,
            &mut output.user_embeddings,
            &mut output.item_embeddings,
            &mut output.report,
            &mut output.log_path,
            &mut output.event_log,
        ] {
            if let Some(p) = slot.as_mut() {
                resolve(p);
            }
        }
    }
}

const fn default_format() -> MovieLensSize {
    MovieLensSize::Ml100k
}

const fn default_ratio() -> f64 {
    0.75
}

const fn default_min_rating() -> usize {
    1
}

const fn default_seed() -> u64 {
    42
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metric;
    use tempfile::tempdir;

    #[test]
    fn applies_defaults() {
        let config = ExperimentConfig::from_toml("[data]\npath = \"u.data\"\n").unwrap();
        assert_eq!(config.data.format, MovieLensSize::Ml100k);
        assert!((config.data.ratio - 0.75).abs() < f64::EPSILON);
        assert_eq!(config.model, LightGcnConfig::default());
        assert_eq!(config.training.batch_size, 1024);
        assert_eq!(config.evaluation.metrics, Metric::ALL.to_vec());
        assert_eq!(config.output, OutputConfig::default());
    }

    #[test]
    fn loads_sections_and_resolves_paths() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("experiment.toml");
        fs::write(
            &path,
            r#"
[data]
path = "ml-1m"
format = "1m"
ratio = 0.8
seed = 7

[model]
embed_size = 32
n_layers = 2

[training]
epochs = 5
eval_epoch = 1
save_epoch = 2

[evaluation]
top_k = 20
metrics = ["ndcg", "recall"]

[output]
model_dir = "runs/model"
log_path = "/var/log/graphrec.log"
log_level = "INFO"
"#,
        )
        .unwrap();
        let config = ExperimentConfig::load(&path).unwrap();
        assert_eq!(config.data.path, dir.path().join("ml-1m"));
        assert_eq!(config.data.format, MovieLensSize::Ml1m);
        assert_eq!(config.model.embed_size, 32);
        assert_eq!(config.model.decay, LightGcnConfig::default().decay);
        assert_eq!(config.training.eval_epoch, Some(1));
        assert_eq!(config.evaluation.metrics, vec![Metric::Ndcg, Metric::Recall]);
        assert_eq!(config.output.model_dir, Some(dir.path().join("runs/model")));
        assert_eq!(config.output.log_path, Some(PathBuf::from("/var/log/graphrec.log")));
        assert_eq!(config.output.log_level, Some(LogLevel::Info));
    }

    #[test]
    fn rejects_invalid_values() {
        for bad in [
            "[data]\npath = \"x\"\nratio = 1.5\n",
            "[data]\npath = \"x\"\n[training]\nbatch_size = 0\n",
            "[data]\npath = \"x\"\n[training]\nsave_epoch = 1\n",
            "[data]\npath = \"x\"\n[evaluation]\nmetrics = []\n",
            "[data]\npath = \"x\"\n[output]\nuser_embeddings = \"u.tsv\"\n",
            "[data]\npath = \"x\"\n[evaluation]\nmetrics = [\"auc\"]\n",
        ] {
            assert!(ExperimentConfig::from_toml(bad).is_err(), "{bad}");
        }
        assert!(ExperimentConfig::from_toml("[model]\nembed_size = 4\n").is_err());
    }
}
