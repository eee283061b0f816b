use std::{fs, path::Path};

use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{dataset::Batch, graph::NormalizedAdjacency};

/// LightGCN architecture hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LightGcnConfig {
    /// Embedding dimension.
    pub embed_size: usize,
    /// Number of propagation layers.
    pub n_layers: usize,
    /// L2 regularization weight on layer-0 embeddings.
    pub decay: f32,
    /// Seed for embedding initialization.
    pub seed: u64,
}

impl Default for LightGcnConfig {
    fn default() -> Self {
        Self {
            embed_size: 64,
            n_layers: 3,
            decay: 1e-4,
            seed: 42,
        }
    }
}

/// Loss components of one BPR step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StepLoss {
    /// Mean pairwise ranking loss.
    pub mf_loss: f32,
    /// L2 regularization term.
    pub emb_loss: f32,
}

impl StepLoss {
    /// Total objective.
    #[must_use]
    pub fn total(&self) -> f32 {
        self.mf_loss + self.emb_loss
    }
}

/// LightGCN model: learnable layer-0 embeddings for every user and item node.
///
/// Users occupy rows `0..n_users`, items the following `n_items` rows.
#[derive(Debug, Clone)]
pub struct LightGcn {
    config: LightGcnConfig,
    n_users: usize,
    n_items: usize,
    embeddings: Array2<f32>,
    propagated: Option<Array2<f32>>,
}

impl LightGcn {
    /// Creates a model with Xavier-uniform initialized embeddings.
    #[must_use]
    pub fn new(n_users: usize, n_items: usize, config: LightGcnConfig) -> Self {
        let dim = config.embed_size;
        let mut rng = SmallRng::seed_from_u64(config.seed);
        let user_limit = xavier_limit(n_users, dim);
        let item_limit = xavier_limit(n_items, dim);
        let embeddings = Array2::from_shape_fn((n_users + n_items, dim), |(row, _)| {
            let limit = if row < n_users { user_limit } else { item_limit };
            rng.gen_range(-limit..=limit)
        });
        Self {
            config,
            n_users,
            n_items,
            embeddings,
            propagated: None,
        }
    }

    /// Architecture hyperparameters.
    #[must_use]
    pub const fn config(&self) -> &LightGcnConfig {
        &self.config
    }

    /// Number of users.
    #[must_use]
    pub const fn n_users(&self) -> usize {
        self.n_users
    }

    /// Number of items.
    #[must_use]
    pub const fn n_items(&self) -> usize {
        self.n_items
    }

    /// Layer-0 embeddings.
    #[must_use]
    pub fn embeddings(&self) -> ArrayView2<'_, f32> {
        self.embeddings.view()
    }

    /// Mutable layer-0 embeddings; invalidates propagated embeddings.
    pub fn embeddings_mut(&mut self) -> &mut Array2<f32> {
        self.propagated = None;
        &mut self.embeddings
    }

    /// Final embeddings: mean of layer outputs `Â^k E0` for `k = 0..=n_layers`.
    pub fn propagate(&self, adj: &NormalizedAdjacency) -> Result<Array2<f32>, ModelError> {
        self.check_graph(adj)?;
        Ok(layer_mean(adj, &self.embeddings, self.config.n_layers))
    }

    /// Recomputes and stores final embeddings for scoring.
    pub fn refresh(&mut self, adj: &NormalizedAdjacency) -> Result<(), ModelError> {
        self.propagated = Some(self.propagate(adj)?);
        Ok(())
    }

    /// True once final embeddings are available for scoring.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.propagated.is_some()
    }

    /// Computes the BPR objective for `batch` and its gradient w.r.t. layer-0 embeddings.
    pub fn bpr_gradients(
        &self,
        adj: &NormalizedAdjacency,
        batch: &Batch,
    ) -> Result<(StepLoss, Array2<f32>), ModelError> {
        if batch.is_empty() {
            return Err(ModelError::EmptyBatch);
        }
        let final_emb = self.propagate(adj)?;
        let size = batch.len() as f32;
        let mut grad_final = Array2::<f32>::zeros(final_emb.raw_dim());
        let mut mf_loss = 0.0_f32;

        for ((&u, &p), &n) in batch
            .users
            .iter()
            .zip(&batch.pos_items)
            .zip(&batch.neg_items)
        {
            let (p, n) = (self.n_users + p, self.n_users + n);
            let eu = final_emb.row(u);
            let ep = final_emb.row(p);
            let en = final_emb.row(n);
            let margin = eu.dot(&ep) - eu.dot(&en);
            mf_loss += softplus(-margin);
            // d softplus(-x) / dx = -sigmoid(-x)
            let g = -sigmoid(-margin) / size;
            let diff = &ep - &en;
            grad_final.row_mut(u).scaled_add(g, &diff);
            grad_final.row_mut(p).scaled_add(g, &eu);
            grad_final.row_mut(n).scaled_add(-g, &eu);
        }
        mf_loss /= size;

        // Â is symmetric, so the layer-mean backward pass is the same propagation.
        let mut grad = layer_mean(adj, &grad_final, self.config.n_layers);

        let decay = self.config.decay;
        let mut reg = 0.0_f32;
        for ((&u, &p), &n) in batch
            .users
            .iter()
            .zip(&batch.pos_items)
            .zip(&batch.neg_items)
        {
            for row in [u, self.n_users + p, self.n_users + n] {
                let e0 = self.embeddings.row(row);
                reg += e0.dot(&e0);
                grad.row_mut(row).scaled_add(decay / size, &e0);
            }
        }
        let emb_loss = decay * reg / 2.0 / size;

        let loss = StepLoss { mf_loss, emb_loss };
        if !loss.total().is_finite() {
            return Err(ModelError::NonFiniteLoss(loss.total()));
        }
        Ok((loss, grad))
    }

    /// Final user embedding by index.
    pub fn user_embedding(&self, user: usize) -> Result<ArrayView1<'_, f32>, ModelError> {
        let propagated = self.propagated.as_ref().ok_or(ModelError::NotPropagated)?;
        if user >= self.n_users {
            return Err(ModelError::IndexOutOfRange(user));
        }
        Ok(propagated.row(user))
    }

    /// Final item embedding by index.
    pub fn item_embedding(&self, item: usize) -> Result<ArrayView1<'_, f32>, ModelError> {
        let propagated = self.propagated.as_ref().ok_or(ModelError::NotPropagated)?;
        if item >= self.n_items {
            return Err(ModelError::IndexOutOfRange(item));
        }
        Ok(propagated.row(self.n_users + item))
    }

    /// Final item embeddings, one row per item.
    pub fn item_embeddings(&self) -> Result<ArrayView2<'_, f32>, ModelError> {
        let propagated = self.propagated.as_ref().ok_or(ModelError::NotPropagated)?;
        Ok(propagated.slice(s![self.n_users.., ..]))
    }

    /// Predicted preference of `user` for `item`.
    pub fn score(&self, user: usize, item: usize) -> Result<f32, ModelError> {
        Ok(self.user_embedding(user)?.dot(&self.item_embedding(item)?))
    }

    /// Scores of every item for `user`, indexed by item.
    pub fn score_all(&self, user: usize) -> Result<Array1<f32>, ModelError> {
        let user_vec = self.user_embedding(user)?;
        Ok(self.item_embeddings()?.dot(&user_vec))
    }

    /// Writes a JSON checkpoint holding layer-0 and final embeddings.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let checkpoint = CheckpointRef {
            config: &self.config,
            n_users: self.n_users,
            n_items: self.n_items,
            embeddings: &self.embeddings,
            propagated: self.propagated.as_ref(),
        };
        fs::write(path, serde_json::to_vec(&checkpoint)?)?;
        Ok(())
    }

    /// Restores a model written by [`LightGcn::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let raw = fs::read(path.as_ref())?;
        let checkpoint: Checkpoint = serde_json::from_slice(&raw)?;
        let expected = (checkpoint.n_users + checkpoint.n_items, checkpoint.config.embed_size);
        if checkpoint.embeddings.dim() != expected
            || checkpoint
                .propagated
                .as_ref()
                .is_some_and(|p| p.dim() != expected)
        {
            return Err(ModelError::ShapeMismatch {
                expected,
                found: checkpoint.embeddings.dim(),
            });
        }
        Ok(Self {
            config: checkpoint.config,
            n_users: checkpoint.n_users,
            n_items: checkpoint.n_items,
            embeddings: checkpoint.embeddings,
            propagated: checkpoint.propagated,
        })
    }

    fn check_graph(&self, adj: &NormalizedAdjacency) -> Result<(), ModelError> {
        if adj.n_users() == self.n_users && adj.n_items() == self.n_items {
            Ok(())
        } else {
            Err(ModelError::ShapeMismatch {
                expected: (self.n_users + self.n_items, self.config.embed_size),
                found: (adj.n_nodes(), self.config.embed_size),
            })
        }
    }
}

#[derive(Serialize)]
struct CheckpointRef<'a> {
    config: &'a LightGcnConfig,
    n_users: usize,
    n_items: usize,
    embeddings: &'a Array2<f32>,
    propagated: Option<&'a Array2<f32>>,
}

#[derive(Deserialize)]
struct Checkpoint {
    config: LightGcnConfig,
    n_users: usize,
    n_items: usize,
    embeddings: Array2<f32>,
    propagated: Option<Array2<f32>>,
}

fn layer_mean(adj: &NormalizedAdjacency, layer0: &Array2<f32>, n_layers: usize) -> Array2<f32> {
    let mut sum = layer0.clone();
    let mut current = layer0.clone();
    for _ in 0..n_layers {
        current = adj.propagate(&current);
        sum += &current;
    }
    sum /= (n_layers + 1) as f32;
    sum
}

#[allow(clippy::cast_precision_loss)]
fn xavier_limit(fan_in: usize, fan_out: usize) -> f32 {
    (6.0 / (fan_in + fan_out).max(1) as f32).sqrt()
}

fn softplus(x: f32) -> f32 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// L2 norm of every embedding row.
#[must_use]
pub fn embedding_norms(embeddings: ArrayView2<'_, f32>) -> Array1<f32> {
    embeddings.map_axis(Axis(1), |row| row.dot(&row).sqrt())
}

/// Errors raised by the model.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Graph or checkpoint dimensions disagree with the model.
    #[error("shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        /// Expected `(nodes, dim)`.
        expected: (usize, usize),
        /// Observed `(nodes, dim)`.
        found: (usize, usize),
    },
    /// A batch without triplets was supplied.
    #[error("cannot train on an empty batch")]
    EmptyBatch,
    /// The loss diverged.
    #[error("loss is not finite ({0})")]
    NonFiniteLoss(f32),
    /// Scoring was requested before propagation.
    #[error("final embeddings not computed; call refresh() first")]
    NotPropagated,
    /// User or item index beyond the model's range.
    #[error("index {0} out of range")]
    IndexOutOfRange(usize),
    /// Checkpoint I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Checkpoint encoding failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::{Interaction, InteractionTable},
        dataset::ImplicitCf,
    };
    use tempfile::tempdir;

    fn fixture() -> (ImplicitCf, NormalizedAdjacency) {
        let rows = vec![
            Interaction::new(1, 10, 5.0, 0),
            Interaction::new(1, 11, 5.0, 0),
            Interaction::new(2, 11, 5.0, 0),
            Interaction::new(2, 12, 5.0, 0),
            Interaction::new(3, 12, 5.0, 0),
            Interaction::new(3, 13, 5.0, 0),
        ];
        let data =
            ImplicitCf::new(InteractionTable::new(rows), InteractionTable::default(), 1).unwrap();
        let adj = NormalizedAdjacency::build(&data);
        (data, adj)
    }

    fn config() -> LightGcnConfig {
        LightGcnConfig {
            embed_size: 8,
            n_layers: 2,
            decay: 1e-3,
            seed: 7,
        }
    }

    #[test]
    fn initialization_is_seeded_and_bounded() {
        let a = LightGcn::new(3, 4, config());
        let b = LightGcn::new(3, 4, config());
        assert_eq!(a.embeddings(), b.embeddings());
        let limit = xavier_limit(3, 8);
        assert!(a
            .embeddings()
            .slice(s![..3, ..])
            .iter()
            .all(|v| v.abs() <= limit));
    }

    #[test]
    fn zero_layers_propagation_is_identity() {
        let (data, adj) = fixture();
        let mut cfg = config();
        cfg.n_layers = 0;
        let model = LightGcn::new(data.n_users(), data.n_items(), cfg);
        assert_eq!(model.propagate(&adj).unwrap(), model.embeddings().to_owned());
    }

    #[test]
    fn analytic_gradient_matches_finite_difference() {
        let (data, adj) = fixture();
        let model = LightGcn::new(data.n_users(), data.n_items(), config());
        let batch = Batch {
            users: vec![0, 1],
            pos_items: vec![0, 2],
            neg_items: vec![3, 0],
        };
        let (_, grad) = model.bpr_gradients(&adj, &batch).unwrap();
        let eps = 1e-2_f32;
        for &(row, col) in &[(0, 0), (1, 3), (3, 5), (6, 1)] {
            let mut plus = model.clone();
            plus.embeddings_mut()[[row, col]] += eps;
            let mut minus = model.clone();
            minus.embeddings_mut()[[row, col]] -= eps;
            let lp = plus.bpr_gradients(&adj, &batch).unwrap().0.total();
            let lm = minus.bpr_gradients(&adj, &batch).unwrap().0.total();
            let numeric = (lp - lm) / (2.0 * eps);
            assert!(
                (numeric - grad[[row, col]]).abs() < 1e-3,
                "({row},{col}) numeric {numeric} analytic {}",
                grad[[row, col]]
            );
        }
    }

    #[test]
    fn scoring_requires_refresh_and_matches_dot_product() {
        let (data, adj) = fixture();
        let mut model = LightGcn::new(data.n_users(), data.n_items(), config());
        assert!(matches!(model.score(0, 0), Err(ModelError::NotPropagated)));
        model.refresh(&adj).unwrap();
        let scores = model.score_all(1).unwrap();
        assert_eq!(scores.len(), data.n_items());
        assert!((scores[2] - model.score(1, 2).unwrap()).abs() < 1e-6);
        assert!(matches!(
            model.item_embedding(99),
            Err(ModelError::IndexOutOfRange(99))
        ));
    }

    #[test]
    fn checkpoint_restores_embeddings() {
        let (data, adj) = fixture();
        let mut model = LightGcn::new(data.n_users(), data.n_items(), config());
        model.refresh(&adj).unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join("ckpt/epoch_1.json");
        model.save(&path).unwrap();
        let restored = LightGcn::load(&path).unwrap();
        assert_eq!(restored.embeddings(), model.embeddings());
        assert!(restored.is_ready());
        assert_eq!(restored.config(), model.config());
        assert_eq!(embedding_norms(restored.embeddings()).len(), data.n_users() + data.n_items());
    }

    #[test]
    fn rejects_mismatched_graph() {
        let (_, adj) = fixture();
        let model = LightGcn::new(2, 2, config());
        assert!(matches!(
            model.propagate(&adj),
            Err(ModelError::ShapeMismatch { .. })
        ));
    }
}
