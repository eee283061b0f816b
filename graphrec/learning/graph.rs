use std::{
    fs,
    path::{Path, PathBuf},
};

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dataset::ImplicitCf;

/// File name of the cached normalized adjacency inside the cache directory.
pub const ADJACENCY_CACHE_FILE: &str = "norm_adj.json";

/// Compressed sparse row matrix of `f32` values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsrMatrix {
    n_rows: usize,
    n_cols: usize,
    indptr: Vec<usize>,
    indices: Vec<usize>,
    values: Vec<f32>,
}

impl CsrMatrix {
    /// Builds a matrix from `(row, col, value)` triplets; duplicates are summed.
    ///
    /// Triplets outside `n_rows x n_cols` are ignored.
    #[must_use]
    pub fn from_triplets(n_rows: usize, n_cols: usize, triplets: &[(usize, usize, f32)]) -> Self {
        let mut sorted: Vec<(usize, usize, f32)> = triplets
            .iter()
            .copied()
            .filter(|(r, c, _)| *r < n_rows && *c < n_cols)
            .collect();
        sorted.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        let mut indptr = vec![0; n_rows + 1];
        let mut indices = Vec::with_capacity(sorted.len());
        let mut values: Vec<f32> = Vec::with_capacity(sorted.len());
        let mut last: Option<(usize, usize)> = None;
        for (row, col, value) in sorted {
            if last == Some((row, col)) {
                if let Some(prev) = values.last_mut() {
                    *prev += value;
                }
                continue;
            }
            indptr[row + 1] += 1;
            indices.push(col);
            values.push(value);
            last = Some((row, col));
        }
        for row in 0..n_rows {
            indptr[row + 1] += indptr[row];
        }

        Self {
            n_rows,
            n_cols,
            indptr,
            indices,
            values,
        }
    }

    /// `(rows, cols)`.
    #[must_use]
    pub const fn shape(&self) -> (usize, usize) {
        (self.n_rows, self.n_cols)
    }

    /// Number of stored entries.
    #[must_use]
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Column indices and values stored in `row`.
    #[must_use]
    pub fn row(&self, row: usize) -> (&[usize], &[f32]) {
        if row >= self.n_rows {
            return (&[], &[]);
        }
        let span = self.indptr[row]..self.indptr[row + 1];
        (&self.indices[span.clone()], &self.values[span])
    }

    /// Value at `(row, col)`, zero when not stored.
    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        let (cols, values) = self.row(row);
        cols.binary_search(&col).map_or(0.0, |pos| values[pos])
    }

    /// Sum of every row.
    #[must_use]
    pub fn row_sums(&self) -> Vec<f32> {
        (0..self.n_rows)
            .map(|row| self.row(row).1.iter().sum())
            .collect()
    }

    /// Sparse-dense product `self * dense`.
    ///
    /// `dense` must have `n_cols` rows.
    #[must_use]
    pub fn matmul_dense(&self, dense: &Array2<f32>) -> Array2<f32> {
        debug_assert_eq!(dense.nrows(), self.n_cols);
        let mut out = Array2::<f32>::zeros((self.n_rows, dense.ncols()));
        for (row, mut target) in out.rows_mut().into_iter().enumerate() {
            let (cols, values) = self.row(row);
            for (&col, &value) in cols.iter().zip(values) {
                target.scaled_add(value, &dense.row(col));
            }
        }
        out
    }
}

/// Symmetric degree-normalized adjacency `D^-1/2 A D^-1/2` of the user-item graph.
///
/// Node order is all users (by index) followed by all items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedAdjacency {
    n_users: usize,
    n_items: usize,
    checksum: u64,
    matrix: CsrMatrix,
}

/// Where an adjacency returned by [`NormalizedAdjacency::load_or_build`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Read from a matching cache file.
    Loaded,
    /// No cache existed; built and written.
    Built,
    /// A stale or unreadable cache was replaced.
    Rebuilt,
}

impl NormalizedAdjacency {
    /// Builds the normalized adjacency from the training edges.
    #[must_use]
    pub fn build(data: &ImplicitCf) -> Self {
        let n_users = data.n_users();
        let n_items = data.n_items();
        let n_nodes = n_users + n_items;

        let mut degree = vec![0usize; n_nodes];
        for (u, i) in data.edges() {
            degree[u] += 1;
            degree[n_users + i] += 1;
        }
        let inv_sqrt: Vec<f32> = degree
            .iter()
            .map(|&d| if d == 0 { 0.0 } else { 1.0 / (d as f32).sqrt() })
            .collect();

        let mut triplets = Vec::new();
        for (u, i) in data.edges() {
            let item_node = n_users + i;
            let weight = inv_sqrt[u] * inv_sqrt[item_node];
            triplets.push((u, item_node, weight));
            triplets.push((item_node, u, weight));
        }

        Self {
            n_users,
            n_items,
            checksum: edge_checksum(data),
            matrix: CsrMatrix::from_triplets(n_nodes, n_nodes, &triplets),
        }
    }

    /// Loads the adjacency cached under `cache_dir`, rebuilding it when absent
    /// or when it was built from a different training graph.
    pub fn load_or_build(
        data: &ImplicitCf,
        cache_dir: impl AsRef<Path>,
    ) -> Result<(Self, CacheOutcome), GraphError> {
        let path = cache_dir.as_ref().join(ADJACENCY_CACHE_FILE);
        let mut outcome = CacheOutcome::Built;
        if path.exists() {
            let cached = fs::read_to_string(&path)
                .ok()
                .and_then(|raw| serde_json::from_str::<Self>(&raw).ok());
            match cached {
                Some(adj) if adj.matches(data) => return Ok((adj, CacheOutcome::Loaded)),
                _ => outcome = CacheOutcome::Rebuilt,
            }
        }
        let adj = Self::build(data);
        adj.save(&path)?;
        Ok((adj, outcome))
    }

    /// Writes the adjacency as JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), GraphError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| GraphError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let raw = serde_json::to_string(self)?;
        fs::write(path, raw).map_err(|source| GraphError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn matches(&self, data: &ImplicitCf) -> bool {
        self.n_users == data.n_users()
            && self.n_items == data.n_items()
            && self.checksum == edge_checksum(data)
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

    /// Total node count.
    #[must_use]
    pub const fn n_nodes(&self) -> usize {
        self.n_users + self.n_items
    }

    /// Underlying sparse matrix.
    #[must_use]
    pub const fn matrix(&self) -> &CsrMatrix {
        &self.matrix
    }

    /// Propagates node embeddings one hop: `Â * embeddings`.
    #[must_use]
    pub fn propagate(&self, embeddings: &Array2<f32>) -> Array2<f32> {
        self.matrix.matmul_dense(embeddings)
    }
}

// FNV-1a over the edge list; stable across builds, unlike `DefaultHasher`.
fn edge_checksum(data: &ImplicitCf) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;
    data.edges().fold(OFFSET, |hash, (u, i)| {
        [u as u64, i as u64]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .fold(hash, |h, byte| (h ^ u64::from(byte)).wrapping_mul(PRIME))
    })
}

/// Errors raised while persisting the adjacency cache.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Filesystem failure.
    #[error("io error at {path}: {source}")]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Serialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
