use indexmap::IndexSet;
use rand::{rngs::SmallRng, seq::index, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::InteractionTable;

/// Bidirectional mapping between original ids and contiguous indices.
///
/// Indices follow first-appearance order in the training table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    ids: IndexSet<u32>,
}

impl IdMap {
    /// Builds the map from ids in appearance order; duplicates are ignored.
    #[must_use]
    pub fn from_ids(ids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
        }
    }

    /// Contiguous index of an original id.
    #[must_use]
    pub fn index_of(&self, id: u32) -> Option<usize> {
        self.ids.get_index_of(&id)
    }

    /// Original id at an index.
    #[must_use]
    pub fn id_of(&self, index: usize) -> Option<u32> {
        self.ids.get_index(index).copied()
    }

    /// Number of mapped ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// True when no id is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Original ids in index order.
    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.ids.iter().copied()
    }
}

/// One BPR mini-batch of `(user, positive, negative)` index triplets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    /// User indices.
    pub users: Vec<usize>,
    /// Observed item index per user.
    pub pos_items: Vec<usize>,
    /// Unobserved item index per user.
    pub neg_items: Vec<usize>,
}

impl Batch {
    /// Number of triplets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// True when the batch holds no triplet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// Implicit collaborative-filtering dataset built from a train/test split.
#[derive(Debug, Clone)]
pub struct ImplicitCf {
    train: InteractionTable,
    test: InteractionTable,
    users: IdMap,
    items: IdMap,
    positives: Vec<Vec<usize>>,
    rng: SmallRng,
}

impl ImplicitCf {
    /// Indexes the training table and drops test rows unknown to it.
    pub fn new(
        train: InteractionTable,
        test: InteractionTable,
        seed: u64,
    ) -> Result<Self, DatasetError> {
        if train.is_empty() {
            return Err(DatasetError::EmptyTrain);
        }
        let users = IdMap::from_ids(train.iter().map(|row| row.user));
        let items = IdMap::from_ids(train.iter().map(|row| row.item));

        let mut positives = vec![Vec::new(); users.len()];
        for row in &train {
            if let (Some(u), Some(i)) = (users.index_of(row.user), items.index_of(row.item)) {
                positives[u].push(i);
            }
        }
        for list in &mut positives {
            list.sort_unstable();
            list.dedup();
        }

        let test = test.filter(|row| {
            users.index_of(row.user).is_some() && items.index_of(row.item).is_some()
        });

        Ok(Self {
            train,
            test,
            users,
            items,
            positives,
            rng: SmallRng::seed_from_u64(seed),
        })
    }

    /// Training interactions.
    #[must_use]
    pub fn train(&self) -> &InteractionTable {
        &self.train
    }

    /// Test interactions restricted to known users and items.
    #[must_use]
    pub fn test(&self) -> &InteractionTable {
        &self.test
    }

    /// User id map.
    #[must_use]
    pub fn users(&self) -> &IdMap {
        &self.users
    }

    /// Item id map.
    #[must_use]
    pub fn items(&self) -> &IdMap {
        &self.items
    }

    /// Number of distinct training users.
    #[must_use]
    pub fn n_users(&self) -> usize {
        self.users.len()
    }

    /// Number of distinct training items.
    #[must_use]
    pub fn n_items(&self) -> usize {
        self.items.len()
    }

    /// Number of training rows.
    #[must_use]
    pub fn train_len(&self) -> usize {
        self.train.len()
    }

    /// Sorted item indices the user interacted with in training.
    #[must_use]
    pub fn user_positives(&self, user: usize) -> &[usize] {
        self.positives.get(user).map_or(&[], Vec::as_slice)
    }

    /// Iterates `(user, item)` index pairs of every distinct training edge.
    pub fn edges(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.positives
            .iter()
            .enumerate()
            .flat_map(|(u, items)| items.iter().map(move |&i| (u, i)))
    }

    /// Samples a BPR mini-batch.
    ///
    /// Users are drawn without replacement when `batch_size <= n_users` and
    /// with replacement otherwise. Users who interacted with every item have
    /// no valid negative and are left out of the batch.
    pub fn sample_batch(&mut self, batch_size: usize) -> Batch {
        let n_users = self.n_users();
        let n_items = self.n_items();
        let users: Vec<usize> = if batch_size <= n_users {
            index::sample(&mut self.rng, n_users, batch_size).into_vec()
        } else {
            (0..batch_size)
                .map(|_| self.rng.gen_range(0..n_users))
                .collect()
        };

        let mut batch = Batch {
            users: Vec::with_capacity(users.len()),
            pos_items: Vec::with_capacity(users.len()),
            neg_items: Vec::with_capacity(users.len()),
        };
        for user in users {
            let seen = &self.positives[user];
            if seen.is_empty() || seen.len() >= n_items {
                continue;
            }
            let pos = seen[self.rng.gen_range(0..seen.len())];
            let neg = loop {
                let candidate = self.rng.gen_range(0..n_items);
                if seen.binary_search(&candidate).is_err() {
                    break candidate;
                }
            };
            batch.users.push(user);
            batch.pos_items.push(pos);
            batch.neg_items.push(neg);
        }
        batch
    }
}

/// Errors raised while building the training dataset.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DatasetError {
    /// Training split held no rows.
    #[error("training split is empty")]
    EmptyTrain,
}
