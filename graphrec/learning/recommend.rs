use std::{cmp::Ordering, fs, path::Path};

use indexmap::{IndexMap, IndexSet};
use thiserror::Error;

use crate::{
    dataset::ImplicitCf,
    lightgcn::model::{LightGcn, ModelError},
    metrics::Prediction,
};

/// Top-k recommendations for the given original user ids.
///
/// Items are ranked by score descending, ties broken by ascending item
/// index. With `remove_seen`, items the user interacted with in training are
/// never returned. Users unknown to the training data are skipped.
pub fn recommend_k_items(
    model: &LightGcn,
    data: &ImplicitCf,
    users: impl IntoIterator<Item = u32>,
    top_k: usize,
    remove_seen: bool,
) -> Result<Vec<Prediction>, RecommendError> {
    let users: IndexSet<u32> = users.into_iter().collect();
    let reserve = users.len().saturating_mul(top_k.min(data.n_items()));
    let mut predictions = Vec::with_capacity(reserve);
    for user in users {
        let Some(user_idx) = data.users().index_of(user) else {
            continue;
        };
        let mut scores = model.score_all(user_idx)?;
        if remove_seen {
            for &item in data.user_positives(user_idx) {
                scores[item] = f32::NEG_INFINITY;
            }
        }
        let mut ranked: Vec<(usize, f32)> = scores
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, score)| *score != f32::NEG_INFINITY)
            .collect();
        let k = top_k.min(ranked.len());
        if k == 0 {
            continue;
        }
        if k < ranked.len() {
            ranked.select_nth_unstable_by(k - 1, rank_order);
            ranked.truncate(k);
        }
        ranked.sort_unstable_by(rank_order);
        for (item_idx, score) in ranked {
            if let Some(item) = data.items().id_of(item_idx) {
                predictions.push(Prediction::new(user, item, score));
            }
        }
    }
    Ok(predictions)
}

/// Top-k recommendations for every user of the test split.
pub fn recommend_for_test_users(
    model: &LightGcn,
    data: &ImplicitCf,
    top_k: usize,
    remove_seen: bool,
) -> Result<Vec<Prediction>, RecommendError> {
    let users = data.test().users();
    recommend_k_items(model, data, users, top_k, remove_seen)
}

fn rank_order(a: &(usize, f32), b: &(usize, f32)) -> Ordering {
    b.1.total_cmp(&a.1).then(a.0.cmp(&b.0))
}

/// Writes final user and item embeddings as `id<TAB>v1 v2 ... vd` lines.
pub fn infer_embedding(
    model: &LightGcn,
    data: &ImplicitCf,
    user_file: impl AsRef<Path>,
    item_file: impl AsRef<Path>,
) -> Result<(), RecommendError> {
    let users = (0..data.n_users()).map(|idx| -> Result<(u32, Vec<f32>), ModelError> {
        let id = data.users().id_of(idx).ok_or(ModelError::IndexOutOfRange(idx))?;
        Ok((id, model.user_embedding(idx)?.to_vec()))
    });
    write_embeddings(user_file.as_ref(), users)?;
    let items = (0..data.n_items()).map(|idx| -> Result<(u32, Vec<f32>), ModelError> {
        let id = data.items().id_of(idx).ok_or(ModelError::IndexOutOfRange(idx))?;
        Ok((id, model.item_embedding(idx)?.to_vec()))
    });
    write_embeddings(item_file.as_ref(), items)
}

fn write_embeddings(
    path: &Path,
    rows: impl Iterator<Item = Result<(u32, Vec<f32>), ModelError>>,
) -> Result<(), RecommendError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_path(path)?;
    for row in rows {
        let (id, vector) = row?;
        let joined = vector
            .iter()
            .map(f32::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        writer.write_record([id.to_string(), joined])?;
    }
    writer.flush()?;
    Ok(())
}

/// Reads an embedding file written by [`infer_embedding`].
pub fn read_embeddings(path: impl AsRef<Path>) -> Result<IndexMap<u32, Vec<f32>>, RecommendError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_path(path.as_ref())?;
    let mut out = IndexMap::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let malformed = || RecommendError::Malformed { line: line + 1 };
        let id: u32 = record
            .get(0)
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(malformed)?;
        let vector = record
            .get(1)
            .ok_or_else(malformed)?
            .split_whitespace()
            .map(str::parse::<f32>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| malformed())?;
        out.insert(id, vector);
    }
    Ok(out)
}

/// Errors raised while recommending or exporting embeddings.
#[derive(Debug, Error)]
pub enum RecommendError {
    /// Model not ready or index out of range.
    #[error(transparent)]
    Model(#[from] ModelError),
    /// CSV/TSV failure.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Embedding file line could not be parsed.
    #[error("malformed embedding row at line {line}")]
    Malformed {
        /// 1-based line number.
        line: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::{Interaction, InteractionTable},
        graph::NormalizedAdjacency,
        lightgcn::model::LightGcnConfig,
    };
    use tempfile::tempdir;

    fn trained() -> (LightGcn, ImplicitCf) {
        let train = InteractionTable::new(vec![
            Interaction::new(1, 100, 5.0, 0),
            Interaction::new(1, 101, 5.0, 0),
            Interaction::new(2, 101, 5.0, 0),
            Interaction::new(2, 102, 5.0, 0),
            Interaction::new(3, 103, 5.0, 0),
            Interaction::new(3, 104, 5.0, 0),
        ]);
        let test = InteractionTable::new(vec![
            Interaction::new(1, 102, 5.0, 1),
            Interaction::new(3, 100, 5.0, 1),
        ]);
        let data = ImplicitCf::new(train, test, 3).unwrap();
        let adj = NormalizedAdjacency::build(&data);
        let config = LightGcnConfig {
            embed_size: 4,
            n_layers: 2,
            decay: 1e-4,
            seed: 11,
        };
        let mut model = LightGcn::new(data.n_users(), data.n_items(), config);
        model.refresh(&adj).unwrap();
        (model, data)
    }

    #[test]
    fn excludes_seen_items_and_orders_by_score() {
        let (model, data) = trained();
        let recs = recommend_k_items(&model, &data, [1, 2, 1, 99], 2, true).unwrap();
        assert_eq!(recs.len(), 4);
        assert!(recs.iter().all(|p| p.user != 99));
        for pred in &recs {
            let u = data.users().index_of(pred.user).unwrap();
            let i = data.items().index_of(pred.item).unwrap();
            assert!(!data.user_positives(u).contains(&i));
        }
        for pair in recs.windows(2).filter(|w| w[0].user == w[1].user) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn keeps_seen_items_when_asked_and_caps_at_catalog() {
        let (model, data) = trained();
        let recs = recommend_k_items(&model, &data, [1], 50, false).unwrap();
        assert_eq!(recs.len(), data.n_items());
        let unseen = recommend_k_items(&model, &data, [1], 50, true).unwrap();
        assert_eq!(unseen.len(), data.n_items() - 2);
    }

    #[test]
    fn huge_top_k_returns_whole_catalog() {
        let (model, data) = trained();
        let recs = recommend_k_items(&model, &data, [1, 2, 3], usize::MAX / 2, false).unwrap();
        assert_eq!(recs.len(), 3 * data.n_items());
        for user in [1, 2, 3] {
            assert_eq!(recs.iter().filter(|p| p.user == user).count(), data.n_items());
        }
    }

    #[test]
    fn test_users_drive_recommendations() {
        let (model, data) = trained();
        let recs = recommend_for_test_users(&model, &data, 1, true).unwrap();
        let users: Vec<u32> = recs.iter().map(|p| p.user).collect();
        assert_eq!(users, vec![1, 3]);
    }

    #[test]
    fn exported_embeddings_read_back() {
        let (model, data) = trained();
        let dir = tempdir().unwrap();
        let users = dir.path().join("out/user_embeddings.tsv");
        let items = dir.path().join("out/item_embeddings.tsv");
        infer_embedding(&model, &data, &users, &items).unwrap();

        let user_rows = read_embeddings(&users).unwrap();
        assert_eq!(user_rows.len(), 3);
        assert_eq!(user_rows[&2], model.user_embedding(1).unwrap().to_vec());
        let item_rows = read_embeddings(&items).unwrap();
        assert_eq!(item_rows.keys().copied().collect::<Vec<_>>(), vec![100, 101, 102, 103, 104]);
        assert_eq!(item_rows[&104].len(), 4);
    }
}
