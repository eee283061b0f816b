use rand::{rngs::SmallRng, seq::SliceRandom, SeedableRng};
use thiserror::Error;

use crate::data::InteractionTable;

/// Splits each user's interactions into train/test by `ratio`.
///
/// Users with fewer than `min_rating` interactions are dropped. Every
/// remaining user contributes `round(ratio * n)` rows to train and the rest
/// to test, chosen uniformly at random from a generator seeded with `seed`.
pub fn stratified_split(
    table: &InteractionTable,
    ratio: f64,
    min_rating: usize,
    seed: u64,
) -> Result<(InteractionTable, InteractionTable), SplitError> {
    if !(ratio > 0.0 && ratio < 1.0) {
        return Err(SplitError::InvalidRatio(ratio));
    }
    let mut parts = stratified_split_multi(table, &[ratio, 1.0 - ratio], min_rating, seed)?;
    let test = parts.pop().unwrap_or_default();
    let train = parts.pop().unwrap_or_default();
    Ok((train, test))
}

/// Splits each user's interactions into `ratios.len()` partitions.
///
/// Ratios are normalized when they do not sum to one.
pub fn stratified_split_multi(
    table: &InteractionTable,
    ratios: &[f64],
    min_rating: usize,
    seed: u64,
) -> Result<Vec<InteractionTable>, SplitError> {
    let ratios = normalize_ratios(ratios)?;
    let mut cumulative = Vec::with_capacity(ratios.len());
    let mut acc = 0.0;
    for ratio in &ratios {
        acc += ratio;
        cumulative.push(acc);
    }

    let mut rng = SmallRng::seed_from_u64(seed);
    let mut partitions = vec![Vec::new(); ratios.len()];
    let mut kept_users = 0usize;
    for (_, mut rows) in table.group_by_user() {
        if rows.len() < min_rating.max(1) {
            continue;
        }
        kept_users += 1;
        rows.shuffle(&mut rng);
        let n = rows.len();
        let mut start = 0;
        for (part, bound) in cumulative.iter().enumerate() {
            let end = if part + 1 == cumulative.len() {
                n
            } else {
                cut_point(*bound, n).max(start)
            };
            partitions[part].extend_from_slice(&rows[start..end]);
            start = end;
        }
    }
    if kept_users == 0 {
        return Err(SplitError::NoEligibleUsers { min_rating });
    }
    Ok(partitions.into_iter().map(InteractionTable::new).collect())
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn cut_point(fraction: f64, n: usize) -> usize {
    ((fraction * n as f64).round() as usize).min(n)
}

fn normalize_ratios(ratios: &[f64]) -> Result<Vec<f64>, SplitError> {
    if ratios.is_empty() {
        return Err(SplitError::NoRatios);
    }
    if let Some(bad) = ratios.iter().find(|r| !(r.is_finite() && **r > 0.0)) {
        return Err(SplitError::InvalidRatio(*bad));
    }
    let total: f64 = ratios.iter().sum();
    if (total - 1.0).abs() < 1e-9 {
        Ok(ratios.to_vec())
    } else {
        Ok(ratios.iter().map(|r| r / total).collect())
    }
}

/// Errors raised by the splitters.
#[derive(Debug, Error, PartialEq)]
pub enum SplitError {
    /// Ratio outside the accepted range.
    #[error("invalid split ratio {0}")]
    InvalidRatio(f64),
    /// No ratios were supplied.
    #[error("at least one split ratio is required")]
    NoRatios,
    /// Every user was filtered out.
    #[error("no user has at least {min_rating} interactions")]
    NoEligibleUsers {
        /// Threshold that was applied.
        min_rating: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Interaction;
    use std::collections::HashSet;

    fn table() -> InteractionTable {
        let mut rows = Vec::new();
        for user in 1..=4u32 {
            for item in 0..(user * 4) {
                rows.push(Interaction::new(user, item, 4.0, i64::from(item)));
            }
        }
        rows.push(Interaction::new(9, 1, 5.0, 0));
        InteractionTable::new(rows)
    }

    #[test]
    fn splits_each_user_by_ratio() {
        let (train, test) = stratified_split(&table(), 0.75, 2, 42).unwrap();
        for user in 1..=4u32 {
            let n = (user * 4) as usize;
            let in_train = train.iter().filter(|r| r.user == user).count();
            let in_test = test.iter().filter(|r| r.user == user).count();
            assert_eq!(in_train, n * 3 / 4);
            assert_eq!(in_train + in_test, n);
        }
        assert!(!train.users().contains(&9));
        assert!(!test.users().contains(&9));
    }

    #[test]
    fn partitions_are_disjoint_and_seeded() {
        let (train_a, test_a) = stratified_split(&table(), 0.5, 1, 7).unwrap();
        let (train_b, _) = stratified_split(&table(), 0.5, 1, 7).unwrap();
        assert_eq!(train_a, train_b);
        let train_keys: HashSet<_> = train_a.iter().map(|r| (r.user, r.item)).collect();
        assert!(test_a.iter().all(|r| !train_keys.contains(&(r.user, r.item))));
        assert_eq!(train_a.len() + test_a.len(), table().len());
    }

    #[test]
    fn multi_split_normalizes_ratios() {
        let parts = stratified_split_multi(&table(), &[2.0, 1.0, 1.0], 1, 3).unwrap();
        assert_eq!(parts.len(), 3);
        let user4: Vec<usize> = parts
            .iter()
            .map(|p| p.iter().filter(|r| r.user == 4).count())
            .collect();
        assert_eq!(user4, vec![8, 4, 4]);
    }

    #[test]
    fn rejects_bad_inputs() {
        assert_eq!(
            stratified_split(&table(), 1.0, 1, 0).unwrap_err(),
            SplitError::InvalidRatio(1.0)
        );
        assert_eq!(
            stratified_split_multi(&table(), &[], 1, 0).unwrap_err(),
            SplitError::NoRatios
        );
        assert_eq!(
            stratified_split(&table(), 0.5, 100, 0).unwrap_err(),
            SplitError::NoEligibleUsers { min_rating: 100 }
        );
    }
}
