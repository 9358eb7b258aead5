//! Raw-id remapping and the in-memory interaction dataset the trainer reads.

pub mod synthetic;

use crate::models::{Interaction, RawItem, RawRating};
use anyhow::{bail, Result};
use nalgebra::DMatrix;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

/// Assigns dense zero-based indices to raw ids in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    to_index: HashMap<u64, usize>,
    raw_ids: Vec<u64>,
}

impl Vocabulary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_insert(&mut self, raw_id: u64) -> usize {
        if let Some(&index) = self.to_index.get(&raw_id) {
            return index;
        }
        let index = self.raw_ids.len();
        self.raw_ids.push(raw_id);
        self.to_index.insert(raw_id, index);
        index
    }

    pub fn index_of(&self, raw_id: u64) -> Option<usize> {
        self.to_index.get(&raw_id).copied()
    }

    pub fn raw_id(&self, index: usize) -> Option<u64> {
        self.raw_ids.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.raw_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw_ids.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Dataset {
    items: Vec<RawItem>,
    item_vocab: Vocabulary,
    user_vocab: Vocabulary,
    interactions: Vec<Interaction>,
    /// Per user, most recent first.
    histories: Vec<Vec<Interaction>>,
    feature_dim: usize,
    skipped_ratings: usize,
}

impl Dataset {
    /// Items are indexed in catalog order, users in order of first rating.
    /// Ratings that reference an item missing from the catalog are skipped.
    pub fn from_raw(items: Vec<RawItem>, ratings: &[RawRating]) -> Result<Self> {
        let feature_dim = items.first().map(|item| item.features.len()).unwrap_or(0);

        let mut item_vocab = Vocabulary::new();
        let mut catalog = Vec::with_capacity(items.len());
        for item in items {
            if item.features.len() != feature_dim {
                bail!(
                    "item {} has {} features, expected {}",
                    item.id,
                    item.features.len(),
                    feature_dim
                );
            }
            if item_vocab.index_of(item.id).is_some() {
                warn!("Duplicate catalog entry for item {} ignored", item.id);
                continue;
            }
            item_vocab.get_or_insert(item.id);
            catalog.push(item);
        }

        let mut user_vocab = Vocabulary::new();
        let mut interactions = Vec::with_capacity(ratings.len());
        let mut skipped_ratings = 0;
        for rating in ratings {
            let Some(item) = item_vocab.index_of(rating.item_id) else {
                skipped_ratings += 1;
                continue;
            };
            let user = user_vocab.get_or_insert(rating.user_id);
            interactions.push(Interaction {
                user,
                item,
                rating: rating.rating,
                timestamp: rating.timestamp,
            });
        }

        if skipped_ratings > 0 {
            warn!("Skipped {} ratings referencing unknown items", skipped_ratings);
        }

        let dataset = Self::from_parts(catalog, item_vocab, user_vocab, interactions, feature_dim, skipped_ratings);
        info!(
            "Loaded dataset: {} users, {} items, {} interactions",
            dataset.num_users(),
            dataset.num_items(),
            dataset.interactions.len()
        );
        Ok(dataset)
    }

    fn from_parts(
        items: Vec<RawItem>,
        item_vocab: Vocabulary,
        user_vocab: Vocabulary,
        interactions: Vec<Interaction>,
        feature_dim: usize,
        skipped_ratings: usize,
    ) -> Self {
        let mut histories = vec![Vec::new(); user_vocab.len()];
        for interaction in &interactions {
            histories[interaction.user].push(*interaction);
        }
        for history in &mut histories {
            history.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        }

        Self {
            items,
            item_vocab,
            user_vocab,
            interactions,
            histories,
            feature_dim,
            skipped_ratings,
        }
    }

    pub fn num_users(&self) -> usize {
        self.user_vocab.len()
    }

    pub fn num_items(&self) -> usize {
        self.items.len()
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    pub fn skipped_ratings(&self) -> usize {
        self.skipped_ratings
    }

    pub fn interactions(&self) -> &[Interaction] {
        &self.interactions
    }

    pub fn item(&self, index: usize) -> Option<&RawItem> {
        self.items.get(index)
    }

    pub fn user_raw_id(&self, user: usize) -> Option<u64> {
        self.user_vocab.raw_id(user)
    }

    pub fn user_index(&self, raw_id: u64) -> Option<usize> {
        self.user_vocab.index_of(raw_id)
    }

    pub fn item_index(&self, raw_id: u64) -> Option<usize> {
        self.item_vocab.index_of(raw_id)
    }

    /// Interactions of `user`, most recent first.
    pub fn history(&self, user: usize) -> &[Interaction] {
        self.histories.get(user).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn seen_items(&self, user: usize) -> HashSet<usize> {
        self.history(user).iter().map(|i| i.item).collect()
    }

    /// Users with at least `min_interactions` interactions, ascending.
    pub fn active_users(&self, min_interactions: usize) -> Vec<usize> {
        (0..self.num_users())
            .filter(|&u| self.histories[u].len() >= min_interactions)
            .collect()
    }

    /// `(user, item)` positives of every active user, in load order.
    pub fn training_pairs(&self, min_interactions: usize) -> Vec<(usize, usize)> {
        self.interactions
            .iter()
            .filter(|i| self.histories[i.user].len() >= min_interactions)
            .map(|i| (i.user, i.item))
            .collect()
    }

    /// Best rated items of `user`, the more recent first among equal ratings.
    pub fn top_rated(&self, user: usize, n: usize) -> Vec<usize> {
        let mut history = self.history(user).to_vec();
        history.sort_by(|a, b| {
            b.rating
                .partial_cmp(&a.rating)
                .unwrap_or(Ordering::Equal)
                .then(b.timestamp.cmp(&a.timestamp))
        });
        history.into_iter().take(n).map(|i| i.item).collect()
    }

    /// `[num_items, feature_dim]` side-feature matrix in item index order.
    pub fn item_feature_matrix(&self) -> DMatrix<f32> {
        DMatrix::from_fn(self.num_items(), self.feature_dim, |r, c| self.items[r].features[c])
    }

    /// Side-feature rows for a batch of item indices.
    pub fn item_features_for(&self, items: &[usize]) -> Result<DMatrix<f32>> {
        if let Some(&bad) = items.iter().find(|&&item| item >= self.items.len()) {
            bail!("item index {} out of range for {} items", bad, self.items.len());
        }
        Ok(DMatrix::from_fn(items.len(), self.feature_dim, |r, c| self.items[items[r]].features[c]))
    }

    /// Holds out the most recent interaction of every user that has at least
    /// `min_interactions` (and never fewer than two). Returns the remaining
    /// dataset, with unchanged indices, and the held-out interactions.
    pub fn leave_last_out(&self, min_interactions: usize) -> (Dataset, Vec<Interaction>) {
        let threshold = min_interactions.max(2);
        let mut held_out = Vec::new();
        let mut dropped: HashSet<(usize, usize, i64)> = HashSet::new();

        for history in &self.histories {
            if history.len() >= threshold {
                let last = history[0];
                dropped.insert((last.user, last.item, last.timestamp));
                held_out.push(last);
            }
        }

        let mut remaining = Vec::with_capacity(self.interactions.len());
        for interaction in &self.interactions {
            let key = (interaction.user, interaction.item, interaction.timestamp);
            // drop exactly one copy per held-out key
            if !dropped.remove(&key) {
                remaining.push(*interaction);
            }
        }

        let train = Self::from_parts(
            self.items.clone(),
            self.item_vocab.clone(),
            self.user_vocab.clone(),
            remaining,
            self.feature_dim,
            self.skipped_ratings,
        );
        (train, held_out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Vec<RawItem> {
        vec![
            RawItem::new(10, "A").with_features(vec![1.0, 0.0]),
            RawItem::new(20, "B").with_features(vec![0.0, 1.0]),
            RawItem::new(30, "C").with_features(vec![1.0, 1.0]),
        ]
    }

    fn ratings() -> Vec<RawRating> {
        vec![
            RawRating::new(7, 20, 4.0, 100),
            RawRating::new(5, 10, 3.0, 50),
            RawRating::new(7, 30, 5.0, 90),
            RawRating::new(7, 99, 5.0, 95),
            RawRating::new(7, 10, 4.0, 120),
        ]
    }

    #[test]
    fn test_vocabulary_first_seen_order() {
        let mut vocab = Vocabulary::new();
        assert_eq!(vocab.get_or_insert(42), 0);
        assert_eq!(vocab.get_or_insert(7), 1);
        assert_eq!(vocab.get_or_insert(42), 0);
        assert_eq!(vocab.raw_id(1), Some(7));
        assert_eq!(vocab.index_of(8), None);
        assert_eq!(vocab.len(), 2);
    }

    #[test]
    fn test_remaps_and_skips_unknown_items() {
        let dataset = Dataset::from_raw(catalog(), &ratings()).unwrap();
        assert_eq!(dataset.num_items(), 3);
        assert_eq!(dataset.num_users(), 2);
        assert_eq!(dataset.skipped_ratings(), 1);
        assert_eq!(dataset.user_index(7), Some(0));
        assert_eq!(dataset.user_index(5), Some(1));
        assert_eq!(dataset.item_index(30), Some(2));
    }

    #[test]
    fn test_history_and_top_rated() {
        let dataset = Dataset::from_raw(catalog(), &ratings()).unwrap();
        let items: Vec<usize> = dataset.history(0).iter().map(|i| i.item).collect();
        assert_eq!(items, vec![0, 1, 2]);
        // rating desc, then most recent first
        assert_eq!(dataset.top_rated(0, 2), vec![2, 0]);
        assert_eq!(dataset.seen_items(1), HashSet::from([0]));
    }

    #[test]
    fn test_activity_filter() {
        let dataset = Dataset::from_raw(catalog(), &ratings()).unwrap();
        assert_eq!(dataset.active_users(2), vec![0]);
        assert_eq!(dataset.training_pairs(2), vec![(0, 1), (0, 2), (0, 0)]);
    }

    #[test]
    fn test_feature_matrices() {
        let dataset = Dataset::from_raw(catalog(), &ratings()).unwrap();
        let all = dataset.item_feature_matrix();
        assert_eq!(all.shape(), (3, 2));
        assert_eq!(all[(2, 1)], 1.0);
        let batch = dataset.item_features_for(&[1, 1, 0]).unwrap();
        assert_eq!(batch, DMatrix::from_row_slice(3, 2, &[0.0, 1.0, 0.0, 1.0, 1.0, 0.0]));
        assert!(dataset.item_features_for(&[0, 3]).is_err());
    }

    #[test]
    fn test_inconsistent_feature_width_rejected() {
        let mut items = catalog();
        items.push(RawItem::new(40, "D").with_features(vec![1.0]));
        assert!(Dataset::from_raw(items, &ratings()).is_err());
    }

    #[test]
    fn test_leave_last_out() {
        let dataset = Dataset::from_raw(catalog(), &ratings()).unwrap();
        let (train, held_out) = dataset.leave_last_out(2);
        assert_eq!(held_out.len(), 1);
        assert_eq!(held_out[0].item, 0);
        assert_eq!(held_out[0].timestamp, 120);
        assert_eq!(train.history(0).len(), 2);
        assert_eq!(train.history(1).len(), 1);
        assert_eq!(train.num_users(), dataset.num_users());
    }
}
