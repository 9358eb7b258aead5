//! Clustered-preference dataset generator.
//!
//! Every item carries a one-hot genre row; every user has a favourite genre
//! and draws most of its interactions from it. Used by the trainer binary
//! and the benchmarks in place of a real catalog.

use crate::models::{RawItem, RawRating};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub num_users: usize,
    pub num_items: usize,
    pub num_genres: usize,
    pub interactions_per_user: usize,
    /// Probability that an interaction is drawn from the favourite genre.
    pub affinity: f64,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            num_users: 300,
            num_items: 400,
            num_genres: 19,
            interactions_per_user: 30,
            affinity: 0.8,
            seed: 7,
        }
    }
}

pub const FIRST_ITEM_ID: u64 = 1000;

pub fn item_genre(item: usize, num_genres: usize) -> Option<usize> {
    (num_genres > 0).then(|| item % num_genres)
}

/// Favourite genre of each generated user, indexed by `user_id - 1`.
pub fn favourite_genres(config: &SyntheticConfig) -> Vec<Option<usize>> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    (0..config.num_users)
        .map(|_| (config.num_genres > 0).then(|| rng.gen_range(0..config.num_genres)))
        .collect()
}

pub fn generate(config: &SyntheticConfig) -> (Vec<RawItem>, Vec<RawRating>) {
    let items: Vec<RawItem> = (0..config.num_items)
        .map(|i| {
            let mut features = vec![0.0; config.num_genres];
            if let Some(genre) = item_genre(i, config.num_genres) {
                features[genre] = 1.0;
            }
            RawItem::new(FIRST_ITEM_ID + i as u64, format!("Item {}", i)).with_features(features)
        })
        .collect();

    let mut by_genre: Vec<Vec<usize>> = vec![Vec::new(); config.num_genres];
    for i in 0..config.num_items {
        if let Some(genre) = item_genre(i, config.num_genres) {
            by_genre[genre].push(i);
        }
    }

    let favourites = favourite_genres(config);
    // separate stream so favourites stay stable if sampling changes
    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(1));
    let per_user = config.interactions_per_user.min(config.num_items);
    let mut ratings = Vec::with_capacity(config.num_users * per_user);

    for (u, favourite) in favourites.iter().copied().enumerate() {
        let user_id = u as u64 + 1;
        let mut chosen = HashSet::with_capacity(per_user);
        let mut attempts = 0;

        while chosen.len() < per_user && attempts < per_user * 20 {
            attempts += 1;
            let pool = favourite
                .filter(|_| rng.gen_bool(config.affinity.clamp(0.0, 1.0)))
                .map(|genre| &by_genre[genre]);
            let item = match pool.and_then(|pool| pool.choose(&mut rng)) {
                Some(&item) => item,
                None => rng.gen_range(0..config.num_items),
            };
            chosen.insert(item);
        }

        let mut chosen: Vec<usize> = chosen.into_iter().collect();
        chosen.sort_unstable();
        chosen.shuffle(&mut rng);

        for (k, item) in chosen.into_iter().enumerate() {
            let liked = item_genre(item, config.num_genres) == favourite;
            let rating: f32 = if liked {
                rng.gen_range(4..=5) as f32
            } else {
                rng.gen_range(1..=3) as f32
            };
            let timestamp = 880_000_000 + (u as i64) * 10_000 + (k as i64) * 60;
            ratings.push(RawRating::new(user_id, FIRST_ITEM_ID + item as u64, rating, timestamp));
        }
    }

    (items, ratings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> SyntheticConfig {
        SyntheticConfig {
            num_users: 12,
            num_items: 40,
            num_genres: 4,
            interactions_per_user: 8,
            affinity: 0.9,
            seed: 3,
        }
    }

    #[test]
    fn test_generate_is_deterministic() {
        let (items_a, ratings_a) = generate(&small());
        let (items_b, ratings_b) = generate(&small());
        assert_eq!(items_a, items_b);
        assert_eq!(ratings_a, ratings_b);
    }

    #[test]
    fn test_shape_of_generated_data() {
        let config = small();
        let (items, ratings) = generate(&config);
        assert_eq!(items.len(), 40);
        assert!(items
            .iter()
            .all(|i| i.features.len() == 4 && i.features.iter().sum::<f32>() == 1.0));
        assert_eq!(ratings.len(), 12 * 8);

        for user_id in 1..=12u64 {
            let items: HashSet<u64> = ratings
                .iter()
                .filter(|r| r.user_id == user_id)
                .map(|r| r.item_id)
                .collect();
            assert_eq!(items.len(), 8);
        }
    }

    #[test]
    fn test_users_lean_to_favourite_genre() {
        let config = small();
        let favourites = favourite_genres(&config);
        let (_, ratings) = generate(&config);
        let in_favourite = ratings
            .iter()
            .filter(|r| {
                let item = (r.item_id - FIRST_ITEM_ID) as usize;
                item_genre(item, config.num_genres) == favourites[(r.user_id - 1) as usize]
            })
            .count();
        assert!(in_favourite * 2 > ratings.len());
    }
}
