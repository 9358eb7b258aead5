use crate::algorithms::TwoTowerModel;
use crate::config::RecommendationConfig;
use crate::data::Dataset;
use crate::models::{Interaction, RecommendationItem, RecommendationResponse};
use crate::utils::metrics::{MetricsCalculator, RecommendationMetrics};
use crate::utils::{cosine_similarity, top_k_indices};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

/// Turns a trained model's full ranking into user-facing top-K lists.
pub struct RecommendationService {
    config: RecommendationConfig,
}

impl RecommendationService {
    pub fn new(config: RecommendationConfig) -> Self {
        Self { config }
    }

    pub fn default_top_k(&self) -> usize {
        self.config.top_k
    }

    /// Top `k` items for the dense user index, skipping items the user has
    /// already rated in `dataset`.
    pub fn recommend(
        &self,
        model: &TwoTowerModel,
        dataset: &Dataset,
        user: usize,
        k: usize,
    ) -> Result<RecommendationResponse> {
        let user_id = dataset
            .user_raw_id(user)
            .ok_or_else(|| anyhow!("Unknown user index {}", user))?;
        let ranking = model
            .score_user(user, None)
            .with_context(|| format!("Failed to score user {}", user_id))?;
        let seen = dataset.seen_items(user);

        let recommendations = ranking
            .top_k(k, &seen)
            .into_iter()
            .filter_map(|(item, score)| {
                dataset.item(item).map(|raw| RecommendationItem {
                    item,
                    item_id: raw.id,
                    title: raw.title.clone(),
                    score,
                })
            })
            .collect::<Vec<_>>();

        debug!(
            "Generated {} recommendations for user {} ({} seen items excluded)",
            recommendations.len(),
            user_id,
            seen.len()
        );

        Ok(RecommendationResponse {
            user,
            user_id,
            run_id: model.run_id(),
            recommendations,
            generated_at: Utc::now(),
        })
    }

    pub fn recommend_for_raw_user(
        &self,
        model: &TwoTowerModel,
        dataset: &Dataset,
        user_id: u64,
        k: usize,
    ) -> Result<RecommendationResponse> {
        let user = dataset
            .user_index(user_id)
            .ok_or_else(|| anyhow!("User {} has no ratings", user_id))?;
        self.recommend(model, dataset, user, k)
    }

    /// Items whose tower outputs point the same way as `item`'s.
    pub fn similar_items(
        &self,
        model: &TwoTowerModel,
        dataset: &Dataset,
        item: usize,
        k: usize,
    ) -> Result<Vec<RecommendationItem>> {
        let vectors = model.item_vectors()?;
        if item >= vectors.nrows() {
            return Err(anyhow!("Unknown item index {}", item));
        }

        let query: Vec<f32> = vectors.row(item).iter().copied().collect();
        let scores: Vec<f32> = vectors
            .row_iter()
            .enumerate()
            .map(|(i, row)| {
                if i == item {
                    f32::NEG_INFINITY
                } else {
                    let row: Vec<f32> = row.iter().copied().collect();
                    cosine_similarity(&query, &row)
                }
            })
            .collect();

        Ok(top_k_indices(&scores, k.min(vectors.nrows().saturating_sub(1)))
            .into_iter()
            .filter_map(|i| {
                dataset.item(i).map(|raw| RecommendationItem {
                    item: i,
                    item_id: raw.id,
                    title: raw.title.clone(),
                    score: scores[i],
                })
            })
            .collect())
    }

    /// Ranks every held-out interaction's user against the catalog minus the
    /// items seen in `train`, and averages hit-rate, precision, recall and
    /// NDCG at `k`.
    pub fn evaluate(
        &self,
        model: &TwoTowerModel,
        train: &Dataset,
        holdout: &[Interaction],
        k: usize,
    ) -> Result<RecommendationMetrics> {
        // ascending user order keeps the evaluation deterministic
        let mut relevant: BTreeMap<usize, HashSet<usize>> = BTreeMap::new();
        for interaction in holdout {
            relevant.entry(interaction.user).or_default().insert(interaction.item);
        }

        let mut recommended_lists = Vec::with_capacity(relevant.len());
        let mut relevant_sets = Vec::with_capacity(relevant.len());
        for (user, items) in relevant {
            let ranking = model
                .score_user(user, None)
                .with_context(|| format!("Failed to score user index {}", user))?;
            let seen = train.seen_items(user);
            let recommended: Vec<usize> = ranking.top_k(k, &seen).into_iter().map(|(item, _)| item).collect();
            recommended_lists.push(recommended);
            relevant_sets.push(items);
        }

        let metrics = MetricsCalculator::new(k).calculate_all_metrics(
            &recommended_lists,
            &relevant_sets,
            model.num_items(),
        );
        info!(
            "Evaluated run {} on {} users: hit@{} {:.3}, ndcg@{} {:.3}",
            model.run_id(),
            metrics.users_evaluated,
            k,
            metrics.hit_rate_at_k,
            k,
            metrics.ndcg_at_k
        );
        Ok(metrics)
    }
}
