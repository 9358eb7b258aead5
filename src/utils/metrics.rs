use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Offline ranking quality averaged over evaluated users.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecommendationMetrics {
    pub k: usize,
    pub users_evaluated: usize,
    pub hit_rate_at_k: f64,
    pub precision_at_k: f64,
    pub recall_at_k: f64,
    pub ndcg_at_k: f64,
    /// Share of the catalog that shows up in at least one list.
    pub coverage: f64,
}

#[derive(Debug, Clone)]
pub struct MetricsCalculator {
    k: usize,
}

impl MetricsCalculator {
    pub fn new(k: usize) -> Self {
        Self { k }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    fn hits(&self, recommended: &[usize], relevant: &HashSet<usize>) -> usize {
        recommended
            .iter()
            .take(self.k)
            .filter(|item| relevant.contains(*item))
            .count()
    }

    pub fn calculate_hit_rate_at_k(&self, recommended: &[usize], relevant: &HashSet<usize>) -> f64 {
        if self.hits(recommended, relevant) > 0 {
            1.0
        } else {
            0.0
        }
    }

    pub fn calculate_precision_at_k(&self, recommended: &[usize], relevant: &HashSet<usize>) -> f64 {
        if recommended.is_empty() || self.k == 0 {
            return 0.0;
        }

        self.hits(recommended, relevant) as f64 / self.k.min(recommended.len()) as f64
    }

    pub fn calculate_recall_at_k(&self, recommended: &[usize], relevant: &HashSet<usize>) -> f64 {
        if relevant.is_empty() {
            return 0.0;
        }

        self.hits(recommended, relevant) as f64 / relevant.len() as f64
    }

    /// Binary-relevance NDCG.
    pub fn calculate_ndcg_at_k(&self, recommended: &[usize], relevant: &HashSet<usize>) -> f64 {
        let dcg: f64 = recommended
            .iter()
            .take(self.k)
            .enumerate()
            .filter(|(_, item)| relevant.contains(*item))
            .map(|(i, _)| discount(i))
            .sum();
        let idcg: f64 = (0..relevant.len().min(self.k)).map(discount).sum();

        if idcg == 0.0 {
            0.0
        } else {
            dcg / idcg
        }
    }

    pub fn calculate_coverage(&self, recommended_lists: &[Vec<usize>], num_items: usize) -> f64 {
        if num_items == 0 {
            return 0.0;
        }

        let covered: HashSet<usize> = recommended_lists
            .iter()
            .flat_map(|list| list.iter().take(self.k).copied())
            .filter(|&item| item < num_items)
            .collect();
        covered.len() as f64 / num_items as f64
    }

    /// Averages per-user metrics over paired `(recommended, relevant)` lists.
    pub fn calculate_all_metrics(
        &self,
        recommended_lists: &[Vec<usize>],
        relevant_sets: &[HashSet<usize>],
        num_items: usize,
    ) -> RecommendationMetrics {
        let users = recommended_lists.len().min(relevant_sets.len());
        if users == 0 {
            return RecommendationMetrics {
                k: self.k,
                ..RecommendationMetrics::default()
            };
        }

        let pairs = recommended_lists.iter().zip(relevant_sets.iter());
        let mut hit_rate = 0.0;
        let mut precision = 0.0;
        let mut recall = 0.0;
        let mut ndcg = 0.0;
        for (recommended, relevant) in pairs {
            hit_rate += self.calculate_hit_rate_at_k(recommended, relevant);
            precision += self.calculate_precision_at_k(recommended, relevant);
            recall += self.calculate_recall_at_k(recommended, relevant);
            ndcg += self.calculate_ndcg_at_k(recommended, relevant);
        }

        let n = users as f64;
        RecommendationMetrics {
            k: self.k,
            users_evaluated: users,
            hit_rate_at_k: hit_rate / n,
            precision_at_k: precision / n,
            recall_at_k: recall / n,
            ndcg_at_k: ndcg / n,
            coverage: self.calculate_coverage(&recommended_lists[..users], num_items),
        }
    }
}

// rank 0 gets full credit
fn discount(rank: usize) -> f64 {
    1.0 / ((rank + 2) as f64).log2()
}
