use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Rating as it arrives from the catalog, keyed by raw ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRating {
    pub user_id: u64,
    pub item_id: u64,
    pub rating: f32,
    pub timestamp: i64,
}

/// Catalog entry with its side-feature row (e.g. genre flags).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    pub id: u64,
    pub title: String,
    pub features: Vec<f32>,
}

/// Implicit-positive interaction on dense indices.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub user: usize,
    pub item: usize,
    pub rating: f32,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingReport {
    pub run_id: Uuid,
    pub deep: bool,
    pub epochs_completed: usize,
    pub steps: usize,
    /// Loss of every batch, in training order.
    pub losses: Vec<f32>,
    /// Mean batch loss of every completed epoch.
    pub epoch_losses: Vec<f32>,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationItem {
    pub item: usize,
    pub item_id: u64,
    pub title: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationResponse {
    pub user: usize,
    pub user_id: u64,
    pub run_id: Uuid,
    pub recommendations: Vec<RecommendationItem>,
    pub generated_at: DateTime<Utc>,
}

impl RawRating {
    pub fn new(user_id: u64, item_id: u64, rating: f32, timestamp: i64) -> Self {
        Self {
            user_id,
            item_id,
            rating,
            timestamp,
        }
    }
}

impl RawItem {
    pub fn new(id: u64, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            features: Vec::new(),
        }
    }

    pub fn with_features(mut self, features: Vec<f32>) -> Self {
        self.features = features;
        self
    }
}

impl TrainingReport {
    pub fn new(run_id: Uuid, deep: bool, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            deep,
            epochs_completed: 0,
            steps: 0,
            losses: Vec::new(),
            epoch_losses: Vec::new(),
            cancelled: false,
            started_at,
            finished_at: started_at,
        }
    }

    pub fn final_loss(&self) -> Option<f32> {
        self.losses.last().copied()
    }

    pub(crate) fn record_step(&mut self, loss: f32) {
        self.losses.push(loss);
        self.steps += 1;
    }

    /// Closes the epoch whose batches start at `first_step`.
    pub(crate) fn close_epoch(&mut self, first_step: usize) {
        let epoch = &self.losses[first_step.min(self.losses.len())..];
        if !epoch.is_empty() {
            self.epoch_losses
                .push(epoch.iter().sum::<f32>() / epoch.len() as f32);
        }
        self.epochs_completed += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_epoch_bookkeeping() {
        let mut report = TrainingReport::new(Uuid::new_v4(), false, Utc::now());
        assert_eq!(report.final_loss(), None);

        report.record_step(2.0);
        report.record_step(1.0);
        report.close_epoch(0);
        report.record_step(0.5);
        report.close_epoch(2);

        assert_eq!(report.steps, 3);
        assert_eq!(report.epochs_completed, 2);
        assert_eq!(report.epoch_losses, vec![1.5, 0.5]);
        assert_eq!(report.final_loss(), Some(0.5));
    }

    #[test]
    fn test_item_builder() {
        let item = RawItem::new(7, "Toy Story (1995)").with_features(vec![0.0, 1.0]);
        assert_eq!(item.title, "Toy Story (1995)");
        assert_eq!(item.features.len(), 2);
    }
}
