use crate::algorithms::{BatchFeatures, TwoTowerModel};
use crate::config::TrainingConfig;
use crate::data::Dataset;
use crate::models::TrainingReport;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Runs epochs of in-batch contrastive training over a dataset.
pub struct TrainingService {
    config: TrainingConfig,
    cancel: Arc<AtomicBool>,
}

impl TrainingService {
    pub fn new(config: TrainingConfig) -> Self {
        Self {
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Setting the flag stops training at the next batch boundary.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn fit(&self, model: &mut TwoTowerModel, dataset: &Dataset) -> Result<TrainingReport> {
        let mut reports = self.fit_all(std::slice::from_mut(model), dataset)?;
        reports
            .pop()
            .ok_or_else(|| anyhow!("Training produced no report"))
    }

    /// Trains every model on the same shuffled batches, then rebuilds each
    /// model's item index. A cancelled run still builds the indexes.
    pub fn fit_all(&self, models: &mut [TwoTowerModel], dataset: &Dataset) -> Result<Vec<TrainingReport>> {
        if self.config.batch_size == 0 {
            return Err(anyhow!("Batch size cannot be zero"));
        }
        for model in models.iter() {
            check_model_fits(model, dataset)?;
        }

        let mut pairs = dataset.training_pairs(self.config.min_user_interactions);
        if pairs.is_empty() {
            warn!(
                "No user has at least {} interactions, nothing to train on",
                self.config.min_user_interactions
            );
        }
        info!(
            "Training {} model(s) on {} pairs from {} users for {} epochs",
            models.len(),
            pairs.len(),
            dataset.active_users(self.config.min_user_interactions).len(),
            self.config.epochs
        );

        let started_at = Utc::now();
        let mut reports: Vec<TrainingReport> = models
            .iter()
            .map(|model| TrainingReport::new(model.run_id(), model.is_deep(), started_at))
            .collect();
        let mut rng = match self.config.shuffle_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut cancelled = false;
        'epochs: for epoch in 0..self.config.epochs {
            pairs.shuffle(&mut rng);
            let first_step = reports.first().map(|r| r.steps).unwrap_or(0);

            for batch in pairs.chunks(self.config.batch_size) {
                if self.is_cancelled() {
                    warn!("Training cancelled during epoch {}", epoch + 1);
                    cancelled = true;
                    break 'epochs;
                }

                let (users, items): (Vec<usize>, Vec<usize>) = batch.iter().copied().unzip();
                let item_features = if dataset.feature_dim() > 0 {
                    Some(dataset.item_features_for(&items)?)
                } else {
                    None
                };

                for (model, report) in models.iter_mut().zip(reports.iter_mut()) {
                    let features = match &item_features {
                        Some(features) if model.item_tower().feature_dim() > 0 => BatchFeatures::items(features),
                        _ => BatchFeatures::default(),
                    };
                    let loss = model
                        .train_step(&users, &items, features)
                        .with_context(|| format!("Training step failed for run {}", model.run_id()))?;
                    report.record_step(loss);

                    if self.config.log_every > 0 && report.steps % self.config.log_every == 0 {
                        debug!(
                            "run {} epoch {} step {}: loss {:.4}",
                            model.run_id(),
                            epoch + 1,
                            report.steps,
                            loss
                        );
                    }
                }
            }

            for report in reports.iter_mut() {
                report.close_epoch(first_step);
                info!(
                    "Epoch {}/{} done for {} model {}: mean loss {:.4}",
                    epoch + 1,
                    self.config.epochs,
                    if report.deep { "deep" } else { "shallow" },
                    report.run_id,
                    report.epoch_losses.last().copied().unwrap_or(f32::NAN)
                );
            }
        }

        let item_features = (dataset.feature_dim() > 0).then(|| dataset.item_feature_matrix());
        for (model, report) in models.iter_mut().zip(reports.iter_mut()) {
            let features = item_features
                .as_ref()
                .filter(|_| model.item_tower().feature_dim() > 0);
            model
                .build_index(features)
                .with_context(|| format!("Failed to build item index for run {}", model.run_id()))?;

            report.cancelled = cancelled;
            report.finished_at = Utc::now();
            info!(
                "Completed training run {}: {} steps, final loss {:?}",
                report.run_id,
                report.steps,
                report.final_loss()
            );
        }

        Ok(reports)
    }
}

fn check_model_fits(model: &TwoTowerModel, dataset: &Dataset) -> Result<()> {
    if model.num_users() < dataset.num_users() || model.num_items() < dataset.num_items() {
        return Err(anyhow!(
            "Model sized for {} users and {} items cannot train on {} users and {} items",
            model.num_users(),
            model.num_items(),
            dataset.num_users(),
            dataset.num_items()
        ));
    }

    let wanted = model.item_tower().feature_dim();
    let available = dataset.feature_dim();
    if wanted > 0 && wanted != available {
        return Err(anyhow!(
            "Item tower expects {} features, dataset has {}",
            wanted,
            available
        ));
    }
    if wanted == 0 && available > 0 {
        debug!("Run {} ignores item side features", model.run_id());
    }

    Ok(())
}
