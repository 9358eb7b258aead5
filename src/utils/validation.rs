use crate::config::{Config, RecommendationConfig, TrainingConfig};
use crate::models::RawItem;
use anyhow::{anyhow, Context, Result};

const MAX_BATCH_SIZE: usize = 65_536;
const MAX_TOP_K: usize = 1000;

pub fn validate_config(config: &Config) -> Result<()> {
    config.shallow.check().context("invalid shallow model config")?;
    config.deep.check().context("invalid deep model config")?;
    validate_training_config(&config.training)?;
    validate_recommendation_config(&config.recommendation)?;

    for (name, model) in [("shallow", &config.shallow), ("deep", &config.deep)] {
        if model.item_feature_dim != 0 && model.item_feature_dim != config.data.num_genres {
            return Err(anyhow!(
                "{} model expects {} item features but the dataset has {} genres",
                name,
                model.item_feature_dim,
                config.data.num_genres
            ));
        }
        if model.user_feature_dim != 0 {
            return Err(anyhow!(
                "{} model expects user features, the dataset provides none",
                name
            ));
        }
    }

    if config.data.num_users == 0 || config.data.num_items == 0 {
        return Err(anyhow!("Dataset needs at least one user and one item"));
    }
    if !(0.0..=1.0).contains(&config.data.affinity) {
        return Err(anyhow!("Genre affinity must be between 0.0 and 1.0"));
    }

    Ok(())
}

pub fn validate_training_config(training: &TrainingConfig) -> Result<()> {
    if training.epochs == 0 {
        return Err(anyhow!("Epoch count must be greater than 0"));
    }
    validate_batch_size(training.batch_size, MAX_BATCH_SIZE)
}

pub fn validate_recommendation_config(recommendation: &RecommendationConfig) -> Result<()> {
    validate_top_k(recommendation.top_k)
}

pub fn validate_top_k(top_k: usize) -> Result<()> {
    if top_k == 0 {
        return Err(anyhow!("Number of recommendations must be greater than 0"));
    }

    if top_k > MAX_TOP_K {
        return Err(anyhow!(
            "Number of recommendations too large: {} (max {})",
            top_k,
            MAX_TOP_K
        ));
    }

    Ok(())
}

pub fn validate_batch_size(batch_size: usize, max_batch_size: usize) -> Result<()> {
    if batch_size == 0 {
        return Err(anyhow!("Batch size cannot be zero"));
    }

    if batch_size > max_batch_size {
        return Err(anyhow!(
            "Batch size too large: {} (max {})",
            batch_size,
            max_batch_size
        ));
    }

    Ok(())
}

/// Every item must carry finite side features of the same width.
pub fn validate_item_features(items: &[RawItem]) -> Result<()> {
    let Some(first) = items.first() else {
        return Ok(());
    };
    let width = first.features.len();

    for item in items {
        if item.features.len() != width {
            return Err(anyhow!(
                "Item {} has {} features, expected {}",
                item.id,
                item.features.len(),
                width
            ));
        }
        if item.features.iter().any(|value| !value.is_finite()) {
            return Err(anyhow!(
                "Item {} features contain invalid values (NaN or Infinity)",
                item.id
            ));
        }
    }

    Ok(())
}
