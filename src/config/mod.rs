use crate::algorithms::optimizer::OptimizerKind;
use crate::data::synthetic::SyntheticConfig;
use crate::error::ModelError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub shallow: ModelConfig,
    pub deep: ModelConfig,
    pub training: TrainingConfig,
    pub recommendation: RecommendationConfig,
    pub data: SyntheticConfig,
}

/// Hyperparameters fixed at model construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub embedding_dim: usize,
    /// Hidden widths of the user tower; the last one is its output dimension.
    /// Empty means the tower is the identity on the embedding.
    pub user_hidden: Vec<usize>,
    pub item_hidden: Vec<usize>,
    pub user_feature_dim: usize,
    pub item_feature_dim: usize,
    pub init_std: f32,
    pub learning_rate: f32,
    pub l2_reg: f32,
    pub optimizer: OptimizerKind,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    /// Users with fewer interactions are left out of training.
    pub min_user_interactions: usize,
    pub shuffle_seed: Option<u64>,
    /// Emit a debug line every `log_every` steps; 0 disables it.
    pub log_every: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommendationConfig {
    pub top_k: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 32,
            user_hidden: Vec::new(),
            item_hidden: Vec::new(),
            user_feature_dim: 0,
            item_feature_dim: 0,
            init_std: 0.05,
            learning_rate: 1e-3,
            l2_reg: 0.0,
            optimizer: OptimizerKind::Adam,
            seed: None,
        }
    }
}

impl ModelConfig {
    pub fn shallow(embedding_dim: usize) -> Self {
        Self {
            embedding_dim,
            ..Self::default()
        }
    }

    /// Same hidden widths for both towers, item side features of `item_feature_dim`.
    pub fn deep(embedding_dim: usize, hidden: Vec<usize>, item_feature_dim: usize) -> Self {
        Self {
            embedding_dim,
            user_hidden: hidden.clone(),
            item_hidden: hidden,
            item_feature_dim,
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_l2(mut self, l2_reg: f32) -> Self {
        self.l2_reg = l2_reg;
        self
    }

    pub fn with_user_features(mut self, user_feature_dim: usize) -> Self {
        self.user_feature_dim = user_feature_dim;
        self
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerKind) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn is_deep(&self) -> bool {
        !self.user_hidden.is_empty() || !self.item_hidden.is_empty()
    }

    pub fn user_output_dim(&self) -> usize {
        self.user_hidden.last().copied().unwrap_or(self.embedding_dim)
    }

    pub fn item_output_dim(&self) -> usize {
        self.item_hidden.last().copied().unwrap_or(self.embedding_dim)
    }

    pub fn check(&self) -> Result<(), ModelError> {
        if self.embedding_dim == 0 {
            return Err(ModelError::InvalidConfig(
                "embedding_dim must be positive".to_string(),
            ));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(ModelError::InvalidConfig(format!(
                "learning_rate must be positive and finite, got {}",
                self.learning_rate
            )));
        }
        if !self.l2_reg.is_finite() || self.l2_reg < 0.0 {
            return Err(ModelError::InvalidConfig(format!(
                "l2_reg must be non-negative, got {}",
                self.l2_reg
            )));
        }
        if !self.init_std.is_finite() || self.init_std < 0.0 {
            return Err(ModelError::InvalidConfig(format!(
                "init_std must be non-negative, got {}",
                self.init_std
            )));
        }
        if self.user_output_dim() != self.item_output_dim() {
            return Err(ModelError::TowerDimensionMismatch {
                user: self.user_output_dim(),
                item: self.item_output_dim(),
            });
        }
        Ok(())
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 5,
            batch_size: 512,
            min_user_interactions: 20,
            shuffle_seed: None,
            log_every: 10,
        }
    }
}

impl Default for RecommendationConfig {
    fn default() -> Self {
        Self { top_k: 10 }
    }
}

impl Default for Config {
    fn default() -> Self {
        let data = SyntheticConfig::default();
        Self {
            shallow: ModelConfig::shallow(32),
            deep: ModelConfig::deep(32, vec![64, 32], data.num_genres),
            training: TrainingConfig::default(),
            recommendation: RecommendationConfig::default(),
            data,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("TOWERREC").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_shallow_and_deep_setup() {
        let config = Config::default();
        assert!(!config.shallow.is_deep());
        assert!(config.deep.is_deep());
        assert_eq!(config.deep.user_output_dim(), 32);
        assert_eq!(config.deep.item_feature_dim, config.data.num_genres);
        assert_eq!(config.training.batch_size, 512);
        assert!(config.shallow.check().is_ok());
        assert!(config.deep.check().is_ok());
    }

    #[test]
    fn test_mismatched_towers_rejected() {
        let mut config = ModelConfig::deep(8, vec![16, 8], 0);
        config.item_hidden = vec![16, 4];
        assert_eq!(
            config.check().unwrap_err(),
            ModelError::TowerDimensionMismatch { user: 8, item: 4 }
        );
    }

    #[test]
    fn test_one_sided_tower_must_match_embedding() {
        let mut config = ModelConfig::shallow(8);
        config.item_hidden = vec![8];
        assert!(config.check().is_ok());
        config.item_hidden = vec![6];
        assert!(config.check().is_err());
    }
}
