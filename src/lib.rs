pub mod algorithms;
pub mod config;
pub mod data;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use algorithms::{BatchFeatures, ItemIndex, Ranking, TwoTowerModel};
pub use config::{Config, ModelConfig, RecommendationConfig, TrainingConfig};
pub use data::Dataset;
pub use error::{Entity, ModelError};
pub use models::*;
pub use services::{RecommendationService, TrainingService};

/// Installs the global fmt subscriber, filtered by `RUST_LOG`. Later calls
/// are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
