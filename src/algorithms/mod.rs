pub mod embedding;
pub mod initializer;
pub mod loss;
pub mod optimizer;
pub mod pca;
pub mod retriever;
pub mod tower;
pub mod two_tower;

pub use embedding::EmbeddingTable;
pub use optimizer::{Adam, Optimizer, OptimizerKind, SGD};
pub use pca::Projection;
pub use retriever::{ItemIndex, Ranking};
pub use tower::{DenseLayer, Tower};
pub use two_tower::{BatchFeatures, TwoTowerModel};
