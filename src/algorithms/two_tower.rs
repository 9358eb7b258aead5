//! Two-tower retrieval model.
//!
//! Owns the user/item embedding tables, the two tower encoders, the optimizer
//! state and the item index. Each instance is independent; retraining from
//! scratch means building a new instance and dropping the old one.

use crate::algorithms::embedding::EmbeddingTable;
use crate::algorithms::initializer::seeded_rng;
use crate::algorithms::loss::in_batch_softmax;
use crate::algorithms::optimizer::Optimizer;
use crate::algorithms::pca::{self, Projection};
use crate::algorithms::retriever::{ItemIndex, Ranking};
use crate::algorithms::tower::Tower;
use crate::config::ModelConfig;
use crate::error::{Entity, ModelError, Result};
use nalgebra::DMatrix;
use std::fmt;
use tracing::{debug, info};
use uuid::Uuid;

/// Optional side-feature batches for a training step, one row per pair.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchFeatures<'a> {
    pub users: Option<&'a DMatrix<f32>>,
    pub items: Option<&'a DMatrix<f32>>,
}

impl<'a> BatchFeatures<'a> {
    pub fn items(items: &'a DMatrix<f32>) -> Self {
        Self {
            users: None,
            items: Some(items),
        }
    }
}

pub struct TwoTowerModel {
    run_id: Uuid,
    config: ModelConfig,
    user_embeddings: EmbeddingTable,
    item_embeddings: EmbeddingTable,
    user_tower: Tower,
    item_tower: Tower,
    optimizer: Box<dyn Optimizer>,
    /// Bumped by every parameter update.
    version: u64,
    item_index: Option<ItemIndex>,
}

impl fmt::Debug for TwoTowerModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwoTowerModel")
            .field("run_id", &self.run_id)
            .field("num_users", &self.num_users())
            .field("num_items", &self.num_items())
            .field("deep", &self.is_deep())
            .field("version", &self.version)
            .field("index_version", &self.item_index.as_ref().map(ItemIndex::version))
            .finish()
    }
}

impl TwoTowerModel {
    pub fn new(num_users: usize, num_items: usize, config: ModelConfig) -> Result<Self> {
        config.check()?;
        if num_users == 0 || num_items == 0 {
            return Err(ModelError::InvalidConfig(format!(
                "need at least one user and one item, got {} users and {} items",
                num_users, num_items
            )));
        }

        let mut rng = seeded_rng(config.seed);
        let dim = config.embedding_dim;
        let user_embeddings = EmbeddingTable::new(Entity::User, num_users, dim, config.init_std, &mut rng);
        let item_embeddings = EmbeddingTable::new(Entity::Item, num_items, dim, config.init_std, &mut rng);
        let user_tower = Tower::new(&mut rng, dim, config.user_feature_dim, &config.user_hidden)?;
        let item_tower = Tower::new(&mut rng, dim, config.item_feature_dim, &config.item_hidden)?;
        let optimizer = config.optimizer.build(config.learning_rate);

        let model = Self {
            run_id: Uuid::new_v4(),
            config,
            user_embeddings,
            item_embeddings,
            user_tower,
            item_tower,
            optimizer,
            version: 0,
            item_index: None,
        };

        info!(
            "Initialized {} two-tower model {}: {} users, {} items, embedding dim {}",
            if model.is_deep() { "deep" } else { "shallow" },
            model.run_id,
            num_users,
            num_items,
            dim
        );
        Ok(model)
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn num_users(&self) -> usize {
        self.user_embeddings.count()
    }

    pub fn num_items(&self) -> usize {
        self.item_embeddings.count()
    }

    pub fn output_dim(&self) -> usize {
        self.user_tower.output_dim()
    }

    pub fn is_deep(&self) -> bool {
        !self.user_tower.is_shallow() || !self.item_tower.is_shallow()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn user_embeddings(&self) -> &EmbeddingTable {
        &self.user_embeddings
    }

    pub fn item_embeddings(&self) -> &EmbeddingTable {
        &self.item_embeddings
    }

    pub fn user_tower(&self) -> &Tower {
        &self.user_tower
    }

    pub fn item_tower(&self) -> &Tower {
        &self.item_tower
    }

    pub fn encode_users(&self, users: &[usize], features: Option<&DMatrix<f32>>) -> Result<DMatrix<f32>> {
        let embeddings = self.user_embeddings.lookup(users)?;
        self.user_tower.forward(&embeddings, features)
    }

    pub fn encode_items(&self, items: &[usize], features: Option<&DMatrix<f32>>) -> Result<DMatrix<f32>> {
        let embeddings = self.item_embeddings.lookup(items)?;
        self.item_tower.forward(&embeddings, features)
    }

    /// One gradient update from the positive pairs `(users[k], items[k])`,
    /// using the other items of the batch as negatives. Returns the batch loss.
    ///
    /// Everything is validated and every gradient computed before the first
    /// parameter is written, so a failed call leaves the model unchanged. A
    /// batch of one pair is accepted; it has no negatives and its
    /// cross-entropy is zero.
    pub fn train_step(&mut self, users: &[usize], items: &[usize], features: BatchFeatures<'_>) -> Result<f32> {
        if users.is_empty() && items.is_empty() {
            return Err(ModelError::EmptyBatch);
        }
        if users.len() != items.len() {
            return Err(ModelError::ShapeMismatch(format!(
                "batch has {} users but {} items",
                users.len(),
                items.len()
            )));
        }

        let user_emb = self.user_embeddings.lookup(users)?;
        let item_emb = self.item_embeddings.lookup(items)?;
        let user_acts = self.user_tower.forward_cached(&user_emb, features.users)?;
        let item_acts = self.item_tower.forward_cached(&item_emb, features.items)?;

        let out = in_batch_softmax(&user_acts.output, &item_acts.output, self.config.l2_reg)?;
        let user_grads = self.user_tower.backward(&user_acts, &out.grad_users);
        let item_grads = self.item_tower.backward(&item_acts, &out.grad_items);

        let optimizer = &mut *self.optimizer;
        optimizer.begin_step();
        self.user_tower.apply_gradients(optimizer, "user_tower", &user_grads);
        self.item_tower.apply_gradients(optimizer, "item_tower", &item_grads);
        self.user_embeddings
            .apply_row_gradients(optimizer, "user_embedding", users, &user_grads.embedding);
        self.item_embeddings
            .apply_row_gradients(optimizer, "item_embedding", items, &item_grads.embedding);
        self.version += 1;

        debug!(
            "run {} step {}: batch {}, loss {:.4}",
            self.run_id,
            self.version,
            users.len(),
            out.loss
        );
        Ok(out.loss)
    }

    /// Runs the item tower over the whole catalog and replaces the stored
    /// index. `item_features` is the `[num_items, item_feature_dim]` matrix
    /// and is required when the item tower takes side features; the previous
    /// index is kept when it is missing.
    pub fn build_index(&mut self, item_features: Option<&DMatrix<f32>>) -> Result<()> {
        let feature_dim = self.item_tower.feature_dim();
        if feature_dim > 0 && item_features.is_none() {
            return Err(ModelError::ShapeMismatch(format!(
                "item tower takes {} side features per item, building the index requires the [{}, {}] feature matrix",
                feature_dim,
                self.num_items(),
                feature_dim
            )));
        }
        let vectors = self
            .item_tower
            .forward(self.item_embeddings.weights(), item_features)?;
        self.item_index = Some(ItemIndex::new(vectors, self.version));

        info!(
            "Built item index for run {}: {} items at version {}",
            self.run_id,
            self.num_items(),
            self.version
        );
        Ok(())
    }

    pub fn has_fresh_index(&self) -> bool {
        self.fresh_index().is_ok()
    }

    fn fresh_index(&self) -> Result<&ItemIndex> {
        match &self.item_index {
            Some(index) if index.version() == self.version => Ok(index),
            other => Err(ModelError::StaleIndex {
                built_for: other.as_ref().map(ItemIndex::version),
                current: self.version,
            }),
        }
    }

    /// `[num_items, output_dim]` item tower outputs from the current index.
    pub fn item_vectors(&self) -> Result<&DMatrix<f32>> {
        Ok(self.fresh_index()?.vectors())
    }

    /// Scores every item for `user` and ranks them, highest first.
    pub fn score_user(&self, user: usize, user_features: Option<&[f32]>) -> Result<Ranking> {
        let index = self.fresh_index()?;
        let features = user_features.map(|row| DMatrix::from_row_slice(1, row.len(), row));
        let encoded = self.encode_users(&[user], features.as_ref())?;
        let query: Vec<f32> = encoded.row(0).iter().copied().collect();
        index.rank(&query)
    }

    /// 2-D PCA projection of the current item index.
    pub fn project_items(&self, iterations: usize) -> Result<Projection> {
        pca::project_2d(self.item_vectors()?, iterations)
    }
}
