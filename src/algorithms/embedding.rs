use crate::algorithms::initializer::InitializationMethod;
use crate::algorithms::optimizer::Optimizer;
use crate::error::{Entity, ModelError, Result};
use nalgebra::DMatrix;
use rand::Rng;

/// Dense `[count, dim]` lookup table of learnable per-entity vectors.
///
/// Shape is fixed at construction. The only write path is
/// [`EmbeddingTable::apply_row_gradients`], driven by a training step.
#[derive(Debug, Clone)]
pub struct EmbeddingTable {
    entity: Entity,
    weights: DMatrix<f32>,
}

impl EmbeddingTable {
    pub fn new<R: Rng + ?Sized>(
        entity: Entity,
        count: usize,
        dim: usize,
        init_std: f32,
        rng: &mut R,
    ) -> Self {
        let weights = InitializationMethod::Normal {
            mean: 0.0,
            std_dev: init_std,
        }
        .initialize_matrix(rng, count, dim);
        Self { entity, weights }
    }

    pub fn entity(&self) -> Entity {
        self.entity
    }

    pub fn count(&self) -> usize {
        self.weights.nrows()
    }

    pub fn dim(&self) -> usize {
        self.weights.ncols()
    }

    pub fn weights(&self) -> &DMatrix<f32> {
        &self.weights
    }

    pub fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.count() {
            return Err(ModelError::IndexOutOfRange {
                entity: self.entity,
                index,
                count: self.count(),
            });
        }
        Ok(())
    }

    pub fn row(&self, index: usize) -> Result<Vec<f32>> {
        self.check_index(index)?;
        Ok(self.weights.row(index).iter().copied().collect())
    }

    /// Gathers `indices` into a `[indices.len(), dim]` matrix.
    pub fn lookup(&self, indices: &[usize]) -> Result<DMatrix<f32>> {
        for &index in indices {
            self.check_index(index)?;
        }
        Ok(self.weights.select_rows(indices.iter()))
    }

    /// Scatters per-batch-row gradients onto the table. Gradients of repeated
    /// indices are summed so every referenced row gets exactly one update;
    /// rows that are not referenced are not touched.
    pub(crate) fn apply_row_gradients(
        &mut self,
        optimizer: &mut dyn Optimizer,
        key: &str,
        indices: &[usize],
        gradients: &DMatrix<f32>,
    ) {
        let (rows, summed) = accumulate_rows(indices, gradients);
        optimizer.update_rows(key, &mut self.weights, &rows, &summed);
    }
}

/// Collapses duplicate indices, preserving first-seen order.
fn accumulate_rows(indices: &[usize], gradients: &DMatrix<f32>) -> (Vec<usize>, DMatrix<f32>) {
    let mut rows: Vec<usize> = Vec::with_capacity(indices.len());
    let mut slot_of = std::collections::HashMap::with_capacity(indices.len());
    for &index in indices {
        slot_of.entry(index).or_insert_with(|| {
            rows.push(index);
            rows.len() - 1
        });
    }

    let mut summed = DMatrix::zeros(rows.len(), gradients.ncols());
    for (k, index) in indices.iter().enumerate() {
        let slot = slot_of[index];
        for c in 0..gradients.ncols() {
            summed[(slot, c)] += gradients[(k, c)];
        }
    }
    (rows, summed)
}
