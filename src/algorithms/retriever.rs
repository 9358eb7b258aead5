use crate::error::{ModelError, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;

/// Item tower outputs for the whole catalog, stamped with the parameter
/// version they were computed from.
#[derive(Debug, Clone)]
pub struct ItemIndex {
    vectors: DMatrix<f32>,
    version: u64,
}

impl ItemIndex {
    pub fn new(vectors: DMatrix<f32>, version: u64) -> Self {
        Self { vectors, version }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.vectors.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.nrows() == 0
    }

    pub fn dimension(&self) -> usize {
        self.vectors.ncols()
    }

    pub fn vectors(&self) -> &DMatrix<f32> {
        &self.vectors
    }

    /// Dot product of `query` against every stored item vector.
    pub fn score(&self, query: &[f32]) -> Result<Vec<f32>> {
        if query.len() != self.dimension() {
            return Err(ModelError::shape(
                "query vector",
                (1, self.dimension()),
                (1, query.len()),
            ));
        }
        let query = DVector::from_column_slice(query);
        Ok((&self.vectors * query).iter().copied().collect())
    }

    pub fn rank(&self, query: &[f32]) -> Result<Ranking> {
        Ok(Ranking::from_scores(self.score(query)?))
    }
}

/// Scores for every item plus all item indices ordered by descending score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ranking {
    pub scores: Vec<f32>,
    pub ranked: Vec<usize>,
}

impl Ranking {
    /// Ties keep ascending item order.
    pub fn from_scores(scores: Vec<f32>) -> Self {
        let ranked = rank_descending(&scores);
        Self { scores, ranked }
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// First `k` ranked items not contained in `exclude`, with their scores.
    pub fn top_k(&self, k: usize, exclude: &HashSet<usize>) -> Vec<(usize, f32)> {
        self.ranked
            .iter()
            .filter(|item| !exclude.contains(*item))
            .take(k)
            .map(|&item| (item, self.scores[item]))
            .collect()
    }
}

pub fn rank_descending(scores: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    // sort_by is stable
    order.sort_by(|&a, &b| scores[b].partial_cmp(&scores[a]).unwrap_or(Ordering::Equal));
    order
}
