//! Two-component PCA by power iteration, used to plot item vectors.

use crate::error::{ModelError, Result};
use nalgebra::{DMatrix, DVector};

#[derive(Debug, Clone)]
pub struct Projection {
    /// `[n, 2]` coordinates of each centered row on the two components.
    pub points: DMatrix<f32>,
    /// `[d, 2]` unit principal directions.
    pub components: DMatrix<f32>,
    pub explained_variance: [f32; 2],
}

impl Projection {
    pub fn point(&self, row: usize) -> [f32; 2] {
        [self.points[(row, 0)], self.points[(row, 1)]]
    }
}

pub fn project_2d(vectors: &DMatrix<f32>, iterations: usize) -> Result<Projection> {
    let (n, d) = vectors.shape();
    if n < 2 || d == 0 {
        return Err(ModelError::ShapeMismatch(format!(
            "PCA needs at least 2 rows and 1 column, got [{}, {}]",
            n, d
        )));
    }

    let mean = DMatrix::from_fn(1, d, |_, c| vectors.column(c).mean());
    let centered = DMatrix::from_fn(n, d, |r, c| vectors[(r, c)] - mean[(0, c)]);
    let mut covariance = centered.tr_mul(&centered) / (n - 1) as f32;

    let mut components = DMatrix::zeros(d, 2);
    let mut explained_variance = [0.0f32; 2];
    let mut found: Vec<DVector<f32>> = Vec::with_capacity(2);
    for k in 0..2.min(d) {
        let (value, vector) = dominant_eigenpair(&covariance, iterations.max(1), k, &found);
        components.set_column(k, &vector);
        explained_variance[k] = value;
        // deflate
        covariance -= (&vector * vector.transpose()) * value;
        found.push(vector);
    }

    let points = &centered * &components;
    Ok(Projection {
        points,
        components,
        explained_variance,
    })
}

/// Removes the components along every vector in `found` (unit, orthogonal).
fn orthogonalize(v: &mut DVector<f32>, found: &[DVector<f32>]) {
    for u in found {
        let along = u.dot(&*v);
        v.axpy(-along, u, 1.0);
    }
}

/// Deterministic unit start vector orthogonal to `found`, or `None` when
/// `found` already spans the space.
fn start_vector(d: usize, seed: usize, found: &[DVector<f32>]) -> Option<DVector<f32>> {
    // not orthogonal to typical leading directions
    let mut v = DVector::from_fn(d, |i, _| 1.0 + ((i + seed) % 3) as f32 * 0.25);
    orthogonalize(&mut v, found);
    let candidates = std::iter::once(v).chain((0..d).map(|i| {
        let mut e = DVector::zeros(d);
        e[i] = 1.0;
        orthogonalize(&mut e, found);
        e
    }));

    for candidate in candidates {
        let norm = candidate.norm();
        if norm > 1e-3 {
            return Some(candidate / norm);
        }
    }
    None
}

/// Leading eigenpair of `matrix` restricted to the complement of `found`.
/// A vanishing remainder yields eigenvalue 0 with a unit vector that is still
/// orthogonal to `found`.
fn dominant_eigenpair(
    matrix: &DMatrix<f32>,
    iterations: usize,
    seed: usize,
    found: &[DVector<f32>],
) -> (f32, DVector<f32>) {
    let d = matrix.nrows();
    let Some(mut v) = start_vector(d, seed, found) else {
        return (0.0, DVector::zeros(d));
    };

    for _ in 0..iterations {
        let mut next = matrix * &v;
        orthogonalize(&mut next, found);
        let norm = next.norm();
        if norm <= f32::EPSILON {
            return (0.0, v);
        }
        v = next / norm;
    }

    let value = v.dot(&(matrix * &v));
    (value, v)
}
