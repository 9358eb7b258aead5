use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Parameter update rule shared by every trainable matrix of a model.
///
/// A training step calls `begin_step` once and then `update`/`update_rows`
/// once per parameter, each parameter identified by a stable key.
pub trait Optimizer: Send + Sync {
    fn begin_step(&mut self);
    fn update(&mut self, key: &str, params: &mut DMatrix<f32>, gradients: &DMatrix<f32>);
    /// Row-sparse update: `gradients` row `k` applies to `params` row `rows[k]`.
    /// Rows not listed are left untouched, including their optimizer state.
    fn update_rows(
        &mut self,
        key: &str,
        params: &mut DMatrix<f32>,
        rows: &[usize],
        gradients: &DMatrix<f32>,
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Adam,
    Sgd,
}

impl Default for OptimizerKind {
    fn default() -> Self {
        OptimizerKind::Adam
    }
}

impl OptimizerKind {
    pub fn build(self, learning_rate: f32) -> Box<dyn Optimizer> {
        match self {
            OptimizerKind::Adam => Box::new(Adam::new(learning_rate, 0.9, 0.999, 1e-8)),
            OptimizerKind::Sgd => Box::new(SGD::new(learning_rate)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SGD {
    learning_rate: f32,
}

impl SGD {
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }
}

impl Optimizer for SGD {
    fn begin_step(&mut self) {}

    fn update(&mut self, _key: &str, params: &mut DMatrix<f32>, gradients: &DMatrix<f32>) {
        *params -= gradients * self.learning_rate;
    }

    fn update_rows(
        &mut self,
        _key: &str,
        params: &mut DMatrix<f32>,
        rows: &[usize],
        gradients: &DMatrix<f32>,
    ) {
        for (k, &row) in rows.iter().enumerate() {
            for c in 0..params.ncols() {
                params[(row, c)] -= self.learning_rate * gradients[(k, c)];
            }
        }
    }
}

/// Adam with per-key moment estimates.
///
/// Row-sparse updates follow the lazy variant: only the moments of the rows
/// present in the batch decay, bias correction uses the global step count.
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    t: u64,
    m: HashMap<String, DMatrix<f32>>,
    v: HashMap<String, DMatrix<f32>>,
}

impl Default for Adam {
    fn default() -> Self {
        Self::new(0.001, 0.9, 0.999, 1e-8)
    }
}

impl Adam {
    pub fn new(learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            t: 0,
            m: HashMap::new(),
            v: HashMap::new(),
        }
    }

    pub fn step_count(&self) -> u64 {
        self.t
    }

    fn bias_corrections(&self) -> (f32, f32) {
        let t = self.t.max(1).min(i32::MAX as u64) as i32;
        (1.0 - self.beta1.powi(t), 1.0 - self.beta2.powi(t))
    }

    fn take_moments(&mut self, key: &str, shape: (usize, usize)) -> (DMatrix<f32>, DMatrix<f32>) {
        let m = self
            .m
            .remove(key)
            .unwrap_or_else(|| DMatrix::zeros(shape.0, shape.1));
        let v = self
            .v
            .remove(key)
            .unwrap_or_else(|| DMatrix::zeros(shape.0, shape.1));
        (m, v)
    }

    fn apply_element(
        &self,
        m: &mut f32,
        v: &mut f32,
        param: &mut f32,
        grad: f32,
        corr1: f32,
        corr2: f32,
    ) {
        *m = self.beta1 * *m + (1.0 - self.beta1) * grad;
        *v = self.beta2 * *v + (1.0 - self.beta2) * grad * grad;
        let m_hat = *m / corr1;
        let v_hat = *v / corr2;
        *param -= self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
    }
}

impl Optimizer for Adam {
    fn begin_step(&mut self) {
        self.t += 1;
    }

    fn update(&mut self, key: &str, params: &mut DMatrix<f32>, gradients: &DMatrix<f32>) {
        let (corr1, corr2) = self.bias_corrections();
        let shape = params.shape();
        let (mut m, mut v) = self.take_moments(key, shape);

        for (((p, g), m_i), v_i) in params
            .iter_mut()
            .zip(gradients.iter())
            .zip(m.iter_mut())
            .zip(v.iter_mut())
        {
            self.apply_element(m_i, v_i, p, *g, corr1, corr2);
        }

        self.m.insert(key.to_string(), m);
        self.v.insert(key.to_string(), v);
    }

    fn update_rows(
        &mut self,
        key: &str,
        params: &mut DMatrix<f32>,
        rows: &[usize],
        gradients: &DMatrix<f32>,
    ) {
        let (corr1, corr2) = self.bias_corrections();
        let shape = params.shape();
        let (mut m, mut v) = self.take_moments(key, shape);

        for (k, &row) in rows.iter().enumerate() {
            for c in 0..shape.1 {
                self.apply_element(
                    &mut m[(row, c)],
                    &mut v[(row, c)],
                    &mut params[(row, c)],
                    gradients[(k, c)],
                    corr1,
                    corr2,
                );
            }
        }

        self.m.insert(key.to_string(), m);
        self.v.insert(key.to_string(), v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sgd_update() {
        let mut sgd = SGD::new(0.1);
        let mut params = DMatrix::from_row_slice(1, 3, &[1.0, 2.0, 3.0]);
        let grads = DMatrix::from_row_slice(1, 3, &[1.0, -1.0, 0.0]);
        sgd.update("w", &mut params, &grads);
        let expected = [0.9, 2.1, 3.0];
        for (got, want) in params.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-6);
        }
    }

    #[test]
    fn test_adam_first_step_moves_by_learning_rate() {
        // With zero-initialized moments, the bias-corrected first step is lr * sign(g).
        let mut adam = Adam::new(0.01, 0.9, 0.999, 1e-8);
        let mut params = DMatrix::from_row_slice(1, 3, &[1.0, 1.0, 1.0]);
        let grads = DMatrix::from_row_slice(1, 3, &[0.5, -2.0, 0.0]);

        adam.begin_step();
        adam.update("w", &mut params, &grads);

        assert!((params[(0, 0)] - 0.99).abs() < 1e-5);
        assert!((params[(0, 1)] - 1.01).abs() < 1e-5);
        assert_eq!(params[(0, 2)], 1.0);
        assert_eq!(adam.step_count(), 1);
    }

    #[test]
    fn test_adam_update_rows_leaves_other_rows() {
        let mut adam = Adam::default();
        let mut params = DMatrix::from_row_slice(3, 2, &[1.0, 1.0, 2.0, 2.0, 3.0, 3.0]);
        let before = params.clone();
        let grads = DMatrix::from_row_slice(1, 2, &[0.3, -0.3]);

        adam.begin_step();
        adam.update_rows("emb", &mut params, &[1], &grads);

        assert_eq!(params.row(0), before.row(0));
        assert_eq!(params.row(2), before.row(2));
        assert_ne!(params.row(1), before.row(1));
    }
}
