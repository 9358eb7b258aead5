use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

/// Seeded when a seed is given so that two models built from the same
/// configuration start from identical parameters.
pub fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f32 {
    // Box-Muller; u1 is kept away from zero so ln() stays finite
    let u1: f32 = 1.0 - rng.gen::<f32>();
    let u2: f32 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

pub fn normal<R: Rng + ?Sized>(rng: &mut R, size: usize, mean: f32, std_dev: f32) -> Vec<f32> {
    (0..size)
        .map(|_| standard_normal(rng) * std_dev + mean)
        .collect()
}

pub fn glorot_normal<R: Rng + ?Sized>(rng: &mut R, fan_in: usize, fan_out: usize) -> Vec<f32> {
    let std_dev = (2.0 / (fan_in + fan_out).max(1) as f32).sqrt();
    normal(rng, fan_in * fan_out, 0.0, std_dev)
}

pub fn zeros(size: usize) -> Vec<f32> {
    vec![0.0; size]
}

pub fn constant(size: usize, value: f32) -> Vec<f32> {
    vec![value; size]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InitializationMethod {
    Normal { mean: f32, std_dev: f32 },
    /// N(0, sqrt(2 / (rows + cols))), rows and cols read as fan-in and fan-out.
    GlorotNormal,
    Zeros,
    Constant { value: f32 },
}

impl InitializationMethod {
    pub fn initialize<R: Rng + ?Sized>(&self, rng: &mut R, size: usize) -> Vec<f32> {
        match self {
            InitializationMethod::Normal { mean, std_dev } => normal(rng, size, *mean, *std_dev),
            InitializationMethod::GlorotNormal => glorot_normal(rng, size, 1),
            InitializationMethod::Zeros => zeros(size),
            InitializationMethod::Constant { value } => constant(size, *value),
        }
    }

    pub fn initialize_matrix<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        rows: usize,
        cols: usize,
    ) -> DMatrix<f32> {
        let data = match self {
            InitializationMethod::GlorotNormal => glorot_normal(rng, rows, cols),
            _ => self.initialize(rng, rows * cols),
        };
        DMatrix::from_vec(rows, cols, data)
    }
}
