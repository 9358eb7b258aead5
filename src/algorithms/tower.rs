//! Tower encoders.
//!
//! A tower maps a batch of raw embeddings, optionally concatenated with side
//! features, to the shared comparison space. Every layer is affine; all but
//! the last are followed by ReLU so the final outputs stay signed, which the
//! softmax-over-dot-products loss needs. A tower without layers is the
//! identity on the embedding ("shallow" mode).

use crate::algorithms::initializer::InitializationMethod;
use crate::algorithms::optimizer::Optimizer;
use crate::error::{ModelError, Result};
use nalgebra::DMatrix;
use rand::Rng;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct DenseLayer {
    /// `[input_dim, output_dim]`
    weight: DMatrix<f32>,
    /// `[1, output_dim]`
    bias: DMatrix<f32>,
}

impl DenseLayer {
    pub fn new(weight: DMatrix<f32>, bias: Vec<f32>) -> Result<Self> {
        if weight.nrows() == 0 || weight.ncols() == 0 {
            return Err(ModelError::InvalidConfig(
                "dense layer weight must be non-empty".to_string(),
            ));
        }
        if bias.len() != weight.ncols() {
            return Err(ModelError::shape(
                "dense layer bias",
                (1, weight.ncols()),
                (1, bias.len()),
            ));
        }
        let bias = DMatrix::from_row_slice(1, bias.len(), &bias);
        Ok(Self { weight, bias })
    }

    pub fn glorot<R: Rng + ?Sized>(rng: &mut R, input_dim: usize, output_dim: usize) -> Self {
        Self {
            weight: InitializationMethod::GlorotNormal.initialize_matrix(rng, input_dim, output_dim),
            bias: DMatrix::zeros(1, output_dim),
        }
    }

    pub fn input_dim(&self) -> usize {
        self.weight.nrows()
    }

    pub fn output_dim(&self) -> usize {
        self.weight.ncols()
    }

    pub fn weight(&self) -> &DMatrix<f32> {
        &self.weight
    }

    pub fn bias(&self) -> &DMatrix<f32> {
        &self.bias
    }

    fn affine(&self, x: &DMatrix<f32>) -> DMatrix<f32> {
        let mut z = x * &self.weight;
        for r in 0..z.nrows() {
            for c in 0..z.ncols() {
                z[(r, c)] += self.bias[(0, c)];
            }
        }
        z
    }
}

/// Per-layer inputs and pre-activations kept from a forward pass.
#[derive(Debug, Clone)]
pub(crate) struct TowerActivations {
    inputs: Vec<DMatrix<f32>>,
    pre_activations: Vec<DMatrix<f32>>,
    pub(crate) output: DMatrix<f32>,
}

#[derive(Debug, Clone)]
pub(crate) struct TowerGradients {
    /// `(dW, db)` per layer, in layer order.
    layers: Vec<(DMatrix<f32>, DMatrix<f32>)>,
    /// Gradient w.r.t. the embedding columns of the tower input.
    pub(crate) embedding: DMatrix<f32>,
}

#[derive(Debug, Clone)]
pub struct Tower {
    embedding_dim: usize,
    feature_dim: usize,
    layers: Vec<DenseLayer>,
}

impl Tower {
    pub fn shallow(embedding_dim: usize) -> Self {
        Self {
            embedding_dim,
            feature_dim: 0,
            layers: Vec::new(),
        }
    }

    /// Builds a tower with Glorot-initialized layers of the given widths.
    /// An empty `hidden` list gives a shallow tower and ignores `feature_dim`.
    pub fn new<R: Rng + ?Sized>(
        rng: &mut R,
        embedding_dim: usize,
        feature_dim: usize,
        hidden: &[usize],
    ) -> Result<Self> {
        if hidden.is_empty() {
            return Ok(Self::shallow(embedding_dim));
        }
        if let Some(pos) = hidden.iter().position(|&w| w == 0) {
            return Err(ModelError::InvalidConfig(format!(
                "hidden layer {} has zero width",
                pos
            )));
        }

        let mut layers = Vec::with_capacity(hidden.len());
        let mut prev = embedding_dim + feature_dim;
        for &units in hidden {
            layers.push(DenseLayer::glorot(rng, prev, units));
            prev = units;
        }

        Ok(Self {
            embedding_dim,
            feature_dim,
            layers,
        })
    }

    pub fn from_layers(
        embedding_dim: usize,
        feature_dim: usize,
        layers: Vec<DenseLayer>,
    ) -> Result<Self> {
        let mut prev = embedding_dim + feature_dim;
        for (k, layer) in layers.iter().enumerate() {
            if layer.input_dim() != prev {
                return Err(ModelError::ShapeMismatch(format!(
                    "layer {} expects {} inputs but receives {}",
                    k,
                    layer.input_dim(),
                    prev
                )));
            }
            prev = layer.output_dim();
        }
        let feature_dim = if layers.is_empty() { 0 } else { feature_dim };

        Ok(Self {
            embedding_dim,
            feature_dim,
            layers,
        })
    }

    pub fn is_shallow(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    pub fn output_dim(&self) -> usize {
        self.layers
            .last()
            .map(DenseLayer::output_dim)
            .unwrap_or(self.embedding_dim)
    }

    pub fn layers(&self) -> &[DenseLayer] {
        &self.layers
    }

    pub fn forward(
        &self,
        embeddings: &DMatrix<f32>,
        features: Option<&DMatrix<f32>>,
    ) -> Result<DMatrix<f32>> {
        Ok(self.forward_cached(embeddings, features)?.output)
    }

    /// Assembles `[embedding | features]`. When the tower declares features
    /// and the caller has none, the feature columns are zero, leaving only the
    /// embedding rows of the first weight matrix in play.
    fn assemble_input(
        &self,
        embeddings: &DMatrix<f32>,
        features: Option<&DMatrix<f32>>,
    ) -> Result<DMatrix<f32>> {
        let batch = embeddings.nrows();
        if embeddings.ncols() != self.embedding_dim {
            return Err(ModelError::shape(
                "tower embeddings",
                (batch, self.embedding_dim),
                embeddings.shape(),
            ));
        }
        if self.feature_dim == 0 {
            return Ok(embeddings.clone());
        }

        let e = self.embedding_dim;
        match features {
            Some(features) => {
                if features.shape() != (batch, self.feature_dim) {
                    return Err(ModelError::shape(
                        "tower side features",
                        (batch, self.feature_dim),
                        features.shape(),
                    ));
                }
                Ok(DMatrix::from_fn(batch, e + self.feature_dim, |r, c| {
                    if c < e {
                        embeddings[(r, c)]
                    } else {
                        features[(r, c - e)]
                    }
                }))
            }
            None => {
                debug!(
                    "No side features supplied, zero-filling {} feature columns",
                    self.feature_dim
                );
                Ok(DMatrix::from_fn(batch, e + self.feature_dim, |r, c| {
                    if c < e {
                        embeddings[(r, c)]
                    } else {
                        0.0
                    }
                }))
            }
        }
    }

    pub(crate) fn forward_cached(
        &self,
        embeddings: &DMatrix<f32>,
        features: Option<&DMatrix<f32>>,
    ) -> Result<TowerActivations> {
        let mut h = self.assemble_input(embeddings, features)?;
        let mut inputs = Vec::with_capacity(self.layers.len());
        let mut pre_activations = Vec::with_capacity(self.layers.len());

        let last = self.layers.len().saturating_sub(1);
        for (k, layer) in self.layers.iter().enumerate() {
            let z = layer.affine(&h);
            let next = if k < last { z.map(|x| x.max(0.0)) } else { z.clone() };
            inputs.push(h);
            pre_activations.push(z);
            h = next;
        }

        Ok(TowerActivations {
            inputs,
            pre_activations,
            output: h,
        })
    }

    pub(crate) fn backward(
        &self,
        activations: &TowerActivations,
        grad_output: &DMatrix<f32>,
    ) -> TowerGradients {
        let mut grad = grad_output.clone();
        let mut layer_grads = Vec::with_capacity(self.layers.len());

        let last = self.layers.len().saturating_sub(1);
        for k in (0..self.layers.len()).rev() {
            if k < last {
                let mask = activations.pre_activations[k].map(|z| if z > 0.0 { 1.0 } else { 0.0 });
                grad = grad.component_mul(&mask);
            }
            let d_weight = activations.inputs[k].tr_mul(&grad);
            let d_bias = DMatrix::from_fn(1, grad.ncols(), |_, c| grad.column(c).sum());
            grad = &grad * self.layers[k].weight.transpose();
            layer_grads.push((d_weight, d_bias));
        }
        layer_grads.reverse();

        let embedding = grad.columns(0, self.embedding_dim).into_owned();
        TowerGradients {
            layers: layer_grads,
            embedding,
        }
    }

    pub(crate) fn apply_gradients(
        &mut self,
        optimizer: &mut dyn Optimizer,
        prefix: &str,
        gradients: &TowerGradients,
    ) {
        for (k, (layer, (d_weight, d_bias))) in self
            .layers
            .iter_mut()
            .zip(gradients.layers.iter())
            .enumerate()
        {
            optimizer.update(&format!("{}.dense_{}.weight", prefix, k), &mut layer.weight, d_weight);
            optimizer.update(&format!("{}.dense_{}.bias", prefix, k), &mut layer.bias, d_bias);
        }
    }
}
