// src/base_layer.rs

use crate::layers::operations::QuantizedTensor;
use libm::tanhf;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::error::Error;

/// A built layer. Layers are immutable once built and map one tensor to one tensor.
pub trait Layer: std::fmt::Debug {
    fn name(&self) -> &str;

    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>, Box<dyn Error>>;

    /// Number of scalar parameters, counting quantized values and their scales.
    fn num_parameters(&self) -> usize;

    /// Materialized quantized weights of this layer and its children, keyed by
    /// dotted path. Float-only layers return nothing.
    fn quantized_weights(&self) -> Result<Vec<(String, QuantizedTensor)>, Box<dyn Error>> {
        Ok(Vec::new())
    }
}

/// Prefixes child weight names with the parent layer name.
pub(crate) fn scoped(
    prefix: &str,
    weights: Vec<(String, QuantizedTensor)>,
) -> Vec<(String, QuantizedTensor)> {
    weights
        .into_iter()
        .map(|(name, tensor)| (format!("{}.{}", prefix, name), tensor))
        .collect()
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Identity,
    Relu,
    Gelu,
    Silu,
    Sigmoid,
    Tanh,
}

// GELU approximation
fn gelu_new(x: f32) -> f32 {
    0.5 * x * (1.0 + tanhf((2.0f32 / std::f32::consts::PI).sqrt() * (x + 0.044715 * x.powi(3))))
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

impl Activation {
    pub fn apply_scalar(&self, x: f32) -> f32 {
        match self {
            Activation::Identity => x,
            Activation::Relu => x.max(0.0),
            Activation::Gelu => gelu_new(x),
            Activation::Silu => x * sigmoid(x),
            Activation::Sigmoid => sigmoid(x),
            Activation::Tanh => tanhf(x),
        }
    }

    pub fn apply(&self, x: &ArrayD<f32>) -> ArrayD<f32> {
        if *self == Activation::Identity {
            return x.clone();
        }
        x.mapv(|v| self.apply_scalar(v))
    }
}

#[derive(Debug, Clone)]
pub struct ActivationLayer {
    name: String,
    activation: Activation,
}

impl ActivationLayer {
    pub fn new(name: &str, activation: Activation) -> Self {
        Self { name: name.to_string(), activation }
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }
}

impl Layer for ActivationLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>, Box<dyn Error>> {
        Ok(self.activation.apply(input))
    }

    fn num_parameters(&self) -> usize {
        0
    }
}
