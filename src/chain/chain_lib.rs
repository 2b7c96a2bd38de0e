// src/chain/chain_lib.rs

use crate::base_layer::{scoped, Layer};
use crate::layers::operations::QuantizedTensor;
use log::debug;
use ndarray::ArrayD;
use std::error::Error;

fn run_in_order(owner: &str, layers: &[Box<dyn Layer>], input: &ArrayD<f32>) -> Result<ArrayD<f32>, Box<dyn Error>> {
    let mut x = input.clone();
    for (i, layer) in layers.iter().enumerate() {
        x = layer
            .forward(&x)
            .map_err(|e| format!("{} layer {} ('{}'): {}", owner, i, layer.name(), e))?;
    }
    Ok(x)
}

fn collect_weights(owner: &str, layers: &[Box<dyn Layer>]) -> Result<Vec<(String, QuantizedTensor)>, Box<dyn Error>> {
    let mut out = Vec::new();
    for layer in layers {
        out.extend(layer.quantized_weights()?);
    }
    Ok(scoped(owner, out))
}

/// An ordered container of layers. The output of each layer feeds the next;
/// an empty chain returns its input unchanged.
#[derive(Debug)]
pub struct Chain {
    name: String,
    layers: Vec<Box<dyn Layer>>,
}

impl Chain {
    pub fn new(name: &str, layers: Vec<Box<dyn Layer>>) -> Self {
        Self { name: name.to_string(), layers }
    }

    pub fn empty(name: &str) -> Self {
        Self::new(name, Vec::new())
    }

    pub fn push(&mut self, layer: Box<dyn Layer>) {
        self.layers.push(layer);
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&dyn Layer> {
        self.layers.get(index).map(|l| l.as_ref())
    }
}

impl Layer for Chain {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>, Box<dyn Error>> {
        run_in_order(&format!("Chain '{}'", self.name), &self.layers, input)
    }

    fn num_parameters(&self) -> usize {
        self.layers.iter().map(|l| l.num_parameters()).sum()
    }

    fn quantized_weights(&self) -> Result<Vec<(String, QuantizedTensor)>, Box<dyn Error>> {
        collect_weights(&self.name, &self.layers)
    }
}

/// One sub-template built `x_times` times, each copy with its own weights,
/// applied in order.
#[derive(Debug)]
pub struct Repeat {
    name: String,
    sub: Vec<Box<dyn Layer>>,
}

impl Repeat {
    pub fn new(name: &str, sub: Vec<Box<dyn Layer>>) -> Self {
        Self { name: name.to_string(), sub }
    }

    pub fn x_times(&self) -> usize {
        self.sub.len()
    }
}

impl Layer for Repeat {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>, Box<dyn Error>> {
        run_in_order(&format!("Repeat '{}'", self.name), &self.sub, input)
    }

    fn num_parameters(&self) -> usize {
        self.sub.iter().map(|l| l.num_parameters()).sum()
    }

    /// Copies share the sub-template's name, so each is scoped by its index.
    fn quantized_weights(&self) -> Result<Vec<(String, QuantizedTensor)>, Box<dyn Error>> {
        let mut out = Vec::new();
        for (i, layer) in self.sub.iter().enumerate() {
            out.extend(scoped(&i.to_string(), layer.quantized_weights()?));
        }
        Ok(scoped(&self.name, out))
    }
}

/// Pass-through layer that logs the shape of what flows through it.
#[derive(Debug, Clone)]
pub struct LogArgs {
    name: String,
    message: String,
}

impl LogArgs {
    pub fn new(name: &str, message: &str) -> Self {
        Self { name: name.to_string(), message: message.to_string() }
    }
}

impl Layer for LogArgs {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>, Box<dyn Error>> {
        debug!("{}: {} shape={:?}", self.name, self.message, input.shape());
        Ok(input.clone())
    }

    fn num_parameters(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base_layer::{Activation, ActivationLayer};
    use crate::config::{QuantizationMode, QuantizationParams, QuantizationType, WeightQuantizationParams};
    use crate::layers::linears::Linear;
    use ndarray::{arr2, Array, IxDyn};

    fn doubler() -> Box<dyn Layer> {
        Box::new(Linear::from_weights("double", vec![arr2(&[[2.0, 0.0], [0.0, 2.0]])], None).unwrap())
    }

    #[test]
    fn test_empty_chain_is_identity() {
        let chain = Chain::empty("nothing");
        assert!(chain.is_empty());
        let x = Array::from_shape_vec((1, 3), vec![1.0, -2.0, 3.0]).unwrap().into_dyn();
        assert_eq!(chain.forward(&x).unwrap(), x);
        assert_eq!(chain.num_parameters(), 0);
    }

    #[test]
    fn test_chain_threads_outputs() {
        let mut chain = Chain::new("net", vec![doubler(), Box::new(ActivationLayer::new("relu", Activation::Relu))]);
        chain.push(doubler());
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.get(1).map(|l| l.name()), Some("relu"));
        let x = Array::from_shape_vec((1, 2), vec![1.0, -1.0]).unwrap().into_dyn();
        let y = chain.forward(&x).unwrap();
        assert_eq!(y.iter().cloned().collect::<Vec<_>>(), vec![4.0, 0.0]);
        assert_eq!(chain.num_parameters(), 8);
    }

    #[test]
    fn test_chain_error_names_failing_layer() {
        let chain = Chain::new("net", vec![Box::new(LogArgs::new("log", "in")), doubler()]);
        let err = chain.forward(&ArrayD::zeros(IxDyn(&[1, 3]))).unwrap_err().to_string();
        assert!(err.contains("layer 1"), "{}", err);
        assert!(err.contains("'double'"), "{}", err);
    }

    #[test]
    fn test_repeat_applies_each_copy() {
        let repeat = Repeat::new("rep", vec![doubler(), doubler(), doubler()]);
        assert_eq!(repeat.x_times(), 3);
        let x = Array::from_shape_vec((1, 2), vec![1.0, 0.5]).unwrap().into_dyn();
        assert_eq!(repeat.forward(&x).unwrap().iter().cloned().collect::<Vec<_>>(), vec![8.0, 4.0]);
    }

    #[test]
    fn test_repeat_scopes_weights_by_copy_index() {
        let params = QuantizationParams {
            quantization_type: QuantizationType::Ptq,
            mode: QuantizationMode::Inference,
            weight_params: WeightQuantizationParams::default(),
            act_params: None,
        };
        let copy = || -> Box<dyn Layer> {
            Box::new(Linear::from_weights("inner", vec![arr2(&[[1.0, -0.5], [0.25, 2.0]])], Some(params.clone())).unwrap())
        };
        let repeat = Repeat::new("rep", vec![copy(), copy(), copy()]);
        let names: Vec<String> = repeat.quantized_weights().unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["rep.0.inner.w", "rep.1.inner.w", "rep.2.inner.w"]);
    }
}
