// src/layers/embedding_softmax.rs

use crate::base_layer::{scoped, Layer};
use crate::common::{flatten_leading, restore_leading};
use crate::config::QuantizationParams;
use crate::layers::linears::Linear;
use crate::layers::operations::QuantizedTensor;
use ndarray::{Array1, ArrayD, IxDyn};
use rand::Rng;
use std::error::Error;

/// How the shared embedding table is laid out when exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingLayout {
    /// `[input_dims, num_classes]`, contracted on axis 0.
    DimMajor,
    /// `[num_classes, input_dims]`, contracted on axis 1.
    ClassMajor,
}

/// Embedding table shared between token lookup and the output softmax.
///
/// The table is held as a `[D, C]` linear so logits run through the same
/// quantized matmul as any other projection; lookup reads columns of the
/// dequantized table.
#[derive(Debug, Clone)]
pub struct SharedEmbeddingSoftmax {
    name: String,
    layout: EmbeddingLayout,
    scale_sqrt_depth: bool,
    linear: Linear,
    bias: Option<Array1<f32>>,
}

impl SharedEmbeddingSoftmax {
    #[allow(clippy::too_many_arguments)]
    pub fn new<R: Rng + ?Sized>(
        name: &str,
        layout: EmbeddingLayout,
        input_dims: usize,
        num_classes: usize,
        scale_sqrt_depth: bool,
        use_bias: bool,
        quantization: Option<QuantizationParams>,
        rng: &mut R,
    ) -> Result<Self, Box<dyn Error>> {
        let linear = Linear::new("w", input_dims, num_classes, quantization, None, rng)?;
        Ok(Self::from_linear(name, layout, linear, scale_sqrt_depth, use_bias))
    }

    pub fn from_linear(
        name: &str,
        layout: EmbeddingLayout,
        linear: Linear,
        scale_sqrt_depth: bool,
        use_bias: bool,
    ) -> Self {
        let bias = if use_bias { Some(Array1::zeros(linear.output_dims())) } else { None };
        Self {
            name: name.to_string(),
            layout,
            scale_sqrt_depth,
            linear,
            bias,
        }
    }

    pub fn layout(&self) -> EmbeddingLayout {
        self.layout
    }

    pub fn input_dims(&self) -> usize {
        self.linear.input_dims()
    }

    pub fn num_classes(&self) -> usize {
        self.linear.output_dims()
    }

    /// Looks up ids of any shape and returns `[..., D]`. Ids are carried as
    /// floats and must be whole numbers below `num_classes`.
    pub fn emb_lookup(&self, ids: &ArrayD<f32>) -> Result<ArrayD<f32>, Box<dyn Error>> {
        let table = self.linear.effective_weight();
        let (dims, classes) = table.dim();
        let scale = if self.scale_sqrt_depth { (dims as f32).sqrt() } else { 1.0 };

        let mut data = Vec::with_capacity(ids.len() * dims);
        for &id in ids.iter() {
            if id < 0.0 || id.fract() != 0.0 || id as usize >= classes {
                return Err(format!(
                    "SharedEmbeddingSoftmax '{}': invalid id {} for {} classes",
                    self.name, id, classes
                )
                .into());
            }
            data.extend(table.column(id as usize).iter().map(|v| v * scale));
        }
        let mut shape = ids.shape().to_vec();
        shape.push(dims);
        Ok(ArrayD::from_shape_vec(IxDyn(&shape), data)?)
    }

    /// `[..., D] -> [..., C]`.
    pub fn logits(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>, Box<dyn Error>> {
        let (x2, leading) = flatten_leading(x, self.input_dims())
            .map_err(|e| format!("SharedEmbeddingSoftmax '{}': {}", self.name, e))?;
        let mut y = self.linear.matmul(&x2)?;
        if let Some(b) = &self.bias {
            y += b;
        }
        restore_leading(y, &leading, &[self.num_classes()])
    }
}

impl Layer for SharedEmbeddingSoftmax {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>, Box<dyn Error>> {
        self.logits(input)
    }

    fn num_parameters(&self) -> usize {
        self.linear.num_parameters() + self.bias.as_ref().map_or(0, |b| b.len())
    }

    fn quantized_weights(&self) -> Result<Vec<(String, QuantizedTensor)>, Box<dyn Error>> {
        let weights = self.linear.unscoped_quantized_weights()?;
        let weights = match self.layout {
            EmbeddingLayout::DimMajor => weights,
            EmbeddingLayout::ClassMajor => weights
                .into_iter()
                .map(|(n, qt)| Ok((n, qt.transposed_2d()?)))
                .collect::<Result<Vec<_>, Box<dyn Error>>>()?,
        };
        Ok(scoped(&self.name, weights))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QuantizationMode, QuantizationType, WeightQuantizationParams};
    use approx::assert_abs_diff_eq;
    use ndarray::{arr2, Array};

    fn table() -> ndarray::Array2<f32> {
        // D = 2, C = 3
        arr2(&[[1.0, 2.0, 3.0], [-1.0, 0.5, 0.0]])
    }

    #[test]
    fn test_lookup_and_logits() {
        let lin = Linear::from_weights("w", vec![table()], None).unwrap();
        let emb = SharedEmbeddingSoftmax::from_linear("softmax", EmbeddingLayout::DimMajor, lin, true, false);
        let ids = Array::from_shape_vec((1, 2), vec![2.0, 0.0]).unwrap().into_dyn();
        let e = emb.emb_lookup(&ids).unwrap();
        assert_eq!(e.shape(), &[1, 2, 2]);
        let s = 2f32.sqrt();
        assert_abs_diff_eq!(e[[0, 0, 0]], 3.0 * s, epsilon = 1e-6);
        assert_abs_diff_eq!(e[[0, 1, 1]], -1.0 * s, epsilon = 1e-6);

        let logits = emb.logits(&e).unwrap();
        assert_eq!(logits.shape(), &[1, 2, 3]);
        // [3s, 0] . table
        assert_abs_diff_eq!(logits[[0, 0, 1]], 6.0 * s, epsilon = 1e-5);

        let bad = Array::from_shape_vec((1, 1), vec![3.0]).unwrap().into_dyn();
        assert!(emb.emb_lookup(&bad).is_err());
        let frac = Array::from_shape_vec((1, 1), vec![0.5]).unwrap().into_dyn();
        assert!(emb.emb_lookup(&frac).is_err());
    }

    #[test]
    fn test_class_major_exports_transposed() {
        let params = QuantizationParams {
            quantization_type: QuantizationType::Ptq,
            mode: QuantizationMode::Inference,
            weight_params: WeightQuantizationParams::default(),
            act_params: None,
        };
        let lin = Linear::from_weights("w", vec![table()], Some(params)).unwrap();
        let dim_major = SharedEmbeddingSoftmax::from_linear("softmax", EmbeddingLayout::DimMajor, lin.clone(), false, false);
        let class_major = SharedEmbeddingSoftmax::from_linear("softmax", EmbeddingLayout::ClassMajor, lin, false, false);

        let a = dim_major.quantized_weights().unwrap();
        let b = class_major.quantized_weights().unwrap();
        assert_eq!(a[0].0, "softmax.w");
        assert_eq!(a[0].1.shape(), &[2, 3]);
        assert_eq!(b[0].1.shape(), &[3, 2]);
        assert_eq!(b[0].1.contract_axis, 1);
        assert_eq!(b[0].1.values[[2, 0]], a[0].1.values[[0, 2]]);
    }
}
