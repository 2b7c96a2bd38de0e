// src/layers/convolutions.rs

use crate::base_layer::{scoped, Activation, Layer};
use crate::config::QuantizationParams;
use crate::layers::linears::Linear;
use crate::layers::operations::QuantizedTensor;
use ndarray::{Array1, Array2, ArrayD, Ix4, IxDyn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::error::Error;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Padding {
    #[default]
    #[serde(rename = "SAME")]
    Same,
    #[serde(rename = "VALID")]
    Valid,
}

// Output length and leading pad along one spatial axis.
fn out_len(input: usize, kernel: usize, stride: usize, padding: Padding) -> Result<(usize, usize), String> {
    match padding {
        Padding::Same => {
            if input == 0 {
                return Err("spatial size must be positive".to_string());
            }
            let out = input.div_ceil(stride);
            let total = ((out - 1) * stride + kernel).saturating_sub(input);
            Ok((out, total / 2))
        }
        Padding::Valid => {
            if input < kernel {
                return Err(format!("input size {} is smaller than kernel {}", input, kernel));
            }
            Ok(((input - kernel) / stride + 1, 0))
        }
    }
}

/// 2-D convolution over NHWC inputs. The filter `[kh, kw, cin, cout]` is held
/// flattened as a `[kh * kw * cin, cout]` linear and applied to im2col patches.
#[derive(Debug, Clone)]
pub struct Conv2D {
    name: String,
    filter_shape: [usize; 4],
    strides: [usize; 2],
    padding: Padding,
    linear: Linear,
    bias: Option<Array1<f32>>,
}

impl Conv2D {
    pub fn new<R: Rng + ?Sized>(
        name: &str,
        filter_shape: [usize; 4],
        strides: [usize; 2],
        padding: Padding,
        use_bias: bool,
        quantization: Option<QuantizationParams>,
        rng: &mut R,
    ) -> Result<Self, Box<dyn Error>> {
        let [kh, kw, cin, cout] = filter_shape;
        if filter_shape.iter().any(|&d| d == 0) || strides.iter().any(|&s| s == 0) {
            return Err(format!(
                "Conv2D '{}': filter {:?} and strides {:?} must be positive",
                name, filter_shape, strides
            )
            .into());
        }
        let linear = Linear::new("w", kh * kw * cin, cout, quantization, None, rng)?;
        Ok(Self {
            name: name.to_string(),
            filter_shape,
            strides,
            padding,
            linear,
            bias: if use_bias { Some(Array1::zeros(cout)) } else { None },
        })
    }

    pub fn filter_shape(&self) -> [usize; 4] {
        self.filter_shape
    }

    pub fn linear(&self) -> &Linear {
        &self.linear
    }

    fn im2col(&self, x: &ndarray::ArrayView4<'_, f32>, oh: usize, ow: usize, pad: (usize, usize)) -> Array2<f32> {
        let (batch, h, w, cin) = x.dim();
        let [kh, kw, _, _] = self.filter_shape;
        let [sh, sw] = self.strides;
        let mut cols = Array2::<f32>::zeros((batch * oh * ow, kh * kw * cin));
        for b in 0..batch {
            for i in 0..oh {
                for j in 0..ow {
                    let row = (b * oh + i) * ow + j;
                    for di in 0..kh {
                        for dj in 0..kw {
                            let y = (i * sh + di) as isize - pad.0 as isize;
                            let x_pos = (j * sw + dj) as isize - pad.1 as isize;
                            if y < 0 || x_pos < 0 || y as usize >= h || x_pos as usize >= w {
                                continue;
                            }
                            let base = (di * kw + dj) * cin;
                            for c in 0..cin {
                                cols[[row, base + c]] = x[[b, y as usize, x_pos as usize, c]];
                            }
                        }
                    }
                }
            }
        }
        cols
    }
}

impl Layer for Conv2D {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>, Box<dyn Error>> {
        let x = input
            .view()
            .into_dimensionality::<Ix4>()
            .map_err(|e| format!("Conv2D '{}' expects NHWC input, got {:?}: {}", self.name, input.shape(), e))?;
        let (batch, h, w, cin) = x.dim();
        let [kh, kw, fcin, cout] = self.filter_shape;
        if cin != fcin {
            return Err(format!("Conv2D '{}': expected {} input channels, got {}", self.name, fcin, cin).into());
        }
        let (oh, pad_h) = out_len(h, kh, self.strides[0], self.padding).map_err(|e| format!("Conv2D '{}': {}", self.name, e))?;
        let (ow, pad_w) = out_len(w, kw, self.strides[1], self.padding).map_err(|e| format!("Conv2D '{}': {}", self.name, e))?;

        let cols = self.im2col(&x, oh, ow, (pad_h, pad_w));
        let mut y = self.linear.matmul(&cols)?;
        if let Some(b) = &self.bias {
            y += b;
        }
        Ok(y.into_shape(IxDyn(&[batch, oh, ow, cout]))?)
    }

    fn num_parameters(&self) -> usize {
        self.linear.num_parameters() + self.bias.as_ref().map_or(0, |b| b.len())
    }

    fn quantized_weights(&self) -> Result<Vec<(String, QuantizedTensor)>, Box<dyn Error>> {
        Ok(scoped(&self.name, self.linear.unscoped_quantized_weights()?))
    }
}

/// Convolution followed by an activation.
#[derive(Debug, Clone)]
pub struct ConvBlock {
    name: String,
    conv: Conv2D,
    activation: Activation,
}

impl ConvBlock {
    pub fn new(name: &str, conv: Conv2D, activation: Activation) -> Self {
        Self { name: name.to_string(), conv, activation }
    }

    pub fn conv(&self) -> &Conv2D {
        &self.conv
    }
}

impl Layer for ConvBlock {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>, Box<dyn Error>> {
        Ok(self.activation.apply(&self.conv.forward(input)?))
    }

    fn num_parameters(&self) -> usize {
        self.conv.num_parameters()
    }

    fn quantized_weights(&self) -> Result<Vec<(String, QuantizedTensor)>, Box<dyn Error>> {
        Ok(scoped(&self.name, self.conv.quantized_weights()?))
    }
}
