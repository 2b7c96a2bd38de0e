use ndarray::{Array1, Array2, ArrayD, Axis, IxDyn, ShapeError};
use std::error::Error;

#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub(crate) weight: Array1<f32>, // gamma
    pub(crate) bias: Array1<f32>,   // beta
    epsilon: f32,
}

impl LayerNorm {
    pub fn new(dims: usize, epsilon: f32) -> Result<Self, Box<dyn Error>> {
        if dims == 0 {
            return Err("LayerNorm dims must be positive".into());
        }
        Ok(Self {
            weight: Array1::ones(dims),
            bias: Array1::zeros(dims),
            epsilon,
        })
    }

    pub fn dims(&self) -> usize {
        self.weight.len()
    }

    pub fn forward(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>, Box<dyn Error>> {
        if x.ndim() == 0 || x.shape()[x.ndim() - 1] != self.dims() {
            return Err(format!(
                "LayerNorm expects last dim {}, got shape {:?}",
                self.dims(),
                x.shape()
            )
            .into());
        }
        let axis = Axis(x.ndim() - 1);

        let mean = x.mean_axis(axis).ok_or("Failed to compute mean")?;
        let variance = x.var_axis(axis, 0.0);

        let mean_kept_dims = mean.insert_axis(axis);
        let variance_kept_dims = variance.insert_axis(axis);

        let x_minus_mean = x - &mean_kept_dims;
        let std_dev_inv = (&variance_kept_dims + self.epsilon).mapv(|v| 1.0 / v.sqrt());

        let normalized_x = x_minus_mean * std_dev_inv;
        Ok(normalized_x * &self.weight + &self.bias)
    }
}

// Numerically stable softmax along `axis_index`.
pub fn softmax(input: &ArrayD<f32>, axis_index: usize) -> Result<ArrayD<f32>, Box<dyn Error>> {
    if axis_index >= input.ndim() {
        return Err(format!("softmax axis {} out of range for rank {}", axis_index, input.ndim()).into());
    }
    let axis = Axis(axis_index);
    let max_val = input.fold_axis(axis, f32::NEG_INFINITY, |&a, &b| a.max(b));
    // Rows that are fully masked keep a finite max so they come out as zeros, not NaN.
    let max_val = max_val.mapv(|m| if m.is_finite() { m } else { 0.0 });
    let max_val_broadcastable = max_val.insert_axis(axis);

    let exp_values = (input - &max_val_broadcastable).mapv(f32::exp);

    let sum_exp_values = exp_values.sum_axis(axis).mapv(|s| if s == 0.0 { 1.0 } else { s });
    let sum_exp_values_broadcastable = sum_exp_values.insert_axis(axis);

    Ok(&exp_values / &sum_exp_values_broadcastable)
}

/// Collapses every leading axis so the tensor becomes `[rows, last]`.
/// Returns the 2-D matrix and the leading shape needed to undo it.
pub fn flatten_leading(x: &ArrayD<f32>, last: usize) -> Result<(Array2<f32>, Vec<usize>), Box<dyn Error>> {
    let shape = x.shape();
    if shape.is_empty() || shape[shape.len() - 1] != last {
        return Err(format!("Expected last dim {}, got shape {:?}", last, shape).into());
    }
    let leading = shape[..shape.len() - 1].to_vec();
    let rows: usize = leading.iter().product();
    let flat = x
        .as_standard_layout()
        .into_owned()
        .into_shape((rows, last))
        .map_err(|e: ShapeError| e.to_string())?;
    Ok((flat, leading))
}

/// Inverse of [`flatten_leading`] with a (possibly different) trailing shape.
pub fn restore_leading(y: Array2<f32>, leading: &[usize], trailing: &[usize]) -> Result<ArrayD<f32>, Box<dyn Error>> {
    let mut shape = leading.to_vec();
    shape.extend_from_slice(trailing);
    let out = y
        .as_standard_layout()
        .into_owned()
        .into_shape(IxDyn(&shape))
        .map_err(|e: ShapeError| format!("Error restoring shape {:?}: {}", shape, e))?;
    Ok(out)
}
