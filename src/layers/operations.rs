// src/layers/operations.rs

use crate::config::{ActQuantizationParams, QuantDtype, WeightQuantizationParams};
use ndarray::{s, Array1, Array2, ArrayD, ArrayView2, Axis, Dimension, Ix2, IxDyn, Zip};
use ndarray_stats::QuantileExt;

#[derive(Debug, PartialEq)]
pub enum QuantError {
    InvalidPrecision(u8),
    InvalidAxis(String),
    BlockSize(String),
    NonFinite(String),
    ShapeMismatch(String),
    OutOfRange(String),
}

impl std::fmt::Display for QuantError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuantError::InvalidPrecision(b) => write!(f, "Invalid precision: {} bits (expected 2..=8)", b),
            QuantError::InvalidAxis(s) => write!(f, "Invalid axis: {}", s),
            QuantError::BlockSize(s) => write!(f, "Invalid block size: {}", s),
            QuantError::NonFinite(s) => write!(f, "Non-finite value: {}", s),
            QuantError::ShapeMismatch(s) => write!(f, "Shape mismatch: {}", s),
            QuantError::OutOfRange(s) => write!(f, "Out of range: {}", s),
        }
    }
}

impl std::error::Error for QuantError {}

/// Signed integer range representable with `bits` bits.
pub fn int_bounds(bits: u8) -> Result<(f32, f32), QuantError> {
    if !(2..=8).contains(&bits) {
        return Err(QuantError::InvalidPrecision(bits));
    }
    let half = (1i32 << (bits - 1)) as f32;
    Ok((-half, half - 1.0))
}

// Index into the scale tensor for an element at `idx`.
fn group_index(idx: &[usize], contract_axis: usize, block_size: usize) -> Vec<usize> {
    let mut sidx = idx.to_vec();
    sidx[contract_axis] = if block_size > 0 { idx[contract_axis] / block_size } else { 0 };
    sidx
}

/// Integer values plus the scale (and zero point) needed to recover floats.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedTensor {
    pub values: ArrayD<i8>,
    // Shape of `values` with the contracting axis reduced to 1, or to len / block_size.
    pub scale: ArrayD<f32>,
    pub zero_point: Option<ArrayD<f32>>,
    pub contract_axis: usize,
    pub block_size: usize,
    pub bits: u8,
}

impl QuantizedTensor {
    pub fn shape(&self) -> &[usize] {
        self.values.shape()
    }

    pub fn num_elements(&self) -> usize {
        self.values.len() + self.scale.len() + self.zero_point.as_ref().map_or(0, |zp| zp.len())
    }

    pub fn is_symmetric(&self) -> bool {
        self.zero_point.is_none()
    }

    pub fn dequantize(&self) -> ArrayD<f32> {
        let mut out = ArrayD::<f32>::zeros(self.values.raw_dim());
        for (idx, &q) in self.values.indexed_iter() {
            let sidx = group_index(idx.slice(), self.contract_axis, self.block_size);
            let mut v = q as f32 * self.scale[sidx.as_slice()];
            if let Some(zp) = &self.zero_point {
                v += zp[sidx.as_slice()];
            }
            out[idx.slice()] = v;
        }
        out
    }

    /// Views of a `[K, N]` tensor quantized along axis 0.
    pub fn as_2d(&self) -> Result<(ArrayView2<'_, i8>, ArrayView2<'_, f32>, Option<ArrayView2<'_, f32>>), QuantError> {
        if self.values.ndim() != 2 || self.contract_axis != 0 {
            return Err(QuantError::ShapeMismatch(format!(
                "expected a 2-D tensor contracted on axis 0, got shape {:?} contracted on axis {}",
                self.values.shape(),
                self.contract_axis
            )));
        }
        let to_2d_err = |e: ndarray::ShapeError| QuantError::ShapeMismatch(e.to_string());
        let values = self.values.view().into_dimensionality::<Ix2>().map_err(to_2d_err)?;
        let scale = self.scale.view().into_dimensionality::<Ix2>().map_err(to_2d_err)?;
        let zero_point = match &self.zero_point {
            Some(zp) => Some(zp.view().into_dimensionality::<Ix2>().map_err(to_2d_err)?),
            None => None,
        };
        Ok((values, scale, zero_point))
    }

    /// Swaps the two axes of a 2-D tensor, keeping scales attached to the same elements.
    pub fn transposed_2d(&self) -> Result<QuantizedTensor, QuantError> {
        if self.values.ndim() != 2 {
            return Err(QuantError::ShapeMismatch(format!(
                "transpose needs a 2-D tensor, got shape {:?}",
                self.values.shape()
            )));
        }
        let t = |a: &ArrayD<f32>| a.t().as_standard_layout().into_owned();
        Ok(QuantizedTensor {
            values: self.values.t().as_standard_layout().into_owned(),
            scale: t(&self.scale),
            zero_point: self.zero_point.as_ref().map(t),
            contract_axis: 1 - self.contract_axis,
            block_size: self.block_size,
            bits: self.bits,
        })
    }
}

/// Quantizes `x` to `bits`-bit integers with one scale per group, where a group is all
/// elements sharing their non-contracting coordinates (and block, when `block_size > 0`).
pub fn quantize(
    x: &ArrayD<f32>,
    contract_axis: usize,
    bits: u8,
    use_symmetric: bool,
    block_size: usize,
    clipping_coeff: f32,
) -> Result<QuantizedTensor, QuantError> {
    let (qmin, qmax) = int_bounds(bits)?;
    if contract_axis >= x.ndim() {
        return Err(QuantError::InvalidAxis(format!(
            "contract axis {} for tensor of rank {}",
            contract_axis,
            x.ndim()
        )));
    }
    let axis_len = x.shape()[contract_axis];
    if block_size > 0 && axis_len % block_size != 0 {
        return Err(QuantError::BlockSize(format!(
            "{} does not divide contracting dim {}",
            block_size, axis_len
        )));
    }
    if let Some(v) = x.iter().find(|v| !v.is_finite()) {
        return Err(QuantError::NonFinite(format!("cannot quantize {}", v)));
    }

    let mut scale_shape = x.shape().to_vec();
    scale_shape[contract_axis] = if block_size > 0 { axis_len / block_size } else { 1 };

    let mut lo = ArrayD::from_elem(IxDyn(&scale_shape), f32::INFINITY);
    let mut hi = ArrayD::from_elem(IxDyn(&scale_shape), f32::NEG_INFINITY);
    for (idx, &v) in x.indexed_iter() {
        let sidx = group_index(idx.slice(), contract_axis, block_size);
        let l = &mut lo[sidx.as_slice()];
        *l = l.min(v);
        let h = &mut hi[sidx.as_slice()];
        *h = h.max(v);
    }
    // Groups that saw no elements (zero-length axis).
    lo.mapv_inplace(|v| if v.is_finite() { v } else { 0.0 });
    hi.mapv_inplace(|v| if v.is_finite() { v } else { 0.0 });

    let mut scale = ArrayD::<f32>::zeros(IxDyn(&scale_shape));
    let zero_point = if use_symmetric {
        Zip::from(&mut scale).and(&lo).and(&hi).for_each(|s, &l, &h| {
            let bound = l.abs().max(h.abs()) * clipping_coeff;
            let v = bound / qmax;
            *s = if v == 0.0 { 1.0 } else { v };
        });
        None
    } else {
        let mut zp = ArrayD::<f32>::zeros(IxDyn(&scale_shape));
        Zip::from(&mut scale).and(&mut zp).and(&lo).and(&hi).for_each(|s, z, &l, &h| {
            let v = (h - l) / (qmax - qmin);
            *s = if v == 0.0 { 1.0 } else { v };
            *z = l - qmin * *s;
        });
        Some(zp)
    };

    let mut values = ArrayD::<i8>::zeros(x.raw_dim());
    for (idx, &v) in x.indexed_iter() {
        let sidx = group_index(idx.slice(), contract_axis, block_size);
        let offset = zero_point.as_ref().map_or(0.0, |zp| zp[sidx.as_slice()]);
        values[idx.slice()] = ((v - offset) / scale[sidx.as_slice()]).round().clamp(qmin, qmax) as i8;
    }

    Ok(QuantizedTensor {
        values,
        scale,
        zero_point,
        contract_axis,
        block_size,
        bits,
    })
}

/// [`quantize`] driven by weight hyper-parameters.
pub fn quantize_weight(
    w: &ArrayD<f32>,
    contract_axis: usize,
    params: &WeightQuantizationParams,
) -> Result<QuantizedTensor, QuantError> {
    quantize(
        w,
        contract_axis,
        params.precision,
        params.use_symmetric,
        params.block_size,
        params.clipping_coeff,
    )
}

/// Quantize then dequantize, keeping the tensor in float.
pub fn fake_quant(
    w: &ArrayD<f32>,
    contract_axis: usize,
    params: &WeightQuantizationParams,
) -> Result<ArrayD<f32>, QuantError> {
    Ok(quantize_weight(w, contract_axis, params)?.dequantize())
}

/// Symmetric per-row activation quantization of `[M, K]` inputs.
pub fn quantize_activation_rows(
    x: &Array2<f32>,
    params: &ActQuantizationParams,
) -> Result<(Array2<i8>, Array1<f32>), QuantError> {
    let (qmin, qmax) = int_bounds(params.precision)?;
    let mut q = Array2::<i8>::zeros(x.raw_dim());
    let mut scales = Array1::<f32>::ones(x.nrows());
    for (r, row) in x.outer_iter().enumerate() {
        if row.is_empty() {
            continue;
        }
        if let Some(v) = row.iter().find(|v| !v.is_finite()) {
            return Err(QuantError::NonFinite(format!("activation value {} in row {}", v, r)));
        }
        let amax = row.mapv(f32::abs).max().copied().unwrap_or(0.0);
        let s = amax * params.clipping_coeff / qmax;
        let s = if s == 0.0 { 1.0 } else { s };
        scales[r] = s;
        for (c, &v) in row.iter().enumerate() {
            q[[r, c]] = (v / s).round().clamp(qmin, qmax) as i8;
        }
    }
    Ok((q, scales))
}

/// Per-row fake quantization of activations.
pub fn fake_quant_activation_rows(x: &Array2<f32>, params: &ActQuantizationParams) -> Result<Array2<f32>, QuantError> {
    let (q, scales) = quantize_activation_rows(x, params)?;
    let mut out = q.mapv(|v| v as f32);
    out *= &scales.view().insert_axis(Axis(1));
    Ok(out)
}

#[derive(Debug, Clone, PartialEq)]
pub enum PackedData {
    Int8(Array2<i8>),
    Int32(Array2<i32>),
}

/// Int4 values packed along axis 0, low nibble first.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedInt4 {
    pub data: PackedData,
    pub rows: usize,
}

fn nibbles_per_word(container: QuantDtype) -> usize {
    match container {
        QuantDtype::Int8 => 2,
        QuantDtype::Int32 => 8,
    }
}

fn sign_extend_nibble(nib: u8) -> i8 {
    ((nib << 4) as i8) >> 4
}

pub fn pack_int4(values: &ArrayView2<'_, i8>, container: QuantDtype) -> Result<PackedInt4, QuantError> {
    if let Some(v) = values.iter().find(|v| !(-8..=7).contains(*v)) {
        return Err(QuantError::OutOfRange(format!("{} does not fit in int4", v)));
    }
    let (rows, cols) = values.dim();
    let per = nibbles_per_word(container);
    let packed_rows = (rows + per - 1) / per;

    let data = match container {
        QuantDtype::Int8 => {
            let mut out = Array2::<i8>::zeros((packed_rows, cols));
            for ((r, c), &v) in values.indexed_iter() {
                let nib = (v as u8) & 0x0F;
                let word = &mut out[[r / per, c]];
                *word = ((*word as u8) | (nib << (4 * (r % per)))) as i8;
            }
            PackedData::Int8(out)
        }
        QuantDtype::Int32 => {
            let mut out = Array2::<i32>::zeros((packed_rows, cols));
            for ((r, c), &v) in values.indexed_iter() {
                let nib = ((v as u8) & 0x0F) as u32;
                let word = &mut out[[r / per, c]];
                *word = ((*word as u32) | (nib << (4 * (r % per)))) as i32;
            }
            PackedData::Int32(out)
        }
    };
    Ok(PackedInt4 { data, rows })
}

impl PackedInt4 {
    pub fn container(&self) -> QuantDtype {
        match self.data {
            PackedData::Int8(_) => QuantDtype::Int8,
            PackedData::Int32(_) => QuantDtype::Int32,
        }
    }

    pub fn num_words(&self) -> usize {
        match &self.data {
            PackedData::Int8(a) => a.len(),
            PackedData::Int32(a) => a.len(),
        }
    }

    pub fn unpack(&self) -> Array2<i8> {
        match &self.data {
            PackedData::Int8(a) => Array2::from_shape_fn((self.rows, a.ncols()), |(r, c)| {
                let word = a[[r / 2, c]] as u8;
                sign_extend_nibble((word >> (4 * (r % 2))) & 0x0F)
            }),
            PackedData::Int32(a) => Array2::from_shape_fn((self.rows, a.ncols()), |(r, c)| {
                let word = a[[r / 8, c]] as u32;
                sign_extend_nibble(((word >> (4 * (r % 8))) & 0x0F) as u8)
            }),
        }
    }
}

/// `x[M, K] · w[K, N]` against quantized weights, one block of the contracting
/// dim at a time. With `act` the inputs are quantized per row and each block is
/// accumulated in i32 before rescaling.
pub fn quantized_einsum(
    x: &Array2<f32>,
    w: &QuantizedTensor,
    act: Option<&ActQuantizationParams>,
) -> Result<Array2<f32>, QuantError> {
    let (q, scale, zero_point) = w.as_2d()?;
    let (k, n) = q.dim();
    if x.ncols() != k {
        return Err(QuantError::ShapeMismatch(format!(
            "input has {} features but weight contracts over {}",
            x.ncols(),
            k
        )));
    }
    let m = x.nrows();
    let block = if w.block_size > 0 { w.block_size } else { k };
    let nblocks = scale.nrows();
    let mut out = Array2::<f32>::zeros((m, n));

    let zp_term = |xsum: &Array1<f32>, b: usize| -> Option<Array2<f32>> {
        zero_point.as_ref().map(|zp| {
            let zp_row = zp.row(b);
            Array2::from_shape_fn((m, n), |(i, j)| xsum[i] * zp_row[j])
        })
    };

    match act {
        None => {
            for b in 0..nblocks {
                let (start, end) = (b * block, ((b + 1) * block).min(k));
                let xb = x.slice(s![.., start..end]);
                let qb = q.slice(s![start..end, ..]).mapv(|v| v as f32);
                let mut partial = xb.dot(&qb);
                partial *= &scale.row(b);
                if let Some(term) = zp_term(&xb.sum_axis(Axis(1)), b) {
                    partial += &term;
                }
                out += &partial;
            }
        }
        Some(params) => {
            let (xq, x_scale) = quantize_activation_rows(x, params)?;
            let xq = xq.mapv(|v| v as i32);
            let x_scale_col = x_scale.view().insert_axis(Axis(1));
            for b in 0..nblocks {
                let (start, end) = (b * block, ((b + 1) * block).min(k));
                let xb = xq.slice(s![.., start..end]);
                let qb = q.slice(s![start..end, ..]).mapv(|v| v as i32);
                let acc = xb.dot(&qb);
                let mut partial = acc.mapv(|v| v as f32);
                partial *= &scale.row(b);
                if let Some(term) = zp_term(&xb.sum_axis(Axis(1)).mapv(|v| v as f32), b) {
                    partial += &term;
                }
                partial *= &x_scale_col;
                out += &partial;
            }
        }
    }
    Ok(out)
}
