// src/checkpoint.rs
//! Safetensors export of materialized quantized weights.
//!
//! Each quantized weight `name` is written as up to three tensors: `name`
//! (I8 values), `name_quantized_scale` (F32) and, for asymmetric weights,
//! `name_quantized_zp` (F32). The file metadata maps `name` to a JSON object
//! holding `bits`, `contract_axis` and `block_size`.

use crate::base_layer::Layer;
use crate::layers::operations::QuantizedTensor;
use log::{debug, info};
use ndarray::{ArrayD, IxDyn};
use safetensors::tensor::{Dtype, SafeTensorError, TensorView};
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::io;
use std::path::Path;

const SCALE_SUFFIX: &str = "_quantized_scale";
const ZP_SUFFIX: &str = "_quantized_zp";

#[derive(Debug)]
pub enum CheckpointError {
    IoError(io::Error),
    JsonError(serde_json::Error),
    SafeTensors(SafeTensorError),
    Layer(String),
    DataCorruption(String),
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointError::IoError(e) => write!(f, "I/O error: {}", e),
            CheckpointError::JsonError(e) => write!(f, "Metadata JSON error: {}", e),
            CheckpointError::SafeTensors(e) => write!(f, "Safetensors error: {:?}", e),
            CheckpointError::Layer(msg) => write!(f, "Failed to collect quantized weights: {}", msg),
            CheckpointError::DataCorruption(msg) => write!(f, "Corrupted checkpoint: {}", msg),
        }
    }
}

impl std::error::Error for CheckpointError {}

impl From<io::Error> for CheckpointError {
    fn from(err: io::Error) -> CheckpointError {
        CheckpointError::IoError(err)
    }
}

impl From<serde_json::Error> for CheckpointError {
    fn from(err: serde_json::Error) -> CheckpointError {
        CheckpointError::JsonError(err)
    }
}

impl From<SafeTensorError> for CheckpointError {
    fn from(err: SafeTensorError) -> CheckpointError {
        CheckpointError::SafeTensors(err)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
struct WeightInfo {
    bits: u8,
    contract_axis: usize,
    block_size: usize,
}

fn f32_bytes(a: &ArrayD<f32>) -> Vec<u8> {
    let values: Vec<f32> = a.iter().cloned().collect();
    bytemuck::cast_slice(&values).to_vec()
}

/// Serializes every quantized weight of `layer`.
pub fn export_quantized_weights(layer: &dyn Layer) -> Result<Vec<u8>, CheckpointError> {
    let weights = layer.quantized_weights().map_err(|e| CheckpointError::Layer(e.to_string()))?;
    let mut seen = HashSet::new();
    for (name, _) in &weights {
        if !seen.insert(name.as_str()) {
            return Err(CheckpointError::Layer(format!("duplicate weight name '{}'", name)));
        }
    }

    // Owned buffers first; the views below borrow them.
    let mut buffers: Vec<(String, Dtype, Vec<usize>, Vec<u8>)> = Vec::new();
    let mut metadata = HashMap::new();
    for (name, qt) in &weights {
        let values: Vec<i8> = qt.values.iter().cloned().collect();
        buffers.push((name.clone(), Dtype::I8, qt.shape().to_vec(), bytemuck::cast_slice(&values).to_vec()));
        buffers.push((format!("{}{}", name, SCALE_SUFFIX), Dtype::F32, qt.scale.shape().to_vec(), f32_bytes(&qt.scale)));
        if let Some(zp) = &qt.zero_point {
            buffers.push((format!("{}{}", name, ZP_SUFFIX), Dtype::F32, zp.shape().to_vec(), f32_bytes(zp)));
        }
        let info = WeightInfo { bits: qt.bits, contract_axis: qt.contract_axis, block_size: qt.block_size };
        metadata.insert(name.clone(), serde_json::to_string(&info)?);
        debug!("Exporting '{}' shape={:?} bits={}", name, qt.shape(), qt.bits);
    }

    let mut views = Vec::with_capacity(buffers.len());
    for (name, dtype, shape, data) in &buffers {
        views.push((name.clone(), TensorView::new(*dtype, shape.clone(), data)?));
    }
    // An empty metadata map does not read back.
    let metadata = if metadata.is_empty() { None } else { Some(metadata) };
    let bytes = safetensors::serialize(views, &metadata)?;
    info!("Exported {} quantized weight(s), {} bytes", weights.len(), bytes.len());
    Ok(bytes)
}

pub fn save_quantized_weights<P: AsRef<Path>>(layer: &dyn Layer, path: P) -> Result<(), CheckpointError> {
    let bytes = export_quantized_weights(layer)?;
    std::fs::write(path.as_ref(), bytes)?;
    info!("Wrote quantized weights to {}", path.as_ref().display());
    Ok(())
}

fn read_array<T: bytemuck::Pod>(st: &SafeTensors<'_>, name: &str, dtype: Dtype) -> Result<ArrayD<T>, CheckpointError> {
    let view = st.tensor(name)?;
    if view.dtype() != dtype {
        return Err(CheckpointError::DataCorruption(format!(
            "tensor '{}' has dtype {:?}, expected {:?}",
            name,
            view.dtype(),
            dtype
        )));
    }
    let values: Vec<T> = bytemuck::pod_collect_to_vec(view.data());
    ArrayD::from_shape_vec(IxDyn(view.shape()), values)
        .map_err(|e| CheckpointError::DataCorruption(format!("tensor '{}': {}", name, e)))
}

/// Reads back what [`export_quantized_weights`] wrote, keyed by weight name.
pub fn import_quantized_weights(bytes: &[u8]) -> Result<BTreeMap<String, QuantizedTensor>, CheckpointError> {
    let (_, header) = SafeTensors::read_metadata(bytes)?;
    let metadata = header.metadata().clone().unwrap_or_default();
    let st = SafeTensors::deserialize(bytes)?;
    let names: Vec<String> = st.names().into_iter().cloned().collect();

    let mut out = BTreeMap::new();
    for (name, raw_info) in metadata {
        let info: WeightInfo = serde_json::from_str(&raw_info)?;
        let values = read_array::<i8>(&st, &name, Dtype::I8)?;
        let scale = read_array::<f32>(&st, &format!("{}{}", name, SCALE_SUFFIX), Dtype::F32)?;
        let zp_name = format!("{}{}", name, ZP_SUFFIX);
        let zero_point = if names.contains(&zp_name) {
            Some(read_array::<f32>(&st, &zp_name, Dtype::F32)?)
        } else {
            None
        };
        if scale.ndim() != values.ndim() || info.contract_axis >= values.ndim() {
            return Err(CheckpointError::DataCorruption(format!(
                "'{}': scale shape {:?} does not fit values {:?} on axis {}",
                name,
                scale.shape(),
                values.shape(),
                info.contract_axis
            )));
        }
        out.insert(
            name,
            QuantizedTensor {
                values,
                scale,
                zero_point,
                contract_axis: info.contract_axis,
                block_size: info.block_size,
                bits: info.bits,
            },
        );
    }
    Ok(out)
}
