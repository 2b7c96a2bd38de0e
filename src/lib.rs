// Quantized neural-network layers, chain composition, and a template
// rewriter that turns float model templates into quantized ones.

pub mod base_layer;
pub mod chain;
pub mod checkpoint;
pub mod common;
pub mod config;
pub mod layers;
pub mod quantize;
pub mod templates;

pub use base_layer::{Activation, Layer};
pub use config::{
    ActQuantizationParams, QuantDtype, QuantizationMode, QuantizationParams, QuantizationType,
    WeightQuantizationParams,
};
pub use templates::{BuildContext, LayerTpl, TaskConfig, TplKind};
