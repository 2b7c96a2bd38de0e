use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// How a quantized layer treats its weights while training.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuantizationType {
    /// Post-training quantization: float math until materialized.
    #[default]
    #[serde(rename = "PTQ")]
    Ptq,
    /// Fake quantization: quantize-dequantize in float.
    #[serde(rename = "FQ")]
    Fq,
    /// Integer math on the fly, weights kept in float.
    #[serde(rename = "AQT")]
    Aqt,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuantizationMode {
    #[serde(rename = "TRAINING")]
    Training,
    #[serde(rename = "MATERIALIZE")]
    Materialize,
    #[default]
    #[serde(rename = "INFERENCE")]
    Inference,
}

/// Storage dtype of quantized variables.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum QuantDtype {
    #[default]
    Int8,
    Int32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct WeightQuantizationParams {
    pub precision: u8,
    pub use_symmetric: bool,
    pub dtype: QuantDtype,
    // 0 disables sub-channel quantization.
    pub block_size: usize,
    pub use_int4_packed_weights: bool,
    pub int4_packed_weights_container_dtype: QuantDtype,
    pub clipping_coeff: f32,
}

impl Default for WeightQuantizationParams {
    fn default() -> Self {
        Self {
            precision: 8,
            use_symmetric: true,
            dtype: QuantDtype::Int8,
            block_size: 0,
            use_int4_packed_weights: true,
            int4_packed_weights_container_dtype: QuantDtype::Int32,
            clipping_coeff: 1.0,
        }
    }
}

impl WeightQuantizationParams {
    pub fn with_precision(precision: u8) -> Self {
        Self { precision, ..Self::default() }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(2..=8).contains(&self.precision) {
            return Err(format!(
                "Weight precision must be in [2, 8], got {}",
                self.precision
            ));
        }
        if self.dtype != QuantDtype::Int8 {
            return Err(format!(
                "Quantized weights are stored as int8, got dtype {:?}",
                self.dtype
            ));
        }
        if !(self.clipping_coeff > 0.0 && self.clipping_coeff <= 1.0) {
            return Err(format!(
                "clipping_coeff must be in (0, 1], got {}",
                self.clipping_coeff
            ));
        }
        Ok(())
    }

    /// True when the weights of a layer built with these params are stored packed.
    pub fn packs_int4(&self) -> bool {
        self.precision == 4 && self.use_int4_packed_weights
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ActQuantizationParams {
    pub precision: u8,
    pub clipping_coeff: f32,
}

impl Default for ActQuantizationParams {
    fn default() -> Self {
        Self { precision: 8, clipping_coeff: 1.0 }
    }
}

impl ActQuantizationParams {
    pub fn with_precision(precision: u8) -> Self {
        Self { precision, ..Self::default() }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(2..=8).contains(&self.precision) {
            return Err(format!(
                "Activation precision must be in [2, 8], got {}",
                self.precision
            ));
        }
        if !(self.clipping_coeff > 0.0 && self.clipping_coeff <= 1.0) {
            return Err(format!(
                "clipping_coeff must be in (0, 1], got {}",
                self.clipping_coeff
            ));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct QuantizationParams {
    pub quantization_type: QuantizationType,
    pub mode: QuantizationMode,
    pub weight_params: WeightQuantizationParams,
    pub act_params: Option<ActQuantizationParams>,
}

impl QuantizationParams {
    pub fn validate(&self) -> Result<(), String> {
        self.weight_params.validate()?;
        if let Some(act) = &self.act_params {
            act.validate()?;
        }
        Ok(())
    }
}

/// Reads a JSON document from `path` into any deserializable config type.
pub fn load_json<T: DeserializeOwned>(path: &str) -> Result<T, Box<dyn std::error::Error>> {
    if !Path::new(path).exists() {
        return Err(format!("Config file not found at: {}", path).into());
    }

    let mut file = File::open(path)
        .map_err(|e| format!("Failed to open config file {}: {}", path, e))?;

    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|e| format!("Failed to read config file {}: {}", path, e))?;

    let config: T = serde_json::from_str(&contents)
        .map_err(|e| format!("Failed to deserialize JSON from {}: {}", path, e))?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_int8_symmetric() {
        let params = QuantizationParams::default();
        assert_eq!(params.quantization_type, QuantizationType::Ptq);
        assert_eq!(params.mode, QuantizationMode::Inference);
        assert_eq!(params.weight_params.precision, 8);
        assert!(params.weight_params.use_symmetric);
        assert!(params.act_params.is_none());
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_precision() {
        assert!(WeightQuantizationParams::with_precision(1).validate().is_err());
        assert!(WeightQuantizationParams::with_precision(9).validate().is_err());
        assert!(ActQuantizationParams::with_precision(0).validate().is_err());
        let mut wp = WeightQuantizationParams::default();
        wp.dtype = QuantDtype::Int32;
        assert!(wp.validate().is_err());
    }

    #[test]
    fn test_serde_uses_upper_case_enum_names() {
        let params = QuantizationParams {
            quantization_type: QuantizationType::Aqt,
            mode: QuantizationMode::Training,
            ..Default::default()
        };
        let json = serde_json::to_string(&params).unwrap();
        assert!(json.contains("\"AQT\""));
        assert!(json.contains("\"TRAINING\""));

        let parsed: QuantizationParams =
            serde_json::from_str(r#"{"quantization_type": "FQ", "weight_params": {"precision": 4}}"#).unwrap();
        assert_eq!(parsed.quantization_type, QuantizationType::Fq);
        assert_eq!(parsed.mode, QuantizationMode::Inference);
        assert_eq!(parsed.weight_params.precision, 4);
        assert!(parsed.weight_params.packs_int4());
    }

    #[test]
    fn test_load_json_missing_and_present() {
        assert!(load_json::<QuantizationParams>("/definitely/not/here.json").is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"mode": "MATERIALIZE", "act_params": {{"precision": 8}}}}"#).unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let params: QuantizationParams = load_json(&path).unwrap();
        assert_eq!(params.mode, QuantizationMode::Materialize);
        assert_eq!(params.act_params, Some(ActQuantizationParams::default()));
    }
}
