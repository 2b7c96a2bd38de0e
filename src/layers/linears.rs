// src/layers/linears.rs

use crate::base_layer::{scoped, Activation, Layer};
use crate::common::{flatten_leading, restore_leading};
use crate::config::{QuantizationMode, QuantizationParams, QuantizationType};
use crate::layers::operations::{
    fake_quant, fake_quant_activation_rows, pack_int4, quantize_weight, quantized_einsum, PackedInt4,
    QuantizedTensor,
};
use log::debug;
use ndarray::{Array1, Array2, ArrayD, Ix2};
use rand::Rng;
use std::borrow::Cow;
use std::error::Error;

/// Uniform init in `[-1/sqrt(fan_in), 1/sqrt(fan_in)]`.
pub fn init_uniform<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> Array2<f32> {
    let bound = 1.0 / (rows.max(1) as f32).sqrt();
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-bound..=bound))
}

/// How one weight matrix is held in memory.
#[derive(Debug, Clone, PartialEq)]
pub enum WeightStore {
    Float(Array2<f32>),
    Int8(QuantizedTensor),
    PackedInt4 {
        packed: PackedInt4,
        scale: ArrayD<f32>,
        zero_point: Option<ArrayD<f32>>,
        block_size: usize,
    },
}

impl WeightStore {
    fn quantize(w: &Array2<f32>, params: &QuantizationParams) -> Result<Self, Box<dyn Error>> {
        let qt = quantize_weight(&w.clone().into_dyn(), 0, &params.weight_params)?;
        if !params.weight_params.packs_int4() {
            return Ok(WeightStore::Int8(qt));
        }
        let values = qt.values.view().into_dimensionality::<Ix2>()?;
        let packed = pack_int4(&values, params.weight_params.int4_packed_weights_container_dtype)?;
        Ok(WeightStore::PackedInt4 {
            packed,
            scale: qt.scale,
            zero_point: qt.zero_point,
            block_size: qt.block_size,
        })
    }

    pub fn dims(&self) -> (usize, usize) {
        match self {
            WeightStore::Float(w) => w.dim(),
            WeightStore::Int8(qt) => (qt.shape()[0], qt.shape()[1]),
            WeightStore::PackedInt4 { packed, scale, .. } => (packed.rows, scale.shape()[1]),
        }
    }

    pub fn is_quantized(&self) -> bool {
        !matches!(self, WeightStore::Float(_))
    }

    pub fn num_parameters(&self) -> usize {
        match self {
            WeightStore::Float(w) => w.len(),
            WeightStore::Int8(qt) => qt.num_elements(),
            WeightStore::PackedInt4 { packed, scale, zero_point, .. } => {
                packed.num_words() + scale.len() + zero_point.as_ref().map_or(0, |zp| zp.len())
            }
        }
    }

    /// The int8 view of a quantized store; packed int4 is unpacked on demand.
    pub fn quantized_tensor(&self) -> Option<Cow<'_, QuantizedTensor>> {
        match self {
            WeightStore::Float(_) => None,
            WeightStore::Int8(qt) => Some(Cow::Borrowed(qt)),
            WeightStore::PackedInt4 { packed, scale, zero_point, block_size } => {
                Some(Cow::Owned(QuantizedTensor {
                    values: packed.unpack().into_dyn(),
                    scale: scale.clone(),
                    zero_point: zero_point.clone(),
                    contract_axis: 0,
                    block_size: *block_size,
                    bits: 4,
                }))
            }
        }
    }

    fn to_float(&self) -> Array2<f32> {
        match self {
            WeightStore::Float(w) => w.clone(),
            _ => self
                .quantized_tensor()
                .and_then(|qt| qt.dequantize().into_dimensionality::<Ix2>().ok())
                .unwrap_or_else(|| Array2::zeros(self.dims())),
        }
    }
}

/// Dense projection `[..., input_dims] -> [..., output_dims]` without bias.
///
/// With `quantization` set, the forward pass depends on the type and mode:
/// float weights under PTQ run in float, under FQ they are fake-quantized and
/// under AQT they are quantized on the fly; INFERENCE layers hold integer
/// weights and run `quantized_einsum`. A `rank` factorizes the weight into
/// `[input_dims, rank]` and `[rank, output_dims]`.
#[derive(Debug, Clone)]
pub struct Linear {
    name: String,
    input_dims: usize,
    output_dims: usize,
    quantization: Option<QuantizationParams>,
    factors: Vec<WeightStore>,
}

impl Linear {
    pub fn new<R: Rng + ?Sized>(
        name: &str,
        input_dims: usize,
        output_dims: usize,
        quantization: Option<QuantizationParams>,
        rank: Option<usize>,
        rng: &mut R,
    ) -> Result<Self, Box<dyn Error>> {
        if input_dims == 0 || output_dims == 0 {
            return Err(format!(
                "Linear '{}': input_dims ({}) and output_dims ({}) must be positive",
                name, input_dims, output_dims
            )
            .into());
        }
        let weights = match rank {
            Some(0) => return Err(format!("Linear '{}': rank must be positive", name).into()),
            Some(r) => vec![init_uniform(input_dims, r, rng), init_uniform(r, output_dims, rng)],
            None => vec![init_uniform(input_dims, output_dims, rng)],
        };
        Self::from_weights(name, weights, quantization)
    }

    /// Builds from explicit float weights: one `[in, out]` matrix, or two factors.
    pub fn from_weights(
        name: &str,
        weights: Vec<Array2<f32>>,
        quantization: Option<QuantizationParams>,
    ) -> Result<Self, Box<dyn Error>> {
        if weights.is_empty() || weights.len() > 2 {
            return Err(format!("Linear '{}': expected 1 or 2 weight factors, got {}", name, weights.len()).into());
        }
        if weights.len() == 2 && weights[0].ncols() != weights[1].nrows() {
            return Err(format!(
                "Linear '{}': factor shapes {:?} and {:?} do not chain",
                name,
                weights[0].shape(),
                weights[1].shape()
            )
            .into());
        }
        if let Some(q) = &quantization {
            q.validate().map_err(|e| format!("Linear '{}': {}", name, e))?;
            let block = q.weight_params.block_size;
            for w in &weights {
                if block > 0 && w.nrows() % block != 0 {
                    return Err(format!(
                        "Linear '{}': block_size {} does not divide contracting dim {}",
                        name,
                        block,
                        w.nrows()
                    )
                    .into());
                }
            }
        }
        let input_dims = weights[0].nrows();
        let output_dims = weights[weights.len() - 1].ncols();

        let inference = matches!(&quantization, Some(q) if q.mode == QuantizationMode::Inference);
        let factors = weights
            .into_iter()
            .map(|w| match (&quantization, inference) {
                (Some(q), true) => WeightStore::quantize(&w, q),
                _ => Ok(WeightStore::Float(w)),
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            "Linear '{}' [{} -> {}] factors={} quantized={}",
            name,
            input_dims,
            output_dims,
            factors.len(),
            inference
        );
        Ok(Self {
            name: name.to_string(),
            input_dims,
            output_dims,
            quantization,
            factors,
        })
    }

    pub fn input_dims(&self) -> usize {
        self.input_dims
    }

    pub fn output_dims(&self) -> usize {
        self.output_dims
    }

    pub fn quantization(&self) -> Option<&QuantizationParams> {
        self.quantization.as_ref()
    }

    pub fn rank(&self) -> Option<usize> {
        if self.factors.len() == 2 {
            Some(self.factors[0].dims().1)
        } else {
            None
        }
    }

    pub fn factors(&self) -> &[WeightStore] {
        &self.factors
    }

    pub fn is_materialized(&self) -> bool {
        self.factors.iter().all(WeightStore::is_quantized)
    }

    /// Converts float weights into quantized storage and switches to INFERENCE.
    pub fn materialize(&self) -> Result<Linear, Box<dyn Error>> {
        let mut q = self
            .quantization
            .clone()
            .ok_or_else(|| format!("Linear '{}' has no quantization params to materialize", self.name))?;
        q.mode = QuantizationMode::Inference;
        let factors = self
            .factors
            .iter()
            .map(|f| match f {
                WeightStore::Float(w) => WeightStore::quantize(w, &q),
                other => Ok(other.clone()),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Linear {
            name: self.name.clone(),
            input_dims: self.input_dims,
            output_dims: self.output_dims,
            quantization: Some(q),
            factors,
        })
    }

    /// The float weight this layer effectively applies (product of factors).
    pub fn effective_weight(&self) -> Array2<f32> {
        let mut w = self.factors[0].to_float();
        for f in &self.factors[1..] {
            w = w.dot(&f.to_float());
        }
        w
    }

    fn apply_factor(&self, x: &Array2<f32>, store: &WeightStore) -> Result<Array2<f32>, Box<dyn Error>> {
        let q = match (&self.quantization, store) {
            (None, WeightStore::Float(w)) => return Ok(x.dot(w)),
            (Some(q), _) => q,
            (None, _) => {
                return Err(format!("Linear '{}' holds quantized weights without quantization params", self.name).into())
            }
        };
        let out = match store {
            WeightStore::Float(w) => match q.quantization_type {
                QuantizationType::Ptq => x.dot(w),
                QuantizationType::Fq => {
                    let wq = fake_quant(&w.clone().into_dyn(), 0, &q.weight_params)?.into_dimensionality::<Ix2>()?;
                    match &q.act_params {
                        Some(act) => fake_quant_activation_rows(x, act)?.dot(&wq),
                        None => x.dot(&wq),
                    }
                }
                QuantizationType::Aqt => {
                    let qt = quantize_weight(&w.clone().into_dyn(), 0, &q.weight_params)?;
                    quantized_einsum(x, &qt, q.act_params.as_ref())?
                }
            },
            quantized => {
                let qt = quantized
                    .quantized_tensor()
                    .ok_or_else(|| format!("Linear '{}': missing quantized weight", self.name))?;
                quantized_einsum(x, &qt, q.act_params.as_ref())?
            }
        };
        Ok(out)
    }

    /// Quantized weights named `w`, or `w_a`/`w_b` when factorized, without
    /// the layer name. Layers wrapping a `Linear` scope these under their own name.
    pub fn unscoped_quantized_weights(&self) -> Result<Vec<(String, QuantizedTensor)>, Box<dyn Error>> {
        let q = match &self.quantization {
            Some(q) => q,
            None => return Ok(Vec::new()),
        };
        let names: &[&str] = if self.factors.len() == 2 { &["w_a", "w_b"] } else { &["w"] };
        let mut out = Vec::with_capacity(self.factors.len());
        for (name, store) in names.iter().zip(self.factors.iter()) {
            let qt = match store.quantized_tensor() {
                Some(qt) => qt.into_owned(),
                None => match store {
                    WeightStore::Float(w) => quantize_weight(&w.clone().into_dyn(), 0, &q.weight_params)?,
                    _ => return Err(format!("Linear '{}': unreadable weight store", self.name).into()),
                },
            };
            out.push((name.to_string(), qt));
        }
        Ok(out)
    }

    /// `[rows, input_dims] -> [rows, output_dims]`.
    pub fn matmul(&self, x: &Array2<f32>) -> Result<Array2<f32>, Box<dyn Error>> {
        if x.ncols() != self.input_dims {
            return Err(format!(
                "Linear '{}' expects {} input features, got {}",
                self.name,
                self.input_dims,
                x.ncols()
            )
            .into());
        }
        let mut h = self.apply_factor(x, &self.factors[0])?;
        for f in &self.factors[1..] {
            h = self.apply_factor(&h, f)?;
        }
        Ok(h)
    }
}

impl Layer for Linear {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>, Box<dyn Error>> {
        let (x, leading) = flatten_leading(input, self.input_dims)
            .map_err(|e| format!("Linear '{}': {}", self.name, e))?;
        let y = self.matmul(&x)?;
        restore_leading(y, &leading, &[self.output_dims])
    }

    fn num_parameters(&self) -> usize {
        self.factors.iter().map(WeightStore::num_parameters).sum()
    }

    fn quantized_weights(&self) -> Result<Vec<(String, QuantizedTensor)>, Box<dyn Error>> {
        Ok(scoped(&self.name, self.unscoped_quantized_weights()?))
    }
}

/// Adds a learned vector over the last axis.
#[derive(Debug, Clone)]
pub struct Bias {
    name: String,
    pub(crate) b: Array1<f32>,
}

impl Bias {
    pub fn new(name: &str, dims: usize) -> Self {
        Self { name: name.to_string(), b: Array1::zeros(dims) }
    }

    pub fn from_values(name: &str, b: Array1<f32>) -> Self {
        Self { name: name.to_string(), b }
    }
}

impl Layer for Bias {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>, Box<dyn Error>> {
        if input.ndim() == 0 || input.shape()[input.ndim() - 1] != self.b.len() {
            return Err(format!(
                "Bias '{}' of size {} cannot apply to shape {:?}",
                self.name,
                self.b.len(),
                input.shape()
            )
            .into());
        }
        Ok(input + &self.b)
    }

    fn num_parameters(&self) -> usize {
        self.b.len()
    }
}

/// Linear, then optional bias, then activation.
#[derive(Debug, Clone)]
pub struct FeedForward {
    name: String,
    linear: Linear,
    bias: Option<Bias>,
    activation: Activation,
}

impl FeedForward {
    pub fn new(name: &str, linear: Linear, has_bias: bool, activation: Activation) -> Self {
        let bias = if has_bias { Some(Bias::new("bias", linear.output_dims())) } else { None };
        Self { name: name.to_string(), linear, bias, activation }
    }

    pub fn linear(&self) -> &Linear {
        &self.linear
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }
}

impl Layer for FeedForward {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>, Box<dyn Error>> {
        let mut h = self.linear.forward(input)?;
        if let Some(bias) = &self.bias {
            h = bias.forward(&h)?;
        }
        Ok(self.activation.apply(&h))
    }

    fn num_parameters(&self) -> usize {
        self.linear.num_parameters() + self.bias.as_ref().map_or(0, |b| b.num_parameters())
    }

    fn quantized_weights(&self) -> Result<Vec<(String, QuantizedTensor)>, Box<dyn Error>> {
        Ok(scoped(&self.name, self.linear.quantized_weights()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ActQuantizationParams, QuantDtype, WeightQuantizationParams};
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2, Array, IxDyn};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn weight() -> Array2<f32> {
        arr2(&[[0.5, -1.0, 0.25], [-0.75, 0.1, 1.5], [1.0, 0.3, -0.5], [0.2, -0.6, 0.9]])
    }

    fn input() -> ArrayD<f32> {
        Array::from_shape_vec((2, 1, 4), vec![1.0, 2.0, -1.0, 0.5, 0.0, -0.5, 0.25, 3.0])
            .unwrap()
            .into_dyn()
    }

    fn params(qtype: QuantizationType, mode: QuantizationMode, bits: u8) -> QuantizationParams {
        QuantizationParams {
            quantization_type: qtype,
            mode,
            weight_params: WeightQuantizationParams::with_precision(bits),
            act_params: None,
        }
    }

    fn float_reference() -> ArrayD<f32> {
        let lin = Linear::from_weights("ref", vec![weight()], None).unwrap();
        lin.forward(&input()).unwrap()
    }

    fn assert_close(a: &ArrayD<f32>, b: &ArrayD<f32>, tol: f32) {
        assert_eq!(a.shape(), b.shape());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() <= tol, "{} vs {} (tol {})", x, y, tol);
        }
    }

    #[test]
    fn test_float_linear_forward() {
        let y = float_reference();
        assert_eq!(y.shape(), &[2, 1, 3]);
        // Row 0: [1, 2, -1, 0.5] . W
        assert_abs_diff_eq!(y[[0, 0, 0]], 0.5 - 1.5 - 1.0 + 0.1, epsilon = 1e-6);
    }

    #[test]
    fn test_new_validates_dims_and_rank() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(Linear::new("l", 0, 3, None, None, &mut rng).is_err());
        assert!(Linear::new("l", 4, 3, None, Some(0), &mut rng).is_err());
        let lin = Linear::new("l", 4, 3, None, Some(2), &mut rng).unwrap();
        assert_eq!(lin.rank(), Some(2));
        assert_eq!(lin.num_parameters(), 4 * 2 + 2 * 3);
        let y = lin.forward(&input()).unwrap();
        assert_eq!(y.shape(), &[2, 1, 3]);
        assert!(lin.forward(&ArrayD::zeros(IxDyn(&[2, 5]))).is_err());
    }

    #[test]
    fn test_ptq_training_is_float() {
        let lin = Linear::from_weights(
            "l",
            vec![weight()],
            Some(params(QuantizationType::Ptq, QuantizationMode::Training, 8)),
        )
        .unwrap();
        assert!(!lin.is_materialized());
        assert_close(&lin.forward(&input()).unwrap(), &float_reference(), 0.0);
    }

    #[test]
    fn test_fq_aqt_and_inference_track_float() {
        let reference = float_reference();
        for qtype in [QuantizationType::Fq, QuantizationType::Aqt, QuantizationType::Ptq] {
            for mode in [QuantizationMode::Training, QuantizationMode::Inference] {
                let mut p = params(qtype, mode, 8);
                p.act_params = Some(ActQuantizationParams::default());
                let lin = Linear::from_weights("l", vec![weight()], Some(p)).unwrap();
                assert_close(&lin.forward(&input()).unwrap(), &reference, 0.15);
            }
        }
    }

    #[test]
    fn test_materialize_matches_aqt_training() {
        let aqt = Linear::from_weights(
            "l",
            vec![weight()],
            Some(params(QuantizationType::Aqt, QuantizationMode::Training, 8)),
        )
        .unwrap();
        let served = aqt.materialize().unwrap();
        assert!(served.is_materialized());
        assert_eq!(served.quantization().unwrap().mode, QuantizationMode::Inference);
        assert_close(&aqt.forward(&input()).unwrap(), &served.forward(&input()).unwrap(), 1e-5);

        let float = Linear::from_weights("l", vec![weight()], None).unwrap();
        assert!(float.materialize().is_err());
    }

    #[test]
    fn test_int4_weights_are_packed() {
        let mut p = params(QuantizationType::Ptq, QuantizationMode::Inference, 4);
        p.weight_params.int4_packed_weights_container_dtype = QuantDtype::Int8;
        let lin = Linear::from_weights("l", vec![weight()], Some(p.clone())).unwrap();
        assert!(matches!(lin.factors()[0], WeightStore::PackedInt4 { .. }));
        // 4 rows -> 2 int8 words per column, plus 3 scales
        assert_eq!(lin.num_parameters(), 2 * 3 + 3);
        assert_close(&lin.forward(&input()).unwrap(), &float_reference(), 0.6);

        p.weight_params.use_int4_packed_weights = false;
        let unpacked = Linear::from_weights("l", vec![weight()], Some(p)).unwrap();
        assert!(matches!(unpacked.factors()[0], WeightStore::Int8(_)));
        assert_close(&lin.forward(&input()).unwrap(), &unpacked.forward(&input()).unwrap(), 1e-6);
    }

    #[test]
    fn test_block_size_must_divide_contracting_dim() {
        let mut p = params(QuantizationType::Ptq, QuantizationMode::Inference, 8);
        p.weight_params.block_size = 3;
        assert!(Linear::from_weights("l", vec![weight()], Some(p.clone())).is_err());
        p.weight_params.block_size = 2;
        let lin = Linear::from_weights("l", vec![weight()], Some(p)).unwrap();
        let qw = lin.quantized_weights().unwrap();
        assert_eq!(qw[0].1.scale.shape(), &[2, 3]);
    }

    #[test]
    fn test_quantized_weights_names() {
        let lin = Linear::from_weights(
            "proj",
            vec![weight(), arr2(&[[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]])],
            Some(params(QuantizationType::Fq, QuantizationMode::Training, 8)),
        )
        .unwrap();
        let names: Vec<String> = lin.quantized_weights().unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["proj.w_a".to_string(), "proj.w_b".to_string()]);
        assert_eq!(lin.effective_weight().shape(), &[4, 2]);

        let float = Linear::from_weights("f", vec![weight()], None).unwrap();
        assert!(float.quantized_weights().unwrap().is_empty());
    }

    #[test]
    fn test_bias_and_feed_forward() {
        let bias = Bias::from_values("b", arr1(&[1.0, -1.0, 0.0]));
        let y = bias.forward(&ArrayD::zeros(IxDyn(&[2, 3]))).unwrap();
        assert_eq!(y.iter().take(3).cloned().collect::<Vec<_>>(), vec![1.0, -1.0, 0.0]);
        assert!(bias.forward(&ArrayD::zeros(IxDyn(&[2, 4]))).is_err());

        let lin = Linear::from_weights("linear", vec![weight()], None).unwrap();
        let ff = FeedForward::new("ffn", lin, true, Activation::Relu);
        let y = ff.forward(&input()).unwrap();
        assert!(y.iter().all(|&v| v >= 0.0));
        assert_eq!(ff.num_parameters(), 12 + 3);
    }
}
