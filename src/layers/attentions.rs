// src/layers/attentions.rs

use crate::base_layer::{scoped, Layer};
use crate::common::{flatten_leading, restore_leading, softmax};
use crate::config::QuantizationParams;
use crate::layers::linears::Linear;
use crate::layers::operations::QuantizedTensor;
use ndarray::{s, Array, Array1, Array2, Array4, ArrayD, ArrayViewD, Ix2, Ix4, ShapeError};
use rand::Rng;
use std::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionDims {
    pub hidden_dim: usize,
    pub num_heads: usize,
    pub dim_per_head: usize,
}

impl AttentionDims {
    pub fn validate(&self) -> Result<(), Box<dyn Error>> {
        if self.hidden_dim == 0 || self.num_heads == 0 || self.dim_per_head == 0 {
            return Err(format!("Attention dims must be positive, got {:?}", self).into());
        }
        Ok(())
    }

    fn heads_width(&self) -> usize {
        self.num_heads * self.dim_per_head
    }
}

fn check_linear(name: &str, linear: &Linear, input: usize, output: usize) -> Result<(), Box<dyn Error>> {
    if linear.input_dims() != input || linear.output_dims() != output {
        return Err(format!(
            "{}: expected weight [{} -> {}], got [{} -> {}]",
            name,
            input,
            output,
            linear.input_dims(),
            linear.output_dims()
        )
        .into());
    }
    Ok(())
}

fn add_bias(mut y: Array2<f32>, bias: &Option<Array1<f32>>) -> Array2<f32> {
    if let Some(b) = bias {
        y += b;
    }
    y
}

/// Per-head projection. Input projections map `[..., D]` to `[..., N, H]`;
/// output projections map `[..., N, H]` back to `[..., D]`.
#[derive(Debug, Clone)]
pub struct AttentionProjection {
    name: String,
    dims: AttentionDims,
    is_output_projection: bool,
    linear: Linear,
    bias: Option<Array1<f32>>,
}

impl AttentionProjection {
    pub fn new<R: Rng + ?Sized>(
        name: &str,
        dims: AttentionDims,
        is_output_projection: bool,
        use_bias: bool,
        quantization: Option<QuantizationParams>,
        rng: &mut R,
    ) -> Result<Self, Box<dyn Error>> {
        dims.validate()?;
        let (input, output) = if is_output_projection {
            (dims.heads_width(), dims.hidden_dim)
        } else {
            (dims.hidden_dim, dims.heads_width())
        };
        let linear = Linear::new("w", input, output, quantization, None, rng)?;
        Self::from_linear(name, dims, is_output_projection, linear, use_bias)
    }

    pub fn from_linear(
        name: &str,
        dims: AttentionDims,
        is_output_projection: bool,
        linear: Linear,
        use_bias: bool,
    ) -> Result<Self, Box<dyn Error>> {
        dims.validate()?;
        let (input, output) = if is_output_projection {
            (dims.heads_width(), dims.hidden_dim)
        } else {
            (dims.hidden_dim, dims.heads_width())
        };
        check_linear(name, &linear, input, output)?;
        Ok(Self {
            name: name.to_string(),
            dims,
            is_output_projection,
            linear,
            bias: if use_bias { Some(Array1::zeros(output)) } else { None },
        })
    }

    pub fn linear(&self) -> &Linear {
        &self.linear
    }

    pub fn project(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>, Box<dyn Error>> {
        let (n, h) = (self.dims.num_heads, self.dims.dim_per_head);
        if !self.is_output_projection {
            let (x2, leading) = flatten_leading(x, self.dims.hidden_dim)
                .map_err(|e| format!("AttentionProjection '{}': {}", self.name, e))?;
            let y = add_bias(self.linear.matmul(&x2)?, &self.bias);
            return restore_leading(y, &leading, &[n, h]);
        }

        let shape = x.shape();
        let rank = shape.len();
        if rank < 2 || shape[rank - 2] != n || shape[rank - 1] != h {
            return Err(format!(
                "AttentionProjection '{}' expects [..., {}, {}], got {:?}",
                self.name, n, h, shape
            )
            .into());
        }
        let leading = shape[..rank - 2].to_vec();
        let rows: usize = leading.iter().product();
        let x2 = x
            .as_standard_layout()
            .into_owned()
            .into_shape((rows, n * h))
            .map_err(|e: ShapeError| e.to_string())?;
        let y = add_bias(self.linear.matmul(&x2)?, &self.bias);
        restore_leading(y, &leading, &[self.dims.hidden_dim])
    }
}

impl Layer for AttentionProjection {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>, Box<dyn Error>> {
        self.project(input)
    }

    fn num_parameters(&self) -> usize {
        self.linear.num_parameters() + self.bias.as_ref().map_or(0, |b| b.len())
    }

    fn quantized_weights(&self) -> Result<Vec<(String, QuantizedTensor)>, Box<dyn Error>> {
        Ok(scoped(&self.name, self.linear.unscoped_quantized_weights()?))
    }
}

/// Query, key and value projections fused into one `[D, 3 * N * H]` weight.
#[derive(Debug, Clone)]
pub struct CombinedQkvProjection {
    name: String,
    dims: AttentionDims,
    linear: Linear,
    bias: Option<Array1<f32>>,
}

impl CombinedQkvProjection {
    pub fn new<R: Rng + ?Sized>(
        name: &str,
        dims: AttentionDims,
        use_bias: bool,
        quantization: Option<QuantizationParams>,
        rng: &mut R,
    ) -> Result<Self, Box<dyn Error>> {
        dims.validate()?;
        let linear = Linear::new("w", dims.hidden_dim, 3 * dims.heads_width(), quantization, None, rng)?;
        Self::from_linear(name, dims, linear, use_bias)
    }

    pub fn from_linear(name: &str, dims: AttentionDims, linear: Linear, use_bias: bool) -> Result<Self, Box<dyn Error>> {
        dims.validate()?;
        check_linear(name, &linear, dims.hidden_dim, 3 * dims.heads_width())?;
        Ok(Self {
            name: name.to_string(),
            dims,
            linear,
            bias: if use_bias { Some(Array1::zeros(3 * dims.heads_width())) } else { None },
        })
    }

    /// Returns `(query, key, value)`, each `[..., N, H]`.
    pub fn project_qkv(&self, x: &ArrayD<f32>) -> Result<(ArrayD<f32>, ArrayD<f32>, ArrayD<f32>), Box<dyn Error>> {
        let (x2, leading) = flatten_leading(x, self.dims.hidden_dim)
            .map_err(|e| format!("CombinedQkvProjection '{}': {}", self.name, e))?;
        let y = add_bias(self.linear.matmul(&x2)?, &self.bias);
        let width = self.dims.heads_width();
        let heads = [self.dims.num_heads, self.dims.dim_per_head];
        let q = restore_leading(y.slice(s![.., 0..width]).to_owned(), &leading, &heads)?;
        let k = restore_leading(y.slice(s![.., width..2 * width]).to_owned(), &leading, &heads)?;
        let v = restore_leading(y.slice(s![.., 2 * width..3 * width]).to_owned(), &leading, &heads)?;
        Ok((q, k, v))
    }
}

impl Layer for CombinedQkvProjection {
    fn name(&self) -> &str {
        &self.name
    }

    /// Output is `[..., 3, N, H]` with query, key, value stacked.
    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>, Box<dyn Error>> {
        let (x2, leading) = flatten_leading(input, self.dims.hidden_dim)?;
        let y = add_bias(self.linear.matmul(&x2)?, &self.bias);
        restore_leading(y, &leading, &[3, self.dims.num_heads, self.dims.dim_per_head])
    }

    fn num_parameters(&self) -> usize {
        self.linear.num_parameters() + self.bias.as_ref().map_or(0, |b| b.len())
    }

    fn quantized_weights(&self) -> Result<Vec<(String, QuantizedTensor)>, Box<dyn Error>> {
        Ok(scoped(&self.name, self.linear.unscoped_quantized_weights()?))
    }
}

/// Single-head projection `[..., D] -> [..., H]`, used for the shared key and
/// value of multi-query attention.
#[derive(Debug, Clone)]
pub struct OneHeadedAttentionProjection {
    name: String,
    input_dim: usize,
    output_dim: usize,
    linear: Linear,
    bias: Option<Array1<f32>>,
}

impl OneHeadedAttentionProjection {
    pub fn new<R: Rng + ?Sized>(
        name: &str,
        input_dim: usize,
        output_dim: usize,
        use_bias: bool,
        quantization: Option<QuantizationParams>,
        rng: &mut R,
    ) -> Result<Self, Box<dyn Error>> {
        let linear = Linear::new("w", input_dim, output_dim, quantization, None, rng)?;
        Self::from_linear(name, linear, use_bias)
    }

    pub fn from_linear(name: &str, linear: Linear, use_bias: bool) -> Result<Self, Box<dyn Error>> {
        let (input_dim, output_dim) = (linear.input_dims(), linear.output_dims());
        Ok(Self {
            name: name.to_string(),
            input_dim,
            output_dim,
            linear,
            bias: if use_bias { Some(Array1::zeros(output_dim)) } else { None },
        })
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }
}

impl Layer for OneHeadedAttentionProjection {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>, Box<dyn Error>> {
        let (x2, leading) = flatten_leading(input, self.input_dim)
            .map_err(|e| format!("OneHeadedAttentionProjection '{}': {}", self.name, e))?;
        let y = add_bias(self.linear.matmul(&x2)?, &self.bias);
        restore_leading(y, &leading, &[self.output_dim])
    }

    fn num_parameters(&self) -> usize {
        self.linear.num_parameters() + self.bias.as_ref().map_or(0, |b| b.len())
    }

    fn quantized_weights(&self) -> Result<Vec<(String, QuantizedTensor)>, Box<dyn Error>> {
        Ok(scoped(&self.name, self.linear.unscoped_quantized_weights()?))
    }
}

#[derive(Debug, Clone)]
pub enum QkvProjections {
    Separate {
        query: AttentionProjection,
        key: AttentionProjection,
        value: AttentionProjection,
    },
    Combined(CombinedQkvProjection),
}

fn head_view<'a>(t: &'a ArrayD<f32>, b: usize, n: usize) -> Result<ndarray::ArrayView2<'a, f32>, Box<dyn Error>> {
    let view: ArrayViewD<'a, f32> = if t.ndim() == 4 {
        t.slice(s![b, .., n, ..]).into_dyn()
    } else {
        t.slice(s![b, .., ..]).into_dyn()
    };
    Ok(view.into_dimensionality::<Ix2>()?)
}

fn check_mask(mask: &ArrayD<f32>, batch: usize, heads: usize, t: usize, s_len: usize) -> Result<(), Box<dyn Error>> {
    let shape = mask.shape();
    let ok = shape.len() == 4
        && shape[0] == batch
        && (shape[1] == 1 || shape[1] == heads)
        && shape[2] == t
        && shape[3] == s_len;
    if !ok {
        return Err(format!(
            "Attention mask must be [{}, 1 or {}, {}, {}], got {:?}",
            batch, heads, t, s_len, shape
        )
        .into());
    }
    Ok(())
}

/// Scaled dot-product over heads. `query` is `[B, T, N, H]`; `key` and `value`
/// are `[B, S, N, H]`, or `[B, S, H]` when shared by all heads.
fn attend(
    query: &ArrayD<f32>,
    key: &ArrayD<f32>,
    value: &ArrayD<f32>,
    mask: Option<&ArrayD<f32>>,
    causal: bool,
) -> Result<ArrayD<f32>, Box<dyn Error>> {
    let q4 = query.view().into_dimensionality::<Ix4>()?;
    let (batch, t, heads, dim) = q4.dim();
    let s_len = key.shape()[1];
    if let Some(m) = mask {
        check_mask(m, batch, heads, t, s_len)?;
    }

    let scale = 1.0 / (dim as f32).sqrt();
    let mut context: Array4<f32> = Array::zeros((batch, t, heads, dim));
    for b in 0..batch {
        for n in 0..heads {
            let q = q4.slice(s![b, .., n, ..]);
            let k = head_view(key, b, n)?;
            let v = head_view(value, b, n)?;
            let mut logits = q.dot(&k.t()) * scale;
            if let Some(m) = mask {
                let head = if m.shape()[1] == 1 { 0 } else { n };
                logits += &m.slice(s![b, head, .., ..]);
            }
            if causal {
                // Queries are aligned with the last t keys.
                let offset = s_len.saturating_sub(t);
                for i in 0..t {
                    for j in (i + offset + 1)..s_len {
                        logits[[i, j]] = f32::NEG_INFINITY;
                    }
                }
            }
            let probs = softmax(&logits.into_dyn(), 1)?.into_dimensionality::<Ix2>()?;
            context.slice_mut(s![b, .., n, ..]).assign(&probs.dot(&v));
        }
    }
    Ok(context.into_dyn())
}

fn check_hidden(name: &str, x: &ArrayD<f32>, hidden_dim: usize) -> Result<(), Box<dyn Error>> {
    let shape = x.shape();
    if shape.len() != 3 || shape[2] != hidden_dim {
        return Err(format!(
            "{} expects [batch, seq_len, {}], got {:?}",
            name, hidden_dim, shape
        )
        .into());
    }
    Ok(())
}

/// Multi-head self-attention.
#[derive(Debug, Clone)]
pub struct DotProductAttention {
    name: String,
    dims: AttentionDims,
    causal: bool,
    qkv: QkvProjections,
    post: AttentionProjection,
}

impl DotProductAttention {
    pub fn new(
        name: &str,
        dims: AttentionDims,
        causal: bool,
        qkv: QkvProjections,
        post: AttentionProjection,
    ) -> Result<Self, Box<dyn Error>> {
        dims.validate()?;
        let parts: Vec<AttentionDims> = match &qkv {
            QkvProjections::Separate { query, key, value } => vec![query.dims, key.dims, value.dims],
            QkvProjections::Combined(c) => vec![c.dims],
        };
        if parts.iter().chain(std::iter::once(&post.dims)).any(|d| *d != dims) {
            return Err(format!("DotProductAttention '{}': projection dims do not match {:?}", name, dims).into());
        }
        if !post.is_output_projection {
            return Err(format!("DotProductAttention '{}': post projection must be an output projection", name).into());
        }
        Ok(Self { name: name.to_string(), dims, causal, qkv, post })
    }

    pub fn qkv(&self) -> &QkvProjections {
        &self.qkv
    }

    /// `x` is `[B, T, D]`; `mask` is additive `[B, 1|N, T, T]`. Causal layers
    /// also mask future positions on top of it.
    pub fn fprop(&self, x: &ArrayD<f32>, mask: Option<&ArrayD<f32>>) -> Result<ArrayD<f32>, Box<dyn Error>> {
        check_hidden(&self.name, x, self.dims.hidden_dim)?;
        let (q, k, v) = match &self.qkv {
            QkvProjections::Separate { query, key, value } => (query.project(x)?, key.project(x)?, value.project(x)?),
            QkvProjections::Combined(c) => c.project_qkv(x)?,
        };
        let context = attend(&q, &k, &v, mask, self.causal)?;
        self.post.project(&context)
    }
}

impl Layer for DotProductAttention {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>, Box<dyn Error>> {
        self.fprop(input, None)
    }

    fn num_parameters(&self) -> usize {
        let qkv = match &self.qkv {
            QkvProjections::Separate { query, key, value } => {
                query.num_parameters() + key.num_parameters() + value.num_parameters()
            }
            QkvProjections::Combined(c) => c.num_parameters(),
        };
        qkv + self.post.num_parameters()
    }

    fn quantized_weights(&self) -> Result<Vec<(String, QuantizedTensor)>, Box<dyn Error>> {
        let mut out = match &self.qkv {
            QkvProjections::Separate { query, key, value } => {
                let mut w = query.quantized_weights()?;
                w.extend(key.quantized_weights()?);
                w.extend(value.quantized_weights()?);
                w
            }
            QkvProjections::Combined(c) => c.quantized_weights()?,
        };
        out.extend(self.post.quantized_weights()?);
        Ok(scoped(&self.name, out))
    }
}

/// Multi-query attention: `N` query heads sharing one key and one value head.
#[derive(Debug, Clone)]
pub struct MultiQueryDotProductAttention {
    name: String,
    dims: AttentionDims,
    causal: bool,
    query: AttentionProjection,
    key: OneHeadedAttentionProjection,
    value: OneHeadedAttentionProjection,
    post: AttentionProjection,
}

impl MultiQueryDotProductAttention {
    pub fn new(
        name: &str,
        dims: AttentionDims,
        causal: bool,
        query: AttentionProjection,
        key: OneHeadedAttentionProjection,
        value: OneHeadedAttentionProjection,
        post: AttentionProjection,
    ) -> Result<Self, Box<dyn Error>> {
        dims.validate()?;
        if query.dims != dims || post.dims != dims || !post.is_output_projection || query.is_output_projection {
            return Err(format!("MultiQueryDotProductAttention '{}': query/post projections do not match {:?}", name, dims).into());
        }
        for kv in [&key, &value] {
            if kv.input_dim != dims.hidden_dim || kv.output_dim != dims.dim_per_head {
                return Err(format!(
                    "MultiQueryDotProductAttention '{}': headless projection '{}' must be [{} -> {}]",
                    name, kv.name, dims.hidden_dim, dims.dim_per_head
                )
                .into());
            }
        }
        Ok(Self { name: name.to_string(), dims, causal, query, key, value, post })
    }

    pub fn fprop(&self, x: &ArrayD<f32>, mask: Option<&ArrayD<f32>>) -> Result<ArrayD<f32>, Box<dyn Error>> {
        check_hidden(&self.name, x, self.dims.hidden_dim)?;
        let q = self.query.project(x)?;
        let k = self.key.forward(x)?;
        let v = self.value.forward(x)?;
        let context = attend(&q, &k, &v, mask, self.causal)?;
        self.post.project(&context)
    }
}

impl Layer for MultiQueryDotProductAttention {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>, Box<dyn Error>> {
        self.fprop(input, None)
    }

    fn num_parameters(&self) -> usize {
        self.query.num_parameters()
            + self.key.num_parameters()
            + self.value.num_parameters()
            + self.post.num_parameters()
    }

    fn quantized_weights(&self) -> Result<Vec<(String, QuantizedTensor)>, Box<dyn Error>> {
        let mut out = self.query.quantized_weights()?;
        out.extend(self.key.quantized_weights()?);
        out.extend(self.value.quantized_weights()?);
        out.extend(self.post.quantized_weights()?);
        Ok(scoped(&self.name, out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QuantizationMode, QuantizationType, WeightQuantizationParams};
    use crate::layers::linears::init_uniform;
    use ndarray::IxDyn;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const DIMS: AttentionDims = AttentionDims { hidden_dim: 4, num_heads: 2, dim_per_head: 3 };

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn hidden(batch: usize, t: usize) -> ArrayD<f32> {
        Array::from_shape_fn((batch, t, DIMS.hidden_dim), |(b, i, d)| ((b + 2 * i + 3 * d) as f32 * 0.37).sin()).into_dyn()
    }

    fn mha(rng: &mut StdRng, combined: bool, causal: bool) -> DotProductAttention {
        let qkv = if combined {
            QkvProjections::Combined(CombinedQkvProjection::new("combined_qkv", DIMS, true, None, rng).unwrap())
        } else {
            QkvProjections::Separate {
                query: AttentionProjection::new("query", DIMS, false, true, None, rng).unwrap(),
                key: AttentionProjection::new("key", DIMS, false, true, None, rng).unwrap(),
                value: AttentionProjection::new("value", DIMS, false, true, None, rng).unwrap(),
            }
        };
        let post = AttentionProjection::new("post", DIMS, true, true, None, rng).unwrap();
        DotProductAttention::new("atten", DIMS, causal, qkv, post).unwrap()
    }

    #[test]
    fn test_projection_shapes() {
        let mut rng = rng();
        let proj = AttentionProjection::new("query", DIMS, false, true, None, &mut rng).unwrap();
        let y = proj.forward(&hidden(2, 5)).unwrap();
        assert_eq!(y.shape(), &[2, 5, 2, 3]);

        let post = AttentionProjection::new("post", DIMS, true, false, None, &mut rng).unwrap();
        let back = post.forward(&y).unwrap();
        assert_eq!(back.shape(), &[2, 5, 4]);
        assert!(post.forward(&hidden(2, 5)).is_err());
        assert_eq!(post.num_parameters(), 6 * 4);

        let combined = CombinedQkvProjection::new("qkv", DIMS, false, None, &mut rng).unwrap();
        assert_eq!(combined.forward(&hidden(1, 3)).unwrap().shape(), &[1, 3, 3, 2, 3]);
        let (q, k, v) = combined.project_qkv(&hidden(1, 3)).unwrap();
        assert_eq!(q.shape(), &[1, 3, 2, 3]);
        assert_eq!(k.shape(), q.shape());
        assert_eq!(v.shape(), q.shape());

        let headless = OneHeadedAttentionProjection::new("key", 4, 3, true, None, &mut rng).unwrap();
        assert_eq!(headless.forward(&hidden(2, 5)).unwrap().shape(), &[2, 5, 3]);
    }

    #[test]
    fn test_from_linear_checks_shapes() {
        let lin = Linear::from_weights("w", vec![Array2::zeros((4, 5))], None).unwrap();
        assert!(AttentionProjection::from_linear("query", DIMS, false, lin.clone(), false).is_err());
        assert!(CombinedQkvProjection::from_linear("qkv", DIMS, lin, false).is_err());
    }

    #[test]
    fn test_quantized_projection_tracks_float() {
        let mut rng = rng();
        let w = init_uniform(4, 6, &mut rng);
        let float = AttentionProjection::from_linear(
            "query",
            DIMS,
            false,
            Linear::from_weights("w", vec![w.clone()], None).unwrap(),
            false,
        )
        .unwrap();
        let params = QuantizationParams {
            quantization_type: QuantizationType::Ptq,
            mode: QuantizationMode::Inference,
            weight_params: WeightQuantizationParams::default(),
            act_params: None,
        };
        let quantized = AttentionProjection::from_linear(
            "query",
            DIMS,
            false,
            Linear::from_weights("w", vec![w], Some(params)).unwrap(),
            false,
        )
        .unwrap();
        let x = hidden(2, 3);
        let a = float.forward(&x).unwrap();
        let b = quantized.forward(&x).unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 0.02, "{} vs {}", x, y);
        }
        let names: Vec<String> = quantized.quantized_weights().unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["query.w".to_string()]);
    }

    #[test]
    fn test_dot_product_attention_shapes_and_mask() {
        let mut rng = rng();
        for combined in [false, true] {
            let attn = mha(&mut rng, combined, false);
            let x = hidden(2, 4);
            assert_eq!(attn.forward(&x).unwrap().shape(), &[2, 4, 4]);
            let mask = ArrayD::<f32>::zeros(IxDyn(&[2, 1, 4, 4]));
            assert_eq!(attn.fprop(&x, Some(&mask)).unwrap().shape(), &[2, 4, 4]);
            let bad_mask = ArrayD::<f32>::zeros(IxDyn(&[2, 3, 4, 4]));
            assert!(attn.fprop(&x, Some(&bad_mask)).is_err());
        }
        let attn = mha(&mut rng, false, false);
        assert!(attn.forward(&ArrayD::zeros(IxDyn(&[2, 4, 5]))).is_err());
    }

    #[test]
    fn test_causal_attention_ignores_future_tokens() {
        let mut rng = rng();
        let attn = mha(&mut rng, false, true);
        let x = hidden(1, 4);
        let mut changed = x.clone();
        for d in 0..DIMS.hidden_dim {
            changed[[0, 3, d]] += 5.0;
        }
        let a = attn.forward(&x).unwrap();
        let b = attn.forward(&changed).unwrap();
        for t in 0..3 {
            for d in 0..DIMS.hidden_dim {
                assert!((a[[0, t, d]] - b[[0, t, d]]).abs() < 1e-5);
            }
        }
        let differs = (0..DIMS.hidden_dim).any(|d| (a[[0, 3, d]] - b[[0, 3, d]]).abs() > 1e-6);
        assert!(differs, "last position should see its own change");
    }

    #[test]
    fn test_causal_masking_applies_on_top_of_explicit_mask() {
        let mut rng = rng();
        let attn = mha(&mut rng, false, true);
        let x = hidden(1, 4);
        let mut changed = x.clone();
        for d in 0..DIMS.hidden_dim {
            changed[[0, 3, d]] -= 3.0;
        }
        // Key 1 is hidden from every query; future keys stay hidden too.
        let mut mask = ArrayD::<f32>::zeros(IxDyn(&[1, 1, 4, 4]));
        for t in 0..4 {
            mask[[0, 0, t, 1]] = -1e9;
        }
        let a = attn.fprop(&x, Some(&mask)).unwrap();
        let b = attn.fprop(&changed, Some(&mask)).unwrap();
        for t in 0..3 {
            for d in 0..DIMS.hidden_dim {
                assert!((a[[0, t, d]] - b[[0, t, d]]).abs() < 1e-5, "position {} saw a future token", t);
            }
        }
        let unmasked = attn.forward(&x).unwrap();
        let differs = (0..DIMS.hidden_dim).any(|d| (a[[0, 2, d]] - unmasked[[0, 2, d]]).abs() > 1e-6);
        assert!(differs, "explicit mask should still apply");
    }

    #[test]
    fn test_multi_query_attention() {
        let mut rng = rng();
        let query = AttentionProjection::new("query", DIMS, false, false, None, &mut rng).unwrap();
        let key = OneHeadedAttentionProjection::new("key", 4, 3, false, None, &mut rng).unwrap();
        let value = OneHeadedAttentionProjection::new("value", 4, 3, false, None, &mut rng).unwrap();
        let post = AttentionProjection::new("post", DIMS, true, false, None, &mut rng).unwrap();
        let bad_key = OneHeadedAttentionProjection::new("key", 4, 2, false, None, &mut rng).unwrap();
        assert!(MultiQueryDotProductAttention::new(
            "mqa", DIMS, true, query.clone(), bad_key, value.clone(), post.clone()
        )
        .is_err());

        let mqa = MultiQueryDotProductAttention::new("mqa", DIMS, true, query, key, value, post).unwrap();
        assert_eq!(mqa.forward(&hidden(3, 2)).unwrap().shape(), &[3, 2, 4]);
        assert_eq!(mqa.num_parameters(), 4 * 6 + 4 * 3 + 4 * 3 + 6 * 4);
        assert!(mqa.quantized_weights().unwrap().is_empty());
    }
}
