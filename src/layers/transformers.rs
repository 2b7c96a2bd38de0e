// src/layers/transformers.rs

use crate::base_layer::{scoped, Layer};
use crate::common::LayerNorm;
use crate::layers::attentions::{DotProductAttention, MultiQueryDotProductAttention};
use crate::layers::embedding_softmax::SharedEmbeddingSoftmax;
use crate::layers::linears::FeedForward;
use crate::layers::operations::QuantizedTensor;
use log::trace;
use ndarray::ArrayD;
use std::error::Error;

/// Two stacked feed-forward layers: `input -> hidden` with the configured
/// activation, then `hidden -> input` with none.
#[derive(Debug, Clone)]
pub struct TransformerFeedForward {
    name: String,
    ffn_layer1: FeedForward,
    ffn_layer2: FeedForward,
}

impl TransformerFeedForward {
    pub fn new(name: &str, ffn_layer1: FeedForward, ffn_layer2: FeedForward) -> Result<Self, Box<dyn Error>> {
        let (l1, l2) = (ffn_layer1.linear(), ffn_layer2.linear());
        if l1.output_dims() != l2.input_dims() || l1.input_dims() != l2.output_dims() {
            return Err(format!(
                "TransformerFeedForward '{}': layers [{} -> {}] and [{} -> {}] do not form a residual block",
                name,
                l1.input_dims(),
                l1.output_dims(),
                l2.input_dims(),
                l2.output_dims()
            )
            .into());
        }
        Ok(Self { name: name.to_string(), ffn_layer1, ffn_layer2 })
    }

    pub fn layers(&self) -> (&FeedForward, &FeedForward) {
        (&self.ffn_layer1, &self.ffn_layer2)
    }
}

impl Layer for TransformerFeedForward {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>, Box<dyn Error>> {
        let h = self.ffn_layer1.forward(input)?;
        self.ffn_layer2.forward(&h)
    }

    fn num_parameters(&self) -> usize {
        self.ffn_layer1.num_parameters() + self.ffn_layer2.num_parameters()
    }

    fn quantized_weights(&self) -> Result<Vec<(String, QuantizedTensor)>, Box<dyn Error>> {
        let mut out = self.ffn_layer1.quantized_weights()?;
        out.extend(self.ffn_layer2.quantized_weights()?);
        Ok(scoped(&self.name, out))
    }
}

#[derive(Debug, Clone)]
pub enum SelfAttention {
    DotProduct(DotProductAttention),
    MultiQuery(MultiQueryDotProductAttention),
}

impl SelfAttention {
    pub fn fprop(&self, x: &ArrayD<f32>, mask: Option<&ArrayD<f32>>) -> Result<ArrayD<f32>, Box<dyn Error>> {
        match self {
            SelfAttention::DotProduct(a) => a.fprop(x, mask),
            SelfAttention::MultiQuery(a) => a.fprop(x, mask),
        }
    }

    fn as_layer(&self) -> &dyn Layer {
        match self {
            SelfAttention::DotProduct(a) => a,
            SelfAttention::MultiQuery(a) => a,
        }
    }
}

/// Pre-norm transformer layer: `x + attn(ln(x))`, then `x + ffn(ln(x))`.
#[derive(Debug, Clone)]
pub struct Transformer {
    name: String,
    ln_1: LayerNorm,
    attention: SelfAttention,
    ln_2: LayerNorm,
    ff_layer: TransformerFeedForward,
}

impl Transformer {
    pub fn new(
        name: &str,
        input_dims: usize,
        attention: SelfAttention,
        ff_layer: TransformerFeedForward,
    ) -> Result<Self, Box<dyn Error>> {
        Ok(Self {
            name: name.to_string(),
            ln_1: LayerNorm::new(input_dims, 1e-6)?,
            attention,
            ln_2: LayerNorm::new(input_dims, 1e-6)?,
            ff_layer,
        })
    }

    pub fn attention(&self) -> &SelfAttention {
        &self.attention
    }

    pub fn ff_layer(&self) -> &TransformerFeedForward {
        &self.ff_layer
    }

    pub fn fprop(&self, x: &ArrayD<f32>, mask: Option<&ArrayD<f32>>) -> Result<ArrayD<f32>, Box<dyn Error>> {
        let attn_out = self.attention.fprop(&self.ln_1.forward(x)?, mask)?;
        let h = x + &attn_out;
        let ff_out = self.ff_layer.forward(&self.ln_2.forward(&h)?)?;
        Ok(h + ff_out)
    }
}

impl Layer for Transformer {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>, Box<dyn Error>> {
        self.fprop(input, None)
    }

    fn num_parameters(&self) -> usize {
        2 * (self.ln_1.dims() * 2) + self.attention.as_layer().num_parameters() + self.ff_layer.num_parameters()
    }

    fn quantized_weights(&self) -> Result<Vec<(String, QuantizedTensor)>, Box<dyn Error>> {
        let mut out = self.attention.as_layer().quantized_weights()?;
        out.extend(self.ff_layer.quantized_weights()?);
        Ok(scoped(&self.name, out))
    }
}

#[derive(Debug, Clone)]
pub struct StackedTransformer {
    name: String,
    layers: Vec<Transformer>,
}

impl StackedTransformer {
    pub fn new(name: &str, layers: Vec<Transformer>) -> Self {
        Self { name: name.to_string(), layers }
    }

    pub fn layers(&self) -> &[Transformer] {
        &self.layers
    }

    pub fn fprop(&self, x: &ArrayD<f32>, mask: Option<&ArrayD<f32>>) -> Result<ArrayD<f32>, Box<dyn Error>> {
        let mut h = x.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer
                .fprop(&h, mask)
                .map_err(|e| format!("StackedTransformer '{}' layer {}: {}", self.name, i, e))?;
        }
        Ok(h)
    }
}

impl Layer for StackedTransformer {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>, Box<dyn Error>> {
        self.fprop(input, None)
    }

    fn num_parameters(&self) -> usize {
        self.layers.iter().map(Layer::num_parameters).sum()
    }

    fn quantized_weights(&self) -> Result<Vec<(String, QuantizedTensor)>, Box<dyn Error>> {
        let mut out = Vec::new();
        for layer in &self.layers {
            out.extend(layer.quantized_weights()?);
        }
        Ok(scoped(&self.name, out))
    }
}

/// Token ids in, class logits out: embedding lookup, the transformer stack,
/// a final LayerNorm and the shared softmax.
#[derive(Debug, Clone)]
pub struct TransformerLm {
    name: String,
    softmax: SharedEmbeddingSoftmax,
    transformer: StackedTransformer,
    final_ln: LayerNorm,
}

impl TransformerLm {
    pub fn new(name: &str, softmax: SharedEmbeddingSoftmax, transformer: StackedTransformer) -> Result<Self, Box<dyn Error>> {
        let final_ln = LayerNorm::new(softmax.input_dims(), 1e-6)?;
        Ok(Self { name: name.to_string(), softmax, transformer, final_ln })
    }

    pub fn softmax(&self) -> &SharedEmbeddingSoftmax {
        &self.softmax
    }

    /// `ids` is `[B, T]`, ids stored as floats. Returns `[B, T, C]` logits.
    pub fn fprop(&self, ids: &ArrayD<f32>, mask: Option<&ArrayD<f32>>) -> Result<ArrayD<f32>, Box<dyn Error>> {
        if ids.ndim() != 2 {
            return Err(format!("TransformerLm '{}' expects [batch, seq_len] ids, got {:?}", self.name, ids.shape()).into());
        }
        let embeddings = self.softmax.emb_lookup(ids)?;
        trace!("TransformerLm '{}' embeddings {:?}", self.name, embeddings.shape());
        let h = self.transformer.fprop(&embeddings, mask)?;
        let h = self.final_ln.forward(&h)?;
        self.softmax.logits(&h)
    }
}

impl Layer for TransformerLm {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>, Box<dyn Error>> {
        self.fprop(input, None)
    }

    fn num_parameters(&self) -> usize {
        self.softmax.num_parameters() + self.transformer.num_parameters() + 2 * self.final_ln.dims()
    }

    fn quantized_weights(&self) -> Result<Vec<(String, QuantizedTensor)>, Box<dyn Error>> {
        let mut out = self.softmax.quantized_weights()?;
        out.extend(self.transformer.quantized_weights()?);
        Ok(scoped(&self.name, out))
    }
}
