// src/templates.rs
//! Serializable layer templates.
//!
//! A template describes a layer without building it. Templates nest through
//! boxed child templates (`proj_tpl`, `linear_tpl`, ...), and parents overwrite
//! the dimensions of their children at build time, so child dims left at zero
//! are filled in by whoever owns them. The quantization rewriter edits these
//! trees; [`LayerTpl::build`] turns a tree into live layers.

use crate::base_layer::{Activation, ActivationLayer, Layer};
use crate::chain::chain_lib::{Chain, LogArgs, Repeat};
use crate::config::{QuantizationParams, load_json};
use crate::layers::attentions::{
    AttentionDims, AttentionProjection, CombinedQkvProjection, DotProductAttention, MultiQueryDotProductAttention,
    OneHeadedAttentionProjection, QkvProjections,
};
use crate::layers::convolutions::{Conv2D, ConvBlock, Padding};
use crate::layers::embedding_softmax::{EmbeddingLayout, SharedEmbeddingSoftmax};
use crate::layers::linears::{FeedForward, Linear};
use crate::layers::transformers::{SelfAttention, StackedTransformer, Transformer, TransformerFeedForward, TransformerLm};
use log::debug;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::str::FromStr;

type Quant = Option<QuantizationParams>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LinearTpl {
    pub name: String,
    pub input_dims: usize,
    pub output_dims: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantization: Quant,
    /// Factorizes the weight into `[input_dims, rank]` and `[rank, output_dims]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank: Option<usize>,
}

impl Default for LinearTpl {
    fn default() -> Self {
        Self { name: "linear".to_string(), input_dims: 0, output_dims: 0, quantization: None, rank: None }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct FeedForwardTpl {
    pub name: String,
    pub input_dims: usize,
    pub output_dims: usize,
    pub has_bias: bool,
    pub activation: Activation,
    pub linear_tpl: Box<LayerTpl>,
}

impl Default for FeedForwardTpl {
    fn default() -> Self {
        Self {
            name: "feed_forward".to_string(),
            input_dims: 0,
            output_dims: 0,
            has_bias: true,
            activation: Activation::Relu,
            linear_tpl: Box::new(LayerTpl::Linear(LinearTpl::default())),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ActivationTpl {
    pub name: String,
    pub activation: Activation,
}

impl Default for ActivationTpl {
    fn default() -> Self {
        Self { name: "activation".to_string(), activation: Activation::Relu }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AttentionProjectionTpl {
    pub name: String,
    pub input_dim: usize,
    pub num_heads: usize,
    pub dim_per_head: usize,
    pub is_output_projection: bool,
    pub use_bias: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantization: Quant,
}

impl Default for AttentionProjectionTpl {
    fn default() -> Self {
        Self {
            name: "attention_projection".to_string(),
            input_dim: 0,
            num_heads: 0,
            dim_per_head: 0,
            is_output_projection: false,
            use_bias: true,
            quantization: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CombinedQkvProjectionTpl {
    pub name: String,
    pub input_dim: usize,
    pub num_heads: usize,
    pub dim_per_head: usize,
    pub use_bias: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantization: Quant,
}

impl Default for CombinedQkvProjectionTpl {
    fn default() -> Self {
        Self {
            name: "combined_qkv".to_string(),
            input_dim: 0,
            num_heads: 0,
            dim_per_head: 0,
            use_bias: true,
            quantization: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct OneHeadedAttentionProjectionTpl {
    pub name: String,
    pub input_dim: usize,
    pub output_dim: usize,
    pub use_bias: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantization: Quant,
}

impl Default for OneHeadedAttentionProjectionTpl {
    fn default() -> Self {
        Self { name: "headless_projection".to_string(), input_dim: 0, output_dim: 0, use_bias: true, quantization: None }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DotProductAttentionTpl {
    pub name: String,
    pub input_dim: usize,
    pub num_heads: usize,
    /// Zero means `input_dim / num_heads`.
    pub dim_per_head: usize,
    pub causal: bool,
    pub combine_qkv: bool,
    pub proj_tpl: Box<LayerTpl>,
    pub combined_qkv_proj_tpl: Box<LayerTpl>,
}

impl Default for DotProductAttentionTpl {
    fn default() -> Self {
        Self {
            name: "self_attention".to_string(),
            input_dim: 0,
            num_heads: 0,
            dim_per_head: 0,
            causal: false,
            combine_qkv: false,
            proj_tpl: Box::new(LayerTpl::AttentionProjection(AttentionProjectionTpl::default())),
            combined_qkv_proj_tpl: Box::new(LayerTpl::CombinedQkvProjection(CombinedQkvProjectionTpl::default())),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct MultiQueryDotProductAttentionTpl {
    pub name: String,
    pub input_dim: usize,
    pub num_heads: usize,
    pub dim_per_head: usize,
    pub causal: bool,
    pub proj_tpl: Box<LayerTpl>,
    pub headless_proj_tpl: Box<LayerTpl>,
}

impl Default for MultiQueryDotProductAttentionTpl {
    fn default() -> Self {
        Self {
            name: "self_attention".to_string(),
            input_dim: 0,
            num_heads: 0,
            dim_per_head: 0,
            causal: false,
            proj_tpl: Box::new(LayerTpl::AttentionProjection(AttentionProjectionTpl::default())),
            headless_proj_tpl: Box::new(LayerTpl::OneHeadedAttentionProjection(
                OneHeadedAttentionProjectionTpl::default(),
            )),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TransformerFeedForwardTpl {
    pub name: String,
    pub input_dims: usize,
    pub hidden_dims: usize,
    pub has_bias: bool,
    pub activation: Activation,
    pub fflayer_tpl: Box<LayerTpl>,
}

impl Default for TransformerFeedForwardTpl {
    fn default() -> Self {
        Self {
            name: "ff_layer".to_string(),
            input_dims: 0,
            hidden_dims: 0,
            has_bias: true,
            activation: Activation::Relu,
            fflayer_tpl: Box::new(LayerTpl::FeedForward(FeedForwardTpl::default())),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TransformerTpl {
    pub name: String,
    pub input_dims: usize,
    pub hidden_dims: usize,
    pub num_heads: usize,
    pub dim_per_head: usize,
    pub mask_self_attention: bool,
    pub tr_atten_tpl: Box<LayerTpl>,
    pub tr_fflayer_tpl: Box<LayerTpl>,
}

impl Default for TransformerTpl {
    fn default() -> Self {
        Self {
            name: "transformer".to_string(),
            input_dims: 0,
            hidden_dims: 0,
            num_heads: 0,
            dim_per_head: 0,
            mask_self_attention: false,
            tr_atten_tpl: Box::new(LayerTpl::DotProductAttention(DotProductAttentionTpl::default())),
            tr_fflayer_tpl: Box::new(LayerTpl::TransformerFeedForward(TransformerFeedForwardTpl::default())),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StackedTransformerTpl {
    pub name: String,
    pub num_layers: usize,
    pub model_dims: usize,
    pub hidden_dims: usize,
    pub num_heads: usize,
    pub dim_per_head: usize,
    pub mask_self_attention: bool,
    pub transformer_layer_params_tpl: Box<LayerTpl>,
}

impl Default for StackedTransformerTpl {
    fn default() -> Self {
        Self {
            name: "transformer".to_string(),
            num_layers: 0,
            model_dims: 0,
            hidden_dims: 0,
            num_heads: 0,
            dim_per_head: 0,
            mask_self_attention: false,
            transformer_layer_params_tpl: Box::new(LayerTpl::Transformer(TransformerTpl::default())),
        }
    }
}

/// Shared by `SharedEmbeddingSoftmax` and `NClassMajorSharedEmbeddingSoftmax`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EmbeddingSoftmaxTpl {
    pub name: String,
    pub input_dims: usize,
    pub num_classes: usize,
    pub scale_sqrt_depth: bool,
    pub use_bias: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantization: Quant,
}

impl Default for EmbeddingSoftmaxTpl {
    fn default() -> Self {
        Self {
            name: "softmax".to_string(),
            input_dims: 0,
            num_classes: 0,
            scale_sqrt_depth: false,
            use_bias: false,
            quantization: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TransformerLmTpl {
    pub name: String,
    pub model_dims: usize,
    pub vocab_size: usize,
    pub softmax_tpl: Box<LayerTpl>,
    pub stacked_transformer_tpl: Box<LayerTpl>,
}

impl Default for TransformerLmTpl {
    fn default() -> Self {
        Self {
            name: "lm".to_string(),
            model_dims: 0,
            vocab_size: 0,
            softmax_tpl: Box::new(LayerTpl::SharedEmbeddingSoftmax(EmbeddingSoftmaxTpl::default())),
            stacked_transformer_tpl: Box::new(LayerTpl::StackedTransformer(StackedTransformerTpl::default())),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Conv2DTpl {
    pub name: String,
    /// `[kh, kw, in_channels, out_channels]`.
    pub filter_shape: [usize; 4],
    pub filter_stride: [usize; 2],
    pub padding: Padding,
    pub bias: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantization: Quant,
}

impl Default for Conv2DTpl {
    fn default() -> Self {
        Self {
            name: "conv".to_string(),
            filter_shape: [0; 4],
            filter_stride: [1, 1],
            padding: Padding::Same,
            bias: false,
            quantization: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ConvBlockTpl {
    pub name: String,
    pub filter_shape: [usize; 4],
    pub filter_stride: [usize; 2],
    pub padding: Padding,
    pub activation: Activation,
    pub conv_tpl: Box<LayerTpl>,
}

impl Default for ConvBlockTpl {
    fn default() -> Self {
        Self {
            name: "conv_block".to_string(),
            filter_shape: [0; 4],
            filter_stride: [1, 1],
            padding: Padding::Same,
            activation: Activation::Relu,
            conv_tpl: Box::new(LayerTpl::Conv2D(Conv2DTpl::default())),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ChainTpl {
    pub name: String,
    pub layers: Vec<LayerTpl>,
}

impl Default for ChainTpl {
    fn default() -> Self {
        Self { name: "chain".to_string(), layers: Vec::new() }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RepeatTpl {
    pub name: String,
    pub sub_tpl: Box<LayerTpl>,
    pub x_times: usize,
}

impl Default for RepeatTpl {
    fn default() -> Self {
        Self {
            name: "repeat".to_string(),
            sub_tpl: Box::new(LayerTpl::Chain(ChainTpl::default())),
            x_times: 0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LogArgsTpl {
    pub name: String,
    pub message: String,
}

impl Default for LogArgsTpl {
    fn default() -> Self {
        Self { name: "log_args".to_string(), message: String::new() }
    }
}

/// A layer template, tagged in JSON by its `"cls"` field.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "cls")]
pub enum LayerTpl {
    Linear(LinearTpl),
    FeedForward(FeedForwardTpl),
    Activation(ActivationTpl),
    AttentionProjection(AttentionProjectionTpl),
    CombinedQkvProjection(CombinedQkvProjectionTpl),
    OneHeadedAttentionProjection(OneHeadedAttentionProjectionTpl),
    DotProductAttention(DotProductAttentionTpl),
    MultiQueryDotProductAttention(MultiQueryDotProductAttentionTpl),
    TransformerFeedForward(TransformerFeedForwardTpl),
    Transformer(TransformerTpl),
    StackedTransformer(StackedTransformerTpl),
    SharedEmbeddingSoftmax(EmbeddingSoftmaxTpl),
    NClassMajorSharedEmbeddingSoftmax(EmbeddingSoftmaxTpl),
    TransformerLm(TransformerLmTpl),
    Conv2D(Conv2DTpl),
    ConvBlock(ConvBlockTpl),
    Chain(ChainTpl),
    Repeat(RepeatTpl),
    LogArgs(LogArgsTpl),
}

/// The class of a template, without its fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TplKind {
    Linear,
    FeedForward,
    Activation,
    AttentionProjection,
    CombinedQkvProjection,
    OneHeadedAttentionProjection,
    DotProductAttention,
    MultiQueryDotProductAttention,
    TransformerFeedForward,
    Transformer,
    StackedTransformer,
    SharedEmbeddingSoftmax,
    NClassMajorSharedEmbeddingSoftmax,
    TransformerLm,
    Conv2D,
    ConvBlock,
    Chain,
    Repeat,
    LogArgs,
}

const ALL_KINDS: [TplKind; 19] = [
    TplKind::Linear,
    TplKind::FeedForward,
    TplKind::Activation,
    TplKind::AttentionProjection,
    TplKind::CombinedQkvProjection,
    TplKind::OneHeadedAttentionProjection,
    TplKind::DotProductAttention,
    TplKind::MultiQueryDotProductAttention,
    TplKind::TransformerFeedForward,
    TplKind::Transformer,
    TplKind::StackedTransformer,
    TplKind::SharedEmbeddingSoftmax,
    TplKind::NClassMajorSharedEmbeddingSoftmax,
    TplKind::TransformerLm,
    TplKind::Conv2D,
    TplKind::ConvBlock,
    TplKind::Chain,
    TplKind::Repeat,
    TplKind::LogArgs,
];

impl fmt::Display for TplKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl FromStr for TplKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_KINDS
            .iter()
            .copied()
            .find(|k| k.to_string() == s)
            .ok_or_else(|| format!("Unknown layer class '{}'", s))
    }
}

impl LayerTpl {
    pub fn kind(&self) -> TplKind {
        match self {
            LayerTpl::Linear(_) => TplKind::Linear,
            LayerTpl::FeedForward(_) => TplKind::FeedForward,
            LayerTpl::Activation(_) => TplKind::Activation,
            LayerTpl::AttentionProjection(_) => TplKind::AttentionProjection,
            LayerTpl::CombinedQkvProjection(_) => TplKind::CombinedQkvProjection,
            LayerTpl::OneHeadedAttentionProjection(_) => TplKind::OneHeadedAttentionProjection,
            LayerTpl::DotProductAttention(_) => TplKind::DotProductAttention,
            LayerTpl::MultiQueryDotProductAttention(_) => TplKind::MultiQueryDotProductAttention,
            LayerTpl::TransformerFeedForward(_) => TplKind::TransformerFeedForward,
            LayerTpl::Transformer(_) => TplKind::Transformer,
            LayerTpl::StackedTransformer(_) => TplKind::StackedTransformer,
            LayerTpl::SharedEmbeddingSoftmax(_) => TplKind::SharedEmbeddingSoftmax,
            LayerTpl::NClassMajorSharedEmbeddingSoftmax(_) => TplKind::NClassMajorSharedEmbeddingSoftmax,
            LayerTpl::TransformerLm(_) => TplKind::TransformerLm,
            LayerTpl::Conv2D(_) => TplKind::Conv2D,
            LayerTpl::ConvBlock(_) => TplKind::ConvBlock,
            LayerTpl::Chain(_) => TplKind::Chain,
            LayerTpl::Repeat(_) => TplKind::Repeat,
            LayerTpl::LogArgs(_) => TplKind::LogArgs,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            LayerTpl::Linear(t) => &t.name,
            LayerTpl::FeedForward(t) => &t.name,
            LayerTpl::Activation(t) => &t.name,
            LayerTpl::AttentionProjection(t) => &t.name,
            LayerTpl::CombinedQkvProjection(t) => &t.name,
            LayerTpl::OneHeadedAttentionProjection(t) => &t.name,
            LayerTpl::DotProductAttention(t) => &t.name,
            LayerTpl::MultiQueryDotProductAttention(t) => &t.name,
            LayerTpl::TransformerFeedForward(t) => &t.name,
            LayerTpl::Transformer(t) => &t.name,
            LayerTpl::StackedTransformer(t) => &t.name,
            LayerTpl::SharedEmbeddingSoftmax(t) | LayerTpl::NClassMajorSharedEmbeddingSoftmax(t) => &t.name,
            LayerTpl::TransformerLm(t) => &t.name,
            LayerTpl::Conv2D(t) => &t.name,
            LayerTpl::ConvBlock(t) => &t.name,
            LayerTpl::Chain(t) => &t.name,
            LayerTpl::Repeat(t) => &t.name,
            LayerTpl::LogArgs(t) => &t.name,
        }
    }

    pub fn set_name(&mut self, name: &str) {
        let slot = match self {
            LayerTpl::Linear(t) => &mut t.name,
            LayerTpl::FeedForward(t) => &mut t.name,
            LayerTpl::Activation(t) => &mut t.name,
            LayerTpl::AttentionProjection(t) => &mut t.name,
            LayerTpl::CombinedQkvProjection(t) => &mut t.name,
            LayerTpl::OneHeadedAttentionProjection(t) => &mut t.name,
            LayerTpl::DotProductAttention(t) => &mut t.name,
            LayerTpl::MultiQueryDotProductAttention(t) => &mut t.name,
            LayerTpl::TransformerFeedForward(t) => &mut t.name,
            LayerTpl::Transformer(t) => &mut t.name,
            LayerTpl::StackedTransformer(t) => &mut t.name,
            LayerTpl::SharedEmbeddingSoftmax(t) | LayerTpl::NClassMajorSharedEmbeddingSoftmax(t) => &mut t.name,
            LayerTpl::TransformerLm(t) => &mut t.name,
            LayerTpl::Conv2D(t) => &mut t.name,
            LayerTpl::ConvBlock(t) => &mut t.name,
            LayerTpl::Chain(t) => &mut t.name,
            LayerTpl::Repeat(t) => &mut t.name,
            LayerTpl::LogArgs(t) => &mut t.name,
        };
        *slot = name.to_string();
    }

    /// The quantization slot of templates whose layer holds weights directly.
    pub fn quantization_mut(&mut self) -> Option<&mut Quant> {
        match self {
            LayerTpl::Linear(t) => Some(&mut t.quantization),
            LayerTpl::AttentionProjection(t) => Some(&mut t.quantization),
            LayerTpl::CombinedQkvProjection(t) => Some(&mut t.quantization),
            LayerTpl::OneHeadedAttentionProjection(t) => Some(&mut t.quantization),
            LayerTpl::SharedEmbeddingSoftmax(t) | LayerTpl::NClassMajorSharedEmbeddingSoftmax(t) => {
                Some(&mut t.quantization)
            }
            LayerTpl::Conv2D(t) => Some(&mut t.quantization),
            _ => None,
        }
    }

    pub fn quantization(&self) -> Option<&QuantizationParams> {
        match self {
            LayerTpl::Linear(t) => t.quantization.as_ref(),
            LayerTpl::AttentionProjection(t) => t.quantization.as_ref(),
            LayerTpl::CombinedQkvProjection(t) => t.quantization.as_ref(),
            LayerTpl::OneHeadedAttentionProjection(t) => t.quantization.as_ref(),
            LayerTpl::SharedEmbeddingSoftmax(t) | LayerTpl::NClassMajorSharedEmbeddingSoftmax(t) => {
                t.quantization.as_ref()
            }
            LayerTpl::Conv2D(t) => t.quantization.as_ref(),
            _ => None,
        }
    }

    pub fn children(&self) -> Vec<&LayerTpl> {
        match self {
            LayerTpl::FeedForward(t) => vec![&*t.linear_tpl],
            LayerTpl::DotProductAttention(t) => vec![&*t.proj_tpl, &*t.combined_qkv_proj_tpl],
            LayerTpl::MultiQueryDotProductAttention(t) => vec![&*t.proj_tpl, &*t.headless_proj_tpl],
            LayerTpl::TransformerFeedForward(t) => vec![&*t.fflayer_tpl],
            LayerTpl::Transformer(t) => vec![&*t.tr_atten_tpl, &*t.tr_fflayer_tpl],
            LayerTpl::StackedTransformer(t) => vec![&*t.transformer_layer_params_tpl],
            LayerTpl::TransformerLm(t) => vec![&*t.softmax_tpl, &*t.stacked_transformer_tpl],
            LayerTpl::ConvBlock(t) => vec![&*t.conv_tpl],
            LayerTpl::Chain(t) => t.layers.iter().collect(),
            LayerTpl::Repeat(t) => vec![&*t.sub_tpl],
            _ => Vec::new(),
        }
    }

    pub fn children_mut(&mut self) -> Vec<&mut LayerTpl> {
        match self {
            LayerTpl::FeedForward(t) => vec![&mut *t.linear_tpl],
            LayerTpl::DotProductAttention(t) => vec![&mut *t.proj_tpl, &mut *t.combined_qkv_proj_tpl],
            LayerTpl::MultiQueryDotProductAttention(t) => vec![&mut *t.proj_tpl, &mut *t.headless_proj_tpl],
            LayerTpl::TransformerFeedForward(t) => vec![&mut *t.fflayer_tpl],
            LayerTpl::Transformer(t) => vec![&mut *t.tr_atten_tpl, &mut *t.tr_fflayer_tpl],
            LayerTpl::StackedTransformer(t) => vec![&mut *t.transformer_layer_params_tpl],
            LayerTpl::TransformerLm(t) => vec![&mut *t.softmax_tpl, &mut *t.stacked_transformer_tpl],
            LayerTpl::ConvBlock(t) => vec![&mut *t.conv_tpl],
            LayerTpl::Chain(t) => t.layers.iter_mut().collect(),
            LayerTpl::Repeat(t) => vec![&mut *t.sub_tpl],
            _ => Vec::new(),
        }
    }

    /// Pre-order walk over this template and every descendant.
    pub fn visit_mut<E>(&mut self, f: &mut dyn FnMut(&mut LayerTpl) -> Result<(), E>) -> Result<(), E> {
        f(self)?;
        for child in self.children_mut() {
            child.visit_mut(f)?;
        }
        Ok(())
    }

    /// Applies `f` to every template of class `kind` in the tree, this one
    /// included. Children are visited after `f` has rewritten their parent.
    pub fn for_each_target_mut<E>(
        &mut self,
        kind: TplKind,
        f: &mut dyn FnMut(&mut LayerTpl) -> Result<(), E>,
    ) -> Result<(), E> {
        self.visit_mut(&mut |tpl: &mut LayerTpl| if tpl.kind() == kind { f(tpl) } else { Ok(()) })
    }

    /// All templates of class `kind` in the tree, in pre-order.
    pub fn find_target_tpl(&self, kind: TplKind) -> Vec<&LayerTpl> {
        let mut found = Vec::new();
        let mut stack = vec![self];
        while let Some(tpl) = stack.pop() {
            if tpl.kind() == kind {
                found.push(tpl);
            }
            stack.extend(tpl.children().into_iter().rev());
        }
        found
    }

    pub fn build(&self, ctx: &mut BuildContext) -> Result<Box<dyn Layer>, Box<dyn Error>> {
        debug!("Building {} '{}'", self.kind(), self.name());
        let layer: Box<dyn Layer> = match self {
            LayerTpl::Linear(t) => Box::new(build_linear(t, ctx)?),
            LayerTpl::FeedForward(t) => Box::new(build_feed_forward(t, ctx)?),
            LayerTpl::Activation(t) => Box::new(ActivationLayer::new(&t.name, t.activation)),
            LayerTpl::AttentionProjection(t) => Box::new(build_attention_projection(t, ctx)?),
            LayerTpl::CombinedQkvProjection(t) => Box::new(build_combined_qkv(t, ctx)?),
            LayerTpl::OneHeadedAttentionProjection(t) => Box::new(build_one_headed(t, ctx)?),
            LayerTpl::DotProductAttention(t) => Box::new(build_dot_product_attention(t, ctx)?),
            LayerTpl::MultiQueryDotProductAttention(t) => Box::new(build_multi_query_attention(t, ctx)?),
            LayerTpl::TransformerFeedForward(t) => Box::new(build_transformer_feed_forward(t, ctx)?),
            LayerTpl::Transformer(t) => Box::new(build_transformer(t, ctx)?),
            LayerTpl::StackedTransformer(t) => Box::new(build_stacked_transformer(t, ctx)?),
            LayerTpl::SharedEmbeddingSoftmax(t) => Box::new(build_softmax(t, EmbeddingLayout::DimMajor, ctx)?),
            LayerTpl::NClassMajorSharedEmbeddingSoftmax(t) => {
                Box::new(build_softmax(t, EmbeddingLayout::ClassMajor, ctx)?)
            }
            LayerTpl::TransformerLm(t) => Box::new(build_transformer_lm(t, ctx)?),
            LayerTpl::Conv2D(t) => Box::new(build_conv(t, ctx)?),
            LayerTpl::ConvBlock(t) => Box::new(build_conv_block(t, ctx)?),
            LayerTpl::Chain(t) => {
                let layers = t.layers.iter().map(|l| l.build(ctx)).collect::<Result<Vec<_>, _>>()?;
                Box::new(Chain::new(&t.name, layers))
            }
            LayerTpl::Repeat(t) => {
                let sub = (0..t.x_times).map(|_| t.sub_tpl.build(ctx)).collect::<Result<Vec<_>, _>>()?;
                Box::new(Repeat::new(&t.name, sub))
            }
            LayerTpl::LogArgs(t) => Box::new(LogArgs::new(&t.name, &t.message)),
        };
        Ok(layer)
    }
}

/// Randomness for weight init. The same seed builds the same weights.
#[derive(Debug)]
pub struct BuildContext {
    rng: StdRng,
}

impl BuildContext {
    pub fn new(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }
}

fn wrong_child(owner: &str, field: &str, expected: &str, got: &LayerTpl) -> Box<dyn Error> {
    format!("{}: {} must be a {} template, got {}", owner, field, expected, got.kind()).into()
}

fn head_dims(owner: &str, input_dim: usize, num_heads: usize, dim_per_head: usize) -> Result<AttentionDims, Box<dyn Error>> {
    if num_heads == 0 {
        return Err(format!("{}: num_heads must be positive", owner).into());
    }
    let dim_per_head = if dim_per_head == 0 {
        if input_dim % num_heads != 0 {
            return Err(format!("{}: input_dim {} is not divisible by num_heads {}", owner, input_dim, num_heads).into());
        }
        input_dim / num_heads
    } else {
        dim_per_head
    };
    let dims = AttentionDims { hidden_dim: input_dim, num_heads, dim_per_head };
    dims.validate()?;
    Ok(dims)
}

fn build_linear(t: &LinearTpl, ctx: &mut BuildContext) -> Result<Linear, Box<dyn Error>> {
    Linear::new(&t.name, t.input_dims, t.output_dims, t.quantization.clone(), t.rank, &mut ctx.rng)
}

fn build_feed_forward(t: &FeedForwardTpl, ctx: &mut BuildContext) -> Result<FeedForward, Box<dyn Error>> {
    let mut linear_tpl = match &*t.linear_tpl {
        LayerTpl::Linear(l) => l.clone(),
        other => return Err(wrong_child(&t.name, "linear_tpl", "Linear", other)),
    };
    linear_tpl.input_dims = t.input_dims;
    linear_tpl.output_dims = t.output_dims;
    let linear = build_linear(&linear_tpl, ctx)?;
    Ok(FeedForward::new(&t.name, linear, t.has_bias, t.activation))
}

fn build_attention_projection(
    t: &AttentionProjectionTpl,
    ctx: &mut BuildContext,
) -> Result<AttentionProjection, Box<dyn Error>> {
    let dims = head_dims(&t.name, t.input_dim, t.num_heads, t.dim_per_head)?;
    AttentionProjection::new(&t.name, dims, t.is_output_projection, t.use_bias, t.quantization.clone(), &mut ctx.rng)
}

fn build_combined_qkv(t: &CombinedQkvProjectionTpl, ctx: &mut BuildContext) -> Result<CombinedQkvProjection, Box<dyn Error>> {
    let dims = head_dims(&t.name, t.input_dim, t.num_heads, t.dim_per_head)?;
    CombinedQkvProjection::new(&t.name, dims, t.use_bias, t.quantization.clone(), &mut ctx.rng)
}

fn build_one_headed(
    t: &OneHeadedAttentionProjectionTpl,
    ctx: &mut BuildContext,
) -> Result<OneHeadedAttentionProjection, Box<dyn Error>> {
    OneHeadedAttentionProjection::new(&t.name, t.input_dim, t.output_dim, t.use_bias, t.quantization.clone(), &mut ctx.rng)
}

// Instantiates `proj_tpl` with the given role.
fn projection_from(
    owner: &str,
    proj_tpl: &LayerTpl,
    name: &str,
    dims: AttentionDims,
    is_output_projection: bool,
    ctx: &mut BuildContext,
) -> Result<AttentionProjection, Box<dyn Error>> {
    let mut p = match proj_tpl {
        LayerTpl::AttentionProjection(p) => p.clone(),
        other => return Err(wrong_child(owner, "proj_tpl", "AttentionProjection", other)),
    };
    p.name = name.to_string();
    p.input_dim = dims.hidden_dim;
    p.num_heads = dims.num_heads;
    p.dim_per_head = dims.dim_per_head;
    p.is_output_projection = is_output_projection;
    build_attention_projection(&p, ctx)
}

fn build_dot_product_attention(
    t: &DotProductAttentionTpl,
    ctx: &mut BuildContext,
) -> Result<DotProductAttention, Box<dyn Error>> {
    let dims = head_dims(&t.name, t.input_dim, t.num_heads, t.dim_per_head)?;
    let qkv = if t.combine_qkv {
        let mut c = match &*t.combined_qkv_proj_tpl {
            LayerTpl::CombinedQkvProjection(c) => c.clone(),
            other => return Err(wrong_child(&t.name, "combined_qkv_proj_tpl", "CombinedQkvProjection", other)),
        };
        c.input_dim = dims.hidden_dim;
        c.num_heads = dims.num_heads;
        c.dim_per_head = dims.dim_per_head;
        QkvProjections::Combined(build_combined_qkv(&c, ctx)?)
    } else {
        QkvProjections::Separate {
            query: projection_from(&t.name, &t.proj_tpl, "query", dims, false, ctx)?,
            key: projection_from(&t.name, &t.proj_tpl, "key", dims, false, ctx)?,
            value: projection_from(&t.name, &t.proj_tpl, "value", dims, false, ctx)?,
        }
    };
    let post = projection_from(&t.name, &t.proj_tpl, "post", dims, true, ctx)?;
    DotProductAttention::new(&t.name, dims, t.causal, qkv, post)
}

fn build_multi_query_attention(
    t: &MultiQueryDotProductAttentionTpl,
    ctx: &mut BuildContext,
) -> Result<MultiQueryDotProductAttention, Box<dyn Error>> {
    let dims = head_dims(&t.name, t.input_dim, t.num_heads, t.dim_per_head)?;
    let headless = match &*t.headless_proj_tpl {
        LayerTpl::OneHeadedAttentionProjection(h) => h,
        other => return Err(wrong_child(&t.name, "headless_proj_tpl", "OneHeadedAttentionProjection", other)),
    };
    let kv_tpl = |name: &str, ctx: &mut BuildContext| {
        let mut h = headless.clone();
        h.name = name.to_string();
        h.input_dim = dims.hidden_dim;
        h.output_dim = dims.dim_per_head;
        build_one_headed(&h, ctx)
    };
    let query = projection_from(&t.name, &t.proj_tpl, "query", dims, false, ctx)?;
    let key = kv_tpl("key", ctx)?;
    let value = kv_tpl("value", ctx)?;
    let post = projection_from(&t.name, &t.proj_tpl, "post", dims, true, ctx)?;
    MultiQueryDotProductAttention::new(&t.name, dims, t.causal, query, key, value, post)
}

fn build_transformer_feed_forward(
    t: &TransformerFeedForwardTpl,
    ctx: &mut BuildContext,
) -> Result<TransformerFeedForward, Box<dyn Error>> {
    let ff = match &*t.fflayer_tpl {
        LayerTpl::FeedForward(f) => f,
        other => return Err(wrong_child(&t.name, "fflayer_tpl", "FeedForward", other)),
    };
    let mut layer1 = ff.clone();
    layer1.name = "ffn_layer1".to_string();
    layer1.input_dims = t.input_dims;
    layer1.output_dims = t.hidden_dims;
    layer1.has_bias = t.has_bias;
    layer1.activation = t.activation;

    let mut layer2 = ff.clone();
    layer2.name = "ffn_layer2".to_string();
    layer2.input_dims = t.hidden_dims;
    layer2.output_dims = t.input_dims;
    layer2.has_bias = t.has_bias;
    layer2.activation = Activation::Identity;

    TransformerFeedForward::new(&t.name, build_feed_forward(&layer1, ctx)?, build_feed_forward(&layer2, ctx)?)
}

fn build_transformer(t: &TransformerTpl, ctx: &mut BuildContext) -> Result<Transformer, Box<dyn Error>> {
    let attention = match &*t.tr_atten_tpl {
        LayerTpl::DotProductAttention(a) => {
            let mut a = a.clone();
            a.input_dim = t.input_dims;
            a.num_heads = t.num_heads;
            a.dim_per_head = t.dim_per_head;
            a.causal = t.mask_self_attention;
            SelfAttention::DotProduct(build_dot_product_attention(&a, ctx)?)
        }
        LayerTpl::MultiQueryDotProductAttention(a) => {
            let mut a = a.clone();
            a.input_dim = t.input_dims;
            a.num_heads = t.num_heads;
            a.dim_per_head = t.dim_per_head;
            a.causal = t.mask_self_attention;
            SelfAttention::MultiQuery(build_multi_query_attention(&a, ctx)?)
        }
        other => return Err(wrong_child(&t.name, "tr_atten_tpl", "DotProductAttention or MultiQueryDotProductAttention", other)),
    };
    let mut ff = match &*t.tr_fflayer_tpl {
        LayerTpl::TransformerFeedForward(f) => f.clone(),
        other => return Err(wrong_child(&t.name, "tr_fflayer_tpl", "TransformerFeedForward", other)),
    };
    ff.input_dims = t.input_dims;
    ff.hidden_dims = t.hidden_dims;
    Transformer::new(&t.name, t.input_dims, attention, build_transformer_feed_forward(&ff, ctx)?)
}

fn build_stacked_transformer(t: &StackedTransformerTpl, ctx: &mut BuildContext) -> Result<StackedTransformer, Box<dyn Error>> {
    let base = match &*t.transformer_layer_params_tpl {
        LayerTpl::Transformer(tr) => tr,
        other => return Err(wrong_child(&t.name, "transformer_layer_params_tpl", "Transformer", other)),
    };
    let mut layers = Vec::with_capacity(t.num_layers);
    for i in 0..t.num_layers {
        let mut tr = base.clone();
        tr.name = format!("x_layers_{}", i);
        tr.input_dims = t.model_dims;
        tr.hidden_dims = t.hidden_dims;
        tr.num_heads = t.num_heads;
        tr.dim_per_head = t.dim_per_head;
        tr.mask_self_attention = t.mask_self_attention;
        layers.push(build_transformer(&tr, ctx)?);
    }
    Ok(StackedTransformer::new(&t.name, layers))
}

fn build_softmax(
    t: &EmbeddingSoftmaxTpl,
    layout: EmbeddingLayout,
    ctx: &mut BuildContext,
) -> Result<SharedEmbeddingSoftmax, Box<dyn Error>> {
    SharedEmbeddingSoftmax::new(
        &t.name,
        layout,
        t.input_dims,
        t.num_classes,
        t.scale_sqrt_depth,
        t.use_bias,
        t.quantization.clone(),
        &mut ctx.rng,
    )
}

fn build_transformer_lm(t: &TransformerLmTpl, ctx: &mut BuildContext) -> Result<TransformerLm, Box<dyn Error>> {
    let (mut softmax_tpl, layout) = match &*t.softmax_tpl {
        LayerTpl::SharedEmbeddingSoftmax(s) => (s.clone(), EmbeddingLayout::DimMajor),
        LayerTpl::NClassMajorSharedEmbeddingSoftmax(s) => (s.clone(), EmbeddingLayout::ClassMajor),
        other => return Err(wrong_child(&t.name, "softmax_tpl", "SharedEmbeddingSoftmax", other)),
    };
    softmax_tpl.input_dims = t.model_dims;
    softmax_tpl.num_classes = t.vocab_size;
    let mut stack_tpl = match &*t.stacked_transformer_tpl {
        LayerTpl::StackedTransformer(s) => s.clone(),
        other => return Err(wrong_child(&t.name, "stacked_transformer_tpl", "StackedTransformer", other)),
    };
    stack_tpl.model_dims = t.model_dims;
    let softmax = build_softmax(&softmax_tpl, layout, ctx)?;
    let stack = build_stacked_transformer(&stack_tpl, ctx)?;
    TransformerLm::new(&t.name, softmax, stack)
}

fn build_conv(t: &Conv2DTpl, ctx: &mut BuildContext) -> Result<Conv2D, Box<dyn Error>> {
    Conv2D::new(&t.name, t.filter_shape, t.filter_stride, t.padding, t.bias, t.quantization.clone(), &mut ctx.rng)
}

fn build_conv_block(t: &ConvBlockTpl, ctx: &mut BuildContext) -> Result<ConvBlock, Box<dyn Error>> {
    let mut conv = match &*t.conv_tpl {
        LayerTpl::Conv2D(c) => c.clone(),
        other => return Err(wrong_child(&t.name, "conv_tpl", "Conv2D", other)),
    };
    conv.filter_shape = t.filter_shape;
    conv.filter_stride = t.filter_stride;
    conv.padding = t.padding;
    Ok(ConvBlock::new(&t.name, build_conv(&conv, ctx)?, t.activation))
}

/// A training task: the model template plus the tasks whose checkpoints
/// initialize it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskConfig {
    pub model: LayerTpl,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub init_from_checkpoint_rules: BTreeMap<String, InitFromCheckpointRule>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InitFromCheckpointRule {
    pub task: TaskConfig,
}

impl TaskConfig {
    pub fn new(model: LayerTpl) -> Self {
        Self { model, init_from_checkpoint_rules: BTreeMap::new() }
    }

    pub fn load(path: &str) -> Result<Self, Box<dyn Error>> {
        load_json(path)
    }
}
