// src/layers/mod.rs

pub mod attentions;
pub mod convolutions;
pub mod embedding_softmax;
pub mod linears;
pub mod operations;
pub mod transformers;

pub use attentions::{
    AttentionDims, AttentionProjection, CombinedQkvProjection, DotProductAttention, MultiQueryDotProductAttention,
    OneHeadedAttentionProjection, QkvProjections,
};
pub use convolutions::{Conv2D, ConvBlock, Padding};
pub use embedding_softmax::{EmbeddingLayout, SharedEmbeddingSoftmax};
pub use linears::{Bias, FeedForward, Linear, WeightStore};
pub use operations::{quantize, quantized_einsum, PackedInt4, QuantError, QuantizedTensor};
pub use transformers::{SelfAttention, StackedTransformer, Transformer, TransformerFeedForward, TransformerLm};
