// src/quantize.rs
//! Rewrites float model templates into quantized ones.
//!
//! Every rewrite sets `QuantizationParams` on a child template. A child of the
//! expected class keeps its other fields (name, bias flags); any other child is
//! replaced by a default one of the expected class whose dims are filled in by
//! its parent at build time. Nothing here touches live layers.

use crate::config::{
    ActQuantizationParams, QuantDtype, QuantizationMode, QuantizationParams, QuantizationType,
    WeightQuantizationParams,
};
use crate::templates::{
    AttentionProjectionTpl, CombinedQkvProjectionTpl, Conv2DTpl, DotProductAttentionTpl, LayerTpl, LinearTpl,
    MultiQueryDotProductAttentionTpl, OneHeadedAttentionProjectionTpl, TaskConfig, TplKind, TransformerFeedForwardTpl,
    TransformerLmTpl, TransformerTpl,
};
use log::{debug, info, warn};
use std::convert::Infallible;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum RewriteError {
    WrongClass { field: String, expected: &'static str, got: TplKind },
    InvalidParams(String),
    UnsupportedBits(u8),
}

impl fmt::Display for RewriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RewriteError::WrongClass { field, expected, got } => {
                write!(f, "{} is {} but has to be {}", field, got, expected)
            }
            RewriteError::InvalidParams(msg) => write!(f, "Invalid quantization params: {}", msg),
            RewriteError::UnsupportedBits(bits) => write!(f, "num_bits must be one of 2, 4, 8, got {}", bits),
        }
    }
}

impl std::error::Error for RewriteError {}

impl From<String> for RewriteError {
    fn from(msg: String) -> Self {
        RewriteError::InvalidParams(msg)
    }
}

fn params(
    quantization_type: QuantizationType,
    mode: QuantizationMode,
    weight_params: &WeightQuantizationParams,
    act_params: Option<&ActQuantizationParams>,
) -> Option<QuantizationParams> {
    Some(QuantizationParams {
        quantization_type,
        mode,
        weight_params: weight_params.clone(),
        act_params: act_params.cloned(),
    })
}

// The existing child when it already has the class of `fresh`, else `fresh`,
// carrying `quantization` either way.
fn requantized(existing: &LayerTpl, fresh: LayerTpl, quantization: &Option<QuantizationParams>) -> Box<LayerTpl> {
    let mut tpl = if existing.kind() == fresh.kind() { existing.clone() } else { fresh };
    if let Some(q) = tpl.quantization_mut() {
        *q = quantization.clone();
    }
    Box::new(tpl)
}

/// Options for [`set_transformer_quantization`] and [`for_transformer`].
#[derive(Debug, Clone, PartialEq)]
pub struct TransformerQuantizationOptions {
    pub quantization_type: QuantizationType,
    pub mode: QuantizationMode,
    pub num_bits: u8,
    /// Leave attention alone and quantize only feed-forward linears.
    pub linear_only: bool,
    pub use_symmetric: bool,
    pub rank: Option<usize>,
    pub weight_quant_only: bool,
    pub quantize_embedding_softmax: bool,
    pub transposed_embedding_softmax: bool,
    pub dtype: QuantDtype,
    pub block_size: usize,
    pub use_int4_packed_weights: bool,
    pub int4_packed_weights_container_dtype: QuantDtype,
    pub quantize_init_from_checkpoint_rules_task: bool,
}

impl Default for TransformerQuantizationOptions {
    fn default() -> Self {
        Self {
            quantization_type: QuantizationType::Ptq,
            mode: QuantizationMode::Inference,
            num_bits: 8,
            linear_only: false,
            use_symmetric: true,
            rank: None,
            weight_quant_only: true,
            quantize_embedding_softmax: false,
            transposed_embedding_softmax: false,
            dtype: QuantDtype::Int8,
            block_size: 0,
            use_int4_packed_weights: true,
            int4_packed_weights_container_dtype: QuantDtype::Int32,
            quantize_init_from_checkpoint_rules_task: false,
        }
    }
}

impl TransformerQuantizationOptions {
    /// Fake quantization in training mode.
    pub fn for_training() -> Self {
        Self { quantization_type: QuantizationType::Fq, mode: QuantizationMode::Training, ..Self::default() }
    }

    pub fn weight_params(&self) -> WeightQuantizationParams {
        WeightQuantizationParams {
            precision: self.num_bits,
            use_symmetric: self.use_symmetric,
            dtype: self.dtype,
            block_size: self.block_size,
            use_int4_packed_weights: self.use_int4_packed_weights,
            int4_packed_weights_container_dtype: self.int4_packed_weights_container_dtype,
            ..WeightQuantizationParams::default()
        }
    }

    pub fn act_params(&self) -> Option<ActQuantizationParams> {
        if self.weight_quant_only {
            None
        } else {
            Some(ActQuantizationParams::with_precision(self.num_bits))
        }
    }
}

/// Options for [`set_diffusion_quantization`] and [`for_diffusion`].
#[derive(Debug, Clone, PartialEq)]
pub struct DiffusionQuantizationOptions {
    pub quantization_type: QuantizationType,
    pub mode: QuantizationMode,
    pub num_bits: u8,
    pub use_symmetric: bool,
    pub weight_quant_only: bool,
    pub dtype: QuantDtype,
    pub quantize_init_from_checkpoint_rules_task: bool,
}

impl Default for DiffusionQuantizationOptions {
    fn default() -> Self {
        Self {
            quantization_type: QuantizationType::Ptq,
            mode: QuantizationMode::Inference,
            num_bits: 8,
            use_symmetric: true,
            weight_quant_only: true,
            dtype: QuantDtype::Int8,
            quantize_init_from_checkpoint_rules_task: false,
        }
    }
}

impl DiffusionQuantizationOptions {
    pub fn for_training() -> Self {
        Self { quantization_type: QuantizationType::Fq, mode: QuantizationMode::Training, ..Self::default() }
    }

    pub fn weight_params(&self) -> WeightQuantizationParams {
        WeightQuantizationParams {
            precision: self.num_bits,
            use_symmetric: self.use_symmetric,
            dtype: self.dtype,
            ..WeightQuantizationParams::default()
        }
    }

    pub fn act_params(&self) -> Option<ActQuantizationParams> {
        if self.weight_quant_only {
            None
        } else {
            Some(ActQuantizationParams::with_precision(self.num_bits))
        }
    }
}

/// Quantizes the attention (unless `linear_only`) and feed-forward weights of
/// one transformer template.
pub fn quantize_transformer_layer_weights(
    tr_tpl: &mut TransformerTpl,
    quantization_type: QuantizationType,
    mode: QuantizationMode,
    weight_params: &WeightQuantizationParams,
    act_params: Option<&ActQuantizationParams>,
    linear_only: bool,
    rank: Option<usize>,
) -> Result<(), RewriteError> {
    debug!("Quantizing transformer '{}' (linear_only={}, rank={:?})", tr_tpl.name, linear_only, rank);
    if !linear_only {
        quantize_attention_layer_weights(tr_tpl, quantization_type, mode, weight_params, act_params)?;
    }
    match &mut *tr_tpl.tr_fflayer_tpl {
        LayerTpl::TransformerFeedForward(ff) => {
            quantize_transformer_feed_forward_layer_weights(ff, quantization_type, mode, weight_params, act_params, rank)
        }
        other => Err(RewriteError::WrongClass {
            field: "tr_tpl.tr_fflayer_tpl".to_string(),
            expected: "TransformerFeedForward",
            got: other.kind(),
        }),
    }
}

pub fn quantize_attention_layer_weights(
    tr_tpl: &mut TransformerTpl,
    quantization_type: QuantizationType,
    mode: QuantizationMode,
    weight_params: &WeightQuantizationParams,
    act_params: Option<&ActQuantizationParams>,
) -> Result<(), RewriteError> {
    match &mut *tr_tpl.tr_atten_tpl {
        LayerTpl::DotProductAttention(attn) => {
            quantize_dot_product_attention_layer_weights(attn, quantization_type, mode, weight_params, act_params);
            Ok(())
        }
        LayerTpl::MultiQueryDotProductAttention(attn) => {
            quantize_mq_dot_product_attention_layer_weights(attn, quantization_type, mode, weight_params, act_params);
            Ok(())
        }
        other => Err(RewriteError::WrongClass {
            field: "tr_tpl.tr_atten_tpl".to_string(),
            expected: "DotProductAttention or MultiQueryDotProductAttention",
            got: other.kind(),
        }),
    }
}

pub fn quantize_dot_product_attention_layer_weights(
    attn_tpl: &mut DotProductAttentionTpl,
    quantization_type: QuantizationType,
    mode: QuantizationMode,
    weight_params: &WeightQuantizationParams,
    act_params: Option<&ActQuantizationParams>,
) {
    let quantization = params(quantization_type, mode, weight_params, act_params);
    attn_tpl.proj_tpl = requantized(
        &attn_tpl.proj_tpl,
        LayerTpl::AttentionProjection(AttentionProjectionTpl::default()),
        &quantization,
    );
    attn_tpl.combined_qkv_proj_tpl = requantized(
        &attn_tpl.combined_qkv_proj_tpl,
        LayerTpl::CombinedQkvProjection(CombinedQkvProjectionTpl::default()),
        &quantization,
    );
    debug!("Quantized projections of DotProductAttention '{}'", attn_tpl.name);
}

pub fn quantize_mq_dot_product_attention_layer_weights(
    attn_tpl: &mut MultiQueryDotProductAttentionTpl,
    quantization_type: QuantizationType,
    mode: QuantizationMode,
    weight_params: &WeightQuantizationParams,
    act_params: Option<&ActQuantizationParams>,
) {
    let quantization = params(quantization_type, mode, weight_params, act_params);
    attn_tpl.proj_tpl = requantized(
        &attn_tpl.proj_tpl,
        LayerTpl::AttentionProjection(AttentionProjectionTpl::default()),
        &quantization,
    );
    attn_tpl.headless_proj_tpl = requantized(
        &attn_tpl.headless_proj_tpl,
        LayerTpl::OneHeadedAttentionProjection(OneHeadedAttentionProjectionTpl::default()),
        &quantization,
    );
    debug!("Quantized projections of MultiQueryDotProductAttention '{}'", attn_tpl.name);
}

pub fn quantize_transformer_feed_forward_layer_weights(
    tr_fflayer_tpl: &mut TransformerFeedForwardTpl,
    quantization_type: QuantizationType,
    mode: QuantizationMode,
    weight_params: &WeightQuantizationParams,
    act_params: Option<&ActQuantizationParams>,
    rank: Option<usize>,
) -> Result<(), RewriteError> {
    let fflayer = match &mut *tr_fflayer_tpl.fflayer_tpl {
        LayerTpl::FeedForward(ff) => ff,
        other => {
            return Err(RewriteError::WrongClass {
                field: "tr_fflayer_tpl.fflayer_tpl".to_string(),
                expected: "FeedForward",
                got: other.kind(),
            })
        }
    };
    let mut linear = match &*fflayer.linear_tpl {
        LayerTpl::Linear(l) => l.clone(),
        _ => LinearTpl::default(),
    };
    linear.quantization = params(quantization_type, mode, weight_params, act_params);
    linear.rank = rank;
    fflayer.linear_tpl = Box::new(LayerTpl::Linear(linear));
    debug!("Quantized linear of TransformerFeedForward '{}'", tr_fflayer_tpl.name);
    Ok(())
}

/// Replaces the softmax of `lm_tpl` with a quantized shared embedding softmax,
/// class-major when `transposed`. Other fields are copied over.
pub fn quantize_embedding_softmax_layer_weights(
    lm_tpl: &mut TransformerLmTpl,
    quantization_type: QuantizationType,
    mode: QuantizationMode,
    weight_params: &WeightQuantizationParams,
    transposed: bool,
) -> Result<(), RewriteError> {
    let mut softmax = match &*lm_tpl.softmax_tpl {
        LayerTpl::SharedEmbeddingSoftmax(s) | LayerTpl::NClassMajorSharedEmbeddingSoftmax(s) => s.clone(),
        other => {
            return Err(RewriteError::WrongClass {
                field: "lm_tpl.softmax_tpl".to_string(),
                expected: "SharedEmbeddingSoftmax",
                got: other.kind(),
            })
        }
    };
    softmax.quantization = params(quantization_type, mode, weight_params, None);
    lm_tpl.softmax_tpl = Box::new(if transposed {
        LayerTpl::NClassMajorSharedEmbeddingSoftmax(softmax)
    } else {
        LayerTpl::SharedEmbeddingSoftmax(softmax)
    });
    debug!("Quantized embedding softmax of '{}' (transposed={})", lm_tpl.name, transposed);
    Ok(())
}

/// Quantizes every transformer in `config`, and optionally the embedding
/// softmax of every `TransformerLm`.
pub fn set_transformer_quantization(
    config: &mut LayerTpl,
    options: &TransformerQuantizationOptions,
) -> Result<(), RewriteError> {
    let weight_params = options.weight_params();
    weight_params.validate()?;
    let act_params = options.act_params();
    if let Some(act) = &act_params {
        act.validate()?;
    }

    let mut transformers = 0;
    config.for_each_target_mut(TplKind::Transformer, &mut |tpl| match tpl {
        LayerTpl::Transformer(tr) => {
            transformers += 1;
            quantize_transformer_layer_weights(
                tr,
                options.quantization_type,
                options.mode,
                &weight_params,
                act_params.as_ref(),
                options.linear_only,
                options.rank,
            )
        }
        _ => Ok(()),
    })?;

    let mut softmaxes = 0;
    if options.transposed_embedding_softmax && !options.quantize_embedding_softmax {
        warn!("transposed_embedding_softmax has no effect without quantize_embedding_softmax");
    }
    if options.quantize_embedding_softmax {
        config.for_each_target_mut(TplKind::TransformerLm, &mut |tpl| match tpl {
            LayerTpl::TransformerLm(lm) => {
                softmaxes += 1;
                quantize_embedding_softmax_layer_weights(
                    lm,
                    options.quantization_type,
                    options.mode,
                    &weight_params,
                    options.transposed_embedding_softmax,
                )
            }
            _ => Ok(()),
        })?;
    }
    info!(
        "Set {:?}/{:?} {}-bit quantization on {} transformer(s) and {} embedding softmax(es)",
        options.quantization_type, options.mode, options.num_bits, transformers, softmaxes
    );
    Ok(())
}

fn conv_tpl_mut(tpl: &mut LayerTpl) -> Option<&mut Box<LayerTpl>> {
    match tpl {
        LayerTpl::ConvBlock(block) => Some(&mut block.conv_tpl),
        _ => None,
    }
}

/// Gives every `target` template that owns a `conv_tpl` a quantized `Conv2D`.
/// Targets without one are left as they are.
pub fn set_diffusion_quantization(
    config: &mut LayerTpl,
    target: TplKind,
    options: &DiffusionQuantizationOptions,
) -> Result<(), RewriteError> {
    let weight_params = options.weight_params();
    weight_params.validate()?;
    let quantization = params(options.quantization_type, options.mode, &weight_params, options.act_params().as_ref());

    let mut rewritten = 0;
    config.for_each_target_mut::<RewriteError>(target, &mut |tpl| {
        let name = tpl.name().to_string();
        match conv_tpl_mut(tpl) {
            Some(conv) => {
                *conv = requantized(conv, LayerTpl::Conv2D(Conv2DTpl::default()), &quantization);
                rewritten += 1;
                debug!("Quantized conv_tpl of {} '{}'", target, name);
            }
            None => debug!("{} '{}' has no conv_tpl; skipped", target, name),
        }
        Ok(())
    })?;
    info!("Set diffusion quantization on {} {} template(s)", rewritten, target);
    Ok(())
}

/// Switches every quantized template to INFERENCE, keeping all other params.
pub fn set_inference_mode(config: &mut LayerTpl) {
    let mut switched = 0;
    let visited = config.visit_mut::<Infallible>(&mut |tpl| {
        if let Some(Some(q)) = tpl.quantization_mut() {
            q.mode = QuantizationMode::Inference;
            switched += 1;
        }
        Ok(())
    });
    if let Err(never) = visited {
        match never {}
    }
    info!("Switched {} template(s) to INFERENCE", switched);
}

/// A reusable rewrite of a whole training task.
pub trait TaskModifier {
    fn apply(&self, task: &mut TaskConfig) -> Result<(), RewriteError>;
}

fn check_bits(num_bits: u8) -> Result<(), RewriteError> {
    if matches!(num_bits, 2 | 4 | 8) {
        Ok(())
    } else {
        Err(RewriteError::UnsupportedBits(num_bits))
    }
}

// The task's model, plus the models of its init-from-checkpoint tasks when asked.
fn task_models(task: &mut TaskConfig, include_rules: bool) -> Vec<&mut LayerTpl> {
    let mut models = vec![&mut task.model];
    if include_rules {
        models.extend(task.init_from_checkpoint_rules.values_mut().map(|rule| &mut rule.task.model));
    }
    models
}

#[derive(Debug, Clone)]
pub struct TransformerQuantizer {
    options: TransformerQuantizationOptions,
}

impl TaskModifier for TransformerQuantizer {
    fn apply(&self, task: &mut TaskConfig) -> Result<(), RewriteError> {
        check_bits(self.options.num_bits)?;
        for model in task_models(task, self.options.quantize_init_from_checkpoint_rules_task) {
            set_transformer_quantization(model, &self.options)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DiffusionQuantizer {
    target: TplKind,
    options: DiffusionQuantizationOptions,
}

impl TaskModifier for DiffusionQuantizer {
    fn apply(&self, task: &mut TaskConfig) -> Result<(), RewriteError> {
        check_bits(self.options.num_bits)?;
        for model in task_models(task, self.options.quantize_init_from_checkpoint_rules_task) {
            set_diffusion_quantization(model, self.target, &self.options)?;
        }
        Ok(())
    }
}

/// Quantizes the transformers of a task. Defaults to
/// [`TransformerQuantizationOptions::for_training`] when used for training.
pub fn for_transformer(options: TransformerQuantizationOptions) -> TransformerQuantizer {
    TransformerQuantizer { options }
}

pub fn for_diffusion(target: TplKind, options: DiffusionQuantizationOptions) -> DiffusionQuantizer {
    DiffusionQuantizer { target, options }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::{BuildContext, ConvBlockTpl, EmbeddingSoftmaxTpl, FeedForwardTpl, StackedTransformerTpl};

    fn transformer_tpl() -> TransformerTpl {
        TransformerTpl { input_dims: 8, hidden_dims: 16, num_heads: 2, ..Default::default() }
    }

    fn fq() -> (QuantizationType, QuantizationMode, WeightQuantizationParams) {
        (QuantizationType::Fq, QuantizationMode::Training, WeightQuantizationParams::with_precision(4))
    }

    #[test]
    fn test_dot_product_attention_rewrite() {
        let (t, m, w) = fq();
        let mut attn = DotProductAttentionTpl::default();
        let act = ActQuantizationParams::with_precision(4);
        quantize_dot_product_attention_layer_weights(&mut attn, t, m, &w, Some(&act));
        let q = attn.proj_tpl.quantization().unwrap();
        assert_eq!(q.quantization_type, QuantizationType::Fq);
        assert_eq!(q.weight_params.precision, 4);
        assert_eq!(q.act_params.as_ref().map(|a| a.precision), Some(4));
        assert_eq!(attn.combined_qkv_proj_tpl.quantization(), Some(q));
    }

    #[test]
    fn test_mq_attention_rewrite() {
        let (t, m, w) = fq();
        let mut tr = TransformerTpl {
            tr_atten_tpl: Box::new(LayerTpl::MultiQueryDotProductAttention(Default::default())),
            ..transformer_tpl()
        };
        quantize_attention_layer_weights(&mut tr, t, m, &w, None).unwrap();
        match &*tr.tr_atten_tpl {
            LayerTpl::MultiQueryDotProductAttention(a) => {
                assert!(a.proj_tpl.quantization().is_some());
                assert_eq!(a.headless_proj_tpl.kind(), TplKind::OneHeadedAttentionProjection);
                assert!(a.headless_proj_tpl.quantization().is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_wrong_attention_class_is_rejected() {
        let (t, m, w) = fq();
        let mut tr = TransformerTpl { tr_atten_tpl: Box::new(LayerTpl::Linear(LinearTpl::default())), ..transformer_tpl() };
        let err = quantize_attention_layer_weights(&mut tr, t, m, &w, None).unwrap_err();
        assert!(matches!(err, RewriteError::WrongClass { got: TplKind::Linear, .. }));
        assert!(err.to_string().contains("tr_atten_tpl"));
    }

    #[test]
    fn test_linear_only_leaves_attention() {
        let (t, m, w) = fq();
        let mut tr = transformer_tpl();
        quantize_transformer_layer_weights(&mut tr, t, m, &w, None, true, Some(4)).unwrap();
        assert!(tr.tr_atten_tpl.find_target_tpl(TplKind::AttentionProjection)[0].quantization().is_none());
        let linears = tr.tr_fflayer_tpl.find_target_tpl(TplKind::Linear);
        match linears[0] {
            LayerTpl::Linear(l) => {
                assert_eq!(l.rank, Some(4));
                assert!(l.quantization.is_some());
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_feed_forward_rewrite_requires_feed_forward_child() {
        let (t, m, w) = fq();
        let mut ff = TransformerFeedForwardTpl {
            fflayer_tpl: Box::new(LayerTpl::Linear(LinearTpl::default())),
            ..Default::default()
        };
        assert!(quantize_transformer_feed_forward_layer_weights(&mut ff, t, m, &w, None, None).is_err());
        let mut ff = TransformerFeedForwardTpl {
            fflayer_tpl: Box::new(LayerTpl::FeedForward(FeedForwardTpl::default())),
            ..Default::default()
        };
        quantize_transformer_feed_forward_layer_weights(&mut ff, t, m, &w, None, None).unwrap();
    }

    #[test]
    fn test_embedding_softmax_rewrite_copies_fields() {
        let (t, m, w) = fq();
        let mut lm = TransformerLmTpl {
            softmax_tpl: Box::new(LayerTpl::SharedEmbeddingSoftmax(EmbeddingSoftmaxTpl {
                name: "emb".to_string(),
                scale_sqrt_depth: true,
                ..Default::default()
            })),
            ..Default::default()
        };
        quantize_embedding_softmax_layer_weights(&mut lm, t, m, &w, true).unwrap();
        match &*lm.softmax_tpl {
            LayerTpl::NClassMajorSharedEmbeddingSoftmax(s) => {
                assert_eq!(s.name, "emb");
                assert!(s.scale_sqrt_depth);
                assert!(s.quantization.as_ref().map_or(false, |q| q.act_params.is_none()));
            }
            other => panic!("unexpected {:?}", other),
        }

        lm.softmax_tpl = Box::new(LayerTpl::Linear(LinearTpl::default()));
        assert!(quantize_embedding_softmax_layer_weights(&mut lm, t, m, &w, false).is_err());
    }

    #[test]
    fn test_set_transformer_quantization_rejects_bad_bits() {
        let mut tpl = LayerTpl::Transformer(transformer_tpl());
        let options = TransformerQuantizationOptions { num_bits: 9, ..Default::default() };
        assert!(matches!(set_transformer_quantization(&mut tpl, &options), Err(RewriteError::InvalidParams(_))));
    }

    #[test]
    fn test_set_diffusion_quantization_targets_conv_blocks() {
        let mut tpl = LayerTpl::Chain(crate::templates::ChainTpl {
            name: "unet".to_string(),
            layers: vec![
                LayerTpl::ConvBlock(ConvBlockTpl { filter_shape: [3, 3, 1, 2], ..Default::default() }),
                LayerTpl::Linear(LinearTpl::default()),
            ],
        });
        set_diffusion_quantization(&mut tpl, TplKind::ConvBlock, &DiffusionQuantizationOptions::default()).unwrap();
        let convs = tpl.find_target_tpl(TplKind::Conv2D);
        assert_eq!(convs.len(), 1);
        assert_eq!(convs[0].quantization().map(|q| q.mode), Some(QuantizationMode::Inference));
        assert!(tpl.find_target_tpl(TplKind::Linear)[0].quantization().is_none());

        // Targets without a conv_tpl are skipped.
        set_diffusion_quantization(&mut tpl, TplKind::Linear, &DiffusionQuantizationOptions::default()).unwrap();
        assert!(tpl.find_target_tpl(TplKind::Linear)[0].quantization().is_none());
    }

    #[test]
    fn test_rewrite_keeps_child_bias_and_names() {
        let tr = TransformerTpl {
            tr_atten_tpl: Box::new(LayerTpl::DotProductAttention(DotProductAttentionTpl {
                proj_tpl: Box::new(LayerTpl::AttentionProjection(AttentionProjectionTpl {
                    use_bias: false,
                    ..Default::default()
                })),
                ..Default::default()
            })),
            tr_fflayer_tpl: Box::new(LayerTpl::TransformerFeedForward(TransformerFeedForwardTpl {
                fflayer_tpl: Box::new(LayerTpl::FeedForward(FeedForwardTpl {
                    linear_tpl: Box::new(LayerTpl::Linear(LinearTpl { name: "dense".to_string(), ..Default::default() })),
                    ..Default::default()
                })),
                ..Default::default()
            })),
            ..transformer_tpl()
        };
        let float_tpl = LayerTpl::Transformer(tr);
        let mut quantized_tpl = float_tpl.clone();
        set_transformer_quantization(&mut quantized_tpl, &TransformerQuantizationOptions::for_training()).unwrap();

        let float_layer = float_tpl.build(&mut BuildContext::new(3)).unwrap();
        let quantized_layer = quantized_tpl.build(&mut BuildContext::new(3)).unwrap();
        assert_eq!(float_layer.num_parameters(), quantized_layer.num_parameters());
        match &*quantized_tpl.find_target_tpl(TplKind::DotProductAttention)[0] {
            LayerTpl::DotProductAttention(a) => match &*a.proj_tpl {
                LayerTpl::AttentionProjection(p) => {
                    assert!(!p.use_bias);
                    assert!(p.quantization.is_some());
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
        let linears = quantized_tpl.find_target_tpl(TplKind::Linear);
        assert_eq!(linears[0].name(), "dense");
        assert!(linears[0].quantization().is_some());
    }

    #[test]
    fn test_diffusion_rewrite_keeps_conv_bias() {
        let block = LayerTpl::ConvBlock(ConvBlockTpl {
            filter_shape: [1, 1, 2, 2],
            conv_tpl: Box::new(LayerTpl::Conv2D(Conv2DTpl { name: "c".to_string(), bias: true, ..Default::default() })),
            ..Default::default()
        });
        let mut quantized = block.clone();
        set_diffusion_quantization(&mut quantized, TplKind::ConvBlock, &DiffusionQuantizationOptions::for_training())
            .unwrap();
        match &*quantized.find_target_tpl(TplKind::Conv2D)[0] {
            LayerTpl::Conv2D(c) => {
                assert!(c.bias);
                assert_eq!(c.name, "c");
                assert!(c.quantization.is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
        // Training keeps float weights, so only a structural change would move the count.
        let before = block.build(&mut BuildContext::new(5)).unwrap().num_parameters();
        let after = quantized.build(&mut BuildContext::new(5)).unwrap().num_parameters();
        assert_eq!(before, after);
    }

    #[test]
    fn test_set_inference_mode_only_flips_mode() {
        let mut tpl = LayerTpl::StackedTransformer(StackedTransformerTpl {
            transformer_layer_params_tpl: Box::new(LayerTpl::Transformer(transformer_tpl())),
            ..Default::default()
        });
        let options = TransformerQuantizationOptions { num_bits: 4, ..TransformerQuantizationOptions::for_training() };
        set_transformer_quantization(&mut tpl, &options).unwrap();
        let before = tpl.clone();
        set_inference_mode(&mut tpl);

        let qs: Vec<&QuantizationParams> = [TplKind::AttentionProjection, TplKind::CombinedQkvProjection, TplKind::Linear]
            .iter()
            .flat_map(|k| tpl.find_target_tpl(*k))
            .filter_map(|t| t.quantization())
            .collect();
        assert_eq!(qs.len(), 3);
        for q in qs {
            assert_eq!(q.mode, QuantizationMode::Inference);
            assert_eq!(q.quantization_type, QuantizationType::Fq);
            assert_eq!(q.weight_params.precision, 4);
        }
        assert_ne!(before, tpl);
    }

    #[test]
    fn test_task_modifier_checks_bits_and_rules() {
        let model = LayerTpl::Transformer(transformer_tpl());
        let mut task = TaskConfig::new(model.clone());
        task.init_from_checkpoint_rules
            .insert("ckpt".to_string(), crate::templates::InitFromCheckpointRule { task: TaskConfig::new(model) });

        let bad = for_transformer(TransformerQuantizationOptions { num_bits: 3, ..Default::default() });
        assert_eq!(bad.apply(&mut task.clone()), Err(RewriteError::UnsupportedBits(3)));

        let quantizer = for_transformer(TransformerQuantizationOptions {
            quantize_init_from_checkpoint_rules_task: true,
            ..TransformerQuantizationOptions::for_training()
        });
        quantizer.apply(&mut task).unwrap();
        let rule_model = &task.init_from_checkpoint_rules["ckpt"].task.model;
        assert!(rule_model.find_target_tpl(TplKind::Linear)[0].quantization().is_some());
        assert!(task.model.find_target_tpl(TplKind::Linear)[0].quantization().is_some());
    }
}
