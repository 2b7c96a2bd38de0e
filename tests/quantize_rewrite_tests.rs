// tests/quantize_rewrite_tests.rs
use ndarray::{Array, ArrayD};
use quantized_layers::base_layer::Layer;
use quantized_layers::checkpoint::{export_quantized_weights, import_quantized_weights};
use quantized_layers::config::{QuantizationMode, QuantizationType};
use quantized_layers::quantize::{set_inference_mode, set_transformer_quantization, TransformerQuantizationOptions};
use quantized_layers::templates::{BuildContext, LayerTpl, TaskConfig, TplKind};

const SEED: u64 = 17;

const LM_TASK: &str = r#"{
    "model": {
        "cls": "TransformerLm",
        "name": "lm",
        "model_dims": 8,
        "vocab_size": 12,
        "stacked_transformer_tpl": {
            "cls": "StackedTransformer",
            "num_layers": 2,
            "hidden_dims": 16,
            "num_heads": 2,
            "mask_self_attention": true
        }
    }
}"#;

fn load_task() -> TaskConfig {
    serde_json::from_str(LM_TASK).unwrap()
}

fn token_ids() -> ArrayD<f32> {
    Array::from_shape_vec((2, 3), vec![1.0, 4.0, 7.0, 11.0, 0.0, 3.0]).unwrap().into_dyn()
}

fn logits(model: &LayerTpl) -> ArrayD<f32> {
    let layer = model.build(&mut BuildContext::new(SEED)).unwrap();
    layer.forward(&token_ids()).unwrap()
}

fn max_abs(a: &ArrayD<f32>) -> f32 {
    a.iter().fold(0.0f32, |m, v| m.max(v.abs()))
}

fn max_abs_diff(a: &ArrayD<f32>, b: &ArrayD<f32>) -> f32 {
    assert_eq!(a.shape(), b.shape());
    a.iter().zip(b.iter()).fold(0.0f32, |m, (x, y)| m.max((x - y).abs()))
}

#[test]
fn fake_quantized_lm_tracks_float_lm() {
    let task = load_task();
    let float_logits = logits(&task.model);
    assert_eq!(float_logits.shape(), &[2, 3, 12]);

    let mut quantized = task.clone();
    set_transformer_quantization(&mut quantized.model, &TransformerQuantizationOptions::for_training()).unwrap();
    assert_ne!(quantized, task);
    let fq_logits = logits(&quantized.model);

    let tolerance = 0.05 * max_abs(&float_logits) + 1e-3;
    assert!(
        max_abs_diff(&float_logits, &fq_logits) < tolerance,
        "8-bit fake quantization drifted too far: {} >= {}",
        max_abs_diff(&float_logits, &fq_logits),
        tolerance
    );
}

#[test]
fn inference_mode_matches_fake_quantized_training() {
    let mut task = load_task();
    set_transformer_quantization(&mut task.model, &TransformerQuantizationOptions::for_training()).unwrap();
    let fq_logits = logits(&task.model);

    set_inference_mode(&mut task.model);
    for tpl in task.model.find_target_tpl(TplKind::Linear) {
        let q = tpl.quantization().unwrap();
        assert_eq!(q.mode, QuantizationMode::Inference);
        assert_eq!(q.quantization_type, QuantizationType::Fq);
    }
    let inference_logits = logits(&task.model);
    assert!(max_abs_diff(&fq_logits, &inference_logits) < 1e-3 * (1.0 + max_abs(&fq_logits)));
}

#[test]
fn rewritten_task_survives_json() {
    let mut task = load_task();
    let options = TransformerQuantizationOptions {
        num_bits: 4,
        block_size: 4,
        quantize_embedding_softmax: true,
        transposed_embedding_softmax: true,
        ..TransformerQuantizationOptions::default()
    };
    set_transformer_quantization(&mut task.model, &options).unwrap();

    let json = serde_json::to_string_pretty(&task).unwrap();
    assert!(json.contains("NClassMajorSharedEmbeddingSoftmax"));
    let back: TaskConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back, task);
}

#[test]
fn exported_checkpoint_holds_every_quantized_weight() {
    let mut task = load_task();
    let options = TransformerQuantizationOptions {
        linear_only: true,
        rank: Some(2),
        use_symmetric: false,
        ..TransformerQuantizationOptions::default()
    };
    set_transformer_quantization(&mut task.model, &options).unwrap();

    let layer = task.model.build(&mut BuildContext::new(SEED)).unwrap();
    let expected = layer.quantized_weights().unwrap();
    // Two feed-forward linears per layer, each split into two factors.
    assert_eq!(expected.len(), 2 * 2 * 2);
    assert!(expected.iter().all(|(name, _)| name.starts_with("lm.transformer.x_layers_")));
    assert!(expected.iter().any(|(name, _)| name.ends_with("ffn_layer1.linear.w_a")));
    assert!(expected.iter().any(|(name, _)| name.ends_with("ffn_layer2.linear.w_b")));

    let bytes = export_quantized_weights(layer.as_ref()).unwrap();
    let loaded = import_quantized_weights(&bytes).unwrap();
    assert_eq!(loaded.len(), expected.len());
    for (name, qt) in &expected {
        assert_eq!(&loaded[name], qt, "mismatch for {}", name);
        assert!(loaded[name].zero_point.is_some());
    }
}

#[test]
fn attention_weights_are_exported_when_not_linear_only() {
    let mut task = load_task();
    set_transformer_quantization(&mut task.model, &TransformerQuantizationOptions::default()).unwrap();
    let layer = task.model.build(&mut BuildContext::new(SEED)).unwrap();
    let names: Vec<String> = layer.quantized_weights().unwrap().into_iter().map(|(n, _)| n).collect();
    for proj in ["query.w", "key.w", "value.w", "post.w"] {
        assert_eq!(names.iter().filter(|n| n.ends_with(proj)).count(), 2, "{} in {:?}", proj, names);
    }
}
