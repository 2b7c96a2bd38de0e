// src/bin/quantize_model.rs
use clap::Parser;
use log::info;
use quantized_layers::checkpoint::save_quantized_weights;
use quantized_layers::config::{QuantDtype, QuantizationMode, QuantizationType};
use quantized_layers::quantize::{
    for_diffusion, for_transformer, set_inference_mode, DiffusionQuantizationOptions, TaskModifier,
    TransformerQuantizationOptions,
};
use quantized_layers::templates::{BuildContext, TaskConfig, TplKind};
use serde::de::DeserializeOwned;
use std::error::Error;

// Parses an enum through its serde name, e.g. "FQ" or "int8".
fn parse_serde_name<T: DeserializeOwned>(s: &str) -> Result<T, String> {
    serde_json::from_value(serde_json::Value::String(s.to_string())).map_err(|e| format!("'{}': {}", s, e))
}

fn parse_quantization_type(s: &str) -> Result<QuantizationType, String> {
    parse_serde_name(&s.to_uppercase())
}

fn parse_mode(s: &str) -> Result<QuantizationMode, String> {
    parse_serde_name(&s.to_uppercase())
}

fn parse_dtype(s: &str) -> Result<QuantDtype, String> {
    parse_serde_name(&s.to_lowercase())
}

/// Rewrites a task template so its layers run quantized.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct CliArgs {
    /// Task JSON to read.
    #[clap(long, value_parser)]
    input: String,
    /// Where to write the rewritten task JSON.
    #[clap(long, value_parser)]
    output: String,
    /// PTQ, FQ or AQT.
    #[clap(long, value_parser = parse_quantization_type, default_value = "PTQ")]
    quantization_type: QuantizationType,
    /// TRAINING, MATERIALIZE or INFERENCE.
    #[clap(long, value_parser = parse_mode, default_value = "INFERENCE")]
    mode: QuantizationMode,
    #[clap(long, value_parser, default_value_t = 8)]
    num_bits: u8,
    #[clap(long)]
    linear_only: bool,
    #[clap(long)]
    asymmetric: bool,
    #[clap(long, value_parser)]
    rank: Option<usize>,
    /// Quantize activations as well as weights.
    #[clap(long)]
    quantize_activations: bool,
    #[clap(long)]
    quantize_embedding_softmax: bool,
    #[clap(long)]
    transposed_embedding_softmax: bool,
    /// Sub-channel block size; 0 is per channel.
    #[clap(long, value_parser, default_value_t = 0)]
    block_size: usize,
    /// Keep int4 weights unpacked, one per int8.
    #[clap(long)]
    no_int4_packing: bool,
    #[clap(long, value_parser = parse_dtype, default_value = "int32")]
    int4_container: QuantDtype,
    /// Also rewrite the models of the init-from-checkpoint tasks.
    #[clap(long)]
    include_checkpoint_rules: bool,
    /// Only switch already-quantized templates to INFERENCE.
    #[clap(long)]
    inference_only: bool,
    /// Quantize the conv_tpl of every template of this class instead of transformers.
    #[clap(long, value_parser)]
    diffusion_target: Option<TplKind>,
    /// Build the rewritten model and write its quantized weights here.
    #[clap(long, value_parser)]
    export_weights: Option<String>,
    /// Seed for weight init when exporting.
    #[clap(long, value_parser, default_value_t = 0)]
    seed: u64,
}

fn run() -> Result<(), Box<dyn Error>> {
    let args = CliArgs::parse();
    let mut task = TaskConfig::load(&args.input)?;
    info!("Loaded task from {}", args.input);

    if args.inference_only {
        set_inference_mode(&mut task.model);
        if args.include_checkpoint_rules {
            for rule in task.init_from_checkpoint_rules.values_mut() {
                set_inference_mode(&mut rule.task.model);
            }
        }
    } else if let Some(target) = args.diffusion_target {
        let options = DiffusionQuantizationOptions {
            quantization_type: args.quantization_type,
            mode: args.mode,
            num_bits: args.num_bits,
            use_symmetric: !args.asymmetric,
            weight_quant_only: !args.quantize_activations,
            dtype: QuantDtype::Int8,
            quantize_init_from_checkpoint_rules_task: args.include_checkpoint_rules,
        };
        for_diffusion(target, options).apply(&mut task)?;
    } else {
        let options = TransformerQuantizationOptions {
            quantization_type: args.quantization_type,
            mode: args.mode,
            num_bits: args.num_bits,
            linear_only: args.linear_only,
            use_symmetric: !args.asymmetric,
            rank: args.rank,
            weight_quant_only: !args.quantize_activations,
            quantize_embedding_softmax: args.quantize_embedding_softmax,
            transposed_embedding_softmax: args.transposed_embedding_softmax,
            dtype: QuantDtype::Int8,
            block_size: args.block_size,
            use_int4_packed_weights: !args.no_int4_packing,
            int4_packed_weights_container_dtype: args.int4_container,
            quantize_init_from_checkpoint_rules_task: args.include_checkpoint_rules,
        };
        for_transformer(options).apply(&mut task)?;
    }

    let json = serde_json::to_string_pretty(&task)?;
    std::fs::write(&args.output, json).map_err(|e| format!("Failed to write {}: {}", args.output, e))?;
    println!("Wrote quantized task to {}", args.output);

    if let Some(path) = &args.export_weights {
        let model = task.model.build(&mut BuildContext::new(args.seed))?;
        save_quantized_weights(model.as_ref(), path)?;
        println!("Wrote quantized weights to {}", path);
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("Application error: {}", e);
        let mut current_err: Option<&(dyn Error + 'static)> = e.source();
        while let Some(source) = current_err {
            eprintln!("Caused by: {}", source);
            current_err = source.source();
        }
        std::process::exit(1);
    }
}
