// src/chain/chain_extensions.rs
//! Shorthands for building chain templates.

use crate::base_layer::Activation;
use crate::templates::{ActivationTpl, ChainTpl, FeedForwardTpl, LayerTpl, LinearTpl, LogArgsTpl, RepeatTpl};
use std::error::Error;

pub fn chain(name: &str, layers: Vec<LayerTpl>) -> LayerTpl {
    LayerTpl::Chain(ChainTpl { name: name.to_string(), layers })
}

/// `n` copies of `tpl`, named `<name>_0 .. <name>_{n-1}`. Each copy builds
/// its own weights.
pub fn copy_n_times(n: usize, tpl: &LayerTpl) -> Vec<LayerTpl> {
    (0..n)
        .map(|i| {
            let mut copy = tpl.clone();
            copy.set_name(&format!("{}_{}", tpl.name(), i));
            copy
        })
        .collect()
}

pub fn repeat(name: &str, tpl: LayerTpl, x_times: usize) -> LayerTpl {
    LayerTpl::Repeat(RepeatTpl { name: name.to_string(), sub_tpl: Box::new(tpl), x_times })
}

pub fn activation(name: &str, act: Activation) -> LayerTpl {
    LayerTpl::Activation(ActivationTpl { name: name.to_string(), activation: act })
}

pub fn linear(name: &str, input_dims: usize, output_dims: usize) -> LayerTpl {
    LayerTpl::Linear(LinearTpl { name: name.to_string(), input_dims, output_dims, ..Default::default() })
}

/// A chain of feed-forward layers over consecutive pairs of `dims`. Every
/// layer uses `act` except the last, which is linear.
pub fn feed_forward(name: &str, dims: &[usize], act: Activation) -> Result<LayerTpl, Box<dyn Error>> {
    if dims.len() < 2 {
        return Err(format!("feed_forward '{}' needs at least 2 dims, got {:?}", name, dims).into());
    }
    let last = dims.len() - 2;
    let layers = dims
        .windows(2)
        .enumerate()
        .map(|(i, pair)| {
            LayerTpl::FeedForward(FeedForwardTpl {
                name: format!("feed_forward_{}", i),
                input_dims: pair[0],
                output_dims: pair[1],
                activation: if i == last { Activation::Identity } else { act },
                ..Default::default()
            })
        })
        .collect();
    Ok(chain(name, layers))
}

pub fn log_args(name: &str, message: &str) -> LayerTpl {
    LayerTpl::LogArgs(LogArgsTpl { name: name.to_string(), message: message.to_string() })
}
