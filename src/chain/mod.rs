// src/chain/mod.rs

pub mod chain_extensions;
pub mod chain_lib;

pub use chain_extensions::{activation, chain, copy_n_times, feed_forward, linear, log_args, repeat};
pub use chain_lib::{Chain, LogArgs, Repeat};
