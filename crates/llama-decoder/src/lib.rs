//! LLaMA decoder crate for multimodal generation.
//!
//! This crate provides the causal language model whose trailing layers
//! accept one injected conditioning embedding per call, together with
//! the KV cache and the loader for Meta-style consolidated shards.

pub mod cache;
pub mod config;
pub mod layers;
pub mod model;
pub mod shards;

pub use cache::{KvCache, LayerKvCache};
pub use config::LlamaConfig;
pub use layers::{Attention, FeedForward, LinearLayer, RmsNorm, RotaryEmbedding, TransformerBlock};
pub use model::{grow_vocabulary, LlamaModel};
pub use shards::{load_consolidated_shards, shard_axis, ShardAxis, ShardLoadReport};
