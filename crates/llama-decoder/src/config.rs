//! Configuration for the LLaMA decoder.

use mm_core::{MmError, MmResult};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;

/// Configuration for the LLaMA decoder (Meta `params.json` plus runtime limits).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlamaConfig {
    /// Hidden size.
    pub dim: usize,

    /// Number of transformer layers.
    pub n_layers: usize,

    /// Number of attention heads.
    pub n_heads: usize,

    /// Number of key-value heads (GQA). `None` means `n_heads`.
    #[serde(default)]
    pub n_kv_heads: Option<usize>,

    /// Vocabulary size. `0` means "take it from the tokenizer"
    /// (Meta checkpoints store `-1` here).
    #[serde(default, deserialize_with = "vocab_size_from_json")]
    pub vocab_size: usize,

    /// FFN hidden size is rounded up to a multiple of this.
    #[serde(default = "default_multiple_of")]
    pub multiple_of: usize,

    #[serde(default)]
    pub ffn_dim_multiplier: Option<f64>,

    /// RMS norm epsilon.
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,

    /// RoPE theta.
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,

    /// Maximum sequence length (prompt + generated).
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,

    /// Maximum batch size for generation.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Add bias terms to wq/wo/w1/w2/w3.
    #[serde(default = "default_true")]
    pub w_bias: bool,

    /// Add low-rank terms to every projection.
    #[serde(default = "default_true")]
    pub w_lora: bool,

    #[serde(default = "default_lora_rank")]
    pub lora_rank: usize,
}

fn vocab_size_from_json<'de, D: Deserializer<'de>>(d: D) -> Result<usize, D::Error> {
    let v = i64::deserialize(d)?;
    Ok(if v < 0 { 0 } else { v as usize })
}

fn default_multiple_of() -> usize {
    256
}
fn default_norm_eps() -> f64 {
    1e-5
}
fn default_rope_theta() -> f64 {
    10_000.0
}
fn default_max_seq_len() -> usize {
    1024
}
fn default_max_batch_size() -> usize {
    1
}
fn default_true() -> bool {
    true
}
fn default_lora_rank() -> usize {
    16
}

impl Default for LlamaConfig {
    fn default() -> Self {
        Self::llama_7b()
    }
}

impl LlamaConfig {
    /// LLaMA-2 7B (`params.json` of the Meta release).
    pub fn llama_7b() -> Self {
        Self {
            dim: 4096,
            n_layers: 32,
            n_heads: 32,
            n_kv_heads: None,
            vocab_size: 0,
            multiple_of: 256,
            ffn_dim_multiplier: None,
            norm_eps: 1e-5,
            rope_theta: 10_000.0,
            max_seq_len: 1024,
            max_batch_size: 1,
            w_bias: true,
            w_lora: true,
            lora_rank: 16,
        }
    }

    /// Load `params.json`.
    pub fn from_params_json(path: impl AsRef<Path>) -> MmResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| MmError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn head_dim(&self) -> usize {
        self.dim / self.n_heads
    }

    pub fn kv_heads(&self) -> usize {
        self.n_kv_heads.unwrap_or(self.n_heads)
    }

    /// SwiGLU hidden size: `2/3 * 4 * dim`, scaled, rounded up to `multiple_of`.
    pub fn ffn_hidden_dim(&self) -> usize {
        let mut hidden = 2 * (4 * self.dim) / 3;
        if let Some(m) = self.ffn_dim_multiplier {
            hidden = (m * hidden as f64) as usize;
        }
        let multiple = self.multiple_of.max(1);
        multiple * hidden.div_ceil(multiple)
    }

    /// Rank of the low-rank terms (`None` when disabled).
    pub fn lora_rank(&self) -> Option<usize> {
        (self.w_lora && self.lora_rank > 0).then_some(self.lora_rank)
    }

    pub fn with_vocab_size(mut self, vocab_size: usize) -> Self {
        self.vocab_size = vocab_size;
        self
    }

    pub fn validate(&self) -> MmResult<()> {
        if self.n_heads == 0 || self.dim % self.n_heads != 0 {
            return Err(MmError::Config(format!(
                "dim={} is not divisible by n_heads={}",
                self.dim, self.n_heads
            )));
        }
        if self.kv_heads() == 0 || self.n_heads % self.kv_heads() != 0 {
            return Err(MmError::Config(format!(
                "n_heads={} is not divisible by n_kv_heads={}",
                self.n_heads,
                self.kv_heads()
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(MmError::Config(format!(
                "head_dim={} must be even for RoPE",
                self.head_dim()
            )));
        }
        if self.vocab_size == 0 {
            return Err(MmError::Config(
                "vocab_size is not resolved (take it from the tokenizer)".into(),
            ));
        }
        if self.max_batch_size == 0 || self.max_seq_len == 0 {
            return Err(MmError::Config(
                "max_batch_size and max_seq_len must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_json_with_negative_vocab() {
        let json = r#"{"dim": 4096, "multiple_of": 256, "n_heads": 32, "n_layers": 32, "norm_eps": 1e-06, "vocab_size": -1}"#;
        let cfg: LlamaConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.vocab_size, 0);
        assert_eq!(cfg.max_seq_len, 1024);
        assert!(cfg.w_bias && cfg.w_lora);
        assert!(cfg.validate().is_err());
        assert!(cfg.with_vocab_size(32008).validate().is_ok());
    }

    #[test]
    fn test_ffn_hidden_dim_7b() {
        // 2/3 * 16384 = 10922 -> 11008
        assert_eq!(LlamaConfig::llama_7b().ffn_hidden_dim(), 11008);
    }

    #[test]
    fn test_lora_rank_toggle() {
        let mut cfg = LlamaConfig::llama_7b();
        assert_eq!(cfg.lora_rank(), Some(16));
        cfg.w_lora = false;
        assert_eq!(cfg.lora_rank(), None);
    }
}
