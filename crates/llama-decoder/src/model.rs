//! LLaMA decoder model.
//!
//! Слои доступны по одному (`layer`), чтобы вызывающий код мог сам решать,
//! какое значение инжектировать в какой слой.

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{Embedding, Module};
use mm_core::{MmError, MmResult, ParamBuilder, ParamGroup, ParamInit, ParamStore};
use tracing::{debug, info};

use crate::cache::{KvCache, LayerKvCache};
use crate::config::LlamaConfig;
use crate::layers::{LinearLayer, RmsNorm, RotaryEmbedding, TransformerBlock};

const EMBED_INIT_STD: f64 = 0.02;

/// LLaMA causal language model.
#[derive(Debug, Clone)]
pub struct LlamaModel {
    config: LlamaConfig,
    tok_embeddings: Embedding,
    layers: Vec<TransformerBlock>,
    norm: RmsNorm,
    output: LinearLayer,
}

impl LlamaModel {
    /// Build the model over the parameter store (`vb` is the model root, e.g. `llama`).
    pub fn new(config: &LlamaConfig, vb: &ParamBuilder) -> Result<Self> {
        let vb = vb.in_group(ParamGroup::LmBackbone);
        let embed_weight = vb.pp("tok_embeddings").get(
            (config.vocab_size, config.dim),
            "weight",
            ParamInit::Normal {
                std: EMBED_INIT_STD,
            },
        )?;
        let tok_embeddings = Embedding::new(embed_weight, config.dim);

        // RoPE одинаковый для всех слоев: таблицы строим один раз и делимся ими.
        let rope = RotaryEmbedding::new(
            config.head_dim(),
            config.max_seq_len,
            config.rope_theta,
            vb.device(),
        )?;

        let mut layers = Vec::with_capacity(config.n_layers);
        for i in 0..config.n_layers {
            layers.push(TransformerBlock::new(
                config,
                &vb.pp(format!("layers.{i}")),
                rope.clone(),
            )?);
        }

        let norm = RmsNorm::new(config.dim, config.norm_eps, &vb.pp("norm"))?;
        let output = LinearLayer::new(config.dim, config.vocab_size, "output", &vb, false, None)?;

        debug!(
            "LlamaModel: dim={}, layers={}, heads={}/{}, vocab={}",
            config.dim,
            config.n_layers,
            config.n_heads,
            config.kv_heads(),
            config.vocab_size
        );

        Ok(Self {
            config: config.clone(),
            tok_embeddings,
            layers,
            norm,
            output,
        })
    }

    pub fn config(&self) -> &LlamaConfig {
        &self.config
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    pub fn new_cache(&self) -> KvCache {
        KvCache::new(self.layers.len())
    }

    /// Token ids `[batch, seq]` (u32) -> embeddings `[batch, seq, dim]`.
    pub fn embed(&self, tokens: &Tensor) -> Result<Tensor> {
        self.tok_embeddings.forward(tokens)
    }

    /// One transformer layer, optionally conditioned by `injected`.
    pub fn layer(
        &self,
        idx: usize,
        hidden: &Tensor,
        start_pos: usize,
        mask: Option<&Tensor>,
        injected: Option<&Tensor>,
        cache: Option<&mut LayerKvCache>,
    ) -> Result<Tensor> {
        let Some(layer) = self.layers.get(idx) else {
            candle_core::bail!("layer {idx} out of range ({} layers)", self.layers.len());
        };
        layer.forward(hidden, start_pos, mask, injected, cache)
    }

    pub fn norm(&self, hidden: &Tensor) -> Result<Tensor> {
        self.norm.forward(hidden)
    }

    /// Hidden `[.., dim]` -> logits `[.., vocab]`.
    pub fn output(&self, hidden: &Tensor) -> Result<Tensor> {
        self.output.forward(hidden)
    }

    /// Additive causal mask `[1, 1, seq, start_pos + seq]`.
    ///
    /// Для одиночного шага декодирования маска не нужна.
    pub fn causal_mask(
        seq_len: usize,
        start_pos: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<Option<Tensor>> {
        if seq_len <= 1 {
            return Ok(None);
        }
        let total = start_pos + seq_len;
        let mask: Vec<f32> = (0..seq_len)
            .flat_map(|i| {
                (0..total).map(move |j| {
                    if j <= start_pos + i {
                        0.0
                    } else {
                        f32::NEG_INFINITY
                    }
                })
            })
            .collect();
        let mask = Tensor::from_vec(mask, (seq_len, total), device)?;
        Ok(Some(mask.unsqueeze(0)?.unsqueeze(0)?.to_dtype(dtype)?))
    }

    /// Plain LM forward without injection: logits of the last position `[batch, vocab]`.
    pub fn forward(&self, tokens: &Tensor, start_pos: usize, cache: &mut KvCache) -> Result<Tensor> {
        let (_, seq_len) = tokens.dims2()?;
        let mut h = self.embed(tokens)?;
        let mask = Self::causal_mask(seq_len, start_pos, h.device(), h.dtype())?;
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward(&h, start_pos, mask.as_ref(), None, cache.layer_mut(i))?;
        }
        let h = self.norm(&h)?;
        let last = h.narrow(1, seq_len - 1, 1)?.squeeze(1)?;
        self.output(&last)?.to_dtype(DType::F32)
    }
}

/// Append `extra` freshly initialised rows to the embedding and output matrices.
///
/// Returns the new vocabulary size. Modules built over the store must be rebuilt.
pub fn grow_vocabulary(store: &ParamStore, prefix: &str, extra: usize) -> MmResult<usize> {
    let mut new_vocab = 0usize;
    for name in ["tok_embeddings.weight", "output.weight"] {
        let full = format!("{prefix}.{name}");
        let current = store
            .get(&full)
            .ok_or_else(|| MmError::Model(format!("missing parameter {full}")))?;
        let (vocab, dim) = current.dims2()?;
        new_vocab = vocab + extra;
        if extra == 0 {
            continue;
        }
        let rows = Tensor::randn(0f32, EMBED_INIT_STD as f32, (extra, dim), current.device())?
            .to_dtype(current.dtype())?;
        store.replace_resized(&full, Tensor::cat(&[&current, &rows], 0)?)?;
    }
    info!("Словарь LLM расширен на {extra} токенов: {new_vocab}");
    Ok(new_vocab)
}
