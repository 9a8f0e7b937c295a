//! Neural network layers for the LLaMA decoder.

use candle_core::{D, DType, Device, Result, Tensor};
use mm_core::tensor::cast;
use mm_core::{ParamBuilder, ParamGroup, ParamInit};

use crate::cache::LayerKvCache;
use crate::config::LlamaConfig;

/// `x @ w^T` for `x` of any rank, `w` of shape `[out, in]`.
fn matmul_t(x: &Tensor, w: &Tensor) -> Result<Tensor> {
    let dims = x.dims().to_vec();
    let in_dim = dims[dims.len() - 1];
    let rows = x.elem_count() / in_dim;
    let y = x.reshape((rows, in_dim))?.matmul(&w.t()?)?;
    let mut out_dims = dims;
    let last = out_dims.len() - 1;
    out_dims[last] = w.dim(0)?;
    y.reshape(out_dims)
}

/// Projection with optional bias and low-rank terms.
///
/// The frozen base weight and the trainable extras can live in different
/// dtypes; every term is computed in its own dtype and summed in the dtype of `x`.
#[derive(Debug, Clone)]
pub struct LinearLayer {
    weight: Tensor,
    bias: Option<Tensor>,
    lora: Option<(Tensor, Tensor)>,
}

impl LinearLayer {
    /// Parameters: `{name}.weight`, `{name}.bias`, `lora_{name}_l1.weight`, `lora_{name}_l2.weight`.
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        name: &str,
        vb: &ParamBuilder,
        bias: bool,
        lora_rank: Option<usize>,
    ) -> Result<Self> {
        let weight = vb.pp(name).in_group(ParamGroup::LmBackbone).get(
            (out_dim, in_dim),
            "weight",
            ParamInit::linear(in_dim),
        )?;
        let bias = if bias {
            Some(
                vb.pp(name)
                    .in_group(ParamGroup::LmBias)
                    .get(out_dim, "bias", ParamInit::Zeros)?,
            )
        } else {
            None
        };
        let lora = match lora_rank {
            Some(rank) => {
                let lb = vb.in_group(ParamGroup::LmLowRank);
                let l1 = lb.pp(format!("lora_{name}_l1")).get(
                    (rank, in_dim),
                    "weight",
                    ParamInit::linear(in_dim),
                )?;
                // Нулевой l2: свежая модель совпадает с базовой.
                let l2 = lb
                    .pp(format!("lora_{name}_l2"))
                    .get((out_dim, rank), "weight", ParamInit::Zeros)?;
                Some((l1, l2))
            }
            None => None,
        };
        Ok(Self { weight, bias, lora })
    }

    /// Plain projection from an existing weight (no extras).
    pub fn from_weight(weight: Tensor) -> Self {
        Self {
            weight,
            bias: None,
            lora: None,
        }
    }

    pub fn out_dim(&self) -> Result<usize> {
        self.weight.dim(0)
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x_dtype = x.dtype();
        let y = matmul_t(&cast(x, self.weight.dtype())?, &self.weight)?;
        let mut y = cast(&y, x_dtype)?;
        if let Some(b) = &self.bias {
            y = y.broadcast_add(&cast(b, x_dtype)?)?;
        }
        if let Some((l1, l2)) = &self.lora {
            let h = matmul_t(&cast(x, l1.dtype())?, l1)?;
            let h = matmul_t(&cast(&h, l2.dtype())?, l2)?;
            y = (y + cast(&h, x_dtype)?)?;
        }
        Ok(y)
    }
}

/// RMS Normalization layer.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    pub fn new(size: usize, eps: f64, vb: &ParamBuilder) -> Result<Self> {
        let weight = vb
            .in_group(ParamGroup::LmNorm)
            .get(size, "weight", ParamInit::Ones)?;
        Ok(Self { weight, eps })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // Вычисления в f32, затем каст обратно.
        let input_dtype = x.dtype();
        let x_f32 = x.to_dtype(DType::F32)?;
        let variance = x_f32.sqr()?.mean_keepdim(D::Minus1)?;
        let x_normed = x_f32.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        let x_normed = x_normed.to_dtype(input_dtype)?;
        x_normed.broadcast_mul(&cast(&self.weight, input_dtype)?)
    }
}

/// Rotary Position Embedding (interleaved pairs, Meta layout).
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    pub fn new(head_dim: usize, max_seq_len: usize, theta: f64, device: &Device) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0 / (theta.powf(i as f64 / head_dim as f64) as f32))
            .collect();

        let inv_freq = Tensor::new(inv_freq, device)?;
        let positions: Vec<f32> = (0..max_seq_len).map(|i| i as f32).collect();
        let positions = Tensor::new(positions, device)?.unsqueeze(1)?;

        // [seq, head_dim/2]: пары (2i, 2i+1) вращаются одной частотой.
        let freqs = positions.matmul(&inv_freq.unsqueeze(0)?)?;
        Ok(Self {
            cos: freqs.cos()?,
            sin: freqs.sin()?,
        })
    }

    pub fn max_positions(&self) -> usize {
        self.cos.dims()[0]
    }

    /// `x`: `[batch, heads, seq, head_dim]`.
    pub fn apply(&self, x: &Tensor, start_pos: usize) -> Result<Tensor> {
        let seq_len = x.dim(2)?;
        if start_pos + seq_len > self.max_positions() {
            candle_core::bail!(
                "position {} exceeds max_seq_len {}",
                start_pos + seq_len,
                self.max_positions()
            );
        }
        let cos = self.cos.narrow(0, start_pos, seq_len)?.to_dtype(x.dtype())?;
        let sin = self.sin.narrow(0, start_pos, seq_len)?.to_dtype(x.dtype())?;
        // Медленный вариант собран из обычных операций и пропускает градиент
        // к low-rank добавкам wq/wk.
        candle_nn::rotary_emb::rope_i_slow(&x.contiguous()?, &cos, &sin)
    }
}

/// Attention with GQA and LLaMA-Adapter style injection.
#[derive(Debug, Clone)]
pub struct Attention {
    wq: LinearLayer,
    wk: LinearLayer,
    wv: LinearLayer,
    wo: LinearLayer,
    gate: Tensor,
    n_heads: usize,
    n_kv_heads: usize,
    head_dim: usize,
    rope: RotaryEmbedding,
}

impl Attention {
    pub fn new(config: &LlamaConfig, vb: &ParamBuilder, rope: RotaryEmbedding) -> Result<Self> {
        let dim = config.dim;
        let n_heads = config.n_heads;
        let n_kv_heads = config.kv_heads();
        let head_dim = config.head_dim();
        let lora = config.lora_rank();
        let bias = config.w_bias;

        let wq = LinearLayer::new(dim, n_heads * head_dim, "wq", vb, bias, lora)?;
        let wk = LinearLayer::new(dim, n_kv_heads * head_dim, "wk", vb, false, lora)?;
        let wv = LinearLayer::new(dim, n_kv_heads * head_dim, "wv", vb, false, lora)?;
        let wo = LinearLayer::new(n_heads * head_dim, dim, "wo", vb, bias, lora)?;
        let gate = vb
            .in_group(ParamGroup::LmGate)
            .get((1, n_heads, 1, 1), "gate", ParamInit::Zeros)?;

        Ok(Self {
            wq,
            wk,
            wv,
            wo,
            gate,
            n_heads,
            n_kv_heads,
            head_dim,
            rope,
        })
    }

    /// `[b, s, heads*hd]` -> `[b, heads, s, hd]`.
    fn split_heads(&self, x: &Tensor, heads: usize) -> Result<Tensor> {
        let (b, s, _) = x.dims3()?;
        x.reshape((b, s, heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// `x`: `[batch, seq, dim]`; `mask`: additive `[1, 1, seq, start_pos + seq]`;
    /// `injected`: `[batch or 1, adapter_len, dim]`.
    pub fn forward(
        &self,
        x: &Tensor,
        start_pos: usize,
        mask: Option<&Tensor>,
        injected: Option<&Tensor>,
        cache: Option<&mut LayerKvCache>,
    ) -> Result<Tensor> {
        let debug = mm_core::debug::enabled();
        let (batch_size, seq_len, _) = x.dims3()?;

        let q = self.split_heads(&self.wq.forward(x)?, self.n_heads)?;
        let k = self.split_heads(&self.wk.forward(x)?, self.n_kv_heads)?;
        let v = self.split_heads(&self.wv.forward(x)?, self.n_kv_heads)?;

        let q = self.rope.apply(&q, start_pos)?;
        let k = self.rope.apply(&k, start_pos)?;

        let (k, v) = match cache {
            Some(layer_cache) => layer_cache.append(&k, &v)?,
            None => (k, v),
        };

        let kv_repeat = self.n_heads / self.n_kv_heads;
        let k = repeat_kv(&k, kv_repeat)?;
        let v = repeat_kv(&v, kv_repeat)?;

        let scale = (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?)? / scale)?;
        let scores = match mask {
            Some(m) => scores.broadcast_add(&cast(m, scores.dtype())?)?,
            None => scores,
        };
        // Softmax в float32 для стабильности.
        let probs = candle_nn::ops::softmax_last_dim(&scores.to_dtype(DType::F32)?)?
            .to_dtype(q.dtype())?;
        let mut out = probs.matmul(&v)?;

        if let Some(adapter) = injected {
            let (ab, adapter_len, dim) = adapter.dims3()?;
            let adapter = if ab == 1 && batch_size > 1 {
                adapter.broadcast_as((batch_size, adapter_len, dim))?.contiguous()?
            } else {
                adapter.clone()
            };
            let adapter = cast(&adapter, x.dtype())?;
            let gate = cast(&self.gate, DType::F32)?.tanh()?.to_dtype(out.dtype())?;
            let adapter_v = repeat_kv(
                &self.split_heads(&self.wv.forward(&adapter)?, self.n_kv_heads)?,
                kv_repeat,
            )?;
            if adapter_len > 1 {
                let adapter_k = repeat_kv(
                    &self.split_heads(&self.wk.forward(&adapter)?, self.n_kv_heads)?,
                    kv_repeat,
                )?;
                let a_scores = (q.matmul(&adapter_k.t()?)? / scale)?;
                let a_probs = candle_nn::ops::softmax_last_dim(&a_scores.to_dtype(DType::F32)?)?
                    .to_dtype(q.dtype())?
                    .broadcast_mul(&gate)?;
                out = (out + a_probs.matmul(&adapter_v)?)?;
            } else {
                out = out.broadcast_add(&adapter_v.broadcast_mul(&gate)?)?;
            }
            if debug {
                eprintln!(
                    "DEBUG attention: adapter_len={} out dtype={:?}",
                    adapter_len,
                    out.dtype()
                );
            }
        }

        let out = out
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch_size, seq_len, self.n_heads * self.head_dim))?;
        self.wo.forward(&out)
    }
}

/// Повтор KV-голов: `[kv0,kv0, kv1,kv1, ...]`.
fn repeat_kv(x: &Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x.clone());
    }
    let (b, kv, s, d) = x.dims4()?;
    x.unsqueeze(2)?
        .broadcast_as((b, kv, n_rep, s, d))?
        .contiguous()?
        .reshape((b, kv * n_rep, s, d))
}

/// SwiGLU feed-forward.
#[derive(Debug, Clone)]
pub struct FeedForward {
    w1: LinearLayer,
    w2: LinearLayer,
    w3: LinearLayer,
}

impl FeedForward {
    pub fn new(config: &LlamaConfig, vb: &ParamBuilder) -> Result<Self> {
        let dim = config.dim;
        let hidden = config.ffn_hidden_dim();
        let lora = config.lora_rank();
        let bias = config.w_bias;
        Ok(Self {
            w1: LinearLayer::new(dim, hidden, "w1", vb, bias, lora)?,
            w2: LinearLayer::new(hidden, dim, "w2", vb, bias, lora)?,
            w3: LinearLayer::new(dim, hidden, "w3", vb, bias, lora)?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = self.w1.forward(x)?.silu()?;
        let up = self.w3.forward(x)?;
        self.w2.forward(&(gate * up)?)
    }
}

/// Transformer block (pre-norm).
#[derive(Debug, Clone)]
pub struct TransformerBlock {
    attention: Attention,
    feed_forward: FeedForward,
    attention_norm: RmsNorm,
    ffn_norm: RmsNorm,
}

impl TransformerBlock {
    pub fn new(config: &LlamaConfig, vb: &ParamBuilder, rope: RotaryEmbedding) -> Result<Self> {
        Ok(Self {
            attention: Attention::new(config, &vb.pp("attention"), rope)?,
            feed_forward: FeedForward::new(config, &vb.pp("feed_forward"))?,
            attention_norm: RmsNorm::new(config.dim, config.norm_eps, &vb.pp("attention_norm"))?,
            ffn_norm: RmsNorm::new(config.dim, config.norm_eps, &vb.pp("ffn_norm"))?,
        })
    }

    pub fn forward(
        &self,
        x: &Tensor,
        start_pos: usize,
        mask: Option<&Tensor>,
        injected: Option<&Tensor>,
        cache: Option<&mut LayerKvCache>,
    ) -> Result<Tensor> {
        let residual = x;
        let h = self.attention_norm.forward(x)?;
        let h = self
            .attention
            .forward(&h, start_pos, mask, injected, cache)?;
        let h = (residual + h)?;

        let residual = &h;
        let out = self.ffn_norm.forward(&h)?;
        let out = self.feed_forward.forward(&out)?;
        residual + out
    }
}
