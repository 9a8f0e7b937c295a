//! Output projector: LLM hidden states at `[AUD{i}]` positions -> conditioning
//! sequence of the audio generator.
//!
//! One head per configured LLM layer ("view"); head outputs are summed.
//! A head mixes the hidden state with the raw token embedding, maps
//! `D -> D_out`, changes the sequence length `N -> T'` and applies a final
//! `D_out -> D_out` map.

use candle_core::{Result, Tensor};
use mm_core::{ParamGroup, ParamStore, ProjectorConfig};
use modality_bridge::Dense;

pub const PROJECTOR_NAME: &str = "output_projector";

#[derive(Debug, Clone)]
struct ProjectorHead {
    fc: Dense,
    seq: Dense,
    out: Dense,
}

impl ProjectorHead {
    fn forward(&self, hidden: &Tensor, token_emb: &Tensor) -> Result<Tensor> {
        let x = hidden.broadcast_add(&token_emb.to_dtype(hidden.dtype())?)?;
        let x = self.fc.forward(&x)?.gelu()?;
        // [B, N, D_out] -> [B, D_out, N] -> [B, D_out, T'] -> [B, T', D_out]
        let x = self.seq.forward(&x.transpose(1, 2)?.contiguous()?)?;
        let x = x.transpose(1, 2)?.contiguous()?;
        self.out.forward(&x)
    }
}

#[derive(Debug, Clone)]
pub struct OutputProjector {
    heads: Vec<ProjectorHead>,
    num_input_tokens: usize,
    config: ProjectorConfig,
}

impl OutputProjector {
    pub fn new(
        config: &ProjectorConfig,
        hidden_dim: usize,
        num_input_tokens: usize,
        store: &ParamStore,
    ) -> Result<Self> {
        let vb = store.builder(ParamGroup::OutputProjector).pp(PROJECTOR_NAME);
        let d_out = config.output_dim;
        let heads = (0..config.input_layers.len().max(1))
            .map(|h| {
                let vb = vb.pp(h);
                Ok(ProjectorHead {
                    fc: Dense::new(hidden_dim, d_out, true, &vb.pp("fc"))?,
                    seq: Dense::new(num_input_tokens, config.num_output_tokens, true, &vb.pp("seq"))?,
                    out: Dense::new(d_out, d_out, true, &vb.pp("out"))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            heads,
            num_input_tokens,
            config: config.clone(),
        })
    }

    pub fn num_views(&self) -> usize {
        self.heads.len()
    }

    pub fn num_input_tokens(&self) -> usize {
        self.num_input_tokens
    }

    pub fn config(&self) -> &ProjectorConfig {
        &self.config
    }

    /// `views`: по тензору `[B, N, D]` на голову, `token_emb`: `[B, N, D]`.
    /// Возвращает `[B, T', D_out]` (сумма голов).
    pub fn forward(&self, views: &[Tensor], token_emb: &Tensor) -> Result<Tensor> {
        if views.len() != self.heads.len() {
            candle_core::bail!(
                "projector expects {} hidden views, got {}",
                self.heads.len(),
                views.len()
            );
        }
        let mut acc: Option<Tensor> = None;
        for (head, view) in self.heads.iter().zip(views) {
            let (_, n, _) = view.dims3()?;
            if n != self.num_input_tokens {
                candle_core::bail!(
                    "projector expects {} generation positions, got {n}",
                    self.num_input_tokens
                );
            }
            let y = head.forward(view, token_emb)?;
            acc = Some(match acc {
                Some(a) => (a + y)?,
                None => y,
            });
        }
        acc.ok_or_else(|| candle_core::Error::Msg("projector has no heads".into()))
    }
}
