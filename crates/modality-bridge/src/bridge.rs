//! Feature bridge: encoder space -> LLM hidden space.
//!
//! Per modality: channel aggregation, weighted mixing of inputs, optional
//! retrieval smoothing, a projection `D_enc -> D` and three gated residual
//! blocks `x + f2(silu(f1(norm(x))) * f3(norm(x)))`.

use candle_core::{Result, Tensor};
use candle_nn::ops::silu;
use mm_core::{EncoderSpec, MmResult, Modality, ParamBuilder, ParamGroup, ParamStore, RetrievalIndex};
use tracing::debug;

use crate::aggregate::ChannelAggregator;
use crate::layers::{BridgeNorm, Dense};
use crate::mixing::mix_weighted;
use crate::retrieval::RetrievalBlend;

/// Number of gated residual blocks per bridge.
pub const BRIDGE_BLOCKS: usize = 3;

/// One gated residual block.
#[derive(Debug, Clone)]
pub struct BridgeBlock {
    norm: BridgeNorm,
    f1: Dense,
    f2: Dense,
    f3: Dense,
}

impl BridgeBlock {
    pub fn new(dim: usize, legacy: bool, vb: &ParamBuilder) -> Result<Self> {
        Ok(Self {
            norm: BridgeNorm::new(dim, legacy, &vb.pp("norm"))?,
            f1: Dense::new(dim, dim, legacy, &vb.pp("f1"))?,
            f2: Dense::new(dim, dim, legacy, &vb.pp("f2"))?,
            f3: Dense::new(dim, dim, legacy, &vb.pp("f3"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let normed = self.norm.forward(x)?;
        let gated = (silu(&self.f1.forward(&normed)?)? * self.f3.forward(&normed)?)?;
        x + self.f2.forward(&gated)?
    }
}

/// Bridge of one modality.
#[derive(Debug, Clone)]
pub struct FeatureBridge {
    modality: Modality,
    agg: ChannelAggregator,
    proj: Dense,
    blocks: [BridgeBlock; BRIDGE_BLOCKS],
}

impl FeatureBridge {
    /// Parameters under `bridge.{modality}` in the modality's bridge group.
    pub fn new(spec: &EncoderSpec, hidden_dim: usize, legacy: bool, store: &ParamStore) -> Result<Self> {
        let modality = spec.modality;
        let vb = store
            .builder(ParamGroup::Bridge(modality))
            .pp("bridge")
            .pp(modality.as_str());
        let blocks = vb.pp("blocks");
        Ok(Self {
            modality,
            agg: ChannelAggregator::new(spec.channels, &vb.pp("agg"))?,
            proj: Dense::new(spec.feature_dim, hidden_dim, true, &vb.pp("proj"))?,
            blocks: [
                BridgeBlock::new(hidden_dim, legacy, &blocks.pp(0))?,
                BridgeBlock::new(hidden_dim, legacy, &blocks.pp(1))?,
                BridgeBlock::new(hidden_dim, legacy, &blocks.pp(2))?,
            ],
        })
    }

    pub fn modality(&self) -> Modality {
        self.modality
    }

    /// `[B, channels, D_enc]` -> `[B, D_enc]`.
    pub fn aggregate(&self, encoded: &Tensor) -> Result<Tensor> {
        self.agg.forward(encoded)
    }

    /// `[B, D_enc]` -> `[B, 1, D]`: projection and the gated blocks.
    pub fn project(&self, feature: &Tensor) -> Result<Tensor> {
        let mut x = self.proj.forward(&feature.unsqueeze(1)?)?;
        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        Ok(x)
    }

    /// Весь путь модальности: агрегация каждого входа, смешивание с весами,
    /// опциональное kNN-сглаживание, проекция.
    ///
    /// `inputs`: пары (`[B, channels, D_enc]`, вес).
    pub fn forward(
        &self,
        inputs: &[(Tensor, f32)],
        retrieval: Option<(&RetrievalBlend, &dyn RetrievalIndex)>,
    ) -> MmResult<Tensor> {
        let aggregated = inputs
            .iter()
            .map(|(encoded, w)| Ok((self.aggregate(encoded)?, *w)))
            .collect::<Result<Vec<_>>>()?;
        let mut feature = mix_weighted(&aggregated)?;
        if let Some((blend, index)) = retrieval {
            feature = blend.apply(index, &feature)?;
        }
        let out = self.project(&feature)?;
        debug!("Мост {}: {} входов -> {:?}", self.modality, inputs.len(), out.dims());
        Ok(out)
    }
}

/// Bridges of all modalities, indexed by [`Modality::index`].
#[derive(Debug, Clone)]
pub struct BridgeSet {
    bridges: [FeatureBridge; Modality::COUNT],
}

impl BridgeSet {
    /// `specs` are looked up by modality; missing ones fall back to the defaults.
    pub fn new(specs: &[EncoderSpec], hidden_dim: usize, legacy: bool, store: &ParamStore) -> Result<Self> {
        let spec_for = |m: Modality| {
            specs
                .iter()
                .find(|s| s.modality == m)
                .cloned()
                .unwrap_or_else(|| EncoderSpec::default_for(m))
        };
        Ok(Self {
            bridges: [
                FeatureBridge::new(&spec_for(Modality::Audio), hidden_dim, legacy, store)?,
                FeatureBridge::new(&spec_for(Modality::Image), hidden_dim, legacy, store)?,
                FeatureBridge::new(&spec_for(Modality::Video), hidden_dim, legacy, store)?,
            ],
        })
    }

    pub fn get(&self, modality: Modality) -> &FeatureBridge {
        &self.bridges[modality.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &FeatureBridge> {
        self.bridges.iter()
    }
}
