//! Channel aggregation: 1x1 convolution over the encoder's channel axis.
//!
//! MERT отдаёт 25 скрытых состояний, ViT/ViViT по вектору на токен.
//! Свёртка с ядром 1 сворачивает их в один вектор признаков.

use candle_core::{Result, Tensor};
use mm_core::{ParamBuilder, ParamInit};

/// `Conv1d(channels -> 1, kernel = 1)`: weight `[1, channels, 1]`, bias `[1]`.
#[derive(Debug, Clone)]
pub struct ChannelAggregator {
    weight: Tensor,
    bias: Tensor,
    channels: usize,
}

impl ChannelAggregator {
    pub fn new(channels: usize, vb: &ParamBuilder) -> Result<Self> {
        let weight = vb.get((1, channels, 1), "weight", ParamInit::linear(channels))?;
        let bias = vb.get(1, "bias", ParamInit::linear(channels))?;
        Ok(Self {
            weight,
            bias,
            channels,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// `[batch, channels, dim]` (or `[channels, dim]`) -> `[batch, dim]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = match x.rank() {
            2 => x.unsqueeze(0)?,
            3 => x.clone(),
            r => candle_core::bail!("channel aggregator expects rank 2 or 3, got {r}"),
        };
        let (batch, channels, dim) = x.dims3()?;
        if channels != self.channels {
            candle_core::bail!(
                "channel aggregator expects {} channels, got {channels}",
                self.channels
            );
        }
        let dtype = self.weight.dtype();
        let w = self.weight.reshape((1, 1, channels))?;
        let w = w.broadcast_as((batch, 1, channels))?.contiguous()?;
        let x_in = if x.dtype() == dtype { x.clone() } else { x.to_dtype(dtype)? };
        let y = w.matmul(&x_in.contiguous()?)?.squeeze(1)?;
        let y = y.broadcast_add(&self.bias)?;
        debug_assert_eq!(y.dims(), &[batch, dim]);
        if x.dtype() == dtype {
            Ok(y)
        } else {
            y.to_dtype(x.dtype())
        }
    }
}
