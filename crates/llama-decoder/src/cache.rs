//! KV-кеш для авторегрессивной генерации.
//!
//! Хранит K/V для каждого слоя в формате `[batch, kv_heads, seq, head_dim]`.

use candle_core::{Result, Tensor};

#[derive(Debug, Clone, Default)]
pub struct LayerKvCache {
    pub k: Option<Tensor>,
    pub v: Option<Tensor>,
}

impl LayerKvCache {
    pub fn seq_len(&self) -> usize {
        self.k.as_ref().map(|t| t.dim(2).unwrap_or(0)).unwrap_or(0)
    }

    /// Дописать новые K/V и вернуть накопленные.
    pub fn append(&mut self, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        let (k, v) = match (&self.k, &self.v) {
            (Some(ck), Some(cv)) => (Tensor::cat(&[ck, k], 2)?, Tensor::cat(&[cv, v], 2)?),
            _ => (k.clone(), v.clone()),
        };
        self.k = Some(k.clone());
        self.v = Some(v.clone());
        Ok((k, v))
    }
}

#[derive(Debug, Clone)]
pub struct KvCache {
    pub layers: Vec<LayerKvCache>,
}

impl KvCache {
    pub fn new(num_layers: usize) -> Self {
        Self {
            layers: (0..num_layers).map(|_| LayerKvCache::default()).collect(),
        }
    }

    pub fn layer_mut(&mut self, idx: usize) -> Option<&mut LayerKvCache> {
        self.layers.get_mut(idx)
    }

    /// Сколько позиций уже в кеше.
    pub fn seq_len(&self) -> usize {
        self.layers.first().map(|l| l.seq_len()).unwrap_or(0)
    }

    pub fn reset(&mut self) {
        for l in &mut self.layers {
            *l = LayerKvCache::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_append_grows_seq() {
        let mut c = LayerKvCache::default();
        let t = Tensor::zeros((1, 2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        c.append(&t, &t).unwrap();
        let (k, _) = c.append(&t.narrow(2, 0, 1).unwrap(), &t.narrow(2, 0, 1).unwrap()).unwrap();
        assert_eq!(k.dims(), &[1, 2, 4, 4]);
        assert_eq!(c.seq_len(), 4);

        let mut kv = KvCache::new(2);
        *kv.layer_mut(0).unwrap() = c;
        assert_eq!(kv.seq_len(), 4);
        kv.reset();
        assert_eq!(kv.seq_len(), 0);
        assert!(kv.layer_mut(2).is_none());
    }
}
