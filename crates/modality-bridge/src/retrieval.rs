//! kNN-сглаживание признаков по индексу прототипов.
//!
//! По нормализованному запросу из индекса берутся `cache_size` ближайших
//! прототипов, их softmax(sim * cache_t)-среднее смешивается с исходным признаком.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use mm_core::{MmError, MmResult, RetrievalConfig, RetrievalIndex};
use tracing::{debug, info, warn};

use crate::mixing::l2_normalize;

/// Имя тензора с векторами в файле индекса.
pub const INDEX_TENSOR: &str = "vectors";

/// Точный индекс по скалярному произведению, целиком в памяти.
#[derive(Debug, Clone)]
pub struct FlatIpIndex {
    data: Vec<f32>,
    dim: usize,
}

impl FlatIpIndex {
    /// Индекс из плоского буфера `len * dim`.
    pub fn new(data: Vec<f32>, dim: usize) -> MmResult<Self> {
        if dim == 0 || data.len() % dim != 0 {
            return Err(MmError::Config(format!(
                "index buffer of {} floats is not a multiple of dim={dim}",
                data.len()
            )));
        }
        Ok(Self { data, dim })
    }

    pub fn from_tensor(vectors: &Tensor) -> MmResult<Self> {
        let (_, dim) = vectors.dims2()?;
        let data = vectors
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        Self::new(data, dim)
    }

    /// Загрузить индекс из safetensors (тензор `vectors [N, D]`).
    pub fn load(path: impl AsRef<Path>) -> MmResult<Self> {
        let path = path.as_ref();
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
        let vectors = tensors.get(INDEX_TENSOR).ok_or_else(|| {
            MmError::Checkpoint(format!(
                "{}: tensor '{INDEX_TENSOR}' not found",
                path.display()
            ))
        })?;
        let index = Self::from_tensor(vectors)?;
        info!(
            "Индекс прототипов загружен: {} векторов, dim={}",
            index.len(),
            index.dim
        );
        Ok(index)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> MmResult<()> {
        let vectors = Tensor::from_slice(&self.data, (self.len(), self.dim), &Device::Cpu)?;
        let map: HashMap<String, Tensor> = [(INDEX_TENSOR.to_string(), vectors)].into();
        candle_core::safetensors::save(&map, path)?;
        Ok(())
    }

    fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }
}

impl RetrievalIndex for FlatIpIndex {
    fn dim(&self) -> usize {
        self.dim
    }

    fn len(&self) -> usize {
        self.data.len() / self.dim
    }

    fn search(&self, query: &Tensor, k: usize) -> MmResult<(Vec<Vec<f32>>, Vec<Vec<i64>>)> {
        let rows = query.to_device(&Device::Cpu)?.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        let mut sims = Vec::with_capacity(rows.len());
        let mut ids = Vec::with_capacity(rows.len());
        for q in rows {
            if q.len() != self.dim {
                return Err(MmError::Inference(format!(
                    "query dim {} does not match index dim {}",
                    q.len(),
                    self.dim
                )));
            }
            let mut scored: Vec<(f32, i64)> = (0..self.len())
                .map(|i| {
                    let s = self.row(i).iter().zip(&q).map(|(a, b)| a * b).sum();
                    (s, i as i64)
                })
                .collect();
            scored.sort_by(|a, b| b.0.total_cmp(&a.0));
            scored.truncate(k);
            sims.push(scored.iter().map(|(s, _)| *s).collect());
            ids.push(scored.iter().map(|(_, i)| *i).collect());
        }
        Ok((sims, ids))
    }

    fn reconstruct(&self, id: i64) -> MmResult<Vec<f32>> {
        let i = usize::try_from(id)
            .ok()
            .filter(|i| *i < self.len())
            .ok_or_else(|| MmError::Inference(format!("index id {id} out of range")))?;
        Ok(self.row(i).to_vec())
    }
}

/// Сглаживание признака по ближайшим прототипам.
#[derive(Debug, Clone)]
pub struct RetrievalBlend {
    config: RetrievalConfig,
}

impl RetrievalBlend {
    pub fn new(config: RetrievalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// `feature [B, D]` -> сглаженный и нормализованный `[B, D]`.
    ///
    /// Если индекс вернул меньше `cache_size` соседей, softmax считается по
    /// тем, что есть. Строка без соседей возвращается без изменений.
    pub fn apply(&self, index: &dyn RetrievalIndex, feature: &Tensor) -> MmResult<Tensor> {
        let (batch, dim) = feature.dims2()?;
        if dim != index.dim() {
            return Err(MmError::Config(format!(
                "retrieval index dim {} does not match feature dim {dim}",
                index.dim()
            )));
        }
        let raw = feature.to_dtype(DType::F32)?;
        let query = l2_normalize(&raw)?;
        let (sims, ids) = index.search(&query, self.config.cache_size)?;
        let rows = raw.to_device(&Device::Cpu)?.to_vec2::<f32>()?;

        let w = self.config.cache_weight;
        let mut out = Vec::with_capacity(batch * dim);
        for (b, original) in rows.iter().enumerate() {
            let neighbours: Vec<(f32, i64)> = sims
                .get(b)
                .zip(ids.get(b))
                .map(|(s, i)| s.iter().copied().zip(i.iter().copied()).filter(|(_, id)| *id >= 0).collect())
                .unwrap_or_default();
            if neighbours.is_empty() {
                warn!("Индекс не вернул соседей для строки {b}, сглаживание пропущено");
                out.extend_from_slice(original);
                continue;
            }
            if neighbours.len() < self.config.cache_size {
                debug!(
                    "Строка {b}: {} соседей вместо {}",
                    neighbours.len(),
                    self.config.cache_size
                );
            }

            let probs = softmax_scaled(neighbours.iter().map(|(s, _)| *s), self.config.cache_t);
            let mut proto = vec![0f32; dim];
            for (p, (_, id)) in probs.iter().zip(&neighbours) {
                let v = index.reconstruct(*id)?;
                for (acc, x) in proto.iter_mut().zip(v) {
                    *acc += p * x;
                }
            }
            normalize_in_place(&mut proto);
            let mut blended: Vec<f32> = original
                .iter()
                .zip(&proto)
                .map(|(o, r)| (1.0 - w) * o + w * r)
                .collect();
            normalize_in_place(&mut blended);
            out.extend(blended);
        }

        let result = Tensor::from_vec(out, (batch, dim), &Device::Cpu)?
            .to_device(feature.device())?
            .to_dtype(feature.dtype())?;
        Ok(result)
    }
}

fn softmax_scaled(scores: impl Iterator<Item = f32>, t: f32) -> Vec<f32> {
    let scaled: Vec<f32> = scores.map(|s| s * t).collect();
    let max = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = scaled.iter().map(|s| (s - max).exp()).collect();
    let sum: f32 = exp.iter().sum();
    exp.into_iter().map(|e| e / sum).collect()
}

fn normalize_in_place(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-12);
    for x in v.iter_mut() {
        *x /= norm;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> FlatIpIndex {
        FlatIpIndex::new(vec![1.0, 0.0, 0.0, 1.0, -1.0, 0.0], 2).unwrap()
    }

    #[test]
    fn test_search_orders_by_inner_product() {
        let idx = index();
        let q = Tensor::new(&[[0.9f32, 0.1]], &Device::Cpu).unwrap();
        let (sims, ids) = idx.search(&q, 2).unwrap();
        assert_eq!(ids, vec![vec![0, 1]]);
        assert!((sims[0][0] - 0.9).abs() < 1e-6);
        assert!(idx.reconstruct(3).is_err());
        assert!(idx.reconstruct(-1).is_err());
    }

    #[test]
    fn test_small_index_reduces_cache_size() {
        // cache_size больше размера индекса: берутся все три вектора.
        let blend = RetrievalBlend::new(RetrievalConfig {
            cache_size: 10,
            cache_t: 20.0,
            cache_weight: 0.5,
        });
        let feature = Tensor::new(&[[2f32, 0.0]], &Device::Cpu).unwrap();
        let out = blend.apply(&index(), &feature).unwrap().to_vec2::<f32>().unwrap();
        let norm = (out[0][0].powi(2) + out[0][1].powi(2)).sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(out[0][0] > 0.99);
    }

    #[test]
    fn test_zero_weight_keeps_query() {
        let blend = RetrievalBlend::new(RetrievalConfig {
            cache_size: 1,
            cache_t: 1.0,
            cache_weight: 0.0,
        });
        let feature = Tensor::new(&[[0f32, 3.0]], &Device::Cpu).unwrap();
        let out = blend.apply(&index(), &feature).unwrap().to_vec2::<f32>().unwrap();
        assert!((out[0][1] - 1.0).abs() < 1e-6);
    }

    struct EmptyIndex;

    impl RetrievalIndex for EmptyIndex {
        fn dim(&self) -> usize {
            2
        }
        fn len(&self) -> usize {
            0
        }
        fn search(&self, query: &Tensor, k: usize) -> MmResult<(Vec<Vec<f32>>, Vec<Vec<i64>>)> {
            let b = query.dim(0)?;
            Ok((vec![vec![0.0; k]; b], vec![vec![-1; k]; b]))
        }
        fn reconstruct(&self, id: i64) -> MmResult<Vec<f32>> {
            Err(MmError::Inference(format!("no vector {id}")))
        }
    }

    #[test]
    fn test_row_without_neighbours_is_skipped() {
        let blend = RetrievalBlend::new(RetrievalConfig::default());
        let feature = Tensor::new(&[[0f32, 4.0]], &Device::Cpu).unwrap();
        let out = blend.apply(&EmptyIndex, &feature).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(out[0], vec![0.0, 4.0]);
    }

    #[test]
    fn test_blend_keeps_unnormalized_mix() {
        // Смесь двух единичных входов с равными весами имеет норму < 1:
        // с прототипом смешивается именно она, а не нормализованный запрос.
        let a = Tensor::new(&[[1f32, 0.0]], &Device::Cpu).unwrap();
        let b = Tensor::new(&[[0f32, 1.0]], &Device::Cpu).unwrap();
        let mixed = crate::mixing::mix_weighted(&[(a, 1.0), (b, 1.0)]).unwrap();
        let index = FlatIpIndex::new(vec![1.0, 0.0], 2).unwrap();
        let blend = RetrievalBlend::new(RetrievalConfig {
            cache_size: 1,
            cache_t: 20.0,
            cache_weight: 0.5,
        });
        let out = blend.apply(&index, &mixed).unwrap().to_vec2::<f32>().unwrap();
        // 0.5 * [0.5, 0.5] + 0.5 * [1, 0] = [0.75, 0.25], затем нормализация.
        assert!((out[0][0] - 0.948_683).abs() < 1e-4, "{:?}", out[0]);
        assert!((out[0][1] - 0.316_228).abs() < 1e-4, "{:?}", out[0]);
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("rustmugen-index-{}.safetensors", std::process::id()));
        index().save(&path).unwrap();
        let loaded = FlatIpIndex::load(&path).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.reconstruct(2).unwrap(), vec![-1.0, 0.0]);
        let _ = std::fs::remove_file(&path);
    }
}
