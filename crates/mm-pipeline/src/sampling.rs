//! Выбор следующего токена: greedy или nucleus (top-p) сэмплинг.

use candle_core::{Tensor, D};
use mm_core::{MmError, MmResult};
use rand::distributions::Distribution;
use rand::SeedableRng;

/// Оставить минимальный префикс токенов (по убыванию вероятности), масса
/// которого достигает `top_p`, и перенормировать.
///
/// Возвращает пары (id токена, вероятность). Токен исключается, если масса
/// строго более вероятных токенов уже больше `top_p`, поэтому arg-max
/// остаётся всегда.
pub fn top_p_filter(probs: &[f32], top_p: f32) -> Vec<(u32, f32)> {
    let mut sorted: Vec<(u32, f32)> = probs
        .iter()
        .enumerate()
        .map(|(i, &p)| (i as u32, p))
        .collect();
    sorted.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut kept = Vec::new();
    let mut mass_before = 0f32;
    for (id, p) in sorted {
        if mass_before > top_p {
            break;
        }
        mass_before += p;
        kept.push((id, p));
    }
    let total: f32 = kept.iter().map(|(_, p)| p).sum();
    if total > 0.0 {
        for (_, p) in kept.iter_mut() {
            *p /= total;
        }
    }
    kept
}

/// Сэмплер следующего токена для батча логитов.
#[derive(Debug)]
pub struct Sampler {
    temperature: f32,
    top_p: f32,
    rng: rand::rngs::StdRng,
}

impl Sampler {
    pub fn new(temperature: f32, top_p: f32, seed: u64) -> Self {
        Self {
            temperature,
            top_p,
            rng: rand::rngs::StdRng::seed_from_u64(seed),
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }

    /// `logits [B, V]` -> id токена на каждую строку.
    pub fn sample(&mut self, logits: &Tensor) -> MmResult<Vec<u32>> {
        if self.is_greedy() {
            return Ok(logits.argmax(D::Minus1)?.to_vec1::<u32>()?);
        }
        let scaled = (logits.to_dtype(candle_core::DType::F32)? / self.temperature as f64)?;
        let probs = candle_nn::ops::softmax_last_dim(&scaled)?.to_vec2::<f32>()?;
        probs.iter().map(|row| self.sample_row(row)).collect()
    }

    fn sample_row(&mut self, probs: &[f32]) -> MmResult<u32> {
        let kept = top_p_filter(probs, self.top_p);
        let weights: Vec<f32> = kept.iter().map(|(_, p)| *p).collect();
        let distr = rand::distributions::WeightedIndex::new(&weights)
            .map_err(|e| MmError::Inference(format!("Некорректное распределение токенов: {e}")))?;
        Ok(kept[distr.sample(&mut self.rng)].0)
    }
}
