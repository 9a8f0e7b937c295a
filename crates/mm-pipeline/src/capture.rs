//! Захват скрытых состояний на позициях токенов `[AUD*]` во время генерации.
//!
//! Группа начинается, когда сэмплирован ожидаемый первый токен генерации,
//! и дальше захватывает состояния подряд, пока не наберёт `N`. Порядок
//! и непрерывность токенов внутри группы не проверяются.

use candle_core::Tensor;
use mm_core::{MmError, MmResult};

/// Захват одной строки батча.
#[derive(Debug, Clone)]
pub struct CaptureTracker {
    gen_ids: Vec<u32>,
    position: usize,
    /// Захваченные шаги: на каждом шаге по `[1, 1, D]` на голову проектора.
    steps: Vec<Vec<Tensor>>,
}

impl CaptureTracker {
    pub fn new(gen_ids: &[u32]) -> Self {
        Self {
            gen_ids: gen_ids.to_vec(),
            position: 0,
            steps: Vec::new(),
        }
    }

    /// Учесть сэмплированный токен и скрытые состояния шага, который его породил.
    pub fn observe(&mut self, token: u32, hidden: Vec<Tensor>) {
        let Some(&expected) = self.gen_ids.get(self.position) else {
            return;
        };
        if token != expected && self.position == 0 {
            return;
        }
        if self.position == 0 {
            self.steps.clear();
        }
        self.steps.push(hidden);
        self.position += 1;
        if self.position >= self.gen_ids.len() {
            self.position = 0;
        }
    }

    pub fn captured(&self) -> usize {
        self.steps.len()
    }

    /// Группа собрана полностью.
    pub fn is_complete(&self) -> bool {
        !self.gen_ids.is_empty() && self.steps.len() == self.gen_ids.len()
    }

    /// Захваченные состояния `[1, N, D]` по головам проектора, если группа полная.
    pub fn finish(self) -> MmResult<Option<Vec<Tensor>>> {
        if !self.is_complete() {
            return Ok(None);
        }
        let views = self.steps.first().map_or(0, Vec::len);
        let mut out = Vec::with_capacity(views);
        for v in 0..views {
            let parts = self
                .steps
                .iter()
                .map(|step| {
                    step.get(v)
                        .cloned()
                        .ok_or_else(|| MmError::Inference(format!("captured step has no view {v}")))
                })
                .collect::<MmResult<Vec<_>>>()?;
            out.push(Tensor::cat(&parts, 1)?);
        }
        Ok(Some(out))
    }
}
