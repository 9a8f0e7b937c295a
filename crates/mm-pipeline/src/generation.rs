//! Авторегрессионный цикл генерации с захватом состояний `[AUD*]`.
//!
//! Буфер токенов `[B, total_len]` заполнен pad-ом (id 0), промпты записаны
//! в начало строк. Шаг `cur_pos` прогоняет срез `[prev_pos, cur_pos)` с
//! абсолютной позиции `prev_pos` через KV-кэш. Позиции внутри промпта
//! никогда не перезаписываются сэмплированными токенами.

use candle_core::{Device, Tensor};
use llama_decoder::KvCache;
use mm_core::{GenerationConfig, MmError, MmResult};
use mm_model::{ModalityFeatures, MultimodalModel, StepOutput};
use tracing::debug;

use crate::capture::CaptureTracker;
use crate::output::StopReason;
use crate::sampling::Sampler;

/// Pad-значение незаполненных позиций буфера.
pub const PAD_ID: u32 = 0;

/// Модель, умеющая делать инкрементальный шаг.
pub trait StepModel {
    fn device(&self) -> &Device;

    fn max_seq_len(&self) -> usize;

    fn max_batch_size(&self) -> usize;

    /// Проход по `tokens [B, S]` с позиции `start_pos`: логиты и скрытые
    /// состояния последней позиции.
    fn step(&mut self, tokens: &Tensor, start_pos: usize) -> MmResult<StepOutput>;
}

/// Модель + признаки модальностей + KV-кэш одного вызова генерации.
pub struct ModelSession<'a> {
    model: &'a MultimodalModel,
    features: &'a ModalityFeatures,
    cache: KvCache,
}

impl<'a> ModelSession<'a> {
    pub fn new(model: &'a MultimodalModel, features: &'a ModalityFeatures) -> Self {
        Self {
            model,
            features,
            cache: model.new_cache(),
        }
    }
}

impl StepModel for ModelSession<'_> {
    fn device(&self) -> &Device {
        self.model.device()
    }

    fn max_seq_len(&self) -> usize {
        self.model.max_seq_len()
    }

    fn max_batch_size(&self) -> usize {
        self.model.max_batch_size()
    }

    fn step(&mut self, tokens: &Tensor, start_pos: usize) -> MmResult<StepOutput> {
        self.model
            .forward_inference(tokens, start_pos, self.features, &mut self.cache)
    }
}

/// Итог генерации одной строки батча.
#[derive(Debug, Clone)]
pub struct GeneratedRow {
    /// Сгенерированные токены после обрезки по `max_gen_len` и EOS.
    pub tokens: Vec<u32>,
    pub stop_reason: StopReason,
    /// Состояния `[1, N, D]` по головам проектора, если группа `[AUD*]` полная.
    pub captured: Option<Vec<Tensor>>,
}

/// Состояние строки во время цикла.
struct RowState {
    prompt_len: usize,
    /// Причина и число сохраняемых сгенерированных токенов.
    finished: Option<(StopReason, usize)>,
    tracker: CaptureTracker,
}

pub struct GenerationLoop<'a> {
    config: &'a GenerationConfig,
    eos_id: u32,
    gen_ids: &'a [u32],
}

impl<'a> GenerationLoop<'a> {
    pub fn new(config: &'a GenerationConfig, eos_id: u32, gen_ids: &'a [u32]) -> Self {
        Self {
            config,
            eos_id,
            gen_ids,
        }
    }

    /// Длина буфера: `min(max_seq_len, max_gen_len + max_prompt_len)`.
    pub fn total_len(&self, max_seq_len: usize, max_prompt_len: usize) -> usize {
        max_seq_len.min(self.config.max_gen_len + max_prompt_len)
    }

    pub fn run(&self, model: &mut dyn StepModel, prompts: &[Vec<u32>]) -> MmResult<Vec<GeneratedRow>> {
        self.config.validate()?;
        let bsz = prompts.len();
        if bsz == 0 || bsz > model.max_batch_size() {
            return Err(MmError::Config(format!(
                "batch size {bsz} is outside 1..={}",
                model.max_batch_size()
            )));
        }
        if prompts.iter().any(|p| p.is_empty()) {
            return Err(MmError::Config("empty prompt".into()));
        }
        let min_prompt = prompts.iter().map(Vec::len).min().unwrap_or(0);
        let max_prompt = prompts.iter().map(Vec::len).max().unwrap_or(0);
        if max_prompt >= model.max_seq_len() {
            return Err(MmError::Config(format!(
                "prompt of {max_prompt} tokens leaves no room in max_seq_len={}",
                model.max_seq_len()
            )));
        }
        let total_len = self.total_len(model.max_seq_len(), max_prompt);

        let mut tokens = vec![vec![PAD_ID; total_len]; bsz];
        for (row, prompt) in tokens.iter_mut().zip(prompts) {
            row[..prompt.len()].copy_from_slice(prompt);
        }
        let mut rows: Vec<RowState> = prompts
            .iter()
            .map(|p| RowState {
                prompt_len: p.len(),
                finished: None,
                tracker: CaptureTracker::new(self.gen_ids),
            })
            .collect();
        let mut sampler = Sampler::new(self.config.temperature, self.config.top_p, self.config.seed);
        debug!(
            "Генерация: batch={bsz}, промпты {min_prompt}..{max_prompt}, total_len={total_len}, greedy={}",
            sampler.is_greedy()
        );

        let mut prev_pos = 0;
        for cur_pos in min_prompt..total_len {
            let slice: Vec<u32> = tokens
                .iter()
                .flat_map(|row| row[prev_pos..cur_pos].iter().copied())
                .collect();
            let input = Tensor::from_vec(slice, (bsz, cur_pos - prev_pos), model.device())?;
            let out = model.step(&input, prev_pos)?;
            let sampled = sampler.sample(&out.logits)?;
            if sampled.len() != bsz {
                return Err(MmError::Inference(format!(
                    "sampler returned {} tokens for batch {bsz}",
                    sampled.len()
                )));
            }

            for (b, (state, mut next)) in rows.iter_mut().zip(sampled).enumerate() {
                let in_prompt = cur_pos < state.prompt_len;
                if in_prompt {
                    next = tokens[b][cur_pos];
                } else if state.finished.is_some() {
                    next = PAD_ID;
                }
                tokens[b][cur_pos] = next;
                if state.finished.is_some() {
                    continue;
                }

                let hidden = out
                    .hidden
                    .iter()
                    .map(|h| h.narrow(0, b, 1))
                    .collect::<candle_core::Result<Vec<_>>>()?;
                state.tracker.observe(next, hidden);

                if in_prompt {
                    continue;
                }
                let generated = &tokens[b][state.prompt_len..=cur_pos];
                if next == self.eos_id {
                    state.finished = Some((StopReason::Eos, generated.len() - 1));
                } else if let Some(stop) = self
                    .config
                    .stop_sequences
                    .iter()
                    .find(|s| generated.ends_with(s))
                {
                    state.finished = Some((StopReason::StopSequence, generated.len() - stop.len()));
                }
            }

            if mm_core::debug::enabled() {
                let last: Vec<u32> = tokens.iter().map(|row| row[cur_pos]).collect();
                eprintln!("DEBUG gen: pos={cur_pos}, tokens={last:?}");
            }
            if rows.iter().all(|r| r.finished.is_some()) {
                break;
            }
            prev_pos = cur_pos;
        }

        let mut out = Vec::with_capacity(bsz);
        for (row, state) in tokens.into_iter().zip(rows) {
            let end = (state.prompt_len + self.config.max_gen_len).min(row.len());
            let mut generated = row[state.prompt_len.min(end)..end].to_vec();
            let reason = match state.finished {
                Some((reason, keep)) => {
                    generated.truncate(keep);
                    reason
                }
                None => StopReason::MaxTokens,
            };
            if let Some(eos) = generated.iter().position(|&t| t == self.eos_id) {
                generated.truncate(eos);
            }
            out.push(GeneratedRow {
                tokens: generated,
                stop_reason: reason,
                captured: state.tracker.finish()?,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VOCAB: usize = 16;
    const EOS: u32 = 2;

    /// Модель, которая выдаёт заранее заданные токены по абсолютной позиции.
    struct ScriptedModel {
        /// `script[b][pos]`: токен, который строка `b` должна получить на позиции `pos`.
        script: Vec<Vec<u32>>,
        calls: Vec<(usize, usize)>,
        inputs: Vec<Vec<Vec<u32>>>,
        max_seq_len: usize,
    }

    impl StepModel for ScriptedModel {
        fn device(&self) -> &Device {
            &Device::Cpu
        }

        fn max_seq_len(&self) -> usize {
            self.max_seq_len
        }

        fn max_batch_size(&self) -> usize {
            4
        }

        fn step(&mut self, tokens: &Tensor, start_pos: usize) -> MmResult<StepOutput> {
            let (bsz, seq) = tokens.dims2()?;
            self.calls.push((start_pos, seq));
            self.inputs.push(tokens.to_vec2::<u32>()?);
            let pos = start_pos + seq;
            let mut logits = vec![0f32; bsz * VOCAB];
            for b in 0..bsz {
                let tok = self.script[b].get(pos).copied().unwrap_or(EOS);
                logits[b * VOCAB + tok as usize] = 10.0;
            }
            let logits = Tensor::from_vec(logits, (bsz, VOCAB), &Device::Cpu)?;
            let hidden = Tensor::full(pos as f32, (bsz, 1, 3), &Device::Cpu)?;
            Ok(StepOutput {
                logits,
                hidden: vec![hidden],
            })
        }
    }

    fn scripted(script: Vec<Vec<u32>>) -> ScriptedModel {
        ScriptedModel {
            script,
            calls: Vec::new(),
            inputs: Vec::new(),
            max_seq_len: 32,
        }
    }

    fn greedy(max_gen_len: usize) -> GenerationConfig {
        GenerationConfig {
            max_gen_len,
            ..GenerationConfig::greedy()
        }
    }

    #[test]
    fn test_incremental_slices() {
        let mut model = scripted(vec![vec![1, 5, 6, 7, 8, EOS]]);
        let cfg = greedy(10);
        let rows = GenerationLoop::new(&cfg, EOS, &[]).run(&mut model, &[vec![1, 5]]).unwrap();
        assert_eq!(rows[0].tokens, vec![6, 7, 8]);
        assert_eq!(rows[0].stop_reason, StopReason::Eos);
        // Префилл промпта, затем по одному токену.
        assert_eq!(model.calls, vec![(0, 2), (2, 1), (3, 1), (4, 1)]);
    }

    #[test]
    fn test_prompt_positions_never_overwritten() {
        // Вторая строка длиннее: пока идёт её промпт, модель «хочет» другой токен.
        let mut model = scripted(vec![
            vec![1, 3, 9, 9, 9, 9, 9],
            vec![1, 4, 11, 12, 13, 14, 15],
        ]);
        let cfg = greedy(3);
        let prompts = vec![vec![1, 3], vec![1, 4, 5, 6]];
        let rows = GenerationLoop::new(&cfg, EOS, &[]).run(&mut model, &prompts).unwrap();
        assert_eq!(rows[0].tokens, vec![9, 9, 9]);
        assert_eq!(rows[1].tokens, vec![13, 14, 15]);
        // На следующем шаге модель видит токены промпта, а не свои 11 и 12.
        assert_eq!(model.inputs[1], vec![vec![9], vec![5]]);
        assert_eq!(model.inputs[2], vec![vec![9], vec![6]]);
        assert_eq!(rows[0].stop_reason, StopReason::MaxTokens);
        assert_eq!(rows[1].stop_reason, StopReason::MaxTokens);
    }

    #[test]
    fn test_finished_rows_are_masked() {
        let mut model = scripted(vec![vec![1, 3, EOS, 7, 7], vec![1, 3, 8, 8, EOS]]);
        let cfg = greedy(8);
        let rows = GenerationLoop::new(&cfg, EOS, &[])
            .run(&mut model, &[vec![1, 3], vec![1, 3]])
            .unwrap();
        assert!(rows[0].tokens.is_empty());
        assert_eq!(rows[0].stop_reason, StopReason::Eos);
        assert_eq!(rows[1].tokens, vec![8, 8]);
        // Цикл закончился, как только обе строки дошли до EOS.
        assert_eq!(model.calls.len(), 3);
    }

    #[test]
    fn test_stop_sequence() {
        let mut model = scripted(vec![vec![1, 6, 7, 8, 9, 10]]);
        let cfg = GenerationConfig {
            stop_sequences: vec![vec![8, 9]],
            ..greedy(10)
        };
        let rows = GenerationLoop::new(&cfg, EOS, &[]).run(&mut model, &[vec![1]]).unwrap();
        assert_eq!(rows[0].tokens, vec![6, 7]);
        assert_eq!(rows[0].stop_reason, StopReason::StopSequence);
    }

    #[test]
    fn test_total_len_is_capped() {
        let mut model = scripted(vec![vec![1; 40]]);
        model.max_seq_len = 6;
        let cfg = greedy(100);
        let lp = GenerationLoop::new(&cfg, EOS, &[]);
        assert_eq!(lp.total_len(6, 2), 6);
        let rows = lp.run(&mut model, &[vec![1, 3]]).unwrap();
        assert_eq!(rows[0].tokens.len(), 4);
        assert_eq!(rows[0].stop_reason, StopReason::MaxTokens);
    }

    #[test]
    fn test_full_capture_window() {
        let gen = [12, 13, 14];
        let mut model = scripted(vec![vec![1, 3, 5, 12, 13, 14, 6, EOS]]);
        let cfg = greedy(10);
        let rows = GenerationLoop::new(&cfg, EOS, &gen).run(&mut model, &[vec![1, 3]]).unwrap();
        assert_eq!(rows[0].tokens, vec![5, 12, 13, 14, 6]);
        let captured = rows[0].captured.as_ref().unwrap();
        assert_eq!(captured[0].dims(), &[1, 3, 3]);
        // Состояние шага, породившего токен на позиции p, помечено значением p.
        let v = captured[0].squeeze(0).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(v.iter().map(|r| r[0]).collect::<Vec<_>>(), vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_early_stop_gives_text_only() {
        let gen = [12, 13, 14];
        let mut model = scripted(vec![vec![1, 3, 12, 13, EOS]]);
        let cfg = greedy(10);
        let rows = GenerationLoop::new(&cfg, EOS, &gen).run(&mut model, &[vec![1, 3]]).unwrap();
        assert_eq!(rows[0].tokens, vec![12, 13]);
        assert!(rows[0].captured.is_none());
    }

    #[test]
    fn test_invalid_batches() {
        let cfg = greedy(4);
        let lp = GenerationLoop::new(&cfg, EOS, &[]);
        let mut model = scripted(vec![]);
        assert!(matches!(lp.run(&mut model, &[]), Err(MmError::Config(_))));
        assert!(matches!(lp.run(&mut model, &vec![vec![1]; 5]), Err(MmError::Config(_))));
        assert!(matches!(lp.run(&mut model, &[vec![]]), Err(MmError::Config(_))));
        assert!(matches!(lp.run(&mut model, &[vec![1; 32]]), Err(MmError::Config(_))));
    }
}
