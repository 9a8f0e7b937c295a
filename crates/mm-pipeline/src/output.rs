//! Результат генерации: текст, причина остановки и (опционально) аудио.

use std::collections::HashMap;
use std::path::Path;

use candle_core::Tensor;
use mm_core::{AudioBuffer, MmError, MmResult};
use regex::Regex;

/// Имя тензора conditioning в сохраняемом safetensors.
pub const CONDITIONING_TENSOR: &str = "conditioning";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Сгенерирован EOS.
    Eos,
    /// Хвост совпал с одной из стоп-последовательностей.
    StopSequence,
    /// Достигнут `max_gen_len` или `max_seq_len`.
    MaxTokens,
}

#[derive(Debug, Clone)]
pub struct MultimodalOutput {
    /// Текст без литералов токенов генерации.
    pub text: String,
    /// Декодированный текст как есть (с `[AUD*]`).
    pub raw: String,
    /// Сгенерированные id после обрезки.
    pub tokens: Vec<u32>,
    pub stop_reason: StopReason,
    /// Conditioning аудио-генератора `[1, T', D_out]`, если группа `[AUD*]` собрана полностью.
    pub audio_conditioning: Option<Tensor>,
    /// Синтезированное аудио (только при подключённом генераторе).
    pub audio: Option<AudioBuffer>,
}

impl MultimodalOutput {
    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    pub fn save_audio(&self, path: impl AsRef<Path>) -> MmResult<()> {
        let audio = self
            .audio
            .as_ref()
            .ok_or_else(|| MmError::Inference("в выходе нет аудио".into()))?;
        audio::save_wav(path, audio)
    }

    /// Сохранить conditioning в safetensors (тензор `conditioning`).
    pub fn save_conditioning(&self, path: impl AsRef<Path>) -> MmResult<()> {
        let conditioning = self
            .audio_conditioning
            .as_ref()
            .ok_or_else(|| MmError::Inference("в выходе нет conditioning".into()))?;
        let tensors = HashMap::from([(CONDITIONING_TENSOR.to_string(), conditioning.clone())]);
        candle_core::safetensors::save(&tensors, path.as_ref())?;
        Ok(())
    }
}

/// Убрать литералы `[AUD3]`, `[IMG0]`, `[VID1]` из текста.
pub fn strip_generation_tokens(raw: &str) -> MmResult<String> {
    let re = Regex::new(r"\s*\[(?:AUD|IMG|VID)\d+\]").map_err(|e| MmError::Inference(e.to_string()))?;
    Ok(re.replace_all(raw, "").trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_strip_generation_tokens() {
        assert_eq!(
            strip_generation_tokens("Here is a calm song [AUD0][AUD1] [AUD2]").unwrap(),
            "Here is a calm song"
        );
        assert_eq!(strip_generation_tokens("no tokens").unwrap(), "no tokens");
    }

    #[test]
    fn test_save_conditioning() {
        let out = MultimodalOutput {
            text: String::new(),
            raw: String::new(),
            tokens: vec![],
            stop_reason: StopReason::Eos,
            audio_conditioning: Some(Tensor::ones((1, 2, 3), candle_core::DType::F32, &Device::Cpu).unwrap()),
            audio: None,
        };
        assert!(!out.has_audio());
        assert!(out.save_audio("unused.wav").is_err());
        let path = std::env::temp_dir().join(format!("rustmugen-cond-{}.safetensors", std::process::id()));
        out.save_conditioning(&path).unwrap();
        let loaded = candle_core::safetensors::load(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded[CONDITIONING_TENSOR].dims(), &[1, 2, 3]);
        let _ = std::fs::remove_file(&path);
    }
}
