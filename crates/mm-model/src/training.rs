//! Обучающий проход: типы датасетов, лоссы, окно захвата.

use std::ops::Range;

use candle_core::{DType, Tensor, D};
use mm_core::{MmError, MmResult, Modality, TrainingStage};

use crate::conditioning::ModalityFeatures;

/// Тип обучающего примера: модальность входа и выхода.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatasetType {
    ImageToText,
    VideoToText,
    AudioToText,
    TextToAudio,
    TextToText,
    ImageToAudio,
    VideoToAudio,
    AudioToAudio,
}

impl DatasetType {
    pub fn all() -> [DatasetType; 8] {
        use DatasetType::*;
        [
            ImageToText,
            VideoToText,
            AudioToText,
            TextToAudio,
            TextToText,
            ImageToAudio,
            VideoToAudio,
            AudioToAudio,
        ]
    }

    /// Модальность входа (None для текста).
    pub fn input_modality(self) -> Option<Modality> {
        use DatasetType::*;
        match self {
            ImageToText | ImageToAudio => Some(Modality::Image),
            VideoToText | VideoToAudio => Some(Modality::Video),
            AudioToText | AudioToAudio => Some(Modality::Audio),
            TextToAudio | TextToText => None,
        }
    }

    /// На выходе аудио: в цели есть `[AUD*]` и считается MSE проектора.
    pub fn produces_audio(self) -> bool {
        use DatasetType::*;
        matches!(self, TextToAudio | ImageToAudio | VideoToAudio | AudioToAudio)
    }

    /// Допустим ли тип на стадии.
    pub fn allowed_in(self, stage: TrainingStage) -> bool {
        use DatasetType::*;
        match stage {
            TrainingStage::EncoderAlignment => matches!(self, ImageToText | VideoToText | AudioToText),
            TrainingStage::DecoderAlignment => self == TextToAudio,
            TrainingStage::InstructionTuning => true,
        }
    }

    /// Парсинг имени из манифеста датасета (`"AudioToText"`).
    pub fn from_name(name: &str) -> Option<DatasetType> {
        Self::all().into_iter().find(|t| format!("{t:?}") == name)
    }

    /// Проверить пример до прямого прохода.
    pub fn check(
        self,
        stage: TrainingStage,
        features: &ModalityFeatures,
        has_caption_embedding: bool,
    ) -> MmResult<()> {
        if !self.allowed_in(stage) {
            return Err(MmError::Config(format!(
                "{self:?} is not trained in stage {}",
                stage.number()
            )));
        }
        if let Some(m) = self.input_modality() {
            if features.get(m).is_none() {
                return Err(MmError::DataPipeline(format!("{self:?} example without {m} input")));
            }
        }
        if self.produces_audio() && !has_caption_embedding {
            return Err(MmError::DataPipeline(format!(
                "{self:?} example without target caption embedding"
            )));
        }
        Ok(())
    }
}

/// Один обучающий батч.
#[derive(Debug, Clone)]
pub struct TrainBatch {
    /// `[B, S]` u32.
    pub tokens: Tensor,
    /// `[B, S]` u32, 0 = не учитывать.
    pub labels: Tensor,
    pub features: ModalityFeatures,
    /// Эмбеддинг подписи от текстового энкодера генератора `[B, T', D_out]`.
    pub caption_embedding: Option<Tensor>,
}

/// Результат обучающего прохода.
#[derive(Debug, Clone)]
pub struct TrainOutput {
    /// `ce + loss_scale * mse`, скаляр.
    pub loss: Tensor,
    pub ce: Tensor,
    pub mse: Option<Tensor>,
    pub accuracy: f32,
}

/// Окно захвата в сдвинутых метках: позиции `s..s+N`, где `targets[s]`
/// это первый токен генерации. Токены окна обязаны идти подряд и по порядку.
pub fn capture_window(targets: &[u32], gen_ids: &[u32]) -> MmResult<Range<usize>> {
    let Some(&first) = gen_ids.first() else {
        return Err(MmError::Config("no generation tokens".into()));
    };
    let start = targets.iter().position(|&t| t == first).ok_or_else(|| {
        MmError::DataPipeline(format!("target sequence has no generation token {first}"))
    })?;
    let window = start..start + gen_ids.len();
    if targets.get(window.clone()) != Some(gen_ids) {
        return Err(MmError::DataPipeline(format!(
            "generation tokens at {window:?} are not {gen_ids:?}"
        )));
    }
    Ok(window)
}

/// Cross-entropy по `logits [N, V]` и `labels [N]` (u32), метка 0 игнорируется.
///
/// Если все метки нулевые, лосс равен нулю (но связан с графом).
pub fn masked_cross_entropy(logits: &Tensor, labels: &Tensor) -> candle_core::Result<Tensor> {
    let logits = logits.to_dtype(DType::F32)?;
    let mask = labels.ne(0u32)?.to_dtype(DType::F32)?;
    let count = mask.sum_all()?.to_scalar::<f32>()?;
    if count == 0.0 {
        return logits.mean_all()? * 0.0;
    }
    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let picked = log_probs
        .gather(&labels.contiguous()?.unsqueeze(1)?, 1)?
        .squeeze(1)?;
    (picked * mask)?.sum_all()?.neg()? / count as f64
}

/// Доля верно предсказанных меток: `correct / (valid + 1)`.
pub fn token_accuracy(logits: &Tensor, labels: &Tensor) -> candle_core::Result<f32> {
    let predicted = logits.argmax(D::Minus1)?.to_dtype(DType::U32)?;
    let valid = labels.ne(0u32)?;
    let correct = predicted.eq(labels)?.mul(&valid)?;
    let correct = correct.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()?;
    let valid = valid.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()?;
    Ok(correct / (valid + 1.0))
}
