//! MultimodalPipeline: промпт + медиа -> текст и (опционально) музыка.
//!
//! Этапы:
//! 1. Разбор inline-разметки промпта ([`parse_prompt`])
//! 2. Медиа -> признаки модальностей (внешние энкодеры + мосты модели)
//! 3. Шаблон + токенизация
//! 4. Цикл генерации с захватом состояний `[AUD*]`
//! 5. Проектор -> внешний аудио-генератор

use std::path::Path;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use mm_core::model_files::{require_file, TOKENIZER_FILE};
use mm_core::{
    AudioBuffer, AudioGenerator, GenerationConfig, MediaInput, MmError, MmResult, Modality,
    ModalityEncoder, RawMedia, RetrievalIndex, TextTokenizer,
};
use mm_model::{ModalityFeatures, MultimodalModel};
use modality_bridge::EncoderAdapter;
use tracing::{debug, info, warn};

use crate::generation::{GenerationLoop, ModelSession};
use crate::output::{strip_generation_tokens, MultimodalOutput};
use crate::prompt::{parse_prompt, prompt_media, prompt_text, PromptTemplate};
use crate::tokenizer::HfTokenizer;

/// Точность весов по устройству: BF16 на GPU, F32 на CPU.
pub fn dtype_for_device(device: &Device) -> DType {
    if device.is_metal() || device.is_cuda() {
        DType::BF16
    } else {
        DType::F32
    }
}

pub struct MultimodalPipeline {
    model: MultimodalModel,
    tokenizer: HfTokenizer,
    encoders: Vec<EncoderAdapter>,
    generator: Option<Box<dyn AudioGenerator>>,
    template: PromptTemplate,
}

impl MultimodalPipeline {
    /// Загрузить модель и токенайзер из директории модели.
    pub fn from_model_dir(model_dir: impl AsRef<Path>, device: &Device) -> MmResult<Self> {
        let model_dir = model_dir.as_ref();
        let mut tokenizer = HfTokenizer::from_file(require_file(model_dir, TOKENIZER_FILE)?)?;
        let model = MultimodalModel::load(model_dir, &mut tokenizer, dtype_for_device(device), device)?;
        Ok(Self::new(model, tokenizer))
    }

    /// Собрать пайплайн из готовой модели.
    ///
    /// `tokenizer` должен быть тем же, через который модель добавила токены `[AUD*]`.
    pub fn new(model: MultimodalModel, tokenizer: HfTokenizer) -> Self {
        Self {
            model,
            tokenizer,
            encoders: Vec::new(),
            generator: None,
            template: PromptTemplate::default(),
        }
    }

    pub fn with_template(mut self, template: PromptTemplate) -> Self {
        self.template = template;
        self
    }

    /// Подключить внешний энкодер; энкодер той же модальности заменяется.
    pub fn set_encoder(&mut self, encoder: Box<dyn ModalityEncoder>) -> MmResult<()> {
        let modality = encoder.modality();
        let spec = self.model.args().encoder(modality);
        info!("Энкодер {modality}: {}", spec.model_name);
        let adapter = EncoderAdapter::new(spec, encoder, self.model.device())?;
        self.encoders.retain(|e| e.modality() != modality);
        self.encoders.push(adapter);
        Ok(())
    }

    pub fn set_audio_generator(&mut self, generator: Box<dyn AudioGenerator>) {
        self.generator = Some(generator);
    }

    pub fn set_retrieval_index(&mut self, index: Arc<dyn RetrievalIndex>) {
        self.model.set_retrieval_index(index);
    }

    pub fn model(&self) -> &MultimodalModel {
        &self.model
    }

    pub fn tokenizer(&self) -> &HfTokenizer {
        &self.tokenizer
    }

    pub fn template(&self) -> PromptTemplate {
        self.template
    }

    fn encoder_mut(&mut self, modality: Modality) -> MmResult<&mut EncoderAdapter> {
        self.encoders
            .iter_mut()
            .find(|e| e.modality() == modality)
            .ok_or_else(|| MmError::Config(format!("no encoder registered for {modality}")))
    }

    // ------------------------------------------------------------------
    // Медиа
    // ------------------------------------------------------------------

    /// Сырой вход модальности по ссылке из промпта.
    ///
    /// Аудио читается сразу (моно, с частотой энкодера, если она задана).
    pub fn load_media(&self, modality: Modality, payload: &str) -> MmResult<RawMedia> {
        match modality {
            Modality::Audio => {
                let buffer = match self.model.args().encoder(Modality::Audio).sample_rate {
                    Some(sr) => audio::load_for_encoder(payload, sr as usize)?,
                    None => audio::to_mono(&audio::load_wav(payload)?),
                };
                Ok(RawMedia::Waveform {
                    samples: buffer.samples,
                    sample_rate: buffer.sample_rate as u32,
                })
            }
            Modality::Image => Ok(RawMedia::ImagePath(payload.into())),
            Modality::Video => Ok(RawMedia::VideoPath(payload.into())),
        }
    }

    /// Признаки `[1, 1, D]` всех модальностей, встречающихся во входах.
    ///
    /// Несколько входов одной модальности смешиваются с их весами.
    pub fn encode_features(&mut self, media: &[MediaInput]) -> MmResult<ModalityFeatures> {
        let mut features = ModalityFeatures::new();
        for modality in Modality::all() {
            let inputs: Vec<&MediaInput> = media.iter().filter(|m| m.modality() == modality).collect();
            if inputs.is_empty() {
                continue;
            }
            let encoder = self.encoder_mut(modality)?;
            let mut encoded = Vec::with_capacity(inputs.len());
            for input in inputs {
                debug!("{modality}: {} (вес {})", input.media.describe(), input.weight);
                encoded.push((encoder.encode(&input.media)?.unsqueeze(0)?, input.weight));
            }
            features.set(modality, self.model.encode_modality(modality, &encoded)?);
        }
        Ok(features)
    }

    // ------------------------------------------------------------------
    // Генерация
    // ------------------------------------------------------------------

    /// Сгенерировать ответы на батч инструкций с общими медиа-входами.
    pub fn generate(
        &mut self,
        instructions: &[&str],
        media: &[MediaInput],
        config: &GenerationConfig,
    ) -> MmResult<Vec<MultimodalOutput>> {
        config.validate()?;
        let features = self.encode_features(media)?;
        let prompts = instructions
            .iter()
            .map(|text| self.tokenizer.encode(&self.template.format(text), true))
            .collect::<MmResult<Vec<_>>>()?;
        info!(
            "Генерация: {} промптов, модальности {:?}, max_gen_len={}",
            prompts.len(),
            features.present(),
            config.max_gen_len
        );

        let rows = {
            let gen_ids = self.model.audio_tokens().ids();
            let generation = GenerationLoop::new(config, self.tokenizer.eos_token_id(), gen_ids);
            let mut session = ModelSession::new(&self.model, &features);
            generation.run(&mut session, &prompts)?
        };

        let mut outputs = Vec::with_capacity(rows.len());
        for row in rows {
            let raw = self.tokenizer.decode(&row.tokens)?;
            let text = strip_generation_tokens(&raw)?;
            let (audio_conditioning, audio) = match &row.captured {
                Some(views) => {
                    let (conditioning, audio) = self.render_audio(views, config)?;
                    (Some(conditioning), audio)
                }
                None => (None, None),
            };
            outputs.push(MultimodalOutput {
                text,
                raw,
                tokens: row.tokens,
                stop_reason: row.stop_reason,
                audio_conditioning,
                audio,
            });
        }
        Ok(outputs)
    }

    /// Промпт с inline-разметкой: `<Audio>a.wav</Audio> describe this music`.
    ///
    /// Каждая ссылка на медиа получает единичный вес.
    pub fn generate_from_markup(
        &mut self,
        markup: &str,
        config: &GenerationConfig,
    ) -> MmResult<MultimodalOutput> {
        let segments = parse_prompt(markup)?;
        let media = prompt_media(&segments)
            .into_iter()
            .map(|(m, payload)| Ok(MediaInput::unit(self.load_media(m, payload)?)))
            .collect::<MmResult<Vec<_>>>()?;
        let text = prompt_text(&segments);
        self.generate(&[text.as_str()], &media, config)?
            .pop()
            .ok_or_else(|| MmError::Inference("generation returned no output".into()))
    }

    /// Conditioning генератора из захваченных состояний и (если генератор
    /// подключён) волна длиной `config.audio_frames()` кадров.
    pub fn render_audio(
        &mut self,
        views: &[Tensor],
        config: &GenerationConfig,
    ) -> MmResult<(Tensor, Option<AudioBuffer>)> {
        let conditioning = self.model.project_generation(views)?;
        let Some(generator) = self.generator.as_mut() else {
            warn!("Аудио-генератор не подключён: возвращается только conditioning");
            return Ok((conditioning, None));
        };
        let frames = config.audio_frames();
        info!("Синтез аудио: {frames} кадров, conditioning {:?}", conditioning.dims());
        let audio = generator.generate(&conditioning, frames)?;
        Ok((conditioning, Some(audio)))
    }
}

impl std::fmt::Debug for MultimodalPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultimodalPipeline")
            .field("model", &self.model)
            .field("tokenizer", &self.tokenizer)
            .field("encoders", &self.encoders.iter().map(|e| e.modality()).collect::<Vec<_>>())
            .field("generator", &self.generator.is_some())
            .field("template", &self.template)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_for_cpu() {
        assert_eq!(dtype_for_device(&Device::Cpu), DType::F32);
    }
}
