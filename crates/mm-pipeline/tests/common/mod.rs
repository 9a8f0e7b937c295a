//! Крошечная модель с word-level токенайзером и заглушки внешних компонентов.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use candle_core::{DType, Device, Tensor};
use llama_decoder::LlamaConfig;
use mm_core::{
    AudioBuffer, AudioGenerator, ConditioningConfig, EncoderSpec, MmResult, Modality,
    ModalityEncoder, ProjectorConfig, RawMedia,
};
use mm_model::{ModelArgs, MultimodalModel};
use mm_pipeline::{HfTokenizer, MultimodalPipeline, PromptTemplate};

pub const WORDS: &[&str] = &[
    "<unk>", "<s>", "</s>", "play", "some", "jazz", "music", "please", "a", "calm", "song", "now",
];
pub const NUM_GEN: usize = 3;
pub const GEN_SAMPLE_RATE: u32 = 32_000;

pub fn word_level_json(words: &[&str]) -> String {
    let vocab = words
        .iter()
        .enumerate()
        .map(|(i, w)| format!("\"{w}\": {i}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        r#"{{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [],
  "normalizer": null,
  "pre_tokenizer": {{"type": "Whitespace"}},
  "post_processor": null,
  "decoder": null,
  "model": {{"type": "WordLevel", "vocab": {{{vocab}}}, "unk_token": "<unk>"}}
}}"#
    )
}

pub fn tiny_args() -> ModelArgs {
    let llama = LlamaConfig {
        dim: 8,
        n_layers: 4,
        n_heads: 2,
        n_kv_heads: None,
        vocab_size: 0,
        multiple_of: 4,
        max_seq_len: 32,
        max_batch_size: 2,
        lora_rank: 2,
        ..LlamaConfig::llama_7b()
    };
    let mut args = ModelArgs::with_llama(llama);
    args.conditioning = ConditioningConfig {
        query_layer: 1,
        query_len: 1,
    };
    args.encoders = Modality::all()
        .into_iter()
        .map(|m| EncoderSpec {
            channels: 2,
            feature_dim: 5,
            ..EncoderSpec::default_for(m)
        })
        .collect();
    args.projector = ProjectorConfig {
        output_dim: 6,
        num_output_tokens: 2,
        input_layers: vec![-1],
    };
    args.num_gen_audio_tokens = NUM_GEN;
    args
}

pub fn tiny_pipeline() -> MultimodalPipeline {
    let mut tokenizer = HfTokenizer::from_bytes(word_level_json(WORDS)).unwrap();
    let model = MultimodalModel::new(tiny_args(), &mut tokenizer, DType::F32, &Device::Cpu).unwrap();
    MultimodalPipeline::new(model, tokenizer).with_template(PromptTemplate::Raw)
}

/// Энкодер, возвращающий константную матрицу и считающий вызовы.
pub struct ConstEncoder {
    pub modality: Modality,
    pub value: f32,
    pub calls: Arc<AtomicUsize>,
}

impl ModalityEncoder for ConstEncoder {
    fn modality(&self) -> Modality {
        self.modality
    }

    fn encode(&mut self, _media: &RawMedia) -> MmResult<Tensor> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Tensor::full(self.value, (2, 5), &Device::Cpu)?)
    }
}

/// Генератор тишины, запоминающий форму conditioning и число кадров.
pub struct SilentGenerator {
    pub seen: Arc<Mutex<Vec<(Vec<usize>, usize)>>>,
}

impl AudioGenerator for SilentGenerator {
    fn sample_rate(&self) -> u32 {
        GEN_SAMPLE_RATE
    }

    fn generate(&mut self, conditioning: &Tensor, max_new_tokens: usize) -> MmResult<AudioBuffer> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push((conditioning.dims().to_vec(), max_new_tokens));
        }
        Ok(AudioBuffer::new(vec![0.0; 320], GEN_SAMPLE_RATE as usize, 1))
    }
}
