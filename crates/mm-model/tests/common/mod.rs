//! Общие заготовки для интеграционных тестов: крошечная модель и словарный токенайзер.

#![allow(dead_code)]

use std::collections::HashMap;

use candle_core::{DType, Device};
use llama_decoder::LlamaConfig;
use mm_core::{
    ConditioningConfig, EncoderSpec, MmError, MmResult, Modality, ProjectorConfig, TextTokenizer,
};
use mm_model::{ModelArgs, MultimodalModel};

pub const BASE_WORDS: &[&str] = &[
    "<unk>", "<s>", "</s>", "play", "some", "jazz", "music", "please", "a", "calm", "song", "now",
];
pub const NUM_GEN: usize = 3;

/// Токенайзер «слово = токен».
pub struct WordTokenizer {
    vocab: HashMap<String, u32>,
}

impl WordTokenizer {
    pub fn new() -> Self {
        Self {
            vocab: BASE_WORDS
                .iter()
                .enumerate()
                .map(|(i, w)| (w.to_string(), i as u32))
                .collect(),
        }
    }
}

impl TextTokenizer for WordTokenizer {
    fn encode(&self, text: &str, add_bos: bool) -> MmResult<Vec<u32>> {
        let mut ids = if add_bos { vec![1] } else { vec![] };
        for w in text.split_whitespace() {
            ids.push(*self.vocab.get(w).ok_or_else(|| MmError::Prompt(w.to_string()))?);
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[u32]) -> MmResult<String> {
        let inv: HashMap<u32, &str> = self.vocab.iter().map(|(w, i)| (*i, w.as_str())).collect();
        Ok(ids
            .iter()
            .filter(|i| **i > 2)
            .filter_map(|i| inv.get(i).copied())
            .collect::<Vec<_>>()
            .join(" "))
    }

    fn add_token(&mut self, literal: &str) -> MmResult<usize> {
        if self.vocab.contains_key(literal) {
            return Ok(0);
        }
        let id = self.vocab.len() as u32;
        self.vocab.insert(literal.to_string(), id);
        Ok(1)
    }

    fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    fn eos_token_id(&self) -> u32 {
        2
    }

    fn bos_token_id(&self) -> u32 {
        1
    }
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

pub fn tiny_model() -> (MultimodalModel, WordTokenizer) {
    let mut tok = WordTokenizer::new();
    let model = MultimodalModel::new(tiny_args(), &mut tok, DType::F32, &Device::Cpu).unwrap();
    (model, tok)
}

pub fn scratch_file(tag: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("rustmugen-{tag}-{}.safetensors", std::process::id()))
}

pub fn max_diff(a: &candle_core::Tensor, b: &candle_core::Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}
