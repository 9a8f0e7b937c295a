//! Сквозная генерация на крошечной модели.

mod common;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use candle_core::Device;
use common::{tiny_pipeline, ConstEncoder, SilentGenerator, NUM_GEN};
use mm_core::{AudioBuffer, GenerationConfig, MediaInput, MmError, Modality, RawMedia, TextTokenizer};
use mm_pipeline::{MultimodalPipeline, StopReason};

fn sampled(max_gen_len: usize) -> GenerationConfig {
    GenerationConfig {
        max_gen_len,
        temperature: 0.7,
        top_p: 0.9,
        seed: 3,
        ..GenerationConfig::default()
    }
}

#[test]
fn test_text_generation_is_bounded_and_seeded() {
    let mut pipeline = tiny_pipeline();
    let cfg = sampled(5);
    let first = pipeline.generate(&["play some jazz"], &[], &cfg).unwrap();
    let second = pipeline.generate(&["play some jazz"], &[], &cfg).unwrap();
    assert_eq!(first.len(), 1);
    assert!(first[0].tokens.len() <= 5);
    assert_eq!(first[0].tokens, second[0].tokens);
    assert_eq!(first[0].raw, pipeline.tokenizer().decode(&first[0].tokens).unwrap());
    if first[0].stop_reason == StopReason::MaxTokens {
        assert_eq!(first[0].tokens.len(), 5);
    }
}

#[test]
fn test_complete_capture_renders_audio() {
    let mut pipeline = tiny_pipeline();
    let seen = Arc::new(Mutex::new(Vec::new()));
    pipeline.set_audio_generator(Box::new(SilentGenerator { seen: seen.clone() }));

    // Первая строка несёт все токены [AUD*] в промпте: пока короткая вторая
    // строка генерирует, первая проходит их принудительно и захватывает состояния.
    let cfg = GenerationConfig {
        max_gen_len: 0,
        audio_length_in_s: 5.0,
        ..GenerationConfig::greedy()
    };
    let outputs = pipeline
        .generate(&["play [AUD0] [AUD1] [AUD2] now", "play"], &[], &cfg)
        .unwrap();
    assert_eq!(outputs.len(), 2);
    let first = &outputs[0];
    assert!(first.tokens.is_empty());
    assert_eq!(first.audio_conditioning.as_ref().unwrap().dims(), &[1, 2, 6]);
    assert!(first.has_audio());

    let seen = seen.lock().unwrap();
    assert!(!seen.is_empty());
    assert_eq!(seen[0], (vec![1, 2, 6], 256));
}

#[test]
fn test_conditioning_without_generator() {
    let mut pipeline = tiny_pipeline();
    let ids = pipeline.model().audio_tokens().ids().to_vec();
    assert_eq!(ids.len(), NUM_GEN);
    let views = vec![candle_core::Tensor::randn(0f32, 1.0, (1, NUM_GEN, 8), &Device::Cpu).unwrap()];
    let (conditioning, audio) = pipeline.render_audio(&views, &GenerationConfig::default()).unwrap();
    assert_eq!(conditioning.dims(), &[1, 2, 6]);
    assert!(audio.is_none());
}

#[test]
fn test_markup_audio_goes_through_encoder() {
    let mut pipeline = tiny_pipeline();
    let calls = Arc::new(AtomicUsize::new(0));
    pipeline
        .set_encoder(Box::new(ConstEncoder {
            modality: Modality::Audio,
            value: 0.5,
            calls: calls.clone(),
        }))
        .unwrap();

    let wav = std::env::temp_dir().join(format!("rustmugen-markup-{}.wav", std::process::id()));
    audio::save_wav(&wav, &AudioBuffer::new(vec![0.1; 2400], 24_000, 1)).unwrap();

    let markup = format!("<Audio>{}</Audio> play some jazz", wav.display());
    let out = pipeline
        .generate_from_markup(&markup, &GenerationConfig { max_gen_len: 3, ..GenerationConfig::greedy() })
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(out.tokens.len() <= 3);
    let _ = std::fs::remove_file(&wav);
}

#[test]
fn test_missing_encoder_is_config_error() {
    let mut pipeline = tiny_pipeline();
    let err = pipeline
        .generate_from_markup("<Image>cat.png</Image> describe", &GenerationConfig::greedy())
        .unwrap_err();
    assert!(matches!(err, MmError::Config(_)), "{err}");
}

#[test]
fn test_weighted_inputs_share_one_feature() {
    let mut pipeline = tiny_pipeline();
    pipeline
        .set_encoder(Box::new(ConstEncoder {
            modality: Modality::Video,
            value: 1.0,
            calls: Arc::new(AtomicUsize::new(0)),
        }))
        .unwrap();
    let media = vec![
        MediaInput::new(RawMedia::VideoPath("a.mp4".into()), 1.0),
        MediaInput::new(RawMedia::VideoPath("b.mp4".into()), 3.0),
    ];
    let features = pipeline.encode_features(&media).unwrap();
    assert_eq!(features.present(), vec![Modality::Video]);
    assert_eq!(features.get(Modality::Video).unwrap().dims(), &[1, 1, 8]);
}

#[test]
fn test_batch_over_limit_is_rejected() {
    let mut pipeline = tiny_pipeline();
    let err = pipeline
        .generate(&["play", "play", "play"], &[], &GenerationConfig::greedy())
        .unwrap_err();
    assert!(matches!(err, MmError::Config(_)), "{err}");
}

// ---------------------------------------------------------------------------
// Реальные веса
// ---------------------------------------------------------------------------

fn get_model_path() -> Option<PathBuf> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()?
        .parent()?
        .join("models")
        .join("mu2gen-7b");
    path.join("params.json").exists().then_some(path)
}

fn pick_test_device() -> Device {
    // Для проверки на GPU: RUSTMUGEN_TEST_DEVICE=metal|cuda cargo test -p mm-pipeline --test generate
    match std::env::var("RUSTMUGEN_TEST_DEVICE").as_deref() {
        Ok("metal") => std::panic::catch_unwind(|| Device::new_metal(0).ok())
            .ok()
            .flatten()
            .unwrap_or(Device::Cpu),
        Ok("cuda") => Device::new_cuda(0).unwrap_or(Device::Cpu),
        _ => Device::Cpu,
    }
}

#[test]
fn test_real_model_text_generation() {
    let Some(model_path) = get_model_path() else {
        eprintln!("Skipping test: model not found");
        return;
    };
    let device = pick_test_device();
    let mut pipeline = MultimodalPipeline::from_model_dir(&model_path, &device).unwrap();
    let cfg = GenerationConfig {
        max_gen_len: 16,
        ..GenerationConfig::greedy()
    };
    let out = pipeline
        .generate(&["Describe a calm jazz song."], &[], &cfg)
        .unwrap();
    eprintln!("Output: {}", out[0].text);
    assert!(out[0].tokens.len() <= 16);
}
