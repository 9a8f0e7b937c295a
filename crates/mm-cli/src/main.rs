//!
//! CLI для мультимодальной генерации (текст и музыка по текстовым и медиа-промптам).

mod inspect;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use mm_core::model_files::{require_file, TOKENIZER_FILE};
use mm_core::{GenerationConfig, ParamGroup, TextTokenizer, TrainingStage};
use mm_model::{MultimodalModel, StageTrainabilityPolicy};
use mm_pipeline::{
    dtype_for_device, parse_prompt, HfTokenizer, MultimodalPipeline, PromptTemplate, SegmentKind,
    StopReason,
};
use modality_bridge::FlatIpIndex;

#[derive(Parser)]
#[command(name = "rustmugen")]
#[command(author, version, about = "RustMuGen: multimodal music understanding and generation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a response (and optionally an audio conditioning) for a prompt
    Generate {
        /// Path to the model directory
        #[arg(long)]
        model: PathBuf,

        /// Промпт с inline-медиа: `<Audio>a.wav</Audio> describe this music`.
        ///
        /// Для медиа нужен подключённый энкодер соответствующей модальности.
        #[arg(long)]
        prompt: String,

        /// Device to use (cpu, metal, cuda)
        #[arg(long, default_value = "cpu")]
        device: String,

        /// Maximum number of new tokens
        #[arg(long, default_value_t = 256)]
        max_gen_len: usize,

        /// Температура (0 = greedy)
        #[arg(long, default_value_t = 0.1)]
        temperature: f32,

        #[arg(long, default_value_t = 0.75)]
        top_p: f32,

        #[arg(long, default_value_t = 299_792_458)]
        seed: u64,

        /// Шаблон промпта: instruction|chat|raw
        #[arg(long, default_value = "instruction")]
        template: String,

        /// Длительность генерируемой музыки в секундах
        #[arg(long, default_value_t = 10.0)]
        audio_length: f32,

        /// Дополнительные стоп-строки (можно задавать несколько раз)
        #[arg(long)]
        stop: Vec<String>,

        /// kNN-индекс прототипов (safetensors) для сглаживания признаков
        #[arg(long)]
        retrieval_index: Option<PathBuf>,

        /// Печатать сырой вывод модели (с токенами `[AUD*]`)
        #[arg(long, default_value_t = false)]
        raw: bool,

        /// Сохранить conditioning аудио-генератора (safetensors), если он получен
        #[arg(long)]
        out_embedding: Option<PathBuf>,

        /// Сохранить итоговый текст в файл (UTF-8)
        #[arg(long)]
        out_text: Option<PathBuf>,
    },

    /// Проверить директорию модели: файлы, шарды, конфигурацию
    Inspect {
        /// Путь к директории модели
        #[arg(long)]
        model: PathBuf,

        /// Дополнительно загрузить шарды и показать отчёт загрузки
        #[arg(long, default_value_t = false)]
        load: bool,
    },

    /// Показать обучаемые группы параметров для стадии 1/2/3
    Trainable {
        #[arg(long)]
        stage: u8,

        /// Директория модели: если задана, выводится сводка по реальным параметрам
        #[arg(long)]
        model: Option<PathBuf>,
    },

    /// Разобрать промпт на текстовые и медиа-сегменты
    ParsePrompt {
        #[arg(long)]
        prompt: String,

        /// Показать, как выглядит промпт после шаблона
        #[arg(long)]
        template: Option<String>,
    },

    /// Run a simple test to verify the setup
    Test {
        /// Device to use (cpu, metal, cuda)
        #[arg(long, default_value = "cpu")]
        device: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Generate {
            model,
            prompt,
            device,
            max_gen_len,
            temperature,
            top_p,
            seed,
            template,
            audio_length,
            stop,
            retrieval_index,
            raw,
            out_embedding,
            out_text,
        } => {
            let template = parse_template(&template)?;
            let config = GenerationConfig {
                max_gen_len,
                temperature,
                top_p,
                audio_length_in_s: audio_length,
                seed,
                stop_sequences: Vec::new(),
            };
            run_generate(
                &model,
                &prompt,
                &device,
                template,
                config,
                &stop,
                retrieval_index,
                raw,
                out_embedding,
                out_text,
            )
        }

        Commands::Inspect { model, load } => run_inspect(&model, load),

        Commands::Trainable { stage, model } => run_trainable(stage, model),

        Commands::ParsePrompt { prompt, template } => {
            let segments = parse_prompt(&prompt)?;
            println!("Сегментов: {}", segments.len());
            for (i, s) in segments.iter().enumerate() {
                match s.kind {
                    SegmentKind::Text => println!("{i}: text  {:?}", s.payload),
                    SegmentKind::Media(m) => println!("{i}: {:<5} {}", m.as_str(), s.payload),
                }
            }
            if let Some(name) = template {
                let template = parse_template(&name)?;
                println!();
                println!("{}", template.format(&mm_pipeline::prompt_text(&segments)));
            }
            Ok(())
        }

        Commands::Test { device } => {
            println!("🧪 RustMuGen - Setup Test");
            println!("=========================");
            println!("Testing {device} device...");
            let device = create_device(&device)?;

            let a = candle_core::Tensor::randn(0f32, 1f32, (2, 3), &device)?;
            let b = candle_core::Tensor::randn(0f32, 1f32, (3, 4), &device)?;
            let c = a.matmul(&b)?;
            println!("   dtype for weights: {:?}", dtype_for_device(&device));
            println!("✅ Test passed. Output shape: {:?}", c.dims());
            Ok(())
        }
    }
}

fn parse_template(name: &str) -> Result<PromptTemplate> {
    PromptTemplate::from_name(name)
        .with_context(|| format!("Неизвестный шаблон: {name} (instruction|chat|raw)"))
}

// ---------------------------------------------------------------------------
// Генерация
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
fn run_generate(
    model_dir: &Path,
    prompt: &str,
    device: &str,
    template: PromptTemplate,
    mut config: GenerationConfig,
    stop: &[String],
    retrieval_index: Option<PathBuf>,
    raw: bool,
    out_embedding: Option<PathBuf>,
    out_text: Option<PathBuf>,
) -> Result<()> {
    println!("🎵 RustMuGen - Generation");
    println!("=========================");
    println!("Model: {}", model_dir.display());
    println!("Device: {device}");
    println!();

    let start = Instant::now();
    let device = create_device(device)?;

    println!("🧠 Loading model...");
    let mut pipeline = MultimodalPipeline::from_model_dir(model_dir, &device)
        .with_context(|| format!("Не удалось загрузить модель из {}", model_dir.display()))?
        .with_template(template);
    println!("   Vocab size: {}", pipeline.tokenizer().vocab_size());
    println!("   Model loaded in {:.2}s", start.elapsed().as_secs_f32());

    if let Some(path) = retrieval_index {
        let index = FlatIpIndex::load(&path)
            .with_context(|| format!("Не удалось загрузить индекс {}", path.display()))?;
        pipeline.set_retrieval_index(Arc::new(index));
    }

    for s in stop {
        let ids = pipeline.tokenizer().encode(s, false)?;
        if ids.is_empty() {
            anyhow::bail!("Стоп-строка {s:?} не даёт ни одного токена");
        }
        config.stop_sequences.push(ids);
    }
    if !config.stop_sequences.is_empty() {
        tracing::info!("Стоп-последовательности: {:?}", config.stop_sequences);
    }

    println!();
    println!("🎯 Generating...");
    let gen_start = Instant::now();
    let result = pipeline.generate_from_markup(prompt, &config)?;
    let gen_time = gen_start.elapsed();

    println!();
    println!("═══════════════════════════════════════════");
    println!("📝 Response:");
    println!();
    if raw {
        println!("   {}", result.raw);
    } else {
        println!("   {}", result.text);
    }

    if let Some(path) = out_text {
        create_parent_dir(&path)?;
        std::fs::write(&path, result.text.as_bytes())?;
        println!();
        println!("💾 Saved text to: {}", path.display());
    }

    match (&result.audio_conditioning, out_embedding) {
        (Some(cond), Some(path)) => {
            create_parent_dir(&path)?;
            result.save_conditioning(&path)?;
            println!();
            println!(
                "💾 Saved audio conditioning {:?} ({} frames requested) to: {}",
                cond.dims(),
                config.audio_frames(),
                path.display()
            );
        }
        (Some(cond), None) => {
            println!();
            println!(
                "   Получен conditioning {:?}; сохранить: --out-embedding <path>",
                cond.dims()
            );
        }
        (None, Some(_)) => {
            println!();
            println!("   [!] Модель не сгенерировала полный набор токенов [AUD*]: conditioning не получен.");
        }
        (None, None) => {}
    }

    if result.stop_reason == StopReason::MaxTokens {
        println!();
        println!(
            "   [!] Достигнут лимит max-gen-len={}. Возможно, текст обрезан.",
            config.max_gen_len
        );
    }

    println!();
    println!("═══════════════════════════════════════════");
    println!();
    println!("⏱️  Generation time: {:.2}s", gen_time.as_secs_f32());
    println!("⏱️  Total time: {:.2}s", start.elapsed().as_secs_f32());
    Ok(())
}

fn create_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Модель на диске
// ---------------------------------------------------------------------------

fn load_model(model_dir: &Path, device: &candle_core::Device) -> Result<MultimodalModel> {
    let mut tokenizer = HfTokenizer::from_file(require_file(model_dir, TOKENIZER_FILE)?)?;
    let args = mm_model::ModelArgs::from_model_dir(model_dir)?;
    Ok(MultimodalModel::new(
        args,
        &mut tokenizer,
        dtype_for_device(device),
        device,
    )?)
}

fn run_inspect(model_dir: &Path, load: bool) -> Result<()> {
    if !model_dir.is_dir() {
        anyhow::bail!("Директория модели не найдена: {}", model_dir.display());
    }
    let insp = inspect::inspect_model_dir(model_dir);
    inspect::print_inspection(&insp);

    if !load {
        return Ok(());
    }
    let shards = insp
        .shards
        .clone()
        .context("Нечего загружать: шарды не найдены")?;

    println!();
    println!("📂 Loading shards on CPU...");
    let start = Instant::now();
    let mut model = load_model(model_dir, &candle_core::Device::Cpu)?;
    let report = model.load_llm_shards(&shards)?;
    println!(
        "   {} шард(ов), загружено {} параметров за {:.2}s",
        report.shards,
        report.loaded,
        start.elapsed().as_secs_f32()
    );
    println!("   Не из шардов (свежие): {}", report.fresh.len());
    if !report.ignored.is_empty() {
        println!("   Проигнорированы ключи: {}", report.ignored.join(", "));
    }
    if let Some(adapter) = &insp.adapter {
        let report = model.load_adapter(adapter)?;
        println!("   Adapter: {report:?}");
    }
    Ok(())
}

fn run_trainable(stage: u8, model_dir: Option<PathBuf>) -> Result<()> {
    let stage = TrainingStage::from_number(stage)
        .with_context(|| format!("Неизвестная стадия: {stage} (ожидается 1, 2 или 3)"))?;
    let policy = StageTrainabilityPolicy::new(stage);

    println!("Стадия {} ({stage})", stage.number());
    for group in ParamGroup::all() {
        let mark = if policy.selects(group) { "train" } else { "frozen" };
        println!("- {:<20} {mark}", group.to_string());
    }

    let Some(model_dir) = model_dir else {
        return Ok(());
    };
    println!();
    println!("Параметры модели {}:", model_dir.display());
    let mut model = load_model(&model_dir, &candle_core::Device::Cpu)?;
    let n = model.set_stage(stage)?;
    for s in model.store().summary() {
        println!(
            "- {:<20} {:>5} тензоров, {:>12} элементов, обучаемых {}",
            s.group.to_string(),
            s.tensors,
            s.elements,
            s.trainable_tensors
        );
    }
    println!("Итого обучаемых тензоров: {n}");
    Ok(())
}

fn create_device(device: &str) -> Result<candle_core::Device> {
    match device {
        "metal" => {
            // candle может паниковать при инициализации Metal (например, если устройство недоступно).
            // Панику ловим, а hook временно глушим, чтобы не засорять stderr.
            let prev_hook = std::panic::take_hook();
            std::panic::set_hook(Box::new(|_| {}));
            let res = std::panic::catch_unwind(|| candle_core::Device::new_metal(0));
            std::panic::set_hook(prev_hook);

            match res {
                Ok(Ok(dev)) => Ok(dev),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(anyhow::anyhow!(
                    "Инициализация Metal недоступна в этом окружении. Попробуйте --device cpu."
                )),
            }
        }
        "cuda" => Ok(candle_core::Device::new_cuda(0)?),
        _ => Ok(candle_core::Device::Cpu),
    }
}
