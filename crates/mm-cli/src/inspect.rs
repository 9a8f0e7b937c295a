//! Проверка директории модели без загрузки весов.

use std::path::{Path, PathBuf};

use mm_core::model_files::{
    optional_file, resolve_consolidated_shards, weights_total_size, ADAPTER_FILE, OVERRIDES_FILE,
    PARAMS_FILE, TOKENIZER_FILE,
};
use mm_model::ModelArgs;

pub struct ModelInspection {
    pub model_dir: PathBuf,
    pub has_params: bool,
    pub has_tokenizer: bool,
    pub has_overrides: bool,
    pub adapter: Option<PathBuf>,
    pub shards: Option<Vec<PathBuf>>,
    pub shards_error: Option<String>,
    pub weights_bytes: Option<u64>,
    pub args: Option<ModelArgs>,
    pub args_error: Option<String>,
}

impl ModelInspection {
    /// Достаточно файлов для `rustmugen generate`.
    pub fn is_ready(&self) -> bool {
        self.has_params && self.has_tokenizer && self.shards.is_some() && self.args.is_some()
    }
}

pub fn inspect_model_dir(model_dir: &Path) -> ModelInspection {
    let (shards, shards_error) = match resolve_consolidated_shards(model_dir) {
        Ok(v) => (Some(v), None),
        Err(e) => (None, Some(e.to_string())),
    };
    let has_params = model_dir.join(PARAMS_FILE).exists();
    let (args, args_error) = if has_params {
        match ModelArgs::from_model_dir(model_dir) {
            Ok(a) => (Some(a), None),
            Err(e) => (None, Some(e.to_string())),
        }
    } else {
        (None, None)
    };

    ModelInspection {
        model_dir: model_dir.to_path_buf(),
        has_params,
        has_tokenizer: model_dir.join(TOKENIZER_FILE).exists(),
        has_overrides: model_dir.join(OVERRIDES_FILE).exists(),
        adapter: optional_file(model_dir, ADAPTER_FILE),
        shards,
        shards_error,
        weights_bytes: weights_total_size(model_dir),
        args,
        args_error,
    }
}

pub fn fmt_mib(bytes: u64) -> String {
    format!("{:.1} MiB", (bytes as f64) / (1024.0 * 1024.0))
}

pub fn status(ok: bool) -> &'static str {
    if ok {
        "OK"
    } else {
        "MISSING"
    }
}

pub fn print_inspection(insp: &ModelInspection) {
    println!("Модель: {}", insp.model_dir.display());
    println!("Файлы:");
    println!("- {PARAMS_FILE}: {}", status(insp.has_params));
    println!("- {TOKENIZER_FILE}: {}", status(insp.has_tokenizer));
    println!(
        "- {OVERRIDES_FILE}: {}",
        if insp.has_overrides { "OK" } else { "-" }
    );
    println!(
        "- {ADAPTER_FILE}: {}",
        if insp.adapter.is_some() { "OK" } else { "-" }
    );
    match (&insp.shards, &insp.shards_error) {
        (Some(shards), _) => {
            println!("- шарды LLM: {}", shards.len());
            for p in shards {
                let size = std::fs::metadata(p).map(|m| m.len()).unwrap_or(0);
                let name = p
                    .file_name()
                    .and_then(|s| s.to_str())
                    .unwrap_or("<unknown>");
                println!("    {name} ({})", fmt_mib(size));
            }
        }
        (None, Some(e)) => println!("- шарды LLM: ошибка: {e}"),
        (None, None) => println!("- шарды LLM: -"),
    }
    if let Some(bytes) = insp.weights_bytes {
        println!("Всего весов: {}", fmt_mib(bytes));
    }

    if let Some(e) = &insp.args_error {
        println!();
        println!("Конфигурация не читается: {e}");
    }
    if let Some(args) = &insp.args {
        println!();
        println!("Конфигурация:");
        println!(
            "- LLM: dim={}, слоёв {}, голов {}, max_seq_len={}, max_batch_size={}",
            args.llama.dim,
            args.llama.n_layers,
            args.llama.n_heads,
            args.llama.max_seq_len,
            args.llama.max_batch_size
        );
        println!(
            "- conditioning: query_layer={}, query_len={}",
            args.conditioning.query_layer, args.conditioning.query_len
        );
        for spec in &args.encoders {
            println!(
                "- энкодер {}: {} ({} x {})",
                spec.modality, spec.model_name, spec.channels, spec.feature_dim
            );
        }
        println!(
            "- проектор: {} токен(ов) x {}, слои {:?}",
            args.projector.num_output_tokens, args.projector.output_dim, args.projector.input_layers
        );
        println!("- токенов [AUD*]: {}", args.num_gen_audio_tokens);
    }

    println!();
    println!(
        "Статус: {}",
        if insp.is_ready() { "OK" } else { "PARTIAL" }
    );
}
