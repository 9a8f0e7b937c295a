//! Утилиты для работы с файлами модели на диске.
//!
//! Ожидаемая раскладка директории модели:
//! - `params.json` (конфиг LLaMA в формате Meta)
//! - `consolidated.00.safetensors`, `consolidated.01.safetensors`, ... (шарды LLM)
//! - `tokenizer.json`
//! - `adapter.safetensors` (опционально, обученные мосты/префикс/проектор)
//! - `mugen.json` (опционально, переопределения мультимодальной конфигурации)

use std::path::{Path, PathBuf};

use crate::{MmError, MmResult};

pub const PARAMS_FILE: &str = "params.json";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const ADAPTER_FILE: &str = "adapter.safetensors";
pub const OVERRIDES_FILE: &str = "mugen.json";

/// Найти шарды `consolidated.NN.safetensors`, отсортированные по номеру.
///
/// Номера шардов обязаны идти подряд с нуля: дырка в нумерации означает
/// недокачанный чекпоинт.
pub fn resolve_consolidated_shards(model_dir: impl AsRef<Path>) -> MmResult<Vec<PathBuf>> {
    let model_dir = model_dir.as_ref();
    let mut shards: Vec<(usize, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(model_dir)? {
        let entry = entry?;
        let p = entry.path();
        if !p.is_file() {
            continue;
        }
        let Some(name) = p.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Some(idx) = parse_shard_index(name) {
            shards.push((idx, p));
        }
    }
    if shards.is_empty() {
        return Err(MmError::Checkpoint(format!(
            "В директории модели не найдено ни одного consolidated.NN.safetensors: {}",
            model_dir.display()
        )));
    }
    shards.sort_by_key(|(idx, _)| *idx);
    for (expected, (idx, p)) in shards.iter().enumerate() {
        if *idx != expected {
            return Err(MmError::Checkpoint(format!(
                "Пропущен шард {expected}: следующий найденный {}",
                p.display()
            )));
        }
    }
    Ok(shards.into_iter().map(|(_, p)| p).collect())
}

fn parse_shard_index(name: &str) -> Option<usize> {
    let rest = name.strip_prefix("consolidated.")?;
    let num = rest.strip_suffix(".safetensors")?;
    if num.is_empty() || !num.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    num.parse().ok()
}

/// Путь к обязательному файлу модели.
pub fn require_file(model_dir: impl AsRef<Path>, name: &str) -> MmResult<PathBuf> {
    let p = model_dir.as_ref().join(name);
    if !p.exists() {
        return Err(MmError::Model(format!("Файл не найден: {}", p.display())));
    }
    Ok(p)
}

/// Путь к опциональному файлу модели.
pub fn optional_file(model_dir: impl AsRef<Path>, name: &str) -> Option<PathBuf> {
    let p = model_dir.as_ref().join(name);
    p.exists().then_some(p)
}

/// Суммарный размер файлов весов в директории.
pub fn weights_total_size(model_dir: impl AsRef<Path>) -> Option<u64> {
    let mut total = 0u64;
    if let Ok(entries) = std::fs::read_dir(model_dir.as_ref()) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(".safetensors") {
                if let Ok(meta) = entry.metadata() {
                    total += meta.len();
                }
            }
        }
    }
    (total > 0).then_some(total)
}
