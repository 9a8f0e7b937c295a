//! Сборка весов LLM из consolidated-шардов (model parallel формат Meta).
//!
//! Каждый шард хранит свою часть матрицы:
//! - `wq`/`wk`/`wv`/`w1`/`w3` разрезаны по строкам (выходная размерность);
//! - `wo`/`w2` разрезаны по столбцам;
//! - `tok_embeddings` разрезан по столбцам, `output` по строкам; последние строки
//!   обоих зарезервированы под добавленные токены генерации и в шардах отсутствуют;
//! - нормы целиком лежат в каждом шарде, читаются из нулевого.
//!
//! Гейты, bias и low-rank добавки в шардах не хранятся и остаются свежими.

use std::collections::HashSet;
use std::path::PathBuf;

use candle_core::safetensors::MmapedSafetensors;
use candle_core::{Device, Tensor, D};
use mm_core::{MmError, MmResult, ParamGroup, ParamStore};
use tracing::{debug, info};

/// Как параметр разрезан между шардами.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardAxis {
    Rows,
    Columns,
    /// Столбцы, только в строках исходного словаря.
    EmbeddingColumns,
    /// Строки исходного словаря (выходной слой).
    VocabRows,
    Unsharded,
}

/// Ось шардирования по короткому имени параметра (`layers.0.attention.wq.weight` -> `wq`).
pub fn shard_axis(name: &str) -> Option<ShardAxis> {
    let mut parts = name.rsplit('.');
    parts.next()?;
    let short = parts.next()?;
    match short {
        "wq" | "wk" | "wv" | "w1" | "w3" => Some(ShardAxis::Rows),
        "output" => Some(ShardAxis::VocabRows),
        "wo" | "w2" => Some(ShardAxis::Columns),
        "tok_embeddings" => Some(ShardAxis::EmbeddingColumns),
        "attention_norm" | "ffn_norm" | "norm" | "rope" => Some(ShardAxis::Unsharded),
        _ => None,
    }
}

/// Собрать полный тензор параметра из частей.
///
/// `current` это текущее значение параметра в модели: из него берутся
/// зарезервированные строки эмбеддингов и целевая форма.
pub fn assemble(
    name: &str,
    axis: ShardAxis,
    parts: &[Tensor],
    current: &Tensor,
) -> MmResult<Tensor> {
    let first = parts
        .first()
        .ok_or_else(|| MmError::Checkpoint(format!("no shards for {name}")))?;
    let full = match axis {
        ShardAxis::Unsharded => first.clone(),
        ShardAxis::Rows => Tensor::cat(parts, 0)?,
        ShardAxis::Columns => Tensor::cat(parts, D::Minus1)?,
        ShardAxis::EmbeddingColumns => {
            keep_reserved_rows(name, Tensor::cat(parts, D::Minus1)?, current)?
        }
        ShardAxis::VocabRows => keep_reserved_rows(name, Tensor::cat(parts, 0)?, current)?,
    };
    if full.shape() != current.shape() {
        return Err(MmError::Checkpoint(format!(
            "{name}: assembled shape {:?} does not match model shape {:?}",
            full.shape(),
            current.shape()
        )));
    }
    Ok(full)
}

/// Дописать к строкам исходного словаря зарезервированные строки модели.
fn keep_reserved_rows(name: &str, base: Tensor, current: &Tensor) -> MmResult<Tensor> {
    let (base_rows, _) = base.dims2()?;
    let (rows, _) = current.dims2()?;
    if base_rows > rows {
        return Err(MmError::Checkpoint(format!(
            "{name}: checkpoint has {base_rows} rows, model only {rows}"
        )));
    }
    if base_rows == rows {
        return Ok(base);
    }
    let reserved = current
        .narrow(0, base_rows, rows - base_rows)?
        .to_device(base.device())?
        .to_dtype(base.dtype())?;
    Ok(Tensor::cat(&[&base, &reserved], 0)?)
}

/// Итог загрузки шардов.
#[derive(Debug, Clone, Default)]
pub struct ShardLoadReport {
    pub shards: usize,
    pub loaded: usize,
    /// Параметры, которые в шардах не хранятся (гейты, bias, low-rank).
    pub fresh: Vec<String>,
    /// Ключи шардов без соответствующего параметра (например, `rope.freqs`).
    pub ignored: Vec<String>,
}

/// Загрузить `consolidated.NN.safetensors` в параметры с префиксом `prefix`.
pub fn load_consolidated_shards(
    store: &ParamStore,
    prefix: &str,
    paths: &[PathBuf],
) -> MmResult<ShardLoadReport> {
    if paths.is_empty() {
        return Err(MmError::Checkpoint("no shard files".into()));
    }
    info!("Загрузка {} шардов LLM", paths.len());

    let shards = paths
        .iter()
        .map(|p| {
            // SAFETY: файлы шардов не изменяются во время загрузки.
            unsafe { MmapedSafetensors::new(p) }.map_err(|e| {
                MmError::Checkpoint(format!("failed to open {}: {e}", p.display()))
            })
        })
        .collect::<MmResult<Vec<_>>>()?;
    let shard_keys: Vec<HashSet<String>> = shards
        .iter()
        .map(|s| s.tensors().into_iter().map(|(n, _)| n).collect())
        .collect();

    let mut report = ShardLoadReport {
        shards: shards.len(),
        ..Default::default()
    };
    let mut used: HashSet<String> = HashSet::new();
    let lm_prefix = format!("{prefix}.");

    for full_name in store.names() {
        let Some(key) = full_name.strip_prefix(&lm_prefix) else {
            continue;
        };
        match store.group_of(&full_name) {
            Some(ParamGroup::LmGate | ParamGroup::LmBias | ParamGroup::LmLowRank) => {
                report.fresh.push(full_name.clone());
                continue;
            }
            Some(ParamGroup::LmNorm | ParamGroup::LmBackbone) => {}
            _ => continue,
        }
        let axis = shard_axis(key).ok_or_else(|| {
            MmError::Checkpoint(format!("no sharding rule for parameter {full_name}"))
        })?;
        let sources = match axis {
            ShardAxis::Unsharded => &shards[..1],
            _ => &shards[..],
        };
        let mut parts = Vec::with_capacity(sources.len());
        for (i, shard) in sources.iter().enumerate() {
            if !shard_keys[i].contains(key) {
                return Err(MmError::Checkpoint(format!(
                    "parameter {key} is missing in {}",
                    paths[i].display()
                )));
            }
            parts.push(shard.load(key, &Device::Cpu)?);
        }
        let current = store
            .get(&full_name)
            .ok_or_else(|| MmError::Checkpoint(format!("unknown parameter {full_name}")))?;
        let full = assemble(key, axis, &parts, &current.to_device(&Device::Cpu)?)?;
        store.set(&full_name, &full)?;
        used.insert(key.to_string());
        report.loaded += 1;
    }

    for keys in &shard_keys {
        for k in keys {
            if !used.contains(k) && !report.ignored.contains(k) {
                report.ignored.push(k.clone());
            }
        }
    }
    report.ignored.sort();
    if !report.ignored.is_empty() {
        debug!("Ключи шардов без параметров: {:?}", report.ignored);
    }
    info!(
        "Шарды загружены: {} параметров, {} свежих, {} ключей пропущено",
        report.loaded,
        report.fresh.len(),
        report.ignored.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_axis() {
        assert_eq!(shard_axis("layers.3.attention.wq.weight"), Some(ShardAxis::Rows));
        assert_eq!(shard_axis("layers.3.feed_forward.w2.weight"), Some(ShardAxis::Columns));
        assert_eq!(shard_axis("tok_embeddings.weight"), Some(ShardAxis::EmbeddingColumns));
        assert_eq!(shard_axis("output.weight"), Some(ShardAxis::VocabRows));
        assert_eq!(shard_axis("norm.weight"), Some(ShardAxis::Unsharded));
        assert_eq!(shard_axis("layers.0.ffn_norm.weight"), Some(ShardAxis::Unsharded));
        assert_eq!(shard_axis("layers.0.attention.gate"), None);
        assert_eq!(shard_axis("weight"), None);
    }

    #[test]
    fn test_assemble_rows_and_columns() {
        let dev = Device::Cpu;
        let a = Tensor::new(&[[1f32, 2.0]], &dev).unwrap();
        let b = Tensor::new(&[[3f32, 4.0]], &dev).unwrap();
        let current = Tensor::zeros((2, 2), candle_core::DType::F32, &dev).unwrap();
        let rows = assemble("wq", ShardAxis::Rows, &[a.clone(), b.clone()], &current).unwrap();
        assert_eq!(rows.to_vec2::<f32>().unwrap(), vec![vec![1.0, 2.0], vec![3.0, 4.0]]);

        let current = Tensor::zeros((1, 4), candle_core::DType::F32, &dev).unwrap();
        let cols = assemble("wo", ShardAxis::Columns, &[a, b], &current).unwrap();
        assert_eq!(cols.to_vec2::<f32>().unwrap(), vec![vec![1.0, 2.0, 3.0, 4.0]]);
    }

    #[test]
    fn test_embedding_keeps_reserved_rows() {
        let dev = Device::Cpu;
        let left = Tensor::new(&[[1f32], [2.0]], &dev).unwrap();
        let right = Tensor::new(&[[3f32], [4.0]], &dev).unwrap();
        let current = Tensor::full(9f32, (3, 2), &dev).unwrap();
        let full = assemble("tok_embeddings", ShardAxis::EmbeddingColumns, &[left, right], &current).unwrap();
        assert_eq!(
            full.to_vec2::<f32>().unwrap(),
            vec![vec![1.0, 3.0], vec![2.0, 4.0], vec![9.0, 9.0]]
        );
    }

    #[test]
    fn test_shape_mismatch_is_checkpoint_error() {
        let dev = Device::Cpu;
        let a = Tensor::zeros((1, 2), candle_core::DType::F32, &dev).unwrap();
        let current = Tensor::zeros((3, 2), candle_core::DType::F32, &dev).unwrap();
        assert!(matches!(
            assemble("wq", ShardAxis::Rows, &[a.clone(), a], &current),
            Err(MmError::Checkpoint(_))
        ));
    }
}
