//! Adapter-чекпоинт: обученные мосты, префикс, проектор и добавки LLM.
//!
//! Загрузка строгая: любой ключ файла, которому нет параметра в модели,
//! или несовпадение формы прерывает загрузку до записи первого тензора.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};
use mm_core::{MmError, MmResult, ParamGroup, ParamStore};
use tracing::{info, warn};

/// Итог загрузки adapter-чекпоинта.
#[derive(Debug, Clone, Default)]
pub struct AdapterLoadReport {
    pub loaded: usize,
    /// Параметры вне backbone, которых нет в файле (остались свежими).
    pub missing: Vec<String>,
}

/// Загрузить `adapter.safetensors` в хранилище.
pub fn load_adapter(store: &ParamStore, path: impl AsRef<Path>) -> MmResult<AdapterLoadReport> {
    let path = path.as_ref();
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)
        .map_err(|e| MmError::Checkpoint(format!("failed to read {}: {e}", path.display())))?;
    apply_tensors(store, &tensors)?;

    let mut report = AdapterLoadReport {
        loaded: tensors.len(),
        ..Default::default()
    };
    for name in store.names() {
        let adapter_side = !matches!(store.group_of(&name), Some(ParamGroup::LmBackbone) | None);
        if adapter_side && !tensors.contains_key(&name) {
            report.missing.push(name);
        }
    }
    if !report.missing.is_empty() {
        warn!(
            "В {} нет {} параметров адаптера, они остаются свежими",
            path.display(),
            report.missing.len()
        );
    }
    info!("Adapter загружен: {} тензоров из {}", report.loaded, path.display());
    Ok(report)
}

/// Строго записать набор тензоров в хранилище.
pub fn apply_tensors(store: &ParamStore, tensors: &HashMap<String, Tensor>) -> MmResult<()> {
    let mut unexpected: Vec<&str> = Vec::new();
    for (name, t) in tensors {
        match store.get(name) {
            None => unexpected.push(name),
            Some(current) if current.shape() != t.shape() => {
                return Err(MmError::Checkpoint(format!(
                    "shape mismatch for {name}: model {:?}, checkpoint {:?}",
                    current.shape(),
                    t.shape()
                )));
            }
            Some(_) => {}
        }
    }
    if !unexpected.is_empty() {
        unexpected.sort_unstable();
        return Err(MmError::Checkpoint(format!(
            "Unexpected keys: {}",
            unexpected.join(", ")
        )));
    }
    for (name, t) in tensors {
        store.set(name, t)?;
    }
    Ok(())
}

/// Сохранить текущий обучаемый набор. Возвращает число тензоров.
pub fn save_trainable(store: &ParamStore, path: impl AsRef<Path>) -> MmResult<usize> {
    let path = path.as_ref();
    let trainable = store.trainable_names();
    let snapshot = store.snapshot(|name, _| trainable.iter().any(|n| n == name));
    candle_core::safetensors::save(&snapshot, path)?;
    info!("Сохранено {} обучаемых тензоров в {}", snapshot.len(), path.display());
    Ok(snapshot.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use mm_core::{Modality, ParamInit};

    fn scratch(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("rustmugen-{name}-{}.safetensors", std::process::id()))
    }

    fn store() -> ParamStore {
        let s = ParamStore::new(DType::F32, &Device::Cpu);
        s.builder(ParamGroup::Bridge(Modality::Audio)).get(2, "bridge.audio.proj.bias", ParamInit::Zeros).unwrap();
        s.builder(ParamGroup::ConditioningPrefix).get((2, 3), "prefix_query.weight", ParamInit::Zeros).unwrap();
        s.builder(ParamGroup::LmBackbone).get(2, "llama.norm_like", ParamInit::Zeros).unwrap();
        s
    }

    #[test]
    fn test_save_trainable_then_load() {
        let src = store();
        src.apply_trainable(|g| g == ParamGroup::ConditioningPrefix).unwrap();
        src.set("prefix_query.weight", &Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap())
            .unwrap();
        let path = scratch("adapter-ok");
        assert_eq!(save_trainable(&src, &path).unwrap(), 1);

        let dst = store();
        let report = load_adapter(&dst, &path).unwrap();
        assert_eq!(report.loaded, 1);
        assert_eq!(report.missing, vec!["bridge.audio.proj.bias".to_string()]);
        let v = dst.get("prefix_query.weight").unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(v, 6.0);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_unexpected_key_aborts_without_writing() {
        let dst = store();
        let mut tensors = HashMap::new();
        tensors.insert("prefix_query.weight".to_string(), Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap());
        tensors.insert("mu_mert_agg.weight".to_string(), Tensor::ones(1, DType::F32, &Device::Cpu).unwrap());
        let err = apply_tensors(&dst, &tensors).unwrap_err();
        assert!(matches!(err, MmError::Checkpoint(ref m) if m.contains("mu_mert_agg.weight")));
        let v = dst.get("prefix_query.weight").unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(v, 0.0);
    }

    #[test]
    fn test_shape_mismatch_is_checkpoint_error() {
        let dst = store();
        let tensors: HashMap<String, Tensor> =
            [("prefix_query.weight".to_string(), Tensor::ones((3, 3), DType::F32, &Device::Cpu).unwrap())].into();
        assert!(matches!(apply_tensors(&dst, &tensors), Err(MmError::Checkpoint(_))));
    }
}
