//! Послойная инжекция условий.
//!
//! Слои LLM делятся на backbone `[0, L-3G)` и три группы по `G` слоёв:
//! аудио `[L-3G, L-2G)`, изображение `[L-2G, L-G)`, видео `[L-G, L)`.
//! В `j`-й слой группы идёт `feature + prefix[slot]`, если признак
//! модальности есть, иначе только `prefix[slot]`, где `slot` это сквозной
//! номер условного слоя `0..3G`. Таким образом каждый проход инжектирует
//! ровно `3G` векторов.

use std::ops::Range;

use candle_core::{Result, Tensor};
use mm_core::{ConditioningConfig, MmResult, Modality, ParamGroup, ParamInit, ParamStore};

/// Имя таблицы префиксов в хранилище.
pub const PREFIX_NAME: &str = "prefix_query";

/// Роль слоя в схеме.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerRole {
    Backbone,
    Conditioned { modality: Modality, slot: usize },
}

/// Разбиение слоёв LLM на backbone и группы модальностей.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerConditioningScheme {
    num_layers: usize,
    query_layer: usize,
}

impl LayerConditioningScheme {
    /// `L <= 3G` это ошибка конфигурации.
    pub fn new(num_layers: usize, config: &ConditioningConfig) -> MmResult<Self> {
        config.validate(num_layers)?;
        Ok(Self {
            num_layers,
            query_layer: config.query_layer,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    /// Всего условных слоёв (`3G`).
    pub fn conditioned_layers(&self) -> usize {
        self.query_layer * Modality::COUNT
    }

    pub fn backbone_range(&self) -> Range<usize> {
        0..self.num_layers - self.conditioned_layers()
    }

    pub fn group_range(&self, modality: Modality) -> Range<usize> {
        let start = self.backbone_range().end + modality.index() * self.query_layer;
        start..start + self.query_layer
    }

    pub fn role(&self, layer: usize) -> LayerRole {
        let backbone_end = self.backbone_range().end;
        if layer < backbone_end || layer >= self.num_layers {
            return LayerRole::Backbone;
        }
        let slot = layer - backbone_end;
        let modality = Modality::all()[slot / self.query_layer];
        LayerRole::Conditioned { modality, slot }
    }
}

/// Признаки модальностей одного вызова `[B, 1, D]`, по слоту на модальность.
#[derive(Debug, Clone, Default)]
pub struct ModalityFeatures {
    slots: [Option<Tensor>; Modality::COUNT],
}

impl ModalityFeatures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, modality: Modality, feature: Tensor) {
        self.slots[modality.index()] = Some(feature);
    }

    pub fn with(mut self, modality: Modality, feature: Tensor) -> Self {
        self.set(modality, feature);
        self
    }

    pub fn get(&self, modality: Modality) -> Option<&Tensor> {
        self.slots[modality.index()].as_ref()
    }

    pub fn present(&self) -> Vec<Modality> {
        Modality::all()
            .into_iter()
            .filter(|m| self.get(*m).is_some())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}

/// Обучаемая таблица префиксов `[3G * query_len, D]`.
#[derive(Debug, Clone)]
pub struct ConditioningPrefix {
    table: Tensor,
    query_len: usize,
}

impl ConditioningPrefix {
    pub fn new(config: &ConditioningConfig, dim: usize, store: &ParamStore) -> Result<Self> {
        let rows = config.conditioned_layers() * config.query_len;
        let table = store
            .builder(ParamGroup::ConditioningPrefix)
            .pp(PREFIX_NAME)
            .get((rows, dim), "weight", ParamInit::Normal { std: 1.0 })?;
        Ok(Self {
            table,
            query_len: config.query_len,
        })
    }

    pub fn num_slots(&self) -> Result<usize> {
        Ok(self.table.dim(0)? / self.query_len)
    }

    /// Префикс слота: `[1, query_len, D]`.
    pub fn entry(&self, slot: usize) -> Result<Tensor> {
        let slots = self.num_slots()?;
        if slot >= slots {
            candle_core::bail!("prefix slot {slot} out of range ({slots} slots)");
        }
        self.table
            .narrow(0, slot * self.query_len, self.query_len)?
            .unsqueeze(0)
    }

    /// Значение для инжекции: `feature + prefix[slot]` или `prefix[slot]`.
    pub fn injection(&self, slot: usize, feature: Option<&Tensor>) -> Result<Tensor> {
        let prefix = self.entry(slot)?;
        match feature {
            Some(f) => f.broadcast_add(&prefix.to_dtype(f.dtype())?),
            None => Ok(prefix),
        }
    }

    /// Инжекция для слоя `layer` (None для backbone).
    pub fn for_layer(
        &self,
        scheme: &LayerConditioningScheme,
        layer: usize,
        features: &ModalityFeatures,
    ) -> Result<Option<Tensor>> {
        match scheme.role(layer) {
            LayerRole::Backbone => Ok(None),
            LayerRole::Conditioned { modality, slot } => {
                self.injection(slot, features.get(modality)).map(Some)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn cfg(g: usize) -> ConditioningConfig {
        ConditioningConfig {
            query_layer: g,
            query_len: 1,
        }
    }

    #[test]
    fn test_layer_partition_30_6() {
        let s = LayerConditioningScheme::new(30, &cfg(6)).unwrap();
        assert_eq!(s.backbone_range(), 0..12);
        assert_eq!(s.group_range(Modality::Audio), 12..18);
        assert_eq!(s.group_range(Modality::Image), 18..24);
        assert_eq!(s.group_range(Modality::Video), 24..30);
        assert_eq!(s.role(11), LayerRole::Backbone);
        assert_eq!(
            s.role(19),
            LayerRole::Conditioned {
                modality: Modality::Image,
                slot: 7
            }
        );
        let conditioned = (0..30).filter(|l| s.role(*l) != LayerRole::Backbone).count();
        assert_eq!(conditioned, 18);
    }

    #[test]
    fn test_empty_backbone_is_rejected() {
        assert!(LayerConditioningScheme::new(18, &cfg(6)).is_err());
        assert!(LayerConditioningScheme::new(4, &cfg(0)).is_err());
    }

    #[test]
    fn test_audio_only_scenario() {
        let dim = 4;
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        let scheme = LayerConditioningScheme::new(30, &cfg(6)).unwrap();
        let prefix = ConditioningPrefix::new(&cfg(6), dim, &store).unwrap();
        let v = Tensor::new(&[[[1f32, 2., 3., 4.]]], &Device::Cpu).unwrap();
        let features = ModalityFeatures::new().with(Modality::Audio, v.clone());
        assert_eq!(features.present(), vec![Modality::Audio]);

        for layer in 0..30 {
            let inj = prefix.for_layer(&scheme, layer, &features).unwrap();
            if layer < 12 {
                assert!(inj.is_none());
                continue;
            }
            let inj = inj.unwrap();
            let slot = layer - 12;
            let expected = if layer < 18 {
                (&v + prefix.entry(slot).unwrap()).unwrap()
            } else {
                prefix.entry(slot).unwrap()
            };
            let diff = (inj - expected).unwrap().abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
            assert_eq!(diff, 0.0, "layer {layer}");
        }
    }

    #[test]
    fn test_prefix_only_without_features() {
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        let prefix = ConditioningPrefix::new(&cfg(2), 3, &store).unwrap();
        assert_eq!(prefix.num_slots().unwrap(), 6);
        let inj = prefix.injection(5, None).unwrap();
        assert_eq!(inj.dims(), &[1, 1, 3]);
        assert!(prefix.entry(6).is_err());
        assert_eq!(store.group_of("prefix_query.weight"), Some(ParamGroup::ConditioningPrefix));
    }
}
