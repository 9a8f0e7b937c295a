//! Конфигурационные структуры для мультимодальной модели.
//!
//! Конфиг самого LLM (размерности, число слоёв) живёт в `llama-decoder`,
//! здесь только то, что нужно нескольким крейтам сразу.

use serde::{Deserialize, Serialize};

use crate::error::{MmError, MmResult};
use crate::modality::Modality;

/// Сколько слоёв декодера отдано под каждую модальность и сколько
/// query-векторов инжектится в каждый такой слой.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditioningConfig {
    /// Число условных слоёв на модальность (`G`).
    pub query_layer: usize,

    /// Число query-токенов на слой.
    pub query_len: usize,
}

impl Default for ConditioningConfig {
    fn default() -> Self {
        Self {
            query_layer: 6,
            query_len: 1,
        }
    }
}

impl ConditioningConfig {
    /// Всего условных слоёв (`3G`).
    pub fn conditioned_layers(&self) -> usize {
        self.query_layer * Modality::COUNT
    }

    /// Проверка против числа слоёв LLM: backbone не может быть пустым.
    pub fn validate(&self, num_layers: usize) -> MmResult<()> {
        if self.query_layer == 0 {
            return Err(MmError::Config("query_layer must be positive".into()));
        }
        if self.query_len == 0 {
            return Err(MmError::Config("query_len must be positive".into()));
        }
        if num_layers <= self.conditioned_layers() {
            return Err(MmError::Config(format!(
                "backbone range is empty: {} layers, {} reserved for conditioning ({} modalities x query_layer={})",
                num_layers,
                self.conditioned_layers(),
                Modality::COUNT,
                self.query_layer
            )));
        }
        Ok(())
    }
}

/// Описание выхода внешнего энкодера модальности.
///
/// Энкодер возвращает матрицу `[channels, feature_dim]` на одно окно входа:
/// для MERT это скрытые состояния всех слоёв, усреднённые по времени,
/// для ViT/ViViT это токены последнего слоя.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderSpec {
    /// Модальность энкодера.
    pub modality: Modality,

    /// Имя модели (для логов).
    pub model_name: String,

    /// Число каналов, которые схлопывает агрегатор.
    pub channels: usize,

    /// Размерность признака энкодера.
    pub feature_dim: usize,

    /// Частота дискретизации входа (только аудио).
    pub sample_rate: Option<u32>,

    /// Длина окна в секундах для длинного аудио.
    pub window_secs: Option<f32>,
}

impl EncoderSpec {
    /// MERT-v1-330M: 25 скрытых состояний по 1024, вход 24 кГц, окна по 60 с.
    pub fn mert_v1_330m() -> Self {
        Self {
            modality: Modality::Audio,
            model_name: "MERT-v1-330M".to_string(),
            channels: 25,
            feature_dim: 1024,
            sample_rate: Some(24_000),
            window_secs: Some(60.0),
        }
    }

    /// ViT-base/16, 224px: 197 токенов по 768.
    pub fn vit_base() -> Self {
        Self {
            modality: Modality::Image,
            model_name: "vit-base-patch16-224".to_string(),
            channels: 197,
            feature_dim: 768,
            sample_rate: None,
            window_secs: None,
        }
    }

    /// ViViT-base (Kinetics-400): 3137 токенов по 768.
    pub fn vivit_base() -> Self {
        Self {
            modality: Modality::Video,
            model_name: "vivit-b-16x2-kinetics400".to_string(),
            channels: 3137,
            feature_dim: 768,
            sample_rate: None,
            window_secs: None,
        }
    }

    /// Спецификация по умолчанию для модальности.
    pub fn default_for(modality: Modality) -> Self {
        match modality {
            Modality::Audio => Self::mert_v1_330m(),
            Modality::Image => Self::vit_base(),
            Modality::Video => Self::vivit_base(),
        }
    }

    /// Размер окна в сэмплах (если энкодер работает с окнами).
    pub fn window_samples(&self) -> Option<usize> {
        match (self.sample_rate, self.window_secs) {
            (Some(sr), Some(secs)) if secs > 0.0 => Some((sr as f32 * secs) as usize),
            _ => None,
        }
    }
}

/// Конфигурация выходного проектора (hidden LLM → conditioning аудио-генератора).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectorConfig {
    /// Размерность conditioning-пространства генератора.
    pub output_dim: usize,

    /// Длина conditioning-последовательности генератора.
    pub num_output_tokens: usize,

    /// С каких слоёв LLM берутся скрытые состояния (`-1` = последний слой).
    /// Каждому слою соответствует своя голова проектора, выходы суммируются.
    pub input_layers: Vec<isize>,
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self {
            output_dim: 768,
            num_output_tokens: 1,
            input_layers: vec![-1],
        }
    }
}

/// Параметры retrieval-сглаживания признака (kNN по прототипам).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Сколько ближайших прототипов запрашивать.
    pub cache_size: usize,

    /// Температура softmax по сходствам.
    pub cache_t: f32,

    /// Вес извлечённого вектора в смеси.
    pub cache_weight: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            cache_size: 10,
            cache_t: 20.0,
            cache_weight: 0.5,
        }
    }
}

/// Параметры авторегрессионной генерации.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Максимум новых токенов на последовательность.
    pub max_gen_len: usize,

    /// Температура (0 = greedy).
    pub temperature: f32,

    /// Порог nucleus-сэмплинга.
    pub top_p: f32,

    /// Длительность генерируемого аудио в секундах.
    pub audio_length_in_s: f32,

    /// Seed генератора случайных чисел.
    pub seed: u64,

    /// Дополнительные последовательности остановки (id токенов).
    #[serde(default)]
    pub stop_sequences: Vec<Vec<u32>>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_gen_len: 256,
            temperature: 0.1,
            top_p: 0.75,
            audio_length_in_s: 10.0,
            seed: 299_792_458,
            stop_sequences: Vec::new(),
        }
    }
}

impl GenerationConfig {
    /// Greedy-декодирование без сэмплинга.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Self::default()
        }
    }

    /// Число кадров аудио-генератора для заданной длительности (256 кадров на 5 с).
    pub fn audio_frames(&self) -> usize {
        (256.0 / 5.0 * self.audio_length_in_s).floor() as usize
    }

    pub fn validate(&self) -> MmResult<()> {
        if !(self.top_p >= 0.0 && self.top_p <= 1.0) {
            return Err(MmError::Config(format!(
                "top_p must be in [0, 1], got {}",
                self.top_p
            )));
        }
        if self.temperature < 0.0 {
            return Err(MmError::Config(format!(
                "temperature must be non-negative, got {}",
                self.temperature
            )));
        }
        if self.stop_sequences.iter().any(|s| s.is_empty()) {
            return Err(MmError::Config("empty stop sequence".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_conditioning() {
        let cfg = ConditioningConfig::default();
        assert_eq!(cfg.query_layer, 6);
        assert_eq!(cfg.conditioned_layers(), 18);
        assert!(cfg.validate(32).is_ok());
    }

    #[test]
    fn test_empty_backbone_is_rejected() {
        let cfg = ConditioningConfig {
            query_layer: 6,
            query_len: 1,
        };
        assert!(cfg.validate(18).is_err());
        assert!(cfg.validate(12).is_err());
        assert!(cfg.validate(19).is_ok());
    }

    #[test]
    fn test_encoder_presets() {
        let mert = EncoderSpec::mert_v1_330m();
        assert_eq!(mert.channels, 25);
        assert_eq!(mert.window_samples(), Some(24_000 * 60));
        assert_eq!(EncoderSpec::vit_base().window_samples(), None);
        assert_eq!(EncoderSpec::default_for(Modality::Video).channels, 3137);
    }

    #[test]
    fn test_audio_frames() {
        let cfg = GenerationConfig::default();
        // 256 / 5 * 10 = 512
        assert_eq!(cfg.audio_frames(), 512);
    }

    #[test]
    fn test_generation_validation() {
        let mut cfg = GenerationConfig::default();
        assert!(cfg.validate().is_ok());
        cfg.top_p = 1.5;
        assert!(cfg.validate().is_err());
        cfg.top_p = 0.9;
        cfg.stop_sequences = vec![vec![]];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_generation_config_json() {
        let json = r#"{"max_gen_len":64,"temperature":0.0,"top_p":1.0,"audio_length_in_s":5.0,"seed":1}"#;
        let cfg: GenerationConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.max_gen_len, 64);
        assert!(cfg.stop_sequences.is_empty());
    }
}
