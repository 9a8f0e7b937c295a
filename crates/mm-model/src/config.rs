//! Конфигурация мультимодальной модели.

use std::path::Path;

use llama_decoder::LlamaConfig;
use mm_core::model_files::{optional_file, require_file, OVERRIDES_FILE, PARAMS_FILE};
use mm_core::{
    ConditioningConfig, EncoderSpec, MmError, MmResult, Modality, ProjectorConfig, RetrievalConfig,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Полная конфигурация модели, фиксируется при построении.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArgs {
    /// Конфигурация LLM (`params.json`).
    pub llama: LlamaConfig,

    /// Сколько слоёв и query-векторов на модальность.
    #[serde(default)]
    pub conditioning: ConditioningConfig,

    /// Выходы внешних энкодеров по модальностям.
    #[serde(default = "default_encoders")]
    pub encoders: Vec<EncoderSpec>,

    #[serde(default)]
    pub projector: ProjectorConfig,

    /// kNN-сглаживание признаков (если есть индекс).
    #[serde(default)]
    pub retrieval: Option<RetrievalConfig>,

    /// Число токенов `[AUD{i}]`.
    #[serde(default = "default_num_gen_audio_tokens")]
    pub num_gen_audio_tokens: usize,

    /// LayerNorm с bias в мостах (старые чекпоинты).
    #[serde(default)]
    pub legacy_bridge: bool,

    /// Множитель MSE-лосса проектора в общем лоссе.
    #[serde(default = "default_loss_scale")]
    pub loss_scale: f64,
}

fn default_encoders() -> Vec<EncoderSpec> {
    Modality::all().into_iter().map(EncoderSpec::default_for).collect()
}

fn default_num_gen_audio_tokens() -> usize {
    8
}

fn default_loss_scale() -> f64 {
    1.0
}

/// Переопределения из `mugen.json`: все поля необязательны.
#[derive(Debug, Clone, Default, Deserialize)]
struct Overrides {
    conditioning: Option<ConditioningConfig>,
    encoders: Option<Vec<EncoderSpec>>,
    projector: Option<ProjectorConfig>,
    retrieval: Option<RetrievalConfig>,
    num_gen_audio_tokens: Option<usize>,
    legacy_bridge: Option<bool>,
    loss_scale: Option<f64>,
    max_seq_len: Option<usize>,
    max_batch_size: Option<usize>,
}

impl ModelArgs {
    /// Конфигурация M2UGen поверх LLaMA-2 7B.
    pub fn mugen_7b() -> Self {
        Self::with_llama(LlamaConfig::llama_7b())
    }

    /// Значения по умолчанию для всего, кроме LLM.
    pub fn with_llama(llama: LlamaConfig) -> Self {
        Self {
            llama,
            conditioning: ConditioningConfig::default(),
            encoders: default_encoders(),
            projector: ProjectorConfig::default(),
            retrieval: None,
            num_gen_audio_tokens: default_num_gen_audio_tokens(),
            legacy_bridge: false,
            loss_scale: default_loss_scale(),
        }
    }

    /// Прочитать `params.json` и необязательный `mugen.json` из директории модели.
    pub fn from_model_dir(model_dir: impl AsRef<Path>) -> MmResult<Self> {
        let model_dir = model_dir.as_ref();
        let llama = LlamaConfig::from_params_json(require_file(model_dir, PARAMS_FILE)?)?;
        let mut args = Self::with_llama(llama);

        if let Some(path) = optional_file(model_dir, OVERRIDES_FILE) {
            let content = std::fs::read_to_string(&path).map_err(|e| {
                MmError::Config(format!("Failed to read {}: {}", path.display(), e))
            })?;
            let overrides: Overrides = serde_json::from_str(&content)?;
            args.apply(overrides);
            info!("Применены переопределения из {}", path.display());
        }
        debug!("ModelArgs: {:?}", args);
        Ok(args)
    }

    fn apply(&mut self, o: Overrides) {
        if let Some(v) = o.conditioning {
            self.conditioning = v;
        }
        if let Some(v) = o.encoders {
            self.encoders = v;
        }
        if let Some(v) = o.projector {
            self.projector = v;
        }
        if o.retrieval.is_some() {
            self.retrieval = o.retrieval;
        }
        if let Some(v) = o.num_gen_audio_tokens {
            self.num_gen_audio_tokens = v;
        }
        if let Some(v) = o.legacy_bridge {
            self.legacy_bridge = v;
        }
        if let Some(v) = o.loss_scale {
            self.loss_scale = v;
        }
        if let Some(v) = o.max_seq_len {
            self.llama.max_seq_len = v;
        }
        if let Some(v) = o.max_batch_size {
            self.llama.max_batch_size = v;
        }
    }

    /// Описание энкодера модальности (или значение по умолчанию).
    pub fn encoder(&self, modality: Modality) -> EncoderSpec {
        self.encoders
            .iter()
            .find(|s| s.modality == modality)
            .cloned()
            .unwrap_or_else(|| EncoderSpec::default_for(modality))
    }

    /// Индексы слоёв, скрытые состояния которых идут в проектор.
    ///
    /// Индекс `0` это выход эмбеддингов, `i` это выход слоя `i - 1`,
    /// отрицательные считаются с конца (`-1` = последний слой).
    pub fn projector_views(&self) -> MmResult<Vec<usize>> {
        let total = self.llama.n_layers as isize + 1;
        self.projector
            .input_layers
            .iter()
            .map(|&i| {
                let idx = if i < 0 { total + i } else { i };
                if idx < 0 || idx >= total {
                    Err(MmError::Config(format!(
                        "projector input layer {i} is out of range for {} layers",
                        self.llama.n_layers
                    )))
                } else {
                    Ok(idx as usize)
                }
            })
            .collect()
    }

    /// Проверить конфигурацию целиком. Ошибки фатальны.
    pub fn validate(&self) -> MmResult<()> {
        self.llama.validate()?;
        self.conditioning.validate(self.llama.n_layers)?;
        if self.num_gen_audio_tokens == 0 {
            return Err(MmError::Config("num_gen_audio_tokens must be positive".into()));
        }
        if self.projector.output_dim == 0 || self.projector.num_output_tokens == 0 {
            return Err(MmError::Config(
                "projector output_dim and num_output_tokens must be positive".into(),
            ));
        }
        if self.projector.input_layers.is_empty() {
            return Err(MmError::Config("projector needs at least one input layer".into()));
        }
        self.projector_views()?;
        for m in Modality::all() {
            let n = self.encoders.iter().filter(|s| s.modality == m).count();
            if n > 1 {
                return Err(MmError::Config(format!("{n} encoder specs for {m}")));
            }
        }
        if let Some(r) = &self.retrieval {
            if r.cache_size == 0 {
                return Err(MmError::Config("retrieval cache_size must be positive".into()));
            }
        }
        Ok(())
    }

    /// Размер батча не должен превышать `max_batch_size`.
    pub fn check_batch(&self, batch: usize) -> MmResult<()> {
        if batch == 0 || batch > self.llama.max_batch_size {
            return Err(MmError::Config(format!(
                "batch size {batch} is outside 1..={}",
                self.llama.max_batch_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("rustmugen-args-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_defaults() {
        let args = ModelArgs::with_llama(LlamaConfig::llama_7b().with_vocab_size(32008));
        assert_eq!(args.num_gen_audio_tokens, 8);
        assert_eq!(args.encoder(Modality::Audio).channels, 25);
        assert_eq!(args.projector_views().unwrap(), vec![32]);
        args.validate().unwrap();
    }

    #[test]
    fn test_backbone_must_not_be_empty() {
        let mut args = ModelArgs::with_llama(LlamaConfig::llama_7b().with_vocab_size(100));
        args.llama.n_layers = 18;
        assert!(matches!(args.validate(), Err(MmError::Config(_))));
        args.llama.n_layers = 19;
        args.validate().unwrap();
    }

    #[test]
    fn test_batch_limit() {
        let args = ModelArgs::mugen_7b();
        assert!(args.check_batch(1).is_ok());
        assert!(args.check_batch(2).is_err());
    }

    #[test]
    fn test_from_model_dir_with_overrides() {
        let dir = scratch_dir("overrides");
        std::fs::write(
            dir.join(PARAMS_FILE),
            r#"{"dim": 64, "n_layers": 8, "n_heads": 4, "multiple_of": 16, "norm_eps": 1e-06, "vocab_size": -1}"#,
        )
        .unwrap();
        std::fs::write(
            dir.join(OVERRIDES_FILE),
            r#"{"conditioning": {"query_layer": 2, "query_len": 1}, "num_gen_audio_tokens": 4, "max_batch_size": 2}"#,
        )
        .unwrap();
        let args = ModelArgs::from_model_dir(&dir).unwrap();
        assert_eq!(args.conditioning.query_layer, 2);
        assert_eq!(args.num_gen_audio_tokens, 4);
        assert_eq!(args.llama.max_batch_size, 2);
        assert_eq!(args.llama.vocab_size, 0);
        assert!(!args.legacy_bridge);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_projector_views_out_of_range() {
        let mut args = ModelArgs::with_llama(LlamaConfig::llama_7b().with_vocab_size(100));
        args.projector.input_layers = vec![-1, 0, 16];
        assert_eq!(args.projector_views().unwrap(), vec![32, 0, 16]);
        args.projector.input_layers = vec![-34];
        assert!(args.validate().is_err());
    }
}
