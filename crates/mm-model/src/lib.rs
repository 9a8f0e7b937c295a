//! # mm-model
//!
//! Мультимодальная модель поверх LLaMA:
//!
//! - [`ModelArgs`]: конфигурация (`params.json` + `mugen.json`)
//! - [`LayerConditioningScheme`] и [`ConditioningPrefix`]: что инжектируется в какой слой
//! - [`OutputProjector`]: скрытые состояния `[AUD*]` -> conditioning генератора
//! - [`StageTrainabilityPolicy`]: обучаемые группы по стадии
//! - [`TokenVocabularyManager`]: токены `[AUD{i}]`
//! - [`MultimodalModel`]: инференс-проход, обучающий проход, загрузка весов

pub mod checkpoint;
pub mod conditioning;
pub mod config;
pub mod model;
pub mod policy;
pub mod projector;
pub mod training;
pub mod vocab;

pub use checkpoint::{load_adapter, save_trainable, AdapterLoadReport};
pub use conditioning::{
    ConditioningPrefix, LayerConditioningScheme, LayerRole, ModalityFeatures, PREFIX_NAME,
};
pub use config::ModelArgs;
pub use model::{MultimodalModel, StepOutput, LM_PREFIX};
pub use policy::StageTrainabilityPolicy;
pub use projector::{OutputProjector, PROJECTOR_NAME};
pub use training::{capture_window, DatasetType, TrainBatch, TrainOutput};
pub use vocab::{GenerationTokens, TokenVocabularyManager};
