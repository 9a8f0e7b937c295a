//! # mm-core
//!
//! Базовые типы, трейты и определения ошибок для RustMuGen.
//!
//! Этот крейт предоставляет фундаментальные абстракции для всех остальных
//! крейтов в workspace:
//!
//! - Перечисления модальностей и стадий обучения ([`Modality`], [`TrainingStage`])
//! - Конфигурационные структуры (энкодеры, retrieval, генерация)
//! - Унифицированная обработка ошибок через [`MmError`]
//! - Трейты внешних компонентов (энкодеры, генератор аудио, индекс, токенайзер)
//! - Хранилище параметров с тегами групп ([`ParamStore`])

pub mod config;
pub mod debug;
pub mod error;
pub mod modality;
pub mod model_files;
pub mod params;
pub mod tensor;
pub mod traits;
pub mod types;

pub use config::{
    ConditioningConfig, EncoderSpec, GenerationConfig, ProjectorConfig, RetrievalConfig,
};
pub use error::{MmError, MmResult};
pub use modality::{Modality, TrainingStage};
pub use params::{ParamBuilder, ParamGroup, ParamInit, ParamStore};
pub use traits::{AudioGenerator, ModalityEncoder, RetrievalIndex, TextTokenizer};
pub use types::{AudioBuffer, MediaInput, RawMedia};
