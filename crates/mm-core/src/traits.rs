//! Трейты внешних компонентов.
//!
//! Предобученные энкодеры, аудио-генератор, kNN-индекс и токенайзер
//! подключаются через эти трейты. Ядро не знает их внутреннего устройства.

use candle_core::Tensor;

use crate::error::MmResult;
use crate::modality::Modality;
use crate::types::{AudioBuffer, RawMedia};

/// Внешний энкодер модальности (MERT, ViT, ViViT).
///
/// # Пример
/// ```ignore
/// let features = encoder.encode(&RawMedia::ImagePath("cat.png".into()))?;
/// assert_eq!(features.dims(), &[197, 768]);
/// ```
pub trait ModalityEncoder: Send {
    /// Модальность, которую кодирует энкодер.
    fn modality(&self) -> Modality;

    /// Закодировать один вход (или одно окно длинного аудио).
    ///
    /// Возвращает матрицу `[channels, feature_dim]`: скрытые состояния
    /// по слоям (MERT) или по токенам (ViT/ViViT).
    fn encode(&mut self, media: &RawMedia) -> MmResult<Tensor>;
}

/// Внешний условный генератор аудио (MusicGen / AudioLDM2).
pub trait AudioGenerator: Send {
    /// Частота дискретизации выходной волны.
    fn sample_rate(&self) -> u32;

    /// Сгенерировать волну по conditioning-тензору `[B, T', D_out]`.
    ///
    /// `max_new_tokens` это число кадров генератора (подсказка длины).
    fn generate(&mut self, conditioning: &Tensor, max_new_tokens: usize) -> MmResult<AudioBuffer>;
}

/// Индекс ближайших соседей по скалярному произведению.
pub trait RetrievalIndex: Send + Sync {
    /// Размерность векторов индекса.
    fn dim(&self) -> usize;

    /// Число векторов в индексе.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Поиск `k` ближайших для каждой строки `query [B, D]`.
    ///
    /// Возвращает сходства и id построчно. Строка может содержать меньше `k`
    /// элементов; отрицательный id означает «соседа нет».
    fn search(&self, query: &Tensor, k: usize) -> MmResult<(Vec<Vec<f32>>, Vec<Vec<i64>>)>;

    /// Восстановить вектор по id.
    fn reconstruct(&self, id: i64) -> MmResult<Vec<f32>>;
}

/// Токенайзер LLM с возможностью добавлять токены.
pub trait TextTokenizer {
    /// Кодирование текста. `add_bos` добавляет BOS в начало.
    fn encode(&self, text: &str, add_bos: bool) -> MmResult<Vec<u32>>;

    /// Декодирование id в текст (без спецтокенов).
    fn decode(&self, ids: &[u32]) -> MmResult<String>;

    /// Добавить литерал токена. Возвращает число реально добавленных токенов.
    fn add_token(&mut self, literal: &str) -> MmResult<usize>;

    /// Текущий размер словаря (включая добавленные токены).
    fn vocab_size(&self) -> usize;

    fn eos_token_id(&self) -> u32;

    fn bos_token_id(&self) -> u32;
}
