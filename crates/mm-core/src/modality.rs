//! Реестр модальностей и стадий обучения.
//!
//! Модальности условного входа (аудио, изображение, видео) фиксированы:
//! каждая имеет свой энкодер, свой мост и свою группу слоёв декодера.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Модальность условного входа.
///
/// Порядок вариантов совпадает с порядком групп слоёв декодера:
/// аудио-группа идёт первой после backbone, видео-группа последней.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Modality {
    /// Музыка / аудио (MERT).
    Audio,
    /// Изображение (ViT).
    Image,
    /// Видео (ViViT).
    Video,
}

impl Modality {
    /// Количество модальностей условного входа.
    pub const COUNT: usize = 3;

    /// Все модальности в порядке групп слоёв.
    pub fn all() -> [Modality; Self::COUNT] {
        [Modality::Audio, Modality::Image, Modality::Video]
    }

    /// Индекс модальности (позиция группы слоёв и индекс в массивах мостов).
    pub fn index(self) -> usize {
        match self {
            Modality::Audio => 0,
            Modality::Image => 1,
            Modality::Video => 2,
        }
    }

    /// Строковый идентификатор (CLI, имена параметров).
    pub fn as_str(self) -> &'static str {
        match self {
            Modality::Audio => "audio",
            Modality::Image => "image",
            Modality::Video => "video",
        }
    }

    /// Имя тега в inline-разметке промпта (`<Audio>...</Audio>`).
    pub fn tag(self) -> &'static str {
        match self {
            Modality::Audio => "Audio",
            Modality::Image => "Image",
            Modality::Video => "Video",
        }
    }

    /// Префикс зарезервированных токенов генерации (`[AUD0]`, `[IMG0]`, ...).
    pub fn gen_token_prefix(self) -> &'static str {
        match self {
            Modality::Audio => "AUD",
            Modality::Image => "IMG",
            Modality::Video => "VID",
        }
    }

    /// Парсинг из строки (CLI-совместимо).
    pub fn from_str_loose(s: &str) -> Option<Modality> {
        match s.to_lowercase().as_str() {
            "audio" | "music" | "aud" => Some(Modality::Audio),
            "image" | "img" | "picture" => Some(Modality::Image),
            "video" | "vid" => Some(Modality::Video),
            _ => None,
        }
    }

    /// Модальность по тегу разметки (регистр важен, как в исходных промптах).
    pub fn from_tag(tag: &str) -> Option<Modality> {
        Self::all().into_iter().find(|m| m.tag() == tag)
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Стадия обучения. Определяет, какие группы параметров обучаемы.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrainingStage {
    /// Выравнивание энкодеров: обучаются только мосты.
    EncoderAlignment,
    /// Выравнивание выхода: проектор и таблица префиксов.
    DecoderAlignment,
    /// Instruction tuning: всё вышеперечисленное плюс norm/bias/low-rank в LLM.
    InstructionTuning,
}

impl TrainingStage {
    /// Номер стадии (1/2/3).
    pub fn number(self) -> u8 {
        match self {
            TrainingStage::EncoderAlignment => 1,
            TrainingStage::DecoderAlignment => 2,
            TrainingStage::InstructionTuning => 3,
        }
    }

    /// Стадия по номеру.
    pub fn from_number(n: u8) -> Option<TrainingStage> {
        match n {
            1 => Some(TrainingStage::EncoderAlignment),
            2 => Some(TrainingStage::DecoderAlignment),
            3 => Some(TrainingStage::InstructionTuning),
            _ => None,
        }
    }
}

impl fmt::Display for TrainingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrainingStage::EncoderAlignment => "encoder alignment",
            TrainingStage::DecoderAlignment => "decoder alignment",
            TrainingStage::InstructionTuning => "instruction tuning",
        };
        write!(f, "stage {} ({})", self.number(), name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modality_index_matches_order() {
        for (i, m) in Modality::all().into_iter().enumerate() {
            assert_eq!(m.index(), i);
        }
    }

    #[test]
    fn test_from_tag_is_case_sensitive() {
        assert_eq!(Modality::from_tag("Image"), Some(Modality::Image));
        assert_eq!(Modality::from_tag("image"), None);
        assert_eq!(Modality::from_str_loose("MUSIC"), Some(Modality::Audio));
    }

    #[test]
    fn test_stage_roundtrip() {
        for n in 1..=3 {
            let stage = TrainingStage::from_number(n).unwrap();
            assert_eq!(stage.number(), n);
        }
        assert!(TrainingStage::from_number(4).is_none());
    }
}
