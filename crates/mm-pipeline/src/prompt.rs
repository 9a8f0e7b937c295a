//! Разбор промпта с inline-медиа и шаблон инструкции.
//!
//! Промпт вида `Опиши <Image>cat.png</Image> и <Audio>a.wav</Audio>` разбирается
//! в список сегментов `{kind, payload}` до любой работы с тензорами.

use mm_core::{MmError, MmResult, Modality};
use regex::Regex;

/// Тип сегмента промпта.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Text,
    Media(Modality),
}

/// Один сегмент: текст или ссылка на медиафайл.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSegment {
    pub kind: SegmentKind,
    pub payload: String,
}

impl PromptSegment {
    pub fn text(payload: impl Into<String>) -> Self {
        Self {
            kind: SegmentKind::Text,
            payload: payload.into(),
        }
    }

    pub fn media(modality: Modality, payload: impl Into<String>) -> Self {
        Self {
            kind: SegmentKind::Media(modality),
            payload: payload.into(),
        }
    }
}

const MEDIA_TAG_PATTERN: &str = r"<(Image|Audio|Video)>(.*?)</(Image|Audio|Video)>";

/// Разобрать промпт на текстовые и медиа-сегменты.
///
/// Пустые текстовые куски отбрасываются, остальные обрезаются по краям.
/// Закрывающий тег обязан совпадать с открывающим.
pub fn parse_prompt(text: &str) -> MmResult<Vec<PromptSegment>> {
    let re = Regex::new(MEDIA_TAG_PATTERN).map_err(|e| MmError::Prompt(e.to_string()))?;
    let mut segments = Vec::new();
    let push_text = |segments: &mut Vec<PromptSegment>, s: &str| {
        let s = s.trim();
        if !s.is_empty() {
            segments.push(PromptSegment::text(s));
        }
    };

    let mut last = 0;
    for caps in re.captures_iter(text) {
        let (Some(whole), Some(open), Some(body), Some(close)) =
            (caps.get(0), caps.get(1), caps.get(2), caps.get(3))
        else {
            continue;
        };
        if open.as_str() != close.as_str() {
            return Err(MmError::Prompt(format!(
                "тег <{}> закрыт тегом </{}>",
                open.as_str(),
                close.as_str()
            )));
        }
        let modality = Modality::from_tag(open.as_str())
            .ok_or_else(|| MmError::Prompt(format!("неизвестный тег {}", open.as_str())))?;
        let payload = body.as_str().trim();
        if payload.is_empty() {
            return Err(MmError::Prompt(format!("пустой тег <{}>", open.as_str())));
        }
        push_text(&mut segments, &text[last..whole.start()]);
        segments.push(PromptSegment::media(modality, payload));
        last = whole.end();
    }
    push_text(&mut segments, &text[last..]);
    Ok(segments)
}

/// Текстовая часть разобранного промпта (сегменты через пробел).
pub fn prompt_text(segments: &[PromptSegment]) -> String {
    segments
        .iter()
        .filter(|s| s.kind == SegmentKind::Text)
        .map(|s| s.payload.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Ссылки на медиа в порядке появления.
pub fn prompt_media(segments: &[PromptSegment]) -> Vec<(Modality, &str)> {
    segments
        .iter()
        .filter_map(|s| match s.kind {
            SegmentKind::Media(m) => Some((m, s.payload.as_str())),
            SegmentKind::Text => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Шаблон
// ---------------------------------------------------------------------------

/// Обрамление инструкции перед токенизацией.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PromptTemplate {
    /// `### Instruction:` / `### Response:`.
    #[default]
    Instruction,
    /// Диалоговый формат `### Human:` / `### Assistant:`.
    Chat,
    /// Текст как есть.
    Raw,
}

const INSTRUCTION_HEADER: &str = "Below is an instruction that describes a task. \
Write a response that appropriately completes the request.";

impl PromptTemplate {
    pub fn format(self, instruction: &str) -> String {
        match self {
            PromptTemplate::Instruction => format!(
                "{INSTRUCTION_HEADER}\n\n### Instruction:\n{instruction}\n\n### Response:"
            ),
            PromptTemplate::Chat => format!("### Human: {instruction}\n### Assistant:"),
            PromptTemplate::Raw => instruction.to_string(),
        }
    }

    /// Парсинг из строки (CLI).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "instruction" | "alpaca" => Some(PromptTemplate::Instruction),
            "chat" => Some(PromptTemplate::Chat),
            "raw" | "none" => Some(PromptTemplate::Raw),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mixed_prompt() {
        let segs = parse_prompt("Describe <Image>cat.png</Image> and <Audio> a.wav </Audio> please").unwrap();
        assert_eq!(
            segs,
            vec![
                PromptSegment::text("Describe"),
                PromptSegment::media(Modality::Image, "cat.png"),
                PromptSegment::text("and"),
                PromptSegment::media(Modality::Audio, "a.wav"),
                PromptSegment::text("please"),
            ]
        );
        assert_eq!(prompt_text(&segs), "Describe and please");
        assert_eq!(
            prompt_media(&segs),
            vec![(Modality::Image, "cat.png"), (Modality::Audio, "a.wav")]
        );
    }

    #[test]
    fn test_plain_text_prompt() {
        let segs = parse_prompt("  compose a calm song ").unwrap();
        assert_eq!(segs, vec![PromptSegment::text("compose a calm song")]);
        assert!(parse_prompt("").unwrap().is_empty());
    }

    #[test]
    fn test_same_modality_twice() {
        let segs = parse_prompt("<Video>a.mp4</Video><Video>b.mp4</Video>").unwrap();
        assert_eq!(prompt_media(&segs).len(), 2);
        assert_eq!(prompt_text(&segs), "");
    }

    #[test]
    fn test_malformed_tags() {
        assert!(matches!(
            parse_prompt("<Image>a.png</Audio>"),
            Err(MmError::Prompt(_))
        ));
        assert!(matches!(parse_prompt("<Audio> </Audio>"), Err(MmError::Prompt(_))));
        // Незакрытый тег остаётся текстом.
        assert_eq!(
            parse_prompt("<Image>a.png").unwrap(),
            vec![PromptSegment::text("<Image>a.png")]
        );
    }

    #[test]
    fn test_templates() {
        let s = PromptTemplate::Instruction.format("play jazz");
        assert!(s.ends_with("### Instruction:\nplay jazz\n\n### Response:"));
        assert_eq!(PromptTemplate::Chat.format("hi"), "### Human: hi\n### Assistant:");
        assert_eq!(PromptTemplate::Raw.format("hi"), "hi");
        assert_eq!(PromptTemplate::from_name("Alpaca"), Some(PromptTemplate::Instruction));
        assert_eq!(PromptTemplate::from_name("xml"), None);
    }
}
