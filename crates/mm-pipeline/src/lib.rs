//! # mm-pipeline
//!
//! Сквозная генерация: промпт с inline-медиа -> текст и музыка.
//!
//! Объединяет разбор промпта, токенайзер, сэмплер, авторегрессионный цикл
//! с захватом состояний `[AUD*]` и внешний аудио-генератор.

pub mod capture;
pub mod generation;
pub mod output;
pub mod pipeline;
pub mod prompt;
pub mod sampling;
pub mod tokenizer;

pub use capture::CaptureTracker;
pub use generation::{GeneratedRow, GenerationLoop, ModelSession, StepModel, PAD_ID};
pub use output::{strip_generation_tokens, MultimodalOutput, StopReason, CONDITIONING_TENSOR};
pub use pipeline::{dtype_for_device, MultimodalPipeline};
pub use prompt::{parse_prompt, prompt_media, prompt_text, PromptSegment, PromptTemplate, SegmentKind};
pub use sampling::{top_p_filter, Sampler};
pub use tokenizer::HfTokenizer;
