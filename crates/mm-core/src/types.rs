//! Общие типы данных для мультимодальных операций.

use std::path::PathBuf;

use crate::modality::Modality;

// ---------------------------------------------------------------------------
// Аудио-буфер
// ---------------------------------------------------------------------------

/// Буфер необработанного аудио.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    /// Аудио-сэмплы (нормализованы к [-1.0, 1.0]).
    pub samples: Vec<f32>,

    /// Частота дискретизации в Гц.
    pub sample_rate: usize,

    /// Количество каналов.
    pub channels: usize,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: usize, channels: usize) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Пустой моно-буфер (генератор вернул ничего).
    pub fn silent(sample_rate: usize) -> Self {
        Self::new(Vec::new(), sample_rate, 1)
    }

    /// Длительность в секундах.
    pub fn duration(&self) -> f32 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / (self.sample_rate * self.channels) as f32
    }

    /// Количество сэмплов на канал.
    pub fn num_samples(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels
    }
}

// ---------------------------------------------------------------------------
// Сырые входы модальностей
// ---------------------------------------------------------------------------

/// Сырой вход одной модальности, который понимает внешний энкодер.
#[derive(Debug, Clone)]
pub enum RawMedia {
    /// Моно-волна с частотой дискретизации.
    Waveform { samples: Vec<f32>, sample_rate: u32 },
    /// Путь к изображению.
    ImagePath(PathBuf),
    /// Путь к видео.
    VideoPath(PathBuf),
}

impl RawMedia {
    /// Модальность входа.
    pub fn modality(&self) -> Modality {
        match self {
            RawMedia::Waveform { .. } => Modality::Audio,
            RawMedia::ImagePath(_) => Modality::Image,
            RawMedia::VideoPath(_) => Modality::Video,
        }
    }

    /// Короткое описание для логов.
    pub fn describe(&self) -> String {
        match self {
            RawMedia::Waveform {
                samples,
                sample_rate,
            } => format!(
                "waveform {:.1}s @ {} Hz",
                samples.len() as f32 / (*sample_rate).max(1) as f32,
                sample_rate
            ),
            RawMedia::ImagePath(p) => format!("image {}", p.display()),
            RawMedia::VideoPath(p) => format!("video {}", p.display()),
        }
    }
}

/// Вход модальности с весом для смешивания нескольких входов.
#[derive(Debug, Clone)]
pub struct MediaInput {
    pub media: RawMedia,
    pub weight: f32,
}

impl MediaInput {
    pub fn new(media: RawMedia, weight: f32) -> Self {
        Self { media, weight }
    }

    /// Вход с единичным весом.
    pub fn unit(media: RawMedia) -> Self {
        Self::new(media, 1.0)
    }

    pub fn modality(&self) -> Modality {
        self.media.modality()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_buffer_duration() {
        let buf = AudioBuffer::new(vec![0.0; 48_000], 24_000, 1);
        assert!((buf.duration() - 2.0).abs() < 1e-6);
        assert_eq!(buf.num_samples(), 48_000);
        assert_eq!(AudioBuffer::silent(16_000).duration(), 0.0);
    }

    #[test]
    fn test_media_modality() {
        let m = MediaInput::unit(RawMedia::ImagePath("a.png".into()));
        assert_eq!(m.modality(), Modality::Image);
        assert_eq!(m.weight, 1.0);
        let w = RawMedia::Waveform {
            samples: vec![0.0; 10],
            sample_rate: 10,
        };
        assert_eq!(w.modality(), Modality::Audio);
    }
}
