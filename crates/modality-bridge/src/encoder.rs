//! Адаптер внешнего энкодера модальности.
//!
//! Сводит вход произвольной длины к одной матрице `[channels, feature_dim]`:
//! длинное аудио режется на окна, выходы окон усредняются. Ошибка энкодера
//! не прерывает генерацию: модальность получает нулевой признак.

use audio::{split_windows, Resampler};
use candle_core::{DType, Device, Tensor};
use mm_core::{AudioBuffer, EncoderSpec, MmError, MmResult, Modality, ModalityEncoder, RawMedia};
use tracing::{debug, warn};

/// Внешний энкодер вместе с описанием его выхода.
pub struct EncoderAdapter {
    spec: EncoderSpec,
    encoder: Box<dyn ModalityEncoder>,
    device: Device,
}

impl EncoderAdapter {
    pub fn new(spec: EncoderSpec, encoder: Box<dyn ModalityEncoder>, device: &Device) -> MmResult<Self> {
        if encoder.modality() != spec.modality {
            return Err(MmError::Config(format!(
                "encoder for {} registered as {} ({})",
                encoder.modality(),
                spec.modality,
                spec.model_name
            )));
        }
        Ok(Self {
            spec,
            encoder,
            device: device.clone(),
        })
    }

    pub fn spec(&self) -> &EncoderSpec {
        &self.spec
    }

    pub fn modality(&self) -> Modality {
        self.spec.modality
    }

    /// Нулевой признак ожидаемой формы.
    pub fn zero_feature(&self) -> MmResult<Tensor> {
        Ok(Tensor::zeros(
            (self.spec.channels, self.spec.feature_dim),
            DType::F32,
            &self.device,
        )?)
    }

    /// Закодировать вход в `[channels, feature_dim]` (F32).
    ///
    /// Вход чужой модальности это ошибка вызывающего кода. Любая ошибка самого
    /// энкодера (или неверная форма его выхода) заменяется нулевым признаком.
    pub fn encode(&mut self, media: &RawMedia) -> MmResult<Tensor> {
        if media.modality() != self.spec.modality {
            return Err(MmError::Model(format!(
                "{} encoder got {} input",
                self.spec.modality,
                media.modality()
            )));
        }
        match self.try_encode(media) {
            Ok(features) => Ok(features),
            Err(e) => {
                warn!(
                    "{}: не удалось закодировать {} ({e}), используется нулевой признак",
                    self.spec.model_name,
                    media.describe()
                );
                self.zero_feature()
            }
        }
    }

    fn try_encode(&mut self, media: &RawMedia) -> MmResult<Tensor> {
        match media {
            RawMedia::Waveform {
                samples,
                sample_rate,
            } => self.encode_waveform(samples, *sample_rate),
            _ => self.encode_once(media),
        }
    }

    fn encode_waveform(&mut self, samples: &[f32], sample_rate: u32) -> MmResult<Tensor> {
        let (Some(target_sr), Some(window)) = (self.spec.sample_rate, self.spec.window_samples())
        else {
            return self.encode_once(&RawMedia::Waveform {
                samples: samples.to_vec(),
                sample_rate,
            });
        };

        let resampled;
        let samples = if sample_rate != target_sr {
            let buffer = AudioBuffer::new(samples.to_vec(), sample_rate as usize, 1);
            resampled = Resampler::new(target_sr as usize).resample(&buffer)?.samples;
            &resampled[..]
        } else {
            samples
        };

        let windows = split_windows(samples, window);
        debug!(
            "{}: {} сэмплов, {} окон по {window}",
            self.spec.model_name,
            samples.len(),
            windows.len()
        );
        let mut acc = self.zero_feature()?;
        for chunk in &windows {
            let features = self.encode_once(&RawMedia::Waveform {
                samples: chunk.to_vec(),
                sample_rate: target_sr,
            })?;
            acc = (acc + features)?;
        }
        Ok((acc / windows.len() as f64)?)
    }

    fn encode_once(&mut self, media: &RawMedia) -> MmResult<Tensor> {
        let features = self.encoder.encode(media)?;
        let expected = [self.spec.channels, self.spec.feature_dim];
        if features.dims() != expected {
            return Err(MmError::Model(format!(
                "{} returned {:?}, expected {:?}",
                self.spec.model_name,
                features.dims(),
                expected
            )));
        }
        Ok(features.to_dtype(DType::F32)?.to_device(&self.device)?)
    }
}

impl std::fmt::Debug for EncoderAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncoderAdapter")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Энкодер, возвращающий среднее окна во всех ячейках.
    struct MeanEncoder {
        calls: Arc<Mutex<Vec<usize>>>,
    }

    impl ModalityEncoder for MeanEncoder {
        fn modality(&self) -> Modality {
            Modality::Audio
        }

        fn encode(&mut self, media: &RawMedia) -> MmResult<Tensor> {
            let RawMedia::Waveform { samples, .. } = media else {
                return Err(MmError::Model("not audio".into()));
            };
            self.calls.lock().unwrap().push(samples.len());
            let mean = samples.iter().sum::<f32>() / samples.len().max(1) as f32;
            Ok(Tensor::full(mean, (2, 3), &Device::Cpu)?)
        }
    }

    struct FailingEncoder;

    impl ModalityEncoder for FailingEncoder {
        fn modality(&self) -> Modality {
            Modality::Image
        }

        fn encode(&mut self, _media: &RawMedia) -> MmResult<Tensor> {
            Err(MmError::Model("corrupted file".into()))
        }
    }

    fn audio_spec() -> EncoderSpec {
        EncoderSpec {
            channels: 2,
            feature_dim: 3,
            sample_rate: Some(10),
            window_secs: Some(1.0),
            ..EncoderSpec::mert_v1_330m()
        }
    }

    #[test]
    fn test_windows_are_averaged() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let encoder = MeanEncoder {
            calls: calls.clone(),
        };
        let mut adapter = EncoderAdapter::new(audio_spec(), Box::new(encoder), &Device::Cpu).unwrap();
        // Окна: 10 единиц, 10 троек -> средние 1 и 3 -> 2.
        let mut samples = vec![1.0f32; 10];
        samples.extend(vec![3.0f32; 10]);
        let out = adapter
            .encode(&RawMedia::Waveform {
                samples,
                sample_rate: 10,
            })
            .unwrap();
        assert_eq!(out.dims(), &[2, 3]);
        assert!(out.flatten_all().unwrap().to_vec1::<f32>().unwrap().iter().all(|v| (v - 2.0).abs() < 1e-6));
        assert_eq!(*calls.lock().unwrap(), vec![10, 10]);
    }

    #[test]
    fn test_failure_gives_zero_feature() {
        let mut adapter = EncoderAdapter::new(EncoderSpec::vit_base(), Box::new(FailingEncoder), &Device::Cpu).unwrap();
        let out = adapter.encode(&RawMedia::ImagePath("missing.png".into())).unwrap();
        assert_eq!(out.dims(), &[197, 768]);
        assert_eq!(out.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_modality_mismatch() {
        assert!(EncoderAdapter::new(EncoderSpec::vit_base(), Box::new(MeanEncoder { calls: Default::default() }), &Device::Cpu).is_err());
        let mut adapter = EncoderAdapter::new(audio_spec(), Box::new(MeanEncoder { calls: Default::default() }), &Device::Cpu).unwrap();
        assert!(adapter.encode(&RawMedia::VideoPath("clip.mp4".into())).is_err());
    }
}
