//! Audio resampling.

use mm_core::{AudioBuffer, MmError, MmResult};
use rubato::{FftFixedInOut, Resampler as RubatoResampler};
use tracing::debug;

/// Resampler to the encoder sample rate.
pub struct Resampler {
    target_sample_rate: usize,
}

impl Resampler {
    pub fn new(target_sample_rate: usize) -> Self {
        Self { target_sample_rate }
    }

    pub fn target_sample_rate(&self) -> usize {
        self.target_sample_rate
    }

    /// Resample a mono buffer. Output length is `round(len * ratio)`.
    pub fn resample(&self, buffer: &AudioBuffer) -> MmResult<AudioBuffer> {
        if buffer.sample_rate == self.target_sample_rate {
            return Ok(buffer.clone());
        }

        if buffer.channels != 1 {
            return Err(MmError::Audio(
                "Resampling requires mono audio. Use to_mono() first.".to_string(),
            ));
        }
        if buffer.sample_rate == 0 {
            return Err(MmError::Audio("Input sample rate is zero".to_string()));
        }

        let ratio = self.target_sample_rate as f64 / buffer.sample_rate as f64;
        let expected_len = (buffer.samples.len() as f64 * ratio).round() as usize;

        let mut resampler = FftFixedInOut::<f32>::new(
            buffer.sample_rate,
            self.target_sample_rate,
            1024,
            1,
        )
        .map_err(|e| MmError::Audio(format!("Failed to create resampler: {}", e)))?;

        // FFT-ресэмплер вносит задержку: выкидываем её из начала выхода
        // и дополняем вход нулями, чтобы хвост успел выйти.
        let delay = resampler.output_delay();
        let mut output = Vec::with_capacity(expected_len + delay);
        let mut pos = 0;
        while output.len() < expected_len + delay {
            let chunk_size = resampler.input_frames_next();
            let mut chunk = vec![0f32; chunk_size];
            if pos < buffer.samples.len() {
                let end = (pos + chunk_size).min(buffer.samples.len());
                chunk[..end - pos].copy_from_slice(&buffer.samples[pos..end]);
            }
            pos += chunk_size;
            let out = resampler
                .process(&[chunk], None)
                .map_err(|e| MmError::Audio(format!("Resampling failed: {}", e)))?;
            output.extend_from_slice(&out[0]);
        }

        let output: Vec<f32> = output.into_iter().skip(delay).take(expected_len).collect();
        debug!(
            "resample {} Hz -> {} Hz: {} -> {} samples",
            buffer.sample_rate,
            self.target_sample_rate,
            buffer.samples.len(),
            output.len()
        );
        Ok(AudioBuffer::new(output, self.target_sample_rate, 1))
    }
}

impl Default for Resampler {
    /// MERT работает на 24 кГц.
    fn default() -> Self {
        Self::new(24_000)
    }
}
