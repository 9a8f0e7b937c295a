//! WAV file loading and saving.

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use mm_core::{AudioBuffer, MmError, MmResult};
use std::path::Path;
use tracing::debug;

/// Load a WAV file and return an AudioBuffer.
pub fn load_wav(path: impl AsRef<Path>) -> MmResult<AudioBuffer> {
    let path = path.as_ref();
    let reader =
        WavReader::open(path).map_err(|e| MmError::Audio(format!("Failed to open WAV: {}", e)))?;

    let spec = reader.spec();
    let sample_rate = spec.sample_rate as usize;
    let channels = spec.channels as usize;
    if channels == 0 {
        return Err(MmError::Audio(format!(
            "WAV without channels: {}",
            path.display()
        )));
    }

    let samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| MmError::Audio(format!("Failed to read samples: {}", e)))?,
        SampleFormat::Int => {
            let max_val = (1u64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| MmError::Audio(format!("Failed to read samples: {}", e)))?
        }
    };

    debug!(
        "WAV {}: {} Hz, {} ch, {} samples",
        path.display(),
        sample_rate,
        channels,
        samples.len()
    );
    Ok(AudioBuffer::new(samples, sample_rate, channels))
}

/// Write an AudioBuffer as 32-bit float WAV.
pub fn save_wav(path: impl AsRef<Path>, buffer: &AudioBuffer) -> MmResult<()> {
    let spec = WavSpec {
        channels: buffer.channels as u16,
        sample_rate: buffer.sample_rate as u32,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer = WavWriter::create(path.as_ref(), spec)
        .map_err(|e| MmError::Audio(format!("Failed to create WAV: {}", e)))?;
    for &s in &buffer.samples {
        writer
            .write_sample(s)
            .map_err(|e| MmError::Audio(format!("Failed to write sample: {}", e)))?;
    }
    writer
        .finalize()
        .map_err(|e| MmError::Audio(format!("Failed to finalize WAV: {}", e)))
}

/// Convert multi-channel audio to mono by averaging channels.
pub fn to_mono(buffer: &AudioBuffer) -> AudioBuffer {
    if buffer.channels <= 1 {
        return buffer.clone();
    }

    let mono_samples: Vec<f32> = buffer
        .samples
        .chunks(buffer.channels)
        .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
        .collect();

    AudioBuffer::new(mono_samples, buffer.sample_rate, 1)
}
