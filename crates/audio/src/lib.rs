//! # audio
//!
//! Audio processing module for RustMuGen.
//!
//! This crate handles:
//! - WAV file loading and saving
//! - Resampling to the audio encoder's sample rate (24 kHz for MERT)
//! - Splitting long waveforms into fixed-length encoder windows

pub mod loader;
pub mod resample;
pub mod windows;

pub use loader::{load_wav, save_wav, to_mono};
pub use resample::Resampler;
pub use windows::split_windows;

use mm_core::{AudioBuffer, MmResult};

/// Load a WAV file as mono audio at `target_sample_rate`.
pub fn load_for_encoder(
    path: impl AsRef<std::path::Path>,
    target_sample_rate: usize,
) -> MmResult<AudioBuffer> {
    let buffer = to_mono(&load_wav(path)?);
    Resampler::new(target_sample_rate).resample(&buffer)
}
