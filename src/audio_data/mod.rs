mod load_options;
mod loader;
mod memory_loader;
mod resampler;
mod stream;
mod symphonia_loader;

use crate::error::{PetalSonicError, Result};
pub use load_options::{ConvertToMono, LoadOptions, StreamingMode};
pub use loader::AudioDataLoader;
pub use memory_loader::MemoryLoader;
pub use resampler::AudioResampler;
use std::sync::Arc;
use std::time::Duration;
pub use stream::{DecoderKind, MemoryStream, StreamDecoder};
pub use symphonia_loader::{SymphoniaLoader, SymphoniaStream};

/// Decoded PCM with reference-counted sharing.
///
/// Samples are stored **interleaved** (`[L0, R0, L1, R1, ...]` for stereo).
/// Cloning is cheap: the sample storage is shared.
#[derive(Debug, Clone)]
pub struct PcmClip {
    inner: Arc<PcmClipInner>,
}

#[derive(Debug)]
struct PcmClipInner {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
    duration: Duration,
    total_frames: usize,
}

impl PcmClip {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Result<Self> {
        if sample_rate == 0 || channels == 0 {
            return Err(PetalSonicError::AudioFormat(
                "Sample rate and channel count must be greater than 0".to_string(),
            ));
        }
        let total_frames = samples.len() / channels as usize;
        let duration = Duration::from_secs_f64(total_frames as f64 / sample_rate as f64);
        Ok(Self {
            inner: Arc::new(PcmClipInner {
                samples,
                sample_rate,
                channels,
                duration,
                total_frames,
            }),
        })
    }

    /// The built-in clip substituted when a requested sound cannot be decoded.
    pub fn fallback() -> Self {
        Self::silence(Duration::from_millis(100), 44100, 1)
    }

    pub fn silence(duration: Duration, sample_rate: u32, channels: u16) -> Self {
        let frames = (duration.as_secs_f64() * sample_rate as f64).round() as usize;
        let total_frames = frames;
        Self {
            inner: Arc::new(PcmClipInner {
                samples: vec![0.0; frames * channels as usize],
                sample_rate,
                channels,
                duration,
                total_frames,
            }),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.inner.channels
    }

    pub fn duration(&self) -> Duration {
        self.inner.duration
    }

    pub fn samples(&self) -> &[f32] {
        &self.inner.samples
    }

    pub fn total_frames(&self) -> usize {
        self.inner.total_frames
    }

    pub fn is_empty(&self) -> bool {
        self.inner.samples.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.samples.len()
    }

    /// Interleaved samples for `frame_count` frames starting at `start_frame`, clamped to the clip.
    pub fn frames(&self, start_frame: usize, frame_count: usize) -> &[f32] {
        let channels = self.inner.channels as usize;
        let start = (start_frame * channels).min(self.inner.samples.len());
        let end = ((start_frame + frame_count) * channels).min(self.inner.samples.len());
        &self.inner.samples[start..end]
    }

    /// Convert to mono by averaging all channels
    pub fn to_mono(&self) -> Result<Self> {
        if self.inner.channels == 1 {
            return Ok(self.clone());
        }

        let channels = self.inner.channels as usize;
        let mono_samples: Vec<f32> = self
            .inner
            .samples
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect();

        Self::new(mono_samples, self.inner.sample_rate, 1)
    }

    /// Resample to a different sample rate using rubato
    pub fn resample(&self, target_sample_rate: u32) -> Result<Self> {
        if target_sample_rate == self.inner.sample_rate {
            return Ok(self.clone());
        }

        let resampler = AudioResampler::new(
            self.inner.sample_rate,
            target_sample_rate,
            self.inner.channels,
            Some(1024),
        )?;

        let resampled = resampler.resample_interleaved(&self.inner.samples)?;
        Self::new(resampled, target_sample_rate, self.inner.channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_accounting() {
        let clip = PcmClip::new(vec![0.0; 48000 * 2], 48000, 2).unwrap();
        assert_eq!(clip.total_frames(), 48000);
        assert_eq!(clip.duration(), Duration::from_secs(1));
        assert_eq!(clip.frames(47999, 10).len(), 2);
        assert!(clip.frames(60000, 10).is_empty());
    }

    #[test]
    fn mono_downmix_averages_channels() {
        let clip = PcmClip::new(vec![1.0, 0.0, 0.5, 0.5], 44100, 2).unwrap();
        let mono = clip.to_mono().unwrap();
        assert_eq!(mono.channels(), 1);
        assert_eq!(mono.samples(), &[0.5, 0.5]);
    }

    #[test]
    fn fallback_is_short_silence() {
        let clip = PcmClip::fallback();
        assert!(clip.samples().iter().all(|s| *s == 0.0));
        assert_eq!(clip.total_frames(), 4410);
        assert!(PcmClip::new(vec![0.0], 0, 1).is_err());
    }
}
