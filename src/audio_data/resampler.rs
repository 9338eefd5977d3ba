use crate::error::{PetalSonicError, Result};
use rubato::{FftFixedIn, Resampler};

/// Offline sample-rate conversion for clips bound to a voice.
pub struct AudioResampler {
    source_sample_rate: u32,
    target_sample_rate: u32,
    channels: u16,
    chunk_size: usize,
}

impl AudioResampler {
    pub fn new(
        source_sample_rate: u32,
        target_sample_rate: u32,
        channels: u16,
        chunk_size: Option<usize>,
    ) -> Result<Self> {
        if source_sample_rate == 0 || target_sample_rate == 0 {
            return Err(PetalSonicError::AudioFormat(
                "Sample rates must be greater than 0".to_string(),
            ));
        }

        if channels == 0 {
            return Err(PetalSonicError::AudioFormat(
                "Channel count must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            source_sample_rate,
            target_sample_rate,
            channels,
            chunk_size: chunk_size.unwrap_or(1024),
        })
    }

    /// Resamples interleaved audio, returning interleaved audio at the target rate.
    pub fn resample_interleaved(&self, interleaved: &[f32]) -> Result<Vec<f32>> {
        if self.source_sample_rate == self.target_sample_rate {
            return Ok(interleaved.to_vec());
        }

        let channels = self.channels as usize;
        let frames = interleaved.len() / channels;

        let mut resampler = FftFixedIn::<f32>::new(
            self.source_sample_rate as usize,
            self.target_sample_rate as usize,
            self.chunk_size,
            2, // sub_chunks
            channels,
        )
        .map_err(|e| PetalSonicError::AudioLoading(format!("Failed to create resampler: {}", e)))?;

        let mut planar_out: Vec<Vec<f32>> = vec![Vec::new(); channels];
        let mut chunk: Vec<Vec<f32>> = vec![vec![0.0; self.chunk_size]; channels];
        let mut frame = 0;

        while frame < frames {
            let take = (frames - frame).min(self.chunk_size);
            for (ch, plane) in chunk.iter_mut().enumerate() {
                plane.fill(0.0); // the last chunk is zero-padded
                for i in 0..take {
                    plane[i] = interleaved[(frame + i) * channels + ch];
                }
            }

            let waves_out = resampler
                .process(&chunk, None)
                .map_err(|e| PetalSonicError::AudioLoading(format!("Resampling error: {}", e)))?;

            for (plane, out) in planar_out.iter_mut().zip(waves_out) {
                plane.extend_from_slice(&out);
            }
            frame += take;
        }

        // Drop the tail produced by padding the last chunk.
        let expected = (frames as f64 * self.resample_ratio()).round() as usize;
        let new_frames = planar_out[0].len().min(expected);

        let mut result = Vec::with_capacity(new_frames * channels);
        for i in 0..new_frames {
            for plane in &planar_out {
                result.push(plane[i]);
            }
        }
        Ok(result)
    }

    pub fn target_sample_rate(&self) -> u32 {
        self.target_sample_rate
    }

    pub fn source_sample_rate(&self) -> u32 {
        self.source_sample_rate
    }

    pub fn resample_ratio(&self) -> f64 {
        self.target_sample_rate as f64 / self.source_sample_rate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resampler_creation() {
        let resampler = AudioResampler::new(44100, 48000, 2, None).unwrap();
        assert_eq!(resampler.source_sample_rate(), 44100);
        assert_eq!(resampler.target_sample_rate(), 48000);
    }

    #[test]
    fn test_resampler_no_resampling_needed() {
        let resampler = AudioResampler::new(44100, 44100, 1, None).unwrap();
        let samples = vec![0.1, 0.2, 0.3, 0.4];
        assert_eq!(resampler.resample_interleaved(&samples).unwrap(), samples);
    }

    #[test]
    fn test_output_length_follows_ratio() {
        let resampler = AudioResampler::new(24000, 48000, 2, Some(256)).unwrap();
        let input = vec![0.0f32; 1000 * 2];
        let output = resampler.resample_interleaved(&input).unwrap();
        assert_eq!(output.len() % 2, 0);
        assert!(output.len() / 2 <= 2000);
        assert!(output.len() / 2 >= 1500);
    }

    #[test]
    fn test_invalid_sample_rates() {
        assert!(AudioResampler::new(0, 48000, 2, None).is_err());
        assert!(AudioResampler::new(44100, 0, 2, None).is_err());
        assert!(AudioResampler::new(44100, 48000, 0, None).is_err());
    }
}
