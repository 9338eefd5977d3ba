use crate::{
    audio_data::{AudioDataLoader, ConvertToMono, DecoderKind, LoadOptions, PcmClip, StreamDecoder},
    error::{PetalSonicError, Result},
};
use std::fs::File;
use std::path::Path;
use symphonia::{
    core::{
        audio::SampleBuffer,
        codecs::{Decoder, DecoderOptions},
        errors::Error,
        formats::{FormatOptions, FormatReader},
        io::MediaSourceStream,
        meta::MetadataOptions,
        probe::Hint,
    },
    default::{get_codecs, get_probe},
};

/// Default loader built on the Symphonia decoder library.
///
/// Supports WAV, FLAC, MP3 and Ogg/Vorbis. Full decodes produce interleaved
/// f32 PCM; streams decode packet by packet on demand.
pub struct SymphoniaLoader;

impl AudioDataLoader for SymphoniaLoader {
    fn load(&self, path: &str, options: &LoadOptions) -> Result<PcmClip> {
        let mut opened = OpenedTrack::open(path)?;
        let mut samples: Vec<f32> = Vec::new();
        while opened.decode_next(&mut samples)? {}

        let channels = opened.channels;
        let clip = PcmClip::new(samples, opened.sample_rate, channels)?;
        match options.convert_to_mono {
            ConvertToMono::Original => Ok(clip),
            ConvertToMono::ForceMono => clip.to_mono(),
        }
    }

    fn open_stream(&self, path: &str) -> Result<StreamDecoder> {
        let stream = SymphoniaStream::open(path)?;
        Ok(StreamDecoder::symphonia(DecoderKind::from_path(path), stream))
    }
}

/// A probed container with a decoder for its default track.
struct OpenedTrack {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    channels: u16,
}

impl OpenedTrack {
    fn open(path: &str) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            PetalSonicError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, e))
        })?;

        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = Path::new(path).extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| {
                PetalSonicError::AudioLoading(format!("Failed to probe audio format: {:?}", e))
            })?;

        let format = probed.format;

        let track = format.default_track().ok_or_else(|| {
            PetalSonicError::AudioLoading("No default audio track found".to_string())
        })?;

        let track_id = track.id;

        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| PetalSonicError::AudioLoading("Sample rate not found".to_string()))?;

        let channels = track
            .codec_params
            .channels
            .ok_or_else(|| PetalSonicError::AudioLoading("Channel count not found".to_string()))?
            .count() as u16;

        let decoder = get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| {
                PetalSonicError::AudioLoading(format!("Failed to create decoder: {:?}", e))
            })?;

        Ok(Self {
            format,
            decoder,
            track_id,
            sample_rate,
            channels,
        })
    }

    /// Decodes one packet of the default track into `out`. Returns false at end of stream.
    fn decode_next(&mut self, out: &mut Vec<f32>) -> Result<bool> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(Error::IoError(_)) => return Ok(false), // end-of-file
                Err(e) => {
                    return Err(PetalSonicError::AudioLoading(format!(
                        "Error reading packet: {:?}",
                        e
                    )));
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(Error::IoError(_)) => return Ok(false), // also EOF in some formats
                Err(Error::DecodeError(_)) => continue,      // recoverable corruption
                Err(e) => {
                    return Err(PetalSonicError::AudioLoading(format!(
                        "Error decoding packet: {:?}",
                        e
                    )));
                }
            };

            let spec = *decoded.spec();
            let mut tmp = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
            tmp.copy_interleaved_ref(decoded);
            out.extend_from_slice(tmp.samples());
            return Ok(true);
        }
    }
}

/// Packet-by-packet Symphonia decode used for streamed voices.
pub struct SymphoniaStream {
    path: String,
    track: OpenedTrack,
    pending: Vec<f32>,
    pending_pos: usize,
}

impl SymphoniaStream {
    pub fn open(path: &str) -> Result<Self> {
        Ok(Self {
            path: path.to_string(),
            track: OpenedTrack::open(path)?,
            pending: Vec::new(),
            pending_pos: 0,
        })
    }

    pub fn channels(&self) -> u16 {
        self.track.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.track.sample_rate
    }

    /// Reopens the file; cheaper to reason about than seeking every container type.
    pub fn rewind(&mut self) -> Result<()> {
        self.track = OpenedTrack::open(&self.path)?;
        self.pending.clear();
        self.pending_pos = 0;
        Ok(())
    }

    /// Appends up to `max_frames` frames to `out`; 0 means end of stream.
    pub fn read(&mut self, out: &mut Vec<f32>, max_frames: usize) -> Result<usize> {
        let channels = self.track.channels as usize;
        let mut frames = 0;
        while frames < max_frames {
            if self.pending_pos >= self.pending.len() {
                self.pending.clear();
                self.pending_pos = 0;
                if !self.track.decode_next(&mut self.pending)? {
                    break;
                }
                continue;
            }
            let available = (self.pending.len() - self.pending_pos) / channels;
            let take = available.min(max_frames - frames);
            if take == 0 {
                // A trailing partial frame cannot be played; drop it.
                self.pending_pos = self.pending.len();
                continue;
            }
            let end = self.pending_pos + take * channels;
            out.extend_from_slice(&self.pending[self.pending_pos..end]);
            self.pending_pos = end;
            frames += take;
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_an_error() {
        let loader = SymphoniaLoader;
        assert!(
            loader
                .load("does/not/exist.wav", &LoadOptions::default())
                .is_err()
        );
        assert!(loader.open_stream("does/not/exist.ogg").is_err());
    }

    #[test]
    fn streams_compressed_formats_by_default() {
        let loader = SymphoniaLoader;
        let options = LoadOptions::default();
        assert!(loader.should_stream("music/theme.ogg", &options));
        assert!(!loader.should_stream("sfx/hit.wav", &options));
    }
}
