//! Streaming decoders.
//!
//! The set of streamable formats is closed, so decoders are an enum dispatched
//! by [`DecoderKind`] rather than trait objects.

use crate::audio_data::{PcmClip, SymphoniaStream};
use crate::error::Result;
use std::path::Path;

/// Container/codec family of a sound, as far as the engine cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderKind {
    Wav,
    Flac,
    Mp3,
    Vorbis,
    /// PCM held in memory (generated or registered at runtime).
    Memory,
    Unknown,
}

impl DecoderKind {
    pub fn from_path(path: &str) -> Self {
        let ext = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("wav") | Some("wave") => Self::Wav,
            Some("flac") => Self::Flac,
            Some("mp3") => Self::Mp3,
            Some("ogg") | Some("oga") => Self::Vorbis,
            _ => Self::Unknown,
        }
    }

    /// Compressed music formats are streamed; short PCM effects are decoded up front.
    pub fn streams_by_default(self) -> bool {
        matches!(self, Self::Vorbis | Self::Mp3)
    }
}

enum StreamSource {
    Symphonia(SymphoniaStream),
    Memory(MemoryStream),
}

/// A pull-based decoder feeding a streamed voice.
pub struct StreamDecoder {
    kind: DecoderKind,
    source: StreamSource,
    looping: bool,
    finished: bool,
}

impl StreamDecoder {
    pub fn symphonia(kind: DecoderKind, stream: SymphoniaStream) -> Self {
        Self {
            kind,
            source: StreamSource::Symphonia(stream),
            looping: false,
            finished: false,
        }
    }

    pub fn memory(clip: PcmClip) -> Self {
        Self {
            kind: DecoderKind::Memory,
            source: StreamSource::Memory(MemoryStream::new(clip)),
            looping: false,
            finished: false,
        }
    }

    pub fn kind(&self) -> DecoderKind {
        self.kind
    }

    pub fn channels(&self) -> u16 {
        match &self.source {
            StreamSource::Symphonia(s) => s.channels(),
            StreamSource::Memory(s) => s.clip.channels(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        match &self.source {
            StreamSource::Symphonia(s) => s.sample_rate(),
            StreamSource::Memory(s) => s.clip.sample_rate(),
        }
    }

    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
        if looping {
            self.finished = false;
        }
    }

    pub fn is_looping(&self) -> bool {
        self.looping
    }

    /// True once a non-looping stream has delivered its last frame.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Appends up to `max_frames` interleaved frames to `out`.
    ///
    /// Looping streams wrap around at the end. Returns the number of frames appended.
    pub fn fill(&mut self, out: &mut Vec<f32>, max_frames: usize) -> Result<usize> {
        let mut total = 0;
        let mut empty_rewinds = 0;
        while total < max_frames && !self.finished {
            let read = self.read(out, max_frames - total)?;
            total += read;
            if read > 0 {
                empty_rewinds = 0;
                continue;
            }
            // End of data.
            if self.looping && empty_rewinds == 0 {
                self.rewind()?;
                empty_rewinds += 1;
            } else {
                self.finished = true;
            }
        }
        Ok(total)
    }

    pub fn rewind(&mut self) -> Result<()> {
        self.finished = false;
        match &mut self.source {
            StreamSource::Symphonia(s) => s.rewind(),
            StreamSource::Memory(s) => {
                s.cursor = 0;
                Ok(())
            }
        }
    }

    fn read(&mut self, out: &mut Vec<f32>, max_frames: usize) -> Result<usize> {
        match &mut self.source {
            StreamSource::Symphonia(s) => s.read(out, max_frames),
            StreamSource::Memory(s) => Ok(s.read(out, max_frames)),
        }
    }
}

impl std::fmt::Debug for StreamDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDecoder")
            .field("kind", &self.kind)
            .field("looping", &self.looping)
            .field("finished", &self.finished)
            .finish()
    }
}

/// Streams an in-memory clip frame by frame.
#[derive(Debug)]
pub struct MemoryStream {
    clip: PcmClip,
    cursor: usize,
}

impl MemoryStream {
    pub fn new(clip: PcmClip) -> Self {
        Self { clip, cursor: 0 }
    }

    fn read(&mut self, out: &mut Vec<f32>, max_frames: usize) -> usize {
        let frames = self.clip.frames(self.cursor, max_frames);
        let read = frames.len() / self.clip.channels() as usize;
        out.extend_from_slice(frames);
        self.cursor += read;
        read
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(frames: usize) -> PcmClip {
        PcmClip::new((0..frames).map(|i| i as f32).collect(), 1000, 1).unwrap()
    }

    #[test]
    fn kind_from_extension() {
        assert_eq!(DecoderKind::from_path("music/theme.OGG"), DecoderKind::Vorbis);
        assert_eq!(DecoderKind::from_path("sfx/hit.wav"), DecoderKind::Wav);
        assert_eq!(DecoderKind::from_path("noext"), DecoderKind::Unknown);
        assert!(DecoderKind::Vorbis.streams_by_default());
        assert!(!DecoderKind::Wav.streams_by_default());
    }

    #[test]
    fn one_shot_stream_finishes() {
        let mut stream = StreamDecoder::memory(ramp(10));
        let mut out = Vec::new();
        assert_eq!(stream.fill(&mut out, 6).unwrap(), 6);
        assert!(!stream.is_finished());
        assert_eq!(stream.fill(&mut out, 6).unwrap(), 4);
        assert!(stream.is_finished());
        assert_eq!(out.len(), 10);
        assert_eq!(stream.fill(&mut out, 6).unwrap(), 0);
    }

    #[test]
    fn looping_stream_wraps() {
        let mut stream = StreamDecoder::memory(ramp(4));
        stream.set_looping(true);
        let mut out = Vec::new();
        assert_eq!(stream.fill(&mut out, 10).unwrap(), 10);
        assert_eq!(out, vec![0.0, 1.0, 2.0, 3.0, 0.0, 1.0, 2.0, 3.0, 0.0, 1.0]);
        assert!(!stream.is_finished());
    }

    #[test]
    fn looping_empty_stream_does_not_spin() {
        let mut stream = StreamDecoder::memory(ramp(0));
        stream.set_looping(true);
        let mut out = Vec::new();
        assert_eq!(stream.fill(&mut out, 10).unwrap(), 0);
        assert!(stream.is_finished());
    }
}
