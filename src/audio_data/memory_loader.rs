use crate::audio_data::{
    AudioDataLoader, ConvertToMono, DecoderKind, LoadOptions, PcmClip, StreamDecoder, StreamingMode,
};
use crate::error::{PetalSonicError, Result};
use std::collections::HashMap;

struct Entry {
    clip: PcmClip,
    streamed: bool,
}

/// Loader serving clips registered in memory under a path.
///
/// Useful for procedurally generated sounds and for running the engine
/// without touching the filesystem.
#[derive(Default)]
pub struct MemoryLoader {
    entries: HashMap<String, Entry>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a clip that is bound to a voice in one piece.
    pub fn with_clip(mut self, path: &str, clip: PcmClip) -> Self {
        self.entries.insert(
            path.to_string(),
            Entry {
                clip,
                streamed: false,
            },
        );
        self
    }

    /// Registers a clip that is fed to its voice through the streaming path.
    pub fn with_streamed_clip(mut self, path: &str, clip: PcmClip) -> Self {
        self.entries.insert(
            path.to_string(),
            Entry {
                clip,
                streamed: true,
            },
        );
        self
    }

    fn entry(&self, path: &str) -> Result<&Entry> {
        self.entries.get(path).ok_or_else(|| {
            PetalSonicError::AudioLoading(format!("No in-memory clip registered for {}", path))
        })
    }
}

impl AudioDataLoader for MemoryLoader {
    fn load(&self, path: &str, options: &LoadOptions) -> Result<PcmClip> {
        let clip = self.entry(path)?.clip.clone();
        match options.convert_to_mono {
            ConvertToMono::Original => Ok(clip),
            ConvertToMono::ForceMono => clip.to_mono(),
        }
    }

    fn open_stream(&self, path: &str) -> Result<StreamDecoder> {
        Ok(StreamDecoder::memory(self.entry(path)?.clip.clone()))
    }

    fn decoder_kind(&self, _path: &str) -> DecoderKind {
        DecoderKind::Memory
    }

    fn should_stream(&self, path: &str, options: &LoadOptions) -> bool {
        match options.streaming {
            StreamingMode::Always => true,
            StreamingMode::Never => false,
            StreamingMode::Auto => self.entries.get(path).is_some_and(|e| e.streamed),
        }
    }
}
