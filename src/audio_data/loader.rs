use crate::audio_data::{DecoderKind, LoadOptions, PcmClip, StreamDecoder, StreamingMode};
use crate::error::Result;

/// Trait for turning a sound path into playable audio.
///
/// The engine calls the loader on the audio thread: `load` for sounds that are
/// decoded up front, `open_stream` every time a streamed sound starts playing.
/// PetalSonic provides [`SymphoniaLoader`](crate::audio_data::SymphoniaLoader);
/// bring your own for custom formats or packed assets.
///
/// A loader error is never surfaced to the code that requested the sound. The
/// engine logs it once and plays [`PcmClip::fallback`] instead.
pub trait AudioDataLoader: Send {
    /// Fully decodes the sound at `path`.
    fn load(&self, path: &str, options: &LoadOptions) -> Result<PcmClip>;

    /// Opens a streaming decoder positioned at the start of `path`.
    fn open_stream(&self, path: &str) -> Result<StreamDecoder>;

    fn decoder_kind(&self, path: &str) -> DecoderKind {
        DecoderKind::from_path(path)
    }

    /// Whether `path` should be streamed rather than decoded up front.
    fn should_stream(&self, path: &str, options: &LoadOptions) -> bool {
        match options.streaming {
            StreamingMode::Always => true,
            StreamingMode::Never => false,
            StreamingMode::Auto => self.decoder_kind(path).streams_by_default(),
        }
    }
}
