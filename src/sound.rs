//! Reference-counted handles to sound data.
//!
//! A [`SoundHandle`] belongs to the thread that created it. Its reference count
//! is only touched there: the audio thread receives handles by move inside a
//! [`AudioCommand`](crate::dispatcher::AudioCommand) and gives them back by
//! move inside a [`ClientMessage`](crate::dispatcher::ClientMessage), so the
//! final drop happens on the owning thread as well.

use crate::audio_data::{DecoderKind, LoadOptions, PcmClip};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use uuid::Uuid;

/// Stable identity of one loaded sound.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SoundId(Uuid);

impl fmt::Display for SoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SoundId({})", self.0)
    }
}

/// Outcome of loading a sound.
#[derive(Debug, Clone)]
pub enum LoadedSound {
    /// Fully decoded, bound to a voice in one piece.
    Buffered(PcmClip),
    /// Decoded on the fly while playing.
    Streamed { kind: DecoderKind },
    /// Decoding failed; the built-in fallback clip plays instead.
    Fallback(PcmClip),
}

struct SoundData {
    id: SoundId,
    path: String,
    options: LoadOptions,
    owner: ThreadId,
    loaded: OnceLock<LoadedSound>,
}

/// Handle to a sound, loaded or still loading.
pub struct SoundHandle {
    data: Arc<SoundData>,
}

impl SoundHandle {
    pub(crate) fn unloaded(path: &str, options: LoadOptions) -> Self {
        Self::with_state(path, options, OnceLock::new())
    }

    /// Wraps an already-decoded clip; no load request is needed before playing it.
    pub fn from_clip(name: &str, clip: PcmClip) -> Self {
        let loaded = OnceLock::new();
        let _ = loaded.set(LoadedSound::Buffered(clip));
        Self::with_state(name, LoadOptions::default(), loaded)
    }

    fn with_state(path: &str, options: LoadOptions, loaded: OnceLock<LoadedSound>) -> Self {
        Self {
            data: Arc::new(SoundData {
                id: SoundId(Uuid::new_v4()),
                path: path.to_string(),
                options,
                owner: thread::current().id(),
                loaded,
            }),
        }
    }

    pub fn id(&self) -> SoundId {
        self.data.id
    }

    pub fn path(&self) -> &str {
        &self.data.path
    }

    pub fn options(&self) -> &LoadOptions {
        &self.data.options
    }

    pub fn is_loaded(&self) -> bool {
        self.data.loaded.get().is_some()
    }

    pub fn loaded(&self) -> Option<&LoadedSound> {
        self.data.loaded.get()
    }

    /// Number of live handles to this sound, including this one.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.data)
    }

    /// Stores the load result; the first result wins.
    pub(crate) fn complete_load(&self, loaded: LoadedSound) -> bool {
        self.data.loaded.set(loaded).is_ok()
    }
}

impl Clone for SoundHandle {
    fn clone(&self) -> Self {
        debug_assert_eq!(
            thread::current().id(),
            self.data.owner,
            "SoundHandle for {} cloned off its owning thread",
            self.data.path
        );
        Self {
            data: Arc::clone(&self.data),
        }
    }
}

impl fmt::Debug for SoundHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoundHandle")
            .field("id", &self.data.id)
            .field("path", &self.data.path)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_identity_and_load_state() {
        let handle = SoundHandle::unloaded("sfx/hit.wav", LoadOptions::default());
        let copy = handle.clone();
        assert_eq!(handle.id(), copy.id());
        assert_eq!(handle.ref_count(), 2);
        assert!(!copy.is_loaded());

        assert!(handle.complete_load(LoadedSound::Fallback(PcmClip::fallback())));
        assert!(copy.is_loaded());
        assert!(!copy.complete_load(LoadedSound::Streamed {
            kind: DecoderKind::Vorbis
        }));

        drop(copy);
        assert_eq!(handle.ref_count(), 1);
    }

    #[test]
    fn from_clip_is_ready_to_play() {
        let handle = SoundHandle::from_clip("beep", PcmClip::fallback());
        assert!(matches!(handle.loaded(), Some(LoadedSound::Buffered(_))));
    }
}
