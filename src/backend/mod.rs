//! Mixing backends.
//!
//! The engine drives voices through [`MixingBackend`]. Two implementations ship
//! with the crate: [`CpalBackend`] mixes in software inside a cpal output
//! stream, and [`VirtualBackend`] is a headless device for tests and servers.

mod cpal_backend;
mod virtual_backend;

use crate::audio_data::PcmClip;
use crate::error::Result;
use crate::math::{Pose, Vec3};
use std::fmt;

pub use cpal_backend::CpalBackend;
pub use virtual_backend::{VirtualBackend, VirtualDeviceProbe, VirtualVoice};

/// Backend-side voice handle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct VoiceId(pub u32);

impl fmt::Display for VoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Voice({})", self.0)
    }
}

/// Per-voice parameters the engine sets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VoiceParam {
    Gain(f32),
    Pitch(f32),
    Position(Vec3),
    Looping(bool),
    /// Position is relative to the listener rather than in world space.
    ListenerRelative(bool),
}

impl VoiceParam {
    /// Short name used as the log-once key for failures.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Gain(_) => "gain",
            Self::Pitch(_) => "pitch",
            Self::Position(_) => "position",
            Self::Looping(_) => "looping",
            Self::ListenerRelative(_) => "listener-relative",
        }
    }
}

/// The hardware-facing side of the engine.
///
/// All methods are called from the audio thread only. Implementations do not
/// need to be `Send`: in threaded mode the engine builds the backend on the
/// audio thread through a factory closure.
pub trait MixingBackend {
    fn create_voice(&mut self) -> Result<VoiceId>;

    /// Binds a fully decoded clip; replaces any previous buffer or stream.
    fn bind_buffer(&mut self, voice: VoiceId, clip: &PcmClip) -> Result<()>;

    /// Switches the voice to streaming input with the given format and drops queued data.
    fn clear_stream(&mut self, voice: VoiceId, channels: u16, sample_rate: u32) -> Result<()>;

    /// How many more frames the voice's stream queue accepts.
    fn stream_vacancy(&self, voice: VoiceId) -> usize;

    /// Queues interleaved frames on a streaming voice. Returns frames accepted.
    fn queue_stream(&mut self, voice: VoiceId, interleaved: &[f32]) -> Result<usize>;

    fn play(&mut self, voice: VoiceId) -> Result<()>;

    fn stop(&mut self, voice: VoiceId) -> Result<()>;

    fn set(&mut self, voice: VoiceId, param: VoiceParam) -> Result<()>;

    /// Whether the voice is physically producing sound right now.
    fn is_playing(&self, voice: VoiceId) -> bool;

    fn destroy(&mut self, voice: VoiceId);

    fn set_listener(&mut self, pose: Pose) -> Result<()>;

    fn is_device_connected(&self) -> bool;

    /// Tries to reopen the output device after a disconnect.
    fn reset_device(&mut self) -> Result<()>;

    /// Called when the app is suspended.
    fn pause_device(&mut self) -> Result<()>;

    fn resume_device(&mut self) -> Result<()>;
}
