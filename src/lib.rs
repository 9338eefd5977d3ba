//! # PetalSonic Pool
//!
//! A fixed-size pool of playback sources shared between a client thread and
//! an audio thread.
//!
//! The client thread reserves a slot, configures it and starts a sound, all
//! without waiting on the audio thread. The audio thread owns the output
//! backend, starts and stops voices, runs fades, refills streams, and returns
//! finished slots to the pool.
//!
//! ## Quick Start
//!
//! ```no_run
//! use petalsonic_pool::*;
//! use std::time::Duration;
//!
//! let desc = AudioEngineDesc::default();
//! let backend_desc = desc.clone();
//! let mut engine = AudioEngineContext::start(desc, SymphoniaLoader, move || {
//!     CpalBackend::open(&backend_desc)
//! })?;
//!
//! let hit = engine.load_sound("sfx/hit.wav")?;
//! let play_id = engine.source_begin_new().map(|mut source| {
//!     source.set_position(Vec3::new(2.0, 0.0, 0.0)).set_gain(0.8);
//!     source.play(&hit)
//! });
//!
//! // Later, from anywhere holding the context:
//! if let Some(id) = play_id {
//!     engine.fade_out_by_play_id(id, Duration::from_millis(500));
//! }
//!
//! // Once per frame:
//! engine.process_messages();
//!
//! engine.shutdown()?;
//! # Ok::<(), PetalSonicError>(())
//! ```
//!
//! ## Key Components
//!
//! - **[`AudioEngineContext`]**: client-thread entry point; reserves slots and posts commands
//! - **[`SourceGuard`]**: scoped lock on one slot; dropping it ends the locked sequence
//! - **[`PlayId`]**: versioned id of one playback session, stale once its slot is reused
//! - **[`ProcessingLoop`]**: audio-thread driver with an adaptive tick cadence
//! - **[`MixingBackend`]**: the output seam ([`CpalBackend`], [`VirtualBackend`])
//! - **[`AudioDataLoader`]**: the decoding seam ([`SymphoniaLoader`], [`MemoryLoader`])
//!
//! ## Threading
//!
//! 1. **Client thread**: owns the context and every [`SoundHandle`]; locks slots and posts commands
//! 2. **Audio thread**: owns the backend and the server half of every slot
//! 3. **Device callback** (cpal only): mixes voices, never blocks on the audio thread
//!
//! Sound handles only ever change reference count on the client thread. The
//! audio thread hands them back through [`ClientMessage::ReleaseSound`].

pub mod audio_data;
pub mod backend;
pub mod config;
pub mod device;
pub mod diagnostics;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod fade;
pub mod math;
pub mod play_id;
pub mod pool;
pub mod processing;
pub mod server;
pub mod settings;
pub mod sound;

pub use audio_data::{
    AudioDataLoader, LoadOptions, MemoryLoader, PcmClip, StreamingMode, SymphoniaLoader,
};
pub use backend::{CpalBackend, MixingBackend, VirtualBackend, VirtualDeviceProbe, VoiceId};
pub use config::AudioEngineDesc;
pub use dispatcher::{AudioCommand, ClientMessage};
pub use engine::AudioEngineContext;
pub use error::{PetalSonicError, Result};
pub use fade::FadeDirection;
pub use math::{Pose, Quat, Vec3};
pub use play_id::PlayId;
pub use pool::{SourceGuard, SourceState};
pub use processing::{Cadence, ProcessingLoop};
pub use sound::{LoadedSound, SoundHandle, SoundId};
