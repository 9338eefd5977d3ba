//! The client-facing engine context.

use crate::audio_data::{AudioDataLoader, LoadOptions};
use crate::backend::MixingBackend;
use crate::config::AudioEngineDesc;
use crate::dispatcher::{self, AudioCommand, ClientEndpoint, ClientMessage};
use crate::error::{PetalSonicError, Result};
use crate::math::Pose;
use crate::play_id::PlayId;
use crate::pool::{LockTag, SourceGuard, SourcePool};
use crate::processing::ProcessingLoop;
use crate::server::AudioServer;
use crate::sound::SoundHandle;
use std::panic::Location;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Handle to a running audio engine, owned by the client thread.
///
/// There is no global engine: pass the context to whatever needs to play
/// sounds. All calls are fire-and-forget. They lock at most one pool slot and
/// post a message to the audio thread; none of them waits for the audio
/// thread to act.
///
/// Call [`process_messages`](Self::process_messages) regularly (once per frame
/// is typical) so sound handles the audio thread is done with are dropped
/// here, on their owning thread.
pub struct AudioEngineContext {
    desc: AudioEngineDesc,
    pub(crate) pool: Arc<SourcePool>,
    pub(crate) endpoint: ClientEndpoint,
    audio_thread: Option<JoinHandle<()>>,
    shut_down: bool,
}

impl AudioEngineContext {
    /// Starts the engine on a dedicated audio thread.
    ///
    /// `open_backend` runs on the audio thread, so the backend does not need
    /// to be `Send`. It is retried `desc.startup_attempts` times.
    ///
    /// # Errors
    ///
    /// Returns [`PetalSonicError::NoDevice`] if no backend could be opened,
    /// [`PetalSonicError::Configuration`] for an invalid `desc`, or the error
    /// raised while creating the voices.
    pub fn start<B, L, F>(desc: AudioEngineDesc, loader: L, mut open_backend: F) -> Result<Self>
    where
        B: MixingBackend + 'static,
        L: AudioDataLoader + 'static,
        F: FnMut() -> Result<B> + Send + 'static,
    {
        desc.validate()?;
        let pool = Arc::new(SourcePool::new(desc.slot_count));
        let (endpoint, audio_endpoint) = dispatcher::channel();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);

        let thread_desc = desc.clone();
        let thread_pool = Arc::clone(&pool);
        let audio_thread = thread::Builder::new()
            .name("petalsonic-audio".to_string())
            .spawn(move || {
                let server = open_with_retry(&thread_desc, &mut open_backend).and_then(|backend| {
                    AudioServer::new(
                        thread_desc.clone(),
                        backend,
                        Box::new(loader),
                        audio_endpoint,
                        thread_pool,
                    )
                });
                match server {
                    Ok(server) => {
                        let _ = ready_tx.send(Ok(()));
                        ProcessingLoop::new(server, thread_desc).run();
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| PetalSonicError::Engine(format!("Failed to spawn audio thread: {}", e)))?;

        let startup = ready_rx
            .recv()
            .map_err(|_| PetalSonicError::Engine("Audio thread exited during startup".to_string()))
            .and_then(|result| result);
        if let Err(e) = startup {
            let _ = audio_thread.join();
            return Err(e);
        }

        log::info!("Audio engine started with {} slots", desc.slot_count);
        Ok(Self {
            desc,
            pool,
            endpoint,
            audio_thread: Some(audio_thread),
            shut_down: false,
        })
    }

    /// Builds the engine without spawning a thread.
    ///
    /// The returned [`ProcessingLoop`] must be driven by the caller, either
    /// with [`ProcessingLoop::run`] on a thread of its choosing or step by step
    /// with [`pump`](ProcessingLoop::pump) and [`tick`](ProcessingLoop::tick).
    pub fn manual<B, L>(
        desc: AudioEngineDesc,
        loader: L,
        backend: B,
    ) -> Result<(Self, ProcessingLoop<B>)>
    where
        B: MixingBackend,
        L: AudioDataLoader + 'static,
    {
        desc.validate()?;
        let pool = Arc::new(SourcePool::new(desc.slot_count));
        let (endpoint, audio_endpoint) = dispatcher::channel();
        let server = AudioServer::new(
            desc.clone(),
            backend,
            Box::new(loader),
            audio_endpoint,
            Arc::clone(&pool),
        )?;
        let processing = ProcessingLoop::new(server, desc.clone());
        Ok((
            Self {
                desc,
                pool,
                endpoint,
                audio_thread: None,
                shut_down: false,
            },
            processing,
        ))
    }

    pub fn desc(&self) -> &AudioEngineDesc {
        &self.desc
    }

    pub fn slot_count(&self) -> usize {
        self.pool.len()
    }

    /// Slots currently on the free-list.
    pub fn free_slots(&self) -> usize {
        self.pool.free_count()
    }

    /// Reserves a free slot for a new playback session.
    ///
    /// Returns `None` when every slot is in use. The caller's location is
    /// recorded as the lock tag for leak reports.
    #[track_caller]
    pub fn source_begin_new(&self) -> Option<SourceGuard<'_>> {
        let tag = LockTag::Caller(Location::caller());
        if self.shut_down {
            return None;
        }
        let (lock, play_id) = self.pool.reserve(tag)?;
        Some(SourceGuard::reserved(lock, &self.endpoint, play_id))
    }

    /// Locks the slot of a running session.
    ///
    /// Returns `None` if `play_id` is stale, i.e. the session has ended and
    /// its slot was reclaimed. Blocks while another guard holds the slot.
    pub fn source_begin_existing(&self, play_id: PlayId, tag: &'static str) -> Option<SourceGuard<'_>> {
        let lock = self.pool.lock_existing(play_id, LockTag::Named(tag))?;
        Some(SourceGuard::existing(lock, &self.endpoint, play_id))
    }

    /// Whether the session `play_id` still holds its slot. Lock-free.
    pub fn is_playing(&self, play_id: PlayId) -> bool {
        self.pool.is_live_id(play_id)
    }

    /// Stops a session. Returns `false` if `play_id` was already stale.
    pub fn stop_by_play_id(&self, play_id: PlayId) -> bool {
        self.source_begin_existing(play_id, "stop_by_play_id")
            .map(|mut source| source.stop())
            .is_some()
    }

    /// Fades a session out over `duration` and stops it. Returns `false` if `play_id` was already stale.
    pub fn fade_out_by_play_id(&self, play_id: PlayId, duration: Duration) -> bool {
        self.source_begin_existing(play_id, "fade_out_by_play_id")
            .map(|mut source| source.fade_out(duration))
            .is_some()
    }

    /// Requests a sound with default options.
    pub fn load_sound(&self, path: &str) -> Result<SoundHandle> {
        self.load_sound_with(path, LoadOptions::default())
    }

    /// Requests a sound. The handle can be played right away; playback starts
    /// once the audio thread has loaded it.
    ///
    /// # Errors
    ///
    /// Only fails if the audio thread is gone. Decode failures are not
    /// reported: the sound plays as a short silent fallback clip instead.
    pub fn load_sound_with(&self, path: &str, options: LoadOptions) -> Result<SoundHandle> {
        let sound = SoundHandle::unloaded(path, options);
        self.endpoint.post(AudioCommand::Load(sound.clone()))?;
        Ok(sound)
    }

    /// Sets the music volume in percent (0 to 100).
    pub fn set_music_volume(&self, percent: f32) -> Result<()> {
        self.endpoint.post(AudioCommand::SetMusicVolume(percent))
    }

    /// Sets the sound effect volume (0.0 to 1.0).
    pub fn set_sound_volume(&self, volume: f32) -> Result<()> {
        self.endpoint.post(AudioCommand::SetSoundVolume(volume))
    }

    /// Sets the pitch applied to every non-music source.
    pub fn set_sound_pitch(&self, pitch: f32) -> Result<()> {
        self.endpoint.post(AudioCommand::SetSoundPitch(pitch))
    }

    /// Foreground/background transition. In the background every source is
    /// scaled by [`AudioEngineDesc::background_gain`].
    pub fn set_app_active(&self, active: bool) -> Result<()> {
        self.endpoint.post(AudioCommand::SetAppActive(active))
    }

    /// Suspends or resumes the output device. Stops issued while suspended
    /// take effect on resume.
    pub fn set_suspended(&self, suspended: bool) -> Result<()> {
        self.endpoint.post(AudioCommand::SetSuspended(suspended))
    }

    pub fn set_listener_pose(&self, pose: Pose) -> Result<()> {
        self.endpoint.post(AudioCommand::SetListener(pose))
    }

    /// Drains messages from the audio thread. Returns how many were handled.
    pub fn process_messages(&self) -> usize {
        let mut handled = 0;
        while let Some(message) = self.endpoint.try_recv() {
            handled += 1;
            match message {
                ClientMessage::ReleaseSound(sound) => drop(sound),
                ClientMessage::LoadFinished(sound) => {
                    log::debug!("Load finished: {}", sound.path());
                }
                ClientMessage::ShutdownComplete => log::debug!("Audio server confirmed shutdown"),
            }
        }
        handled
    }

    /// Stops every source and, in threaded mode, joins the audio thread.
    ///
    /// In manual mode the shutdown takes effect the next time the
    /// [`ProcessingLoop`] is pumped.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        if let Err(e) = self.endpoint.post(AudioCommand::Shutdown) {
            log::debug!("Audio thread already gone: {}", e);
        }
        if let Some(audio_thread) = self.audio_thread.take() {
            audio_thread
                .join()
                .map_err(|_| PetalSonicError::Engine("Audio thread panicked".to_string()))?;
        }
        self.process_messages();
        log::info!("Audio engine shut down");
        Ok(())
    }
}

impl Drop for AudioEngineContext {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Audio engine shutdown failed: {}", e);
        }
    }
}

fn open_with_retry<B, F>(desc: &AudioEngineDesc, open_backend: &mut F) -> Result<B>
where
    F: FnMut() -> Result<B>,
{
    let mut reason = String::new();
    for attempt in 1..=desc.startup_attempts {
        match open_backend() {
            Ok(backend) => return Ok(backend),
            Err(e) => {
                log::warn!(
                    "Opening audio backend failed (attempt {}/{}): {}",
                    attempt,
                    desc.startup_attempts,
                    e
                );
                reason = e.to_string();
                if attempt < desc.startup_attempts {
                    thread::sleep(desc.startup_retry_delay);
                }
            }
        }
    }
    Err(PetalSonicError::NoDevice {
        attempts: desc.startup_attempts,
        reason,
    })
}
