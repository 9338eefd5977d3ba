//! Audio-thread state: the server halves of every slot plus everything they share.

use crate::audio_data::{AudioDataLoader, PcmClip};
use crate::backend::MixingBackend;
use crate::config::AudioEngineDesc;
use crate::device::{DeviceMonitor, DeviceState};
use crate::diagnostics::{LeakWatchdog, LogOnce};
use crate::dispatcher::{AudioCommand, AudioEndpoint, ClientMessage};
use crate::error::Result;
use crate::fade::{FadeDirection, FadeScheduler, FadeStep};
use crate::pool::{ReclaimOutcome, ServerSource, SourceEnv, SourcePool, SourceState};
use crate::settings::GlobalAudioSettings;
use crate::sound::{LoadedSound, SoundHandle};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

/// Builds a [`SourceEnv`] from disjoint fields of an [`AudioServer`].
macro_rules! source_env {
    ($server:expr) => {
        SourceEnv {
            backend: &mut $server.backend,
            settings: &$server.settings,
            loader: $server.loader.as_ref(),
            endpoint: &$server.endpoint,
            log_once: &mut $server.log_once,
            scratch: &mut $server.scratch,
        }
    };
}

/// Owns the backend and all server-side playback state.
///
/// Lives on the audio thread and is driven by a
/// [`ProcessingLoop`](crate::ProcessingLoop): commands go through
/// [`handle`](Self::handle), periodic work through [`tick`](Self::tick).
pub struct AudioServer<B: MixingBackend> {
    desc: AudioEngineDesc,
    backend: B,
    loader: Box<dyn AudioDataLoader>,
    endpoint: AudioEndpoint,
    pool: Arc<SourcePool>,
    sources: Vec<ServerSource>,
    settings: GlobalAudioSettings,
    fades: FadeScheduler,
    device: DeviceMonitor,
    watchdog: LeakWatchdog,
    log_once: LogOnce,
    scratch: Vec<f32>,
    pending_loads: VecDeque<SoundHandle>,
    contended_ticks: u32,
    last_refill: Option<Instant>,
}

impl<B: MixingBackend> AudioServer<B> {
    /// Creates one backend voice per pool slot.
    pub fn new(
        desc: AudioEngineDesc,
        mut backend: B,
        loader: Box<dyn AudioDataLoader>,
        endpoint: AudioEndpoint,
        pool: Arc<SourcePool>,
    ) -> Result<Self> {
        let sources = (0..pool.len())
            .map(|slot| Ok(ServerSource::new(slot, backend.create_voice()?)))
            .collect::<Result<Vec<_>>>()?;
        log::info!("Audio server ready with {} voices", sources.len());

        Ok(Self {
            settings: GlobalAudioSettings::from_desc(&desc),
            fades: FadeScheduler::new(desc.fade_update_min),
            device: DeviceMonitor::new(&desc),
            watchdog: LeakWatchdog::new(pool.len(), desc.leak_threshold, desc.leak_scan_interval),
            log_once: LogOnce::new(),
            scratch: Vec::new(),
            pending_loads: VecDeque::new(),
            contended_ticks: 0,
            last_refill: None,
            desc,
            backend,
            loader,
            endpoint,
            pool,
            sources,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn source(&self, slot: usize) -> Option<&ServerSource> {
        self.sources.get(slot)
    }

    pub fn settings(&self) -> &GlobalAudioSettings {
        &self.settings
    }

    pub fn device_state(&self) -> DeviceState {
        self.device.state()
    }

    pub fn has_pending_loads(&self) -> bool {
        !self.pending_loads.is_empty()
    }

    pub fn has_fades(&self) -> bool {
        self.fades.is_active()
    }

    pub fn has_streams(&self) -> bool {
        self.sources.iter().any(ServerSource::is_streaming)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.settings.shutting_down
    }

    pub(crate) fn endpoint(&self) -> &AudioEndpoint {
        &self.endpoint
    }

    /// Executes one client command. Returns `false` once the server has shut down.
    pub fn handle(&mut self, command: AudioCommand, now: Instant) -> bool {
        let acknowledged = command.slot().filter(|slot| *slot < self.sources.len());
        let keep_running = self.execute(command, now);
        if let Some(slot) = acknowledged.and_then(|slot| self.pool.source(slot)) {
            slot.acknowledge();
        }
        keep_running
    }

    fn execute(&mut self, command: AudioCommand, now: Instant) -> bool {
        match command {
            AudioCommand::Play {
                slot,
                play_id,
                sound,
                params,
            } => {
                self.fades.cancel(play_id);
                let mut env = source_env!(self);
                match self.sources.get_mut(slot) {
                    Some(source) => source.play(play_id, sound, params, &mut env),
                    None => env.endpoint.release(sound),
                }
            }
            AudioCommand::Update {
                slot,
                play_id,
                update,
            } => {
                let mut env = source_env!(self);
                match self.sources.get_mut(slot) {
                    Some(source) if source.matches(play_id) => source.update(update, &mut env),
                    _ => log::debug!("Ignoring {:?} for stale {}", update, play_id),
                }
            }
            AudioCommand::Stop { slot, play_id } => {
                let mut env = source_env!(self);
                match self.sources.get_mut(slot) {
                    Some(source) if source.matches(play_id) => {
                        self.fades.cancel(play_id);
                        source.stop(&mut env);
                    }
                    _ => log::debug!("Ignoring stop for stale {}", play_id),
                }
            }
            AudioCommand::Fade {
                slot,
                play_id,
                duration,
                direction,
            } => {
                let mut env = source_env!(self);
                match self.sources.get_mut(slot) {
                    Some(source) if source.matches(play_id) => {
                        if let Some(entry) = self.fades.start(play_id, now, duration, direction) {
                            source.begin_fade();
                            source.set_fade(entry.level(now), &mut env);
                        }
                    }
                    _ => log::debug!("Ignoring fade for stale {}", play_id),
                }
            }
            AudioCommand::Load(sound) => self.pending_loads.push_back(sound),
            AudioCommand::SetMusicVolume(volume) => {
                self.settings.music_volume = volume.clamp(0.0, 100.0);
                self.refresh_sources();
            }
            AudioCommand::SetSoundVolume(volume) => {
                self.settings.sound_volume = volume.max(0.0);
                self.refresh_sources();
            }
            AudioCommand::SetSoundPitch(pitch) => {
                self.settings.sound_pitch = pitch;
                self.refresh_sources();
            }
            AudioCommand::SetAppActive(active) => {
                if self.settings.app_active != active {
                    log::info!("App {}", if active { "foreground" } else { "background" });
                    self.settings.app_active = active;
                    self.refresh_sources();
                }
            }
            AudioCommand::SetSuspended(suspended) => self.set_suspended(suspended),
            AudioCommand::SetListener(pose) => {
                if let Err(e) = self.backend.set_listener(pose) {
                    self.log_once
                        .warn("listener", || format!("Failed to set listener pose: {}", e));
                }
            }
            AudioCommand::Shutdown => {
                self.shutdown();
                return false;
            }
        }
        true
    }

    fn set_suspended(&mut self, suspended: bool) {
        if self.settings.suspended == suspended {
            return;
        }
        if suspended {
            if let Err(e) = self.backend.pause_device() {
                log::warn!("Failed to pause output device: {}", e);
            }
            self.settings.suspended = true;
            log::info!("Audio suspended");
            return;
        }

        self.settings.suspended = false;
        if let Err(e) = self.backend.resume_device() {
            log::warn!("Failed to resume output device: {}", e);
        }
        let mut env = source_env!(self);
        for source in &mut self.sources {
            source.on_resume(&mut env);
        }
        log::info!("Audio resumed");
        self.refresh_sources();
    }

    /// One pass of periodic work.
    pub fn tick(&mut self, now: Instant) {
        let device_ok = self.device.poll(&mut self.backend, now);
        let backend_usable = device_ok && !self.settings.suspended;

        self.advance_loads();
        if backend_usable {
            self.reclaim_scan();
        }
        if !self.settings.suspended {
            self.advance_fades(now);
        }
        if backend_usable {
            self.refill_streams(now);
        }
        self.refresh_sources();
        self.watchdog.scan(&self.pool, now);
    }

    fn advance_loads(&mut self) {
        let Some(sound) = self.pending_loads.pop_front() else {
            return;
        };
        if !sound.is_loaded() {
            let loaded = self.load(&sound);
            sound.complete_load(loaded);
        }
        self.endpoint.reply(ClientMessage::LoadFinished(sound));
    }

    fn load(&mut self, sound: &SoundHandle) -> LoadedSound {
        let path = sound.path();
        if self.loader.should_stream(path, sound.options()) {
            return LoadedSound::Streamed {
                kind: self.loader.decoder_kind(path),
            };
        }
        match self.loader.load(path, sound.options()) {
            Ok(clip) => {
                log::debug!("Loaded {} ({:?})", path, clip.duration());
                LoadedSound::Buffered(clip)
            }
            Err(e) => {
                self.log_once.warn(format!("decode:{}", path), || {
                    format!("Failed to load {}: {}; using fallback clip", path, e)
                });
                LoadedSound::Fallback(PcmClip::fallback())
            }
        }
    }

    /// Returns finished sources to the free-list.
    fn reclaim_scan(&mut self) {
        let block = self.contended_ticks >= self.desc.max_contended_reclaim_ticks;
        if block {
            log::debug!(
                "Free-list contended for {} ticks, blocking",
                self.contended_ticks
            );
        }
        let mut contended = false;
        let pool = Arc::clone(&self.pool);
        let mut env = source_env!(self);

        for source in &mut self.sources {
            let slot = source.slot();
            let Some(client) = pool.source(slot) else {
                continue;
            };
            if client.is_available() || source.is_busy(&*env.backend) {
                continue;
            }
            match pool.reclaim(slot, block, || source.retire(&mut env)) {
                ReclaimOutcome::Reclaimed => log::debug!("Slot {} reclaimed", slot),
                ReclaimOutcome::FreeListContended => contended = true,
                ReclaimOutcome::SlotLocked | ReclaimOutcome::InFlight => {}
            }
        }

        self.contended_ticks = if contended {
            self.contended_ticks + 1
        } else {
            0
        };
    }

    fn advance_fades(&mut self, now: Instant) {
        let mut env = source_env!(self);
        let sources = &mut self.sources;
        self.fades.advance(now, |entry, level, complete| {
            let Some(source) = sources.get_mut(entry.play_id.slot()) else {
                return FadeStep::Drop;
            };
            if !source.matches(entry.play_id) || source.state() == SourceState::Stopped {
                return FadeStep::Drop;
            }
            source.set_fade(level, &mut env);
            if complete {
                match entry.direction {
                    FadeDirection::Out => source.stop(&mut env),
                    FadeDirection::In => source.end_fade(),
                }
            }
            FadeStep::Continue
        });
    }

    fn refill_streams(&mut self, now: Instant) {
        if let Some(last) = self.last_refill {
            if now.saturating_duration_since(last) < self.desc.stream_refill_min {
                return;
            }
        }
        if !self.has_streams() {
            return;
        }
        self.last_refill = Some(now);
        let mut env = source_env!(self);
        for source in &mut self.sources {
            source.refill_stream(&mut env);
        }
    }

    /// Starts deferred sources and pushes changed global gain/pitch to playing ones.
    fn refresh_sources(&mut self) {
        let mut env = source_env!(self);
        for source in &mut self.sources {
            if source.state() == SourceState::Reserved {
                source.try_start(&mut env);
            } else {
                source.refresh(&mut env);
            }
        }
    }

    fn shutdown(&mut self) {
        self.settings.shutting_down = true;
        let mut env = source_env!(self);
        for source in &mut self.sources {
            source.retire(&mut env);
            env.backend.destroy(source.voice());
        }
        for sound in self.pending_loads.drain(..) {
            self.endpoint.release(sound);
        }
        self.endpoint.reply(ClientMessage::ShutdownComplete);
        log::info!("Audio server shut down");
    }
}
