use crate::audio_data::{AudioDataLoader, PcmClip, StreamDecoder};
use crate::backend::{MixingBackend, VoiceId, VoiceParam};
use crate::diagnostics::LogOnce;
use crate::dispatcher::{AudioEndpoint, SourceParams, SourceUpdate};
use crate::math::Vec3;
use crate::play_id::PlayId;
use crate::settings::GlobalAudioSettings;
use crate::sound::{LoadedSound, SoundHandle};

/// Playback state of a [`ServerSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    /// Free, or reclaimed and waiting to be handed out again.
    Idle,
    /// Bound to a sound but not started yet (still loading, suspended, or muted music).
    Reserved,
    Playing,
    /// Playing under a running fade.
    Fading,
    /// Playing from a streaming decoder.
    Streaming,
    /// Halted; the bound sound has been released.
    Stopped,
}

/// What a [`ServerSource`] needs from the audio thread to act on the backend.
pub struct SourceEnv<'a, B: MixingBackend> {
    pub backend: &'a mut B,
    pub settings: &'a GlobalAudioSettings,
    pub loader: &'a dyn AudioDataLoader,
    pub endpoint: &'a AudioEndpoint,
    pub log_once: &'a mut LogOnce,
    /// Reused buffer for streaming refills.
    pub scratch: &'a mut Vec<f32>,
}

/// Audio-thread half of a pool slot: one backend voice and its playback state.
pub struct ServerSource {
    slot: usize,
    voice: VoiceId,
    state: SourceState,
    play_id: Option<PlayId>,
    want_to_play: bool,
    is_streamed: bool,
    params: SourceParams,
    sound: Option<SoundHandle>,
    stream: Option<StreamDecoder>,
    applied_gain: Option<f32>,
    applied_pitch: Option<f32>,
}

impl ServerSource {
    pub fn new(slot: usize, voice: VoiceId) -> Self {
        Self {
            slot,
            voice,
            state: SourceState::Idle,
            play_id: None,
            want_to_play: false,
            is_streamed: false,
            params: SourceParams::default(),
            sound: None,
            stream: None,
            applied_gain: None,
            applied_pitch: None,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn voice(&self) -> VoiceId {
        self.voice
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    pub fn play_id(&self) -> Option<PlayId> {
        self.play_id
    }

    pub fn want_to_play(&self) -> bool {
        self.want_to_play
    }

    pub fn is_streamed(&self) -> bool {
        self.is_streamed
    }

    pub fn params(&self) -> &SourceParams {
        &self.params
    }

    pub fn sound(&self) -> Option<&SoundHandle> {
        self.sound.as_ref()
    }

    /// Whether `play_id` is this source's current session.
    pub fn matches(&self, play_id: PlayId) -> bool {
        self.play_id == Some(play_id) && self.state != SourceState::Idle
    }

    /// Whether the backend voice has been started for the current session.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            SourceState::Playing | SourceState::Fading | SourceState::Streaming
        )
    }

    pub fn is_streaming(&self) -> bool {
        self.is_active() && self.stream.is_some()
    }

    fn is_looping(&self) -> bool {
        self.params.looping || self.stream.as_ref().is_some_and(StreamDecoder::is_looping)
    }

    /// Gain the backend voice should have under `settings`.
    pub fn effective_gain(&self, settings: &GlobalAudioSettings) -> f32 {
        settings.effective_gain(self.params.gain, self.params.fade, self.params.is_music)
    }

    /// Clears per-session parameters. Only valid on an idle source.
    pub fn reset(&mut self) {
        debug_assert_eq!(self.state, SourceState::Idle, "reset on slot {}", self.slot);
        self.params = SourceParams::default();
        self.is_streamed = false;
        self.stream = None;
        self.applied_gain = None;
        self.applied_pitch = None;
    }

    /// Binds `sound` for a new session and starts it if nothing holds it back.
    pub fn play<B: MixingBackend>(
        &mut self,
        play_id: PlayId,
        sound: SoundHandle,
        params: SourceParams,
        env: &mut SourceEnv<'_, B>,
    ) {
        if self.state != SourceState::Idle {
            self.exec_stop(env);
            self.state = SourceState::Idle;
        }
        self.reset();
        self.is_streamed = matches!(sound.loaded(), Some(LoadedSound::Streamed { .. }));
        self.params = params;
        self.play_id = Some(play_id);
        self.sound = Some(sound);
        self.want_to_play = true;
        self.state = SourceState::Reserved;
        if !self.try_start(env) {
            log::debug!("{} reserved, start deferred", play_id);
        }
    }

    /// Starts a reserved source once it is loaded and allowed to sound.
    pub fn try_start<B: MixingBackend>(&mut self, env: &mut SourceEnv<'_, B>) -> bool {
        if self.state != SourceState::Reserved || !self.want_to_play {
            return false;
        }
        if !env.settings.can_start() {
            return false;
        }
        if self.params.is_music && !env.settings.music_audible() {
            return false;
        }
        let Some(loaded) = self.sound.as_ref().and_then(SoundHandle::loaded).cloned() else {
            return false;
        };
        self.exec_play(&loaded, env);
        true
    }

    fn exec_play<B: MixingBackend>(&mut self, loaded: &LoadedSound, env: &mut SourceEnv<'_, B>) {
        match loaded {
            LoadedSound::Buffered(clip) | LoadedSound::Fallback(clip) => {
                self.start_buffered(clip, env)
            }
            LoadedSound::Streamed { .. } => self.start_streamed(env),
        }
    }

    fn start_buffered<B: MixingBackend>(&mut self, clip: &PcmClip, env: &mut SourceEnv<'_, B>) {
        self.is_streamed = false;
        if let Err(e) = env.backend.bind_buffer(self.voice, clip) {
            log::warn!("Slot {}: failed to bind buffer: {}", self.slot, e);
            self.want_to_play = false;
            self.exec_stop(env);
            return;
        }
        self.set_param(VoiceParam::ListenerRelative(false), env);
        self.set_param(VoiceParam::Position(self.params.position), env);
        self.set_param(VoiceParam::Looping(self.params.looping), env);
        self.state = SourceState::Playing;
        self.start_voice(env);
    }

    fn start_streamed<B: MixingBackend>(&mut self, env: &mut SourceEnv<'_, B>) {
        let path = self
            .sound
            .as_ref()
            .map(|s| s.path().to_string())
            .unwrap_or_default();
        let mut stream = match env.loader.open_stream(&path) {
            Ok(stream) => stream,
            Err(e) => {
                env.log_once.warn(format!("decode:{}", path), || {
                    format!("Cannot stream {}: {}; playing fallback clip", path, e)
                });
                self.start_buffered(&PcmClip::fallback(), env);
                return;
            }
        };
        stream.set_looping(self.params.looping);

        if let Err(e) = env
            .backend
            .clear_stream(self.voice, stream.channels(), stream.sample_rate())
        {
            log::warn!("Slot {}: failed to prepare stream: {}", self.slot, e);
            self.want_to_play = false;
            self.exec_stop(env);
            return;
        }
        self.stream = Some(stream);
        self.is_streamed = true;

        // Streams play head-locked at the listener.
        self.set_param(VoiceParam::Looping(false), env);
        self.set_param(VoiceParam::ListenerRelative(true), env);
        self.set_param(VoiceParam::Position(Vec3::ZERO), env);
        self.state = SourceState::Streaming;
        self.pump_stream(env);
        self.start_voice(env);
    }

    fn start_voice<B: MixingBackend>(&mut self, env: &mut SourceEnv<'_, B>) {
        self.applied_gain = None;
        self.applied_pitch = None;
        self.apply_mix(env);
        if let Err(e) = env.backend.play(self.voice) {
            log::warn!("Slot {}: backend refused to play: {}", self.slot, e);
        }
        log::debug!(
            "{} {:?} on {}",
            self.play_id.map(|id| id.to_string()).unwrap_or_default(),
            self.state,
            self.voice
        );
    }

    /// Requests a stop. While suspended only the intent is recorded.
    pub fn stop<B: MixingBackend>(&mut self, env: &mut SourceEnv<'_, B>) {
        self.want_to_play = false;
        if env.settings.suspended {
            return;
        }
        self.exec_stop(env);
    }

    /// Halts the voice and sends the bound sound back to its owning thread.
    pub fn exec_stop<B: MixingBackend>(&mut self, env: &mut SourceEnv<'_, B>) {
        if self.is_active() {
            if let Err(e) = env.backend.stop(self.voice) {
                log::warn!("Slot {}: failed to stop voice: {}", self.slot, e);
            }
        }
        self.stream = None;
        if let Some(sound) = self.sound.take() {
            env.endpoint.release(sound);
        }
        if self.state != SourceState::Idle {
            self.state = SourceState::Stopped;
        }
    }

    /// Returns the source to `Idle` before its slot goes back to the free-list. Idempotent.
    pub fn retire<B: MixingBackend>(&mut self, env: &mut SourceEnv<'_, B>) {
        self.want_to_play = false;
        self.exec_stop(env);
        self.state = SourceState::Idle;
        self.play_id = None;
    }

    /// Whether the slot must stay out of the free-list.
    ///
    /// Looping sources are busy for as long as they want to play, regardless of
    /// what the backend reports. One-shots are busy until the voice goes quiet
    /// (and, when streamed, until the decoder has run dry).
    pub fn is_busy<B: MixingBackend>(&self, backend: &B) -> bool {
        match self.state {
            SourceState::Idle | SourceState::Stopped => false,
            SourceState::Reserved => self.want_to_play,
            SourceState::Playing | SourceState::Fading | SourceState::Streaming => {
                if !self.want_to_play {
                    false
                } else if self.is_looping() {
                    true
                } else if self.is_streamed {
                    let drained = self.stream.as_ref().is_none_or(StreamDecoder::is_finished);
                    !drained || backend.is_playing(self.voice)
                } else {
                    backend.is_playing(self.voice)
                }
            }
        }
    }

    pub fn update<B: MixingBackend>(&mut self, update: SourceUpdate, env: &mut SourceEnv<'_, B>) {
        self.params.apply(update);
        if !self.is_active() || env.settings.suspended {
            return;
        }
        match update {
            SourceUpdate::Position(position) if !self.is_streamed => {
                self.set_param(VoiceParam::Position(position), env);
            }
            SourceUpdate::Looping(looping) => match self.stream.as_mut() {
                Some(stream) => stream.set_looping(looping),
                None => {
                    self.set_param(VoiceParam::Looping(looping), env);
                }
            },
            _ => {}
        }
        self.apply_mix(env);
    }

    pub fn set_fade<B: MixingBackend>(&mut self, fade: f32, env: &mut SourceEnv<'_, B>) {
        self.params.fade = fade;
        self.apply_mix(env);
    }

    pub fn begin_fade(&mut self) {
        if matches!(self.state, SourceState::Playing | SourceState::Streaming) {
            self.state = SourceState::Fading;
        }
    }

    pub fn end_fade(&mut self) {
        if self.state == SourceState::Fading {
            self.state = if self.stream.is_some() {
                SourceState::Streaming
            } else {
                SourceState::Playing
            };
        }
    }

    /// Pushes gain and pitch to the backend if the global settings changed them.
    pub fn refresh<B: MixingBackend>(&mut self, env: &mut SourceEnv<'_, B>) {
        self.apply_mix(env);
    }

    fn apply_mix<B: MixingBackend>(&mut self, env: &mut SourceEnv<'_, B>) {
        if !self.is_active() || env.settings.suspended {
            return;
        }
        let gain = self.effective_gain(env.settings);
        if self.applied_gain != Some(gain) && self.set_param(VoiceParam::Gain(gain), env) {
            self.applied_gain = Some(gain);
        }
        let pitch = env.settings.effective_pitch(self.params.is_music);
        if self.applied_pitch != Some(pitch) && self.set_param(VoiceParam::Pitch(pitch), env) {
            self.applied_pitch = Some(pitch);
        }
    }

    fn set_param<B: MixingBackend>(&self, param: VoiceParam, env: &mut SourceEnv<'_, B>) -> bool {
        match env.backend.set(self.voice, param) {
            Ok(()) => true,
            Err(e) => {
                env.log_once.warn(format!("param:{}", param.name()), || {
                    format!("Backend rejected {} on slot {}: {}", param.name(), self.slot, e)
                });
                false
            }
        }
    }

    /// Tops up the backend's stream queue and restarts the voice after an underrun.
    pub fn refill_stream<B: MixingBackend>(&mut self, env: &mut SourceEnv<'_, B>) {
        if !self.is_streaming() {
            return;
        }
        self.pump_stream(env);
        let drained = self.stream.as_ref().is_none_or(StreamDecoder::is_finished);
        if self.want_to_play && !drained && !env.backend.is_playing(self.voice) {
            log::debug!("Slot {}: stream underrun, restarting", self.slot);
            if let Err(e) = env.backend.play(self.voice) {
                log::warn!("Slot {}: failed to restart stream: {}", self.slot, e);
            }
        }
    }

    fn pump_stream<B: MixingBackend>(&mut self, env: &mut SourceEnv<'_, B>) -> usize {
        let Some(stream) = self.stream.as_mut() else {
            return 0;
        };
        let mut queued = 0;
        let mut failed = false;
        while !stream.is_finished() {
            let vacancy = env.backend.stream_vacancy(self.voice);
            if vacancy == 0 {
                break;
            }
            env.scratch.clear();
            let frames = match stream.fill(env.scratch, vacancy) {
                Ok(frames) => frames,
                Err(e) => {
                    let path = self.sound.as_ref().map(|s| s.path()).unwrap_or_default();
                    env.log_once.warn(format!("decode:{}", path), || {
                        format!("Stream decode failed for {}: {}", path, e)
                    });
                    failed = true;
                    break;
                }
            };
            if frames == 0 {
                break;
            }
            match env.backend.queue_stream(self.voice, env.scratch) {
                Ok(0) => break,
                Ok(accepted) => queued += accepted,
                Err(e) => {
                    log::warn!("Slot {}: failed to queue stream data: {}", self.slot, e);
                    break;
                }
            }
        }
        if failed {
            self.stream = None;
        }
        queued
    }

    /// Applies stops requested while the engine was suspended.
    pub fn on_resume<B: MixingBackend>(&mut self, env: &mut SourceEnv<'_, B>) {
        if self.is_active() && !self.want_to_play {
            self.exec_stop(env);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_data::MemoryLoader;
    use crate::backend::{VirtualBackend, VirtualDeviceProbe};
    use crate::config::AudioEngineDesc;
    use crate::dispatcher::{self, ClientEndpoint, ClientMessage};
    use std::time::Duration;

    struct Rig {
        backend: VirtualBackend,
        probe: VirtualDeviceProbe,
        settings: GlobalAudioSettings,
        loader: MemoryLoader,
        client: ClientEndpoint,
        audio: AudioEndpoint,
        log_once: LogOnce,
        scratch: Vec<f32>,
    }

    impl Rig {
        fn new() -> Self {
            let (backend, probe) = VirtualBackend::with_stream_capacity(500);
            let (client, audio) = dispatcher::channel();
            Self {
                backend,
                probe,
                settings: GlobalAudioSettings::from_desc(&AudioEngineDesc::default()),
                loader: MemoryLoader::new()
                    .with_streamed_clip("music.ogg", PcmClip::silence(Duration::from_secs(2), 1000, 1)),
                client,
                audio,
                log_once: LogOnce::new(),
                scratch: Vec::new(),
            }
        }

        fn env(&mut self) -> SourceEnv<'_, VirtualBackend> {
            SourceEnv {
                backend: &mut self.backend,
                settings: &self.settings,
                loader: &self.loader,
                endpoint: &self.audio,
                log_once: &mut self.log_once,
                scratch: &mut self.scratch,
            }
        }

        fn source(&mut self) -> ServerSource {
            let voice = self.backend.create_voice().unwrap();
            ServerSource::new(0, voice)
        }
    }

    fn clip_sound(seconds: u64) -> SoundHandle {
        SoundHandle::from_clip("clip", PcmClip::silence(Duration::from_secs(seconds), 1000, 1))
    }

    #[test]
    fn one_shot_is_busy_until_voice_ends() {
        let mut rig = Rig::new();
        let mut source = rig.source();
        source.play(PlayId::new(0, 1), clip_sound(1), SourceParams::default(), &mut rig.env());
        assert_eq!(source.state(), SourceState::Playing);
        assert!(source.is_busy(&rig.backend));

        rig.probe.advance(Duration::from_millis(1500));
        assert!(!source.is_busy(&rig.backend));
    }

    #[test]
    fn looping_source_stays_busy_through_silence() {
        let mut rig = Rig::new();
        let mut source = rig.source();
        let params = SourceParams {
            looping: true,
            ..SourceParams::default()
        };
        source.play(PlayId::new(0, 1), clip_sound(1), params, &mut rig.env());
        rig.probe.set_physically_playing(source.voice(), false);
        assert!(source.is_busy(&rig.backend));

        source.stop(&mut rig.env());
        assert!(!source.is_busy(&rig.backend));
        assert_eq!(source.state(), SourceState::Stopped);
    }

    #[test]
    fn stop_releases_sound_to_client() {
        let mut rig = Rig::new();
        let mut source = rig.source();
        let sound = clip_sound(1);
        let id = sound.id();
        source.play(PlayId::new(0, 1), sound, SourceParams::default(), &mut rig.env());
        source.stop(&mut rig.env());
        assert!(source.sound().is_none());
        match rig.client.try_recv() {
            Some(ClientMessage::ReleaseSound(sound)) => assert_eq!(sound.id(), id),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn muted_music_waits_for_volume() {
        let mut rig = Rig::new();
        rig.settings.music_volume = 0.0;
        let mut source = rig.source();
        let params = SourceParams {
            is_music: true,
            ..SourceParams::default()
        };
        source.play(PlayId::new(0, 1), clip_sound(5), params, &mut rig.env());
        assert_eq!(source.state(), SourceState::Reserved);
        assert!(source.is_busy(&rig.backend));

        rig.settings.music_volume = 50.0;
        assert!(source.try_start(&mut rig.env()));
        assert_eq!(source.state(), SourceState::Playing);
        let voice = rig.probe.voice(source.voice()).unwrap();
        assert!((voice.gain - 0.5).abs() < 1e-6);
        assert_eq!(voice.pitch, 1.0);
    }

    #[test]
    fn suspended_stop_only_records_intent() {
        let mut rig = Rig::new();
        let mut source = rig.source();
        source.play(PlayId::new(0, 1), clip_sound(5), SourceParams::default(), &mut rig.env());
        rig.settings.suspended = true;
        source.stop(&mut rig.env());
        assert_eq!(source.state(), SourceState::Playing);
        assert_eq!(rig.probe.voice(source.voice()).unwrap().stop_calls, 0);

        rig.settings.suspended = false;
        source.on_resume(&mut rig.env());
        assert_eq!(source.state(), SourceState::Stopped);
        assert_eq!(rig.probe.voice(source.voice()).unwrap().stop_calls, 1);
    }

    #[test]
    fn streamed_source_plays_head_locked_and_refills() {
        let mut rig = Rig::new();
        let mut source = rig.source();
        let sound = SoundHandle::unloaded("music.ogg", Default::default());
        sound.complete_load(LoadedSound::Streamed {
            kind: crate::audio_data::DecoderKind::Memory,
        });
        source.play(PlayId::new(0, 1), sound, SourceParams::default(), &mut rig.env());
        assert_eq!(source.state(), SourceState::Streaming);
        let voice = rig.probe.voice(source.voice()).unwrap();
        assert!(voice.listener_relative);
        assert_eq!(voice.position, Vec3::ZERO);
        assert_eq!(voice.queued_frames, 500);

        // Drain the queue completely: the voice underruns and is restarted on refill.
        rig.probe.advance(Duration::from_millis(600));
        assert!(!rig.backend.is_playing(source.voice()));
        assert!(source.is_busy(&rig.backend));
        source.refill_stream(&mut rig.env());
        assert!(rig.backend.is_playing(source.voice()));
    }

    #[test]
    fn unknown_stream_falls_back_to_buffered_clip() {
        let mut rig = Rig::new();
        let mut source = rig.source();
        let sound = SoundHandle::unloaded("missing.ogg", Default::default());
        sound.complete_load(LoadedSound::Streamed {
            kind: crate::audio_data::DecoderKind::Vorbis,
        });
        source.play(PlayId::new(0, 1), sound, SourceParams::default(), &mut rig.env());
        assert_eq!(source.state(), SourceState::Playing);
        assert!(!source.is_streamed());
    }

    #[test]
    fn looping_update_reaches_buffered_voice() {
        let mut rig = Rig::new();
        let mut source = rig.source();
        source.play(PlayId::new(0, 1), clip_sound(1), SourceParams::default(), &mut rig.env());
        assert!(!rig.probe.voice(source.voice()).unwrap().looping);

        source.update(SourceUpdate::Looping(true), &mut rig.env());
        assert!(rig.probe.voice(source.voice()).unwrap().looping);
        rig.probe.advance(Duration::from_millis(1500));
        assert!(source.is_busy(&rig.backend));
    }

    #[test]
    fn param_failures_are_logged_once() {
        let mut rig = Rig::new();
        let mut source = rig.source();
        rig.probe.reject_params(true);
        source.play(PlayId::new(0, 1), clip_sound(5), SourceParams::default(), &mut rig.env());
        source.update(SourceUpdate::Gain(0.3), &mut rig.env());
        source.update(SourceUpdate::Gain(0.2), &mut rig.env());
        assert!(rig.log_once.suppressed() > 0);
    }
}
