use crate::dispatcher::{AudioCommand, ClientEndpoint, SourceParams, SourceUpdate};
use crate::fade::FadeDirection;
use crate::math::Vec3;
use crate::play_id::{PlayId, next_play_count};
use crate::sound::SoundHandle;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Names whoever holds a slot lock, for leak reports.
#[derive(Debug, Clone, Copy)]
pub enum LockTag {
    Named(&'static str),
    Caller(&'static Location<'static>),
}

impl fmt::Display for LockTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => f.write_str(name),
            Self::Caller(location) => write!(f, "{}:{}", location.file(), location.line()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LockHolder {
    pub tag: LockTag,
    pub since: Instant,
    /// Distinguishes successive acquisitions of the same slot.
    pub acquisition: u64,
}

/// Client-side half of a pool slot.
///
/// `available`, `queue_depth` and `play_id` are only written while the slot
/// lock is held (the audio thread's acknowledgement of a finished command is
/// the one lock-free decrement) and may be read without it.
pub struct ClientSource {
    slot: usize,
    lock: Mutex<()>,
    holder: Mutex<Option<LockHolder>>,
    acquisitions: AtomicU64,
    available: AtomicBool,
    queue_depth: AtomicU32,
    play_id: AtomicU32,
}

impl ClientSource {
    pub(crate) fn new(slot: usize) -> Self {
        Self {
            slot,
            lock: Mutex::new(()),
            holder: Mutex::new(None),
            acquisitions: AtomicU64::new(0),
            available: AtomicBool::new(true),
            queue_depth: AtomicU32::new(0),
            play_id: AtomicU32::new(PlayId::new(slot, 0).raw()),
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Blocks until the slot lock is free.
    pub fn lock(&self, tag: LockTag) -> SlotLock<'_> {
        let guard = self.lock.lock();
        self.acquired(guard, tag)
    }

    pub fn try_lock(&self, tag: LockTag) -> Option<SlotLock<'_>> {
        let guard = self.lock.try_lock()?;
        Some(self.acquired(guard, tag))
    }

    fn acquired<'a>(&'a self, guard: MutexGuard<'a, ()>, tag: LockTag) -> SlotLock<'a> {
        let acquisition = self.acquisitions.fetch_add(1, Ordering::Relaxed) + 1;
        *self.holder.lock() = Some(LockHolder {
            tag,
            since: Instant::now(),
            acquisition,
        });
        SlotLock {
            source: self,
            _guard: guard,
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Commands posted for this slot that the audio thread has not yet executed.
    pub fn queue_depth(&self) -> u32 {
        self.queue_depth.load(Ordering::Acquire)
    }

    pub fn play_id(&self) -> PlayId {
        PlayId::from_raw(self.play_id.load(Ordering::Acquire))
    }

    pub fn holder(&self) -> Option<LockHolder> {
        *self.holder.lock()
    }

    /// Called by the audio thread once a command for this slot has executed.
    pub(crate) fn acknowledge(&self) {
        let previous = self
            .queue_depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| {
                depth.checked_sub(1)
            });
        debug_assert!(previous.is_ok(), "slot {} acknowledged with nothing in flight", self.slot);
    }
}

/// Exclusive ownership of one [`ClientSource`]. Dropping it unlocks the slot.
pub struct SlotLock<'a> {
    source: &'a ClientSource,
    _guard: MutexGuard<'a, ()>,
}

impl<'a> SlotLock<'a> {
    pub fn source(&self) -> &'a ClientSource {
        self.source
    }

    /// Marks the slot taken and mints the play id for the new session.
    pub(crate) fn reserve(&self) -> PlayId {
        let previous = self.source.play_id();
        let play_id = PlayId::new(self.source.slot, next_play_count(previous.play_count()));
        self.source.play_id.store(play_id.raw(), Ordering::Release);
        self.source.available.store(false, Ordering::Release);
        play_id
    }

    pub(crate) fn release_to_pool(&self) {
        self.source.available.store(true, Ordering::Release);
    }

    pub(crate) fn begin_command(&self) {
        self.source.queue_depth.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn cancel_command(&self) {
        self.source.acknowledge();
    }
}

impl Drop for SlotLock<'_> {
    fn drop(&mut self) {
        *self.source.holder.lock() = None;
    }
}

/// Scoped access to a pool slot from the client thread.
///
/// Obtained from
/// [`AudioEngineContext::source_begin_new`](crate::AudioEngineContext::source_begin_new)
/// or [`source_begin_existing`](crate::AudioEngineContext::source_begin_existing).
/// Dropping the guard ends the locked sequence.
///
/// On a fresh reservation the setters are buffered and travel with
/// [`play`](Self::play). Afterwards, and on guards for an existing session,
/// each setter posts an update to the audio thread at once.
pub struct SourceGuard<'a> {
    lock: SlotLock<'a>,
    endpoint: &'a ClientEndpoint,
    play_id: PlayId,
    pending: Option<SourceParams>,
}

impl<'a> SourceGuard<'a> {
    pub(crate) fn reserved(lock: SlotLock<'a>, endpoint: &'a ClientEndpoint, play_id: PlayId) -> Self {
        Self {
            lock,
            endpoint,
            play_id,
            pending: Some(SourceParams::default()),
        }
    }

    pub(crate) fn existing(lock: SlotLock<'a>, endpoint: &'a ClientEndpoint, play_id: PlayId) -> Self {
        Self {
            lock,
            endpoint,
            play_id,
            pending: None,
        }
    }

    pub fn slot(&self) -> usize {
        self.lock.source().slot()
    }

    pub fn play_id(&self) -> PlayId {
        self.play_id
    }

    pub fn set_position(&mut self, position: Vec3) -> &mut Self {
        self.update(SourceUpdate::Position(position))
    }

    pub fn set_gain(&mut self, gain: f32) -> &mut Self {
        self.update(SourceUpdate::Gain(gain))
    }

    pub fn set_fade(&mut self, fade: f32) -> &mut Self {
        self.update(SourceUpdate::Fade(fade))
    }

    pub fn set_looping(&mut self, looping: bool) -> &mut Self {
        self.update(SourceUpdate::Looping(looping))
    }

    pub fn set_is_music(&mut self, is_music: bool) -> &mut Self {
        self.update(SourceUpdate::IsMusic(is_music))
    }

    /// Starts `sound` on this slot and returns the session's play id.
    ///
    /// Fire-and-forget: the audio thread starts the voice on its next pass.
    /// Only a fresh reservation can be played; once the session has started
    /// (or on a guard for an existing session) this does nothing.
    pub fn play(&mut self, sound: &SoundHandle) -> PlayId {
        let Some(params) = self.pending.take() else {
            log::debug!("{} already started, ignoring play of {}", self.play_id, sound.path());
            return self.play_id;
        };
        self.post(AudioCommand::Play {
            slot: self.slot(),
            play_id: self.play_id,
            sound: sound.clone(),
            params,
        });
        self.play_id
    }

    pub fn stop(&mut self) {
        if self.pending.is_some() {
            return;
        }
        self.post(AudioCommand::Stop {
            slot: self.slot(),
            play_id: self.play_id,
        });
    }

    /// Ramps the source to silence over `duration`, then stops it.
    pub fn fade_out(&mut self, duration: Duration) {
        self.fade(duration, FadeDirection::Out);
    }

    pub fn fade_in(&mut self, duration: Duration) {
        self.fade(duration, FadeDirection::In);
    }

    fn fade(&mut self, duration: Duration, direction: FadeDirection) {
        if self.pending.is_some() {
            return;
        }
        self.post(AudioCommand::Fade {
            slot: self.slot(),
            play_id: self.play_id,
            duration,
            direction,
        });
    }

    fn update(&mut self, update: SourceUpdate) -> &mut Self {
        match &mut self.pending {
            Some(params) => params.apply(update),
            None => self.post(AudioCommand::Update {
                slot: self.slot(),
                play_id: self.play_id,
                update,
            }),
        }
        self
    }

    fn post(&self, command: AudioCommand) {
        self.lock.begin_command();
        if let Err(e) = self.endpoint.post(command) {
            self.lock.cancel_command();
            log::warn!("Dropped command for {}: {}", self.play_id, e);
        }
    }
}

impl fmt::Debug for SourceGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceGuard")
            .field("slot", &self.slot())
            .field("play_id", &self.play_id)
            .field("started", &self.pending.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher;

    #[test]
    fn reserve_mints_a_new_play_id() {
        let source = ClientSource::new(4);
        let first = source.lock(LockTag::Named("test")).reserve();
        let second = source.lock(LockTag::Named("test")).reserve();
        assert_eq!(first.slot(), 4);
        assert_ne!(first, second);
        assert!(!source.is_available());
    }

    #[test]
    fn holder_is_recorded_while_locked() {
        let source = ClientSource::new(0);
        {
            let _lock = source.lock(LockTag::Named("menu music"));
            let holder = source.holder().unwrap();
            assert_eq!(holder.tag.to_string(), "menu music");
            assert!(source.try_lock(LockTag::Named("other")).is_none());
        }
        assert!(source.holder().is_none());
        assert!(source.try_lock(LockTag::Named("other")).is_some());
    }

    #[test]
    fn setters_buffer_until_play() {
        let (client, audio) = dispatcher::channel();
        let source = ClientSource::new(1);
        let lock = source.lock(LockTag::Named("test"));
        let play_id = lock.reserve();
        let mut guard = SourceGuard::reserved(lock, &client, play_id);

        guard.set_gain(0.5).set_looping(true);
        assert!(audio.try_recv().is_err());
        assert_eq!(source.queue_depth(), 0);

        let sound = SoundHandle::from_clip("tone", crate::audio_data::PcmClip::fallback());
        assert_eq!(guard.play(&sound), play_id);
        guard.set_gain(0.25);
        assert_eq!(source.queue_depth(), 2);

        match audio.try_recv() {
            Ok(AudioCommand::Play { params, .. }) => {
                assert_eq!(params.gain, 0.5);
                assert!(params.looping);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(matches!(
            audio.try_recv(),
            Ok(AudioCommand::Update {
                update: SourceUpdate::Gain(_),
                ..
            })
        ));
    }

    #[test]
    fn failed_post_does_not_leak_depth() {
        let (client, audio) = dispatcher::channel();
        drop(audio);
        let source = ClientSource::new(2);
        let lock = source.lock(LockTag::Named("test"));
        let play_id = lock.reserve();
        let mut guard = SourceGuard::existing(lock, &client, play_id);
        guard.stop();
        assert_eq!(source.queue_depth(), 0);
    }

    #[test]
    fn play_only_starts_a_fresh_reservation() {
        let (client, audio) = dispatcher::channel();
        let source = ClientSource::new(3);
        let sound = SoundHandle::from_clip("tone", crate::audio_data::PcmClip::fallback());
        {
            let lock = source.lock(LockTag::Named("test"));
            let play_id = lock.reserve();
            let mut guard = SourceGuard::reserved(lock, &client, play_id);
            guard.set_looping(true);
            assert_eq!(guard.play(&sound), play_id);
            assert_eq!(guard.play(&sound), play_id);
        }
        assert_eq!(source.queue_depth(), 1);

        let lock = source.lock(LockTag::Named("existing"));
        let mut existing = SourceGuard::existing(lock, &client, source.play_id());
        existing.play(&sound);
        drop(existing);
        assert_eq!(source.queue_depth(), 1);

        assert!(matches!(audio.try_recv(), Ok(AudioCommand::Play { params, .. }) if params.looping));
        assert!(audio.try_recv().is_err());
    }
}
