use crate::audio_data::PcmClip;
use crate::backend::{MixingBackend, VoiceId, VoiceParam};
use crate::error::{PetalSonicError, Result};
use crate::math::{Pose, Vec3};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Snapshot of one voice on a [`VirtualBackend`].
#[derive(Debug, Clone)]
pub struct VirtualVoice {
    pub clip_duration: Option<Duration>,
    pub clip_elapsed: Duration,
    pub streaming: bool,
    pub stream_sample_rate: u32,
    pub stream_channels: u16,
    pub queued_frames: usize,
    pub playing: bool,
    pub looping: bool,
    pub gain: f32,
    pub pitch: f32,
    pub position: Vec3,
    pub listener_relative: bool,
    pub play_calls: u32,
    pub stop_calls: u32,
    /// Every gain value set on the voice, oldest first.
    pub gain_history: Vec<f32>,
}

impl Default for VirtualVoice {
    fn default() -> Self {
        Self {
            clip_duration: None,
            clip_elapsed: Duration::ZERO,
            streaming: false,
            stream_sample_rate: 0,
            stream_channels: 1,
            queued_frames: 0,
            playing: false,
            looping: false,
            gain: 1.0,
            pitch: 1.0,
            position: Vec3::ZERO,
            listener_relative: false,
            play_calls: 0,
            stop_calls: 0,
            gain_history: Vec::new(),
        }
    }
}

struct VirtualDevice {
    voices: Vec<Option<VirtualVoice>>,
    connected: bool,
    paused: bool,
    failing_resets: u32,
    reset_attempts: u32,
    reject_params: bool,
    listener: Pose,
    stream_capacity: usize,
}

impl VirtualDevice {
    fn voice_mut(&mut self, voice: VoiceId) -> Result<&mut VirtualVoice> {
        self.voices
            .get_mut(voice.0 as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| PetalSonicError::Backend(format!("Unknown voice {}", voice)))
    }

    fn voice(&self, voice: VoiceId) -> Option<&VirtualVoice> {
        self.voices.get(voice.0 as usize).and_then(Option::as_ref)
    }
}

/// A headless output device with simulated time.
///
/// Nothing is rendered. Voices play until [`VirtualDeviceProbe::advance`] moves
/// simulated time past the end of their clip or stream queue. The probe also
/// injects device loss and failing parameter calls.
pub struct VirtualBackend {
    device: Arc<Mutex<VirtualDevice>>,
}

/// Inspection and fault-injection handle for a [`VirtualBackend`].
#[derive(Clone)]
pub struct VirtualDeviceProbe {
    device: Arc<Mutex<VirtualDevice>>,
}

impl VirtualBackend {
    pub fn new() -> (Self, VirtualDeviceProbe) {
        Self::with_stream_capacity(48000)
    }

    /// `stream_capacity` is the per-voice stream queue size in frames.
    pub fn with_stream_capacity(stream_capacity: usize) -> (Self, VirtualDeviceProbe) {
        let device = Arc::new(Mutex::new(VirtualDevice {
            voices: Vec::new(),
            connected: true,
            paused: false,
            failing_resets: 0,
            reset_attempts: 0,
            reject_params: false,
            listener: Pose::default(),
            stream_capacity,
        }));
        (
            Self {
                device: device.clone(),
            },
            VirtualDeviceProbe { device },
        )
    }
}

impl MixingBackend for VirtualBackend {
    fn create_voice(&mut self) -> Result<VoiceId> {
        let mut device = self.device.lock();
        device.voices.push(Some(VirtualVoice::default()));
        Ok(VoiceId(device.voices.len() as u32 - 1))
    }

    fn bind_buffer(&mut self, voice: VoiceId, clip: &PcmClip) -> Result<()> {
        let mut device = self.device.lock();
        let v = device.voice_mut(voice)?;
        v.streaming = false;
        v.queued_frames = 0;
        v.clip_duration = Some(clip.duration());
        v.clip_elapsed = Duration::ZERO;
        Ok(())
    }

    fn clear_stream(&mut self, voice: VoiceId, channels: u16, sample_rate: u32) -> Result<()> {
        let mut device = self.device.lock();
        let v = device.voice_mut(voice)?;
        v.streaming = true;
        v.stream_channels = channels.max(1);
        v.stream_sample_rate = sample_rate;
        v.queued_frames = 0;
        v.clip_duration = None;
        Ok(())
    }

    fn stream_vacancy(&self, voice: VoiceId) -> usize {
        let device = self.device.lock();
        device
            .voice(voice)
            .map(|v| device.stream_capacity.saturating_sub(v.queued_frames))
            .unwrap_or(0)
    }

    fn queue_stream(&mut self, voice: VoiceId, interleaved: &[f32]) -> Result<usize> {
        let mut device = self.device.lock();
        let capacity = device.stream_capacity;
        let v = device.voice_mut(voice)?;
        let frames = interleaved.len() / v.stream_channels as usize;
        let accepted = frames.min(capacity.saturating_sub(v.queued_frames));
        v.queued_frames += accepted;
        Ok(accepted)
    }

    fn play(&mut self, voice: VoiceId) -> Result<()> {
        let mut device = self.device.lock();
        let v = device.voice_mut(voice)?;
        v.play_calls += 1;
        v.playing = true;
        if !v.streaming {
            v.clip_elapsed = Duration::ZERO;
        }
        Ok(())
    }

    fn stop(&mut self, voice: VoiceId) -> Result<()> {
        let mut device = self.device.lock();
        let v = device.voice_mut(voice)?;
        v.stop_calls += 1;
        v.playing = false;
        Ok(())
    }

    fn set(&mut self, voice: VoiceId, param: VoiceParam) -> Result<()> {
        let mut device = self.device.lock();
        if device.reject_params {
            return Err(PetalSonicError::Backend(format!(
                "{} rejected by virtual device",
                param.name()
            )));
        }
        let v = device.voice_mut(voice)?;
        match param {
            VoiceParam::Gain(gain) => {
                v.gain = gain;
                v.gain_history.push(gain);
            }
            VoiceParam::Pitch(pitch) => v.pitch = pitch,
            VoiceParam::Position(position) => v.position = position,
            VoiceParam::Looping(looping) => v.looping = looping,
            VoiceParam::ListenerRelative(relative) => v.listener_relative = relative,
        }
        Ok(())
    }

    fn is_playing(&self, voice: VoiceId) -> bool {
        let device = self.device.lock();
        device.connected && device.voice(voice).is_some_and(|v| v.playing)
    }

    fn destroy(&mut self, voice: VoiceId) {
        let mut device = self.device.lock();
        if let Some(slot) = device.voices.get_mut(voice.0 as usize) {
            *slot = None;
        }
    }

    fn set_listener(&mut self, pose: Pose) -> Result<()> {
        self.device.lock().listener = pose;
        Ok(())
    }

    fn is_device_connected(&self) -> bool {
        self.device.lock().connected
    }

    fn reset_device(&mut self) -> Result<()> {
        let mut device = self.device.lock();
        device.reset_attempts += 1;
        if device.failing_resets > 0 {
            device.failing_resets -= 1;
            return Err(PetalSonicError::AudioDevice(
                "Virtual device still unplugged".to_string(),
            ));
        }
        device.connected = true;
        Ok(())
    }

    fn pause_device(&mut self) -> Result<()> {
        self.device.lock().paused = true;
        Ok(())
    }

    fn resume_device(&mut self) -> Result<()> {
        self.device.lock().paused = false;
        Ok(())
    }
}

impl VirtualDeviceProbe {
    pub fn voice(&self, voice: VoiceId) -> Option<VirtualVoice> {
        self.device.lock().voice(voice).cloned()
    }

    pub fn playing_voices(&self) -> usize {
        self.device
            .lock()
            .voices
            .iter()
            .flatten()
            .filter(|v| v.playing)
            .count()
    }

    pub fn live_voices(&self) -> usize {
        self.device.lock().voices.iter().flatten().count()
    }

    /// Simulates unplugging the device. Resets fail `failing_resets` times before succeeding.
    pub fn disconnect(&self, failing_resets: u32) {
        let mut device = self.device.lock();
        device.connected = false;
        device.failing_resets = failing_resets;
    }

    pub fn reset_attempts(&self) -> u32 {
        self.device.lock().reset_attempts
    }

    pub fn is_paused(&self) -> bool {
        self.device.lock().paused
    }

    pub fn listener(&self) -> Pose {
        self.device.lock().listener
    }

    /// Makes every subsequent `set` call fail.
    pub fn reject_params(&self, reject: bool) {
        self.device.lock().reject_params = reject;
    }

    /// Forces the physical play state of a voice, e.g. to simulate an underrun.
    pub fn set_physically_playing(&self, voice: VoiceId, playing: bool) {
        if let Ok(v) = self.device.lock().voice_mut(voice) {
            v.playing = playing;
        }
    }

    /// Moves simulated time forward for every playing voice.
    ///
    /// One-shot clips stop at their end, looping clips wrap, and streams drain
    /// their queue and stop when it runs dry.
    pub fn advance(&self, elapsed: Duration) {
        let mut device = self.device.lock();
        if !device.connected || device.paused {
            return;
        }
        for v in device.voices.iter_mut().flatten() {
            if !v.playing {
                continue;
            }
            let seconds = elapsed.as_secs_f64() * v.pitch.max(0.0) as f64;
            if v.streaming {
                let frames = (seconds * v.stream_sample_rate as f64).round() as usize;
                v.queued_frames = v.queued_frames.saturating_sub(frames);
                if v.queued_frames == 0 {
                    v.playing = false;
                }
            } else if let Some(length) = v.clip_duration {
                v.clip_elapsed += Duration::from_secs_f64(seconds);
                if v.clip_elapsed >= length {
                    if v.looping && !length.is_zero() {
                        let wraps = v.clip_elapsed.as_nanos() % length.as_nanos();
                        v.clip_elapsed = Duration::from_nanos(wraps as u64);
                    } else {
                        v.playing = false;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot_clip_ends_and_loop_wraps() {
        let (mut backend, probe) = VirtualBackend::new();
        let one_shot = backend.create_voice().unwrap();
        let looped = backend.create_voice().unwrap();
        let clip = PcmClip::silence(Duration::from_secs(2), 1000, 1);

        for voice in [one_shot, looped] {
            backend.bind_buffer(voice, &clip).unwrap();
            backend.play(voice).unwrap();
        }
        backend.set(looped, VoiceParam::Looping(true)).unwrap();

        probe.advance(Duration::from_millis(2500));
        assert!(!backend.is_playing(one_shot));
        assert!(backend.is_playing(looped));
        assert_eq!(
            probe.voice(looped).unwrap().clip_elapsed,
            Duration::from_millis(500)
        );
    }

    #[test]
    fn disconnected_device_reports_silence_until_reset() {
        let (mut backend, probe) = VirtualBackend::new();
        let voice = backend.create_voice().unwrap();
        backend
            .bind_buffer(voice, &PcmClip::silence(Duration::from_secs(1), 1000, 1))
            .unwrap();
        backend.play(voice).unwrap();

        probe.disconnect(1);
        assert!(!backend.is_device_connected());
        assert!(!backend.is_playing(voice));
        assert!(backend.reset_device().is_err());
        assert!(backend.reset_device().is_ok());
        assert!(backend.is_playing(voice));
        assert_eq!(probe.reset_attempts(), 2);
    }

    #[test]
    fn stream_queue_drains() {
        let (mut backend, probe) = VirtualBackend::with_stream_capacity(100);
        let voice = backend.create_voice().unwrap();
        backend.clear_stream(voice, 1, 1000).unwrap();
        assert_eq!(backend.queue_stream(voice, &[0.0; 150]).unwrap(), 100);
        assert_eq!(backend.stream_vacancy(voice), 0);
        backend.play(voice).unwrap();
        probe.advance(Duration::from_millis(60));
        assert_eq!(backend.stream_vacancy(voice), 60);
        probe.advance(Duration::from_millis(60));
        assert!(!backend.is_playing(voice));
    }

    #[test]
    fn pitched_stream_drains_whole_frames() {
        let (mut backend, probe) = VirtualBackend::with_stream_capacity(1000);
        let voice = backend.create_voice().unwrap();
        backend.clear_stream(voice, 2, 1000).unwrap();
        assert_eq!(backend.queue_stream(voice, &[0.0; 2000]).unwrap(), 1000);
        backend.set(voice, VoiceParam::Pitch(1.1)).unwrap();
        backend.play(voice).unwrap();
        for _ in 0..3 {
            probe.advance(Duration::from_millis(70));
        }
        // 3 x 77 frames at 1.1x
        assert_eq!(backend.stream_vacancy(voice), 231);
    }
}
