use crate::audio_data::PcmClip;
use crate::backend::{MixingBackend, VoiceId, VoiceParam};
use crate::config::AudioEngineDesc;
use crate::error::{PetalSonicError, Result};
use crate::math::{Pose, Vec3};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SizedSample};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

enum VoiceInput {
    Empty,
    /// Resampled to the output rate when bound.
    Buffer(PcmClip),
    Stream {
        consumer: HeapCons<f32>,
        channels: u16,
        /// Input frames consumed per output frame at pitch 1.
        step: f64,
        frame: Vec<f32>,
    },
}

struct MixVoice {
    input: VoiceInput,
    playing: bool,
    looping: bool,
    gain: f32,
    pitch: f32,
    position: Vec3,
    listener_relative: bool,
    cursor: f64,
}

impl MixVoice {
    fn new() -> Self {
        Self {
            input: VoiceInput::Empty,
            playing: false,
            looping: false,
            gain: 1.0,
            pitch: 1.0,
            position: Vec3::ZERO,
            listener_relative: false,
            cursor: 0.0,
        }
    }

    /// Adds this voice into `out` (interleaved, `out_channels` wide).
    fn mix_into(&mut self, out: &mut [f32], out_channels: usize, listener: &Pose) {
        let pan = if self.listener_relative {
            Pose::identity().pan_towards(self.position)
        } else {
            listener.pan_towards(self.position)
        };
        // Equal-power pan for mono input on stereo output.
        let angle = (pan + 1.0) * std::f32::consts::FRAC_PI_4;
        let (left, right) = (angle.cos(), angle.sin());
        let pitch = self.pitch.max(0.0) as f64;
        let gain = self.gain;

        for out_frame in out.chunks_mut(out_channels) {
            let Some(frame) = next_frame(&mut self.input, &mut self.cursor, self.looping, pitch)
            else {
                self.playing = false;
                return;
            };
            if frame.len() == 1 && out_channels >= 2 {
                out_frame[0] += frame[0] * gain * left;
                out_frame[1] += frame[0] * gain * right;
            } else {
                for (ch, sample) in out_frame.iter_mut().enumerate() {
                    *sample += frame[ch % frame.len()] * gain;
                }
            }
        }
    }
}

/// Advances `cursor` by one output frame and returns the input frame under it.
///
/// Runs inside the device callback: the returned slice borrows the clip or the
/// stream's frame buffer, nothing is allocated.
fn next_frame<'a>(
    input: &'a mut VoiceInput,
    cursor: &mut f64,
    looping: bool,
    pitch: f64,
) -> Option<&'a [f32]> {
    match input {
        VoiceInput::Empty => None,
        VoiceInput::Buffer(clip) => {
            let total = clip.total_frames();
            if total == 0 {
                return None;
            }
            let mut index = *cursor as usize;
            if index >= total {
                if !looping {
                    return None;
                }
                *cursor %= total as f64;
                index = *cursor as usize;
            }
            *cursor += pitch;
            Some(clip.frames(index, 1))
        }
        VoiceInput::Stream {
            consumer,
            channels,
            step,
            frame,
        } => {
            let channels = *channels as usize;
            *cursor += *step * pitch;
            while *cursor >= 1.0 {
                if consumer.occupied_len() < channels {
                    return None;
                }
                frame.clear();
                for _ in 0..channels {
                    frame.push(consumer.try_pop().unwrap_or(0.0));
                }
                *cursor -= 1.0;
            }
            (frame.len() == channels).then_some(frame.as_slice())
        }
    }
}

struct MixerState {
    voices: HashMap<u32, MixVoice>,
    listener: Pose,
}

/// Software mixer rendering every voice inside one cpal output stream.
///
/// Voice state lives behind a mutex shared with the device callback. The
/// callback only ever `try_lock`s it and outputs silence for the block when the
/// audio thread holds it.
pub struct CpalBackend {
    sample_rate: u32,
    channels: u16,
    block_size: usize,
    stream_buffer_frames: usize,
    mixer: Arc<Mutex<MixerState>>,
    producers: HashMap<u32, HeapProd<f32>>,
    stream: Option<cpal::Stream>,
    disconnected: Arc<AtomicBool>,
    next_voice: u32,
}

impl CpalBackend {
    /// Opens the default output device.
    pub fn open(desc: &AudioEngineDesc) -> Result<Self> {
        let mut backend = Self {
            sample_rate: desc.sample_rate,
            channels: desc.channels,
            block_size: desc.block_size,
            stream_buffer_frames: desc.stream_buffer_frames,
            mixer: Arc::new(Mutex::new(MixerState {
                voices: HashMap::new(),
                listener: Pose::default(),
            })),
            producers: HashMap::new(),
            stream: None,
            disconnected: Arc::new(AtomicBool::new(false)),
            next_voice: 0,
        };
        backend.open_stream()?;
        Ok(backend)
    }

    fn open_stream(&mut self) -> Result<()> {
        self.stream = None;

        let host = cpal::default_host();
        let device = host.default_output_device().ok_or_else(|| {
            PetalSonicError::AudioDevice("No default output device available".into())
        })?;

        let config = cpal::StreamConfig {
            channels: self.channels,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(self.block_size as u32),
        };

        let default_config = device.default_output_config().map_err(|e| {
            PetalSonicError::AudioDevice(format!("Failed to get default config: {}", e))
        })?;

        let stream = match default_config.sample_format() {
            cpal::SampleFormat::F32 => self.create_stream::<f32>(&device, &config)?,
            cpal::SampleFormat::I16 => self.create_stream::<i16>(&device, &config)?,
            cpal::SampleFormat::U16 => self.create_stream::<u16>(&device, &config)?,
            _ => {
                return Err(PetalSonicError::AudioFormat(
                    "Unsupported sample format".into(),
                ));
            }
        };

        stream
            .play()
            .map_err(|e| PetalSonicError::AudioDevice(format!("Failed to start stream: {}", e)))?;

        self.disconnected.store(false, Ordering::Relaxed);
        self.stream = Some(stream);
        log::info!(
            "Opened output device at {} Hz, {} channels",
            self.sample_rate,
            self.channels
        );
        Ok(())
    }

    fn create_stream<T>(
        &self,
        device: &cpal::Device,
        config: &cpal::StreamConfig,
    ) -> Result<cpal::Stream>
    where
        T: SizedSample + FromSample<f32>,
    {
        let channels = self.channels as usize;
        let mixer = self.mixer.clone();
        let disconnected = self.disconnected.clone();
        let mut scratch: Vec<f32> = Vec::new();

        device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    scratch.clear();
                    scratch.resize(data.len(), 0.0);

                    if let Some(mut state) = mixer.try_lock() {
                        let state = &mut *state;
                        for voice in state.voices.values_mut().filter(|v| v.playing) {
                            voice.mix_into(&mut scratch, channels, &state.listener);
                        }
                    }

                    for (out, sample) in data.iter_mut().zip(scratch.iter()) {
                        *out = T::from_sample(sample.clamp(-1.0, 1.0));
                    }
                },
                move |err| match err {
                    cpal::StreamError::DeviceNotAvailable => {
                        log::warn!("Output device lost");
                        disconnected.store(true, Ordering::Relaxed);
                    }
                    other => log::error!("Audio stream error: {}", other),
                },
                None,
            )
            .map_err(|e| PetalSonicError::AudioDevice(format!("Failed to build stream: {}", e)))
    }

    fn with_voice<R>(&self, voice: VoiceId, f: impl FnOnce(&mut MixVoice) -> R) -> Result<R> {
        let mut state = self.mixer.lock();
        state
            .voices
            .get_mut(&voice.0)
            .map(f)
            .ok_or_else(|| PetalSonicError::Backend(format!("Unknown voice {}", voice)))
    }
}

impl MixingBackend for CpalBackend {
    fn create_voice(&mut self) -> Result<VoiceId> {
        let id = self.next_voice;
        self.next_voice += 1;
        self.mixer.lock().voices.insert(id, MixVoice::new());
        Ok(VoiceId(id))
    }

    fn bind_buffer(&mut self, voice: VoiceId, clip: &PcmClip) -> Result<()> {
        // Resample outside the lock the callback contends on.
        let clip = clip.resample(self.sample_rate)?;
        self.producers.remove(&voice.0);
        self.with_voice(voice, |v| {
            v.input = VoiceInput::Buffer(clip);
            v.cursor = 0.0;
        })
    }

    fn clear_stream(&mut self, voice: VoiceId, channels: u16, sample_rate: u32) -> Result<()> {
        if channels == 0 || sample_rate == 0 {
            return Err(PetalSonicError::AudioFormat(
                "Stream format must have channels and a sample rate".into(),
            ));
        }
        let ring = HeapRb::<f32>::new(self.stream_buffer_frames * channels as usize);
        let (producer, consumer) = ring.split();
        let step = sample_rate as f64 / self.sample_rate as f64;
        self.with_voice(voice, |v| {
            v.input = VoiceInput::Stream {
                consumer,
                channels,
                step,
                frame: Vec::with_capacity(channels as usize),
            };
            v.cursor = 1.0;
        })?;
        self.producers.insert(voice.0, producer);
        Ok(())
    }

    fn stream_vacancy(&self, voice: VoiceId) -> usize {
        let Some(producer) = self.producers.get(&voice.0) else {
            return 0;
        };
        let channels = self
            .mixer
            .lock()
            .voices
            .get(&voice.0)
            .map(|v| match &v.input {
                VoiceInput::Stream { channels, .. } => *channels as usize,
                _ => 1,
            })
            .unwrap_or(1);
        producer.vacant_len() / channels
    }

    fn queue_stream(&mut self, voice: VoiceId, interleaved: &[f32]) -> Result<usize> {
        if !self.producers.contains_key(&voice.0) {
            return Err(PetalSonicError::Backend(format!(
                "{} is not a streaming voice",
                voice
            )));
        }
        let channels = self.with_voice(voice, |v| match &v.input {
            VoiceInput::Stream { channels, .. } => *channels as usize,
            _ => 1,
        })?;
        let producer = self.producers.get_mut(&voice.0).ok_or_else(|| {
            PetalSonicError::Backend(format!("{} is not a streaming voice", voice))
        })?;
        let whole = (producer.vacant_len() / channels).min(interleaved.len() / channels);
        let pushed = producer.push_slice(&interleaved[..whole * channels]);
        Ok(pushed / channels)
    }

    fn play(&mut self, voice: VoiceId) -> Result<()> {
        self.with_voice(voice, |v| {
            if matches!(v.input, VoiceInput::Buffer(_)) {
                v.cursor = 0.0;
            }
            v.playing = true;
        })
    }

    fn stop(&mut self, voice: VoiceId) -> Result<()> {
        self.with_voice(voice, |v| v.playing = false)
    }

    fn set(&mut self, voice: VoiceId, param: VoiceParam) -> Result<()> {
        self.with_voice(voice, |v| match param {
            VoiceParam::Gain(gain) => v.gain = gain.max(0.0),
            VoiceParam::Pitch(pitch) => v.pitch = pitch,
            VoiceParam::Position(position) => v.position = position,
            VoiceParam::Looping(looping) => v.looping = looping,
            VoiceParam::ListenerRelative(relative) => v.listener_relative = relative,
        })
    }

    fn is_playing(&self, voice: VoiceId) -> bool {
        !self.disconnected.load(Ordering::Relaxed)
            && self
                .mixer
                .lock()
                .voices
                .get(&voice.0)
                .is_some_and(|v| v.playing)
    }

    fn destroy(&mut self, voice: VoiceId) {
        self.producers.remove(&voice.0);
        self.mixer.lock().voices.remove(&voice.0);
    }

    fn set_listener(&mut self, pose: Pose) -> Result<()> {
        self.mixer.lock().listener = pose;
        Ok(())
    }

    fn is_device_connected(&self) -> bool {
        self.stream.is_some() && !self.disconnected.load(Ordering::Relaxed)
    }

    fn reset_device(&mut self) -> Result<()> {
        self.open_stream()
    }

    fn pause_device(&mut self) -> Result<()> {
        if let Some(stream) = &self.stream {
            stream
                .pause()
                .map_err(|e| PetalSonicError::AudioDevice(format!("Failed to pause stream: {}", e)))?;
        }
        Ok(())
    }

    fn resume_device(&mut self) -> Result<()> {
        if let Some(stream) = &self.stream {
            stream
                .play()
                .map_err(|e| PetalSonicError::AudioDevice(format!("Failed to resume stream: {}", e)))?;
        }
        Ok(())
    }
}

impl Drop for CpalBackend {
    fn drop(&mut self) {
        self.stream = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn looping_buffer_voice_wraps() {
        let clip = PcmClip::new(vec![0.5; 4], 48000, 1).unwrap();
        let mut voice = MixVoice::new();
        voice.input = VoiceInput::Buffer(clip);
        voice.playing = true;
        voice.looping = true;

        let mut out = vec![0.0; 20];
        voice.mix_into(&mut out, 2, &Pose::identity());
        assert!(voice.playing);
        assert!(out.iter().all(|s| *s > 0.0));
    }

    #[test]
    fn one_shot_buffer_voice_stops_at_end() {
        let clip = PcmClip::new(vec![0.5; 4], 48000, 1).unwrap();
        let mut voice = MixVoice::new();
        voice.input = VoiceInput::Buffer(clip);
        voice.playing = true;

        let mut out = vec![0.0; 20];
        voice.mix_into(&mut out, 2, &Pose::identity());
        assert!(!voice.playing);
        assert_eq!(out[8], 0.0);
    }

    #[test]
    fn stream_voice_underruns_when_ring_is_empty() {
        let (mut producer, consumer) = HeapRb::<f32>::new(8).split();
        assert_eq!(producer.push_slice(&[0.25, 0.25]), 2);
        let mut voice = MixVoice::new();
        voice.input = VoiceInput::Stream {
            consumer,
            channels: 1,
            step: 1.0,
            frame: Vec::new(),
        };
        voice.cursor = 1.0;
        voice.playing = true;

        let mut out = vec![0.0; 8];
        voice.mix_into(&mut out, 2, &Pose::identity());
        assert!(!voice.playing);
        assert!(out[0] > 0.0);
    }

    #[test]
    fn buffer_frames_are_borrowed_from_the_clip() {
        let mut input = VoiceInput::Buffer(PcmClip::new(vec![0.1, 0.2, 0.3, 0.4], 48000, 2).unwrap());
        let base = match &input {
            VoiceInput::Buffer(clip) => clip.samples().as_ptr(),
            _ => unreachable!(),
        };
        let mut cursor = 1.0;
        let frame = next_frame(&mut input, &mut cursor, false, 1.0).unwrap();
        assert_eq!(frame, &[0.3, 0.4]);
        assert_eq!(frame.as_ptr(), base.wrapping_add(2));
    }

    #[test]
    fn stream_frame_buffer_is_reused() {
        let (mut producer, consumer) = HeapRb::<f32>::new(16).split();
        assert_eq!(producer.push_slice(&[0.5; 8]), 8);
        let frame = Vec::with_capacity(2);
        let buffer = frame.as_ptr();
        let mut voice = MixVoice::new();
        voice.input = VoiceInput::Stream {
            consumer,
            channels: 2,
            step: 1.0,
            frame,
        };
        voice.playing = true;

        let mut out = vec![0.0; 6];
        voice.mix_into(&mut out, 2, &Pose::identity());
        assert!(voice.playing);
        match &voice.input {
            VoiceInput::Stream { frame, .. } => {
                assert_eq!(frame.capacity(), 2);
                assert_eq!(frame.as_ptr(), buffer);
            }
            _ => unreachable!(),
        }
    }
}
