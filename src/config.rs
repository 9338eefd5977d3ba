//! Configuration for the PetalSonic voice pool

use crate::error::{PetalSonicError, Result};
use std::time::Duration;

/// Highest slot count a [`PlayId`](crate::PlayId) can address (16 bits of slot index).
pub const MAX_SLOTS: usize = 0xFFFF;

/// Configuration descriptor for an [`AudioEngineContext`](crate::AudioEngineContext).
///
/// Everything here is read once at startup. Runtime inputs (volumes, pitch,
/// foreground state) go through the dispatcher instead.
#[derive(Debug, Clone)]
pub struct AudioEngineDesc {
    /// Number of pool slots (voices) created at startup.
    pub slot_count: usize,
    /// Output sample rate requested from the device.
    pub sample_rate: u32,
    /// Number of output channels (typically 2 for stereo).
    pub channels: u16,
    /// Frames per device callback.
    pub block_size: usize,

    /// Tick cadence while a load is pending or shutdown is in progress.
    pub pending_load_interval: Duration,
    /// Tick cadence while at least one fade is active.
    pub fade_interval: Duration,
    /// Tick cadence while a streamed source is registered.
    pub stream_interval: Duration,
    /// Tick cadence otherwise.
    pub idle_interval: Duration,
    /// Minimum spacing between two fade updates.
    pub fade_update_min: Duration,
    /// Minimum spacing between two streaming refills.
    pub stream_refill_min: Duration,
    /// Capacity of each streamed voice's ring buffer, in frames.
    pub stream_buffer_frames: usize,

    /// A client lock held longer than this is reported as a suspected leak.
    pub leak_threshold: Duration,
    /// Minimum spacing between two leak scans.
    pub leak_scan_interval: Duration,

    /// Delay between device reset attempts right after a disconnect.
    pub reconnect_interval: Duration,
    /// Delay between reset attempts once the device has been gone for `reconnect_slow_after`.
    pub reconnect_slow_interval: Duration,
    pub reconnect_slow_after: Duration,

    /// How many times to try opening the backend at startup before giving up.
    pub startup_attempts: u32,
    pub startup_retry_delay: Duration,

    /// After this many consecutive ticks where the free-list was contended,
    /// the reclaim scan blocks on the free-list lock instead of skipping.
    pub max_contended_reclaim_ticks: u32,

    /// Initial music volume, in percent (0..=100).
    pub music_volume: f32,
    /// Initial sound effect volume (0.0..=1.0).
    pub sound_volume: f32,
    /// Initial pitch applied to non-music sources.
    pub sound_pitch: f32,
    /// Gain multiplier applied to everything while the app is in the background.
    pub background_gain: f32,
}

impl Default for AudioEngineDesc {
    fn default() -> Self {
        Self {
            slot_count: 30,
            sample_rate: 48000,
            channels: 2,
            block_size: 1024,
            pending_load_interval: Duration::from_millis(1),
            fade_interval: Duration::from_millis(50),
            stream_interval: Duration::from_millis(100),
            idle_interval: Duration::from_millis(500),
            fade_update_min: Duration::from_millis(50),
            stream_refill_min: Duration::from_millis(100),
            stream_buffer_frames: 48000,
            leak_threshold: Duration::from_secs(10),
            leak_scan_interval: Duration::from_secs(1),
            reconnect_interval: Duration::from_secs(3),
            reconnect_slow_interval: Duration::from_secs(10),
            reconnect_slow_after: Duration::from_secs(20),
            startup_attempts: 3,
            startup_retry_delay: Duration::from_millis(500),
            max_contended_reclaim_ticks: 8,
            music_volume: 100.0,
            sound_volume: 1.0,
            sound_pitch: 1.0,
            background_gain: 0.0,
        }
    }
}

impl AudioEngineDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot_count(mut self, count: usize) -> Self {
        self.slot_count = count;
        self
    }

    pub fn sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = rate;
        self
    }

    pub fn channels(mut self, channels: u16) -> Self {
        self.channels = channels;
        self
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    pub fn leak_threshold(mut self, threshold: Duration) -> Self {
        self.leak_threshold = threshold;
        self
    }

    pub fn startup_attempts(mut self, attempts: u32, delay: Duration) -> Self {
        self.startup_attempts = attempts;
        self.startup_retry_delay = delay;
        self
    }

    pub fn music_volume(mut self, percent: f32) -> Self {
        self.music_volume = percent;
        self
    }

    pub fn sound_volume(mut self, volume: f32) -> Self {
        self.sound_volume = volume;
        self
    }

    pub fn background_gain(mut self, gain: f32) -> Self {
        self.background_gain = gain;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.slot_count == 0 || self.slot_count > MAX_SLOTS {
            return Err(PetalSonicError::Configuration(format!(
                "slot_count must be in 1..={}, got {}",
                MAX_SLOTS, self.slot_count
            )));
        }
        if self.sample_rate == 0 || self.channels == 0 {
            return Err(PetalSonicError::Configuration(
                "Sample rate and channel count must be greater than 0".to_string(),
            ));
        }
        if self.startup_attempts == 0 {
            return Err(PetalSonicError::Configuration(
                "startup_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
