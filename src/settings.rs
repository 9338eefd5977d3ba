//! Engine-wide playback inputs owned by the audio thread.

use crate::config::AudioEngineDesc;

/// Music volume is expressed in percent.
pub const MUSIC_VOLUME_SCALE: f32 = 100.0;

pub const MIN_SOUND_PITCH: f32 = 0.1;
pub const MAX_SOUND_PITCH: f32 = 10.0;

/// Global volume, pitch and lifecycle state.
///
/// Only the audio thread holds this. Clients change it by posting commands.
#[derive(Debug, Clone)]
pub struct GlobalAudioSettings {
    pub music_volume: f32,
    pub sound_volume: f32,
    pub sound_pitch: f32,
    pub app_active: bool,
    pub background_gain: f32,
    pub suspended: bool,
    pub shutting_down: bool,
}

impl GlobalAudioSettings {
    pub fn from_desc(desc: &AudioEngineDesc) -> Self {
        Self {
            music_volume: desc.music_volume,
            sound_volume: desc.sound_volume,
            sound_pitch: desc.sound_pitch,
            app_active: true,
            background_gain: desc.background_gain,
            suspended: false,
            shutting_down: false,
        }
    }

    pub fn app_multiplier(&self) -> f32 {
        if self.app_active {
            1.0
        } else {
            self.background_gain
        }
    }

    pub fn effective_gain(&self, gain: f32, fade: f32, is_music: bool) -> f32 {
        let category = if is_music {
            self.music_volume / MUSIC_VOLUME_SCALE
        } else {
            self.sound_volume
        };
        (gain * fade * self.app_multiplier() * category).max(0.0)
    }

    pub fn effective_pitch(&self, is_music: bool) -> f32 {
        if is_music {
            1.0
        } else {
            self.sound_pitch.clamp(MIN_SOUND_PITCH, MAX_SOUND_PITCH)
        }
    }

    /// Whether a music source may start right now.
    pub fn music_audible(&self) -> bool {
        self.music_volume > 0.0 && self.app_active && !self.suspended
    }

    /// Whether the backend may be driven at all.
    pub fn can_start(&self) -> bool {
        !self.suspended && !self.shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> GlobalAudioSettings {
        GlobalAudioSettings::from_desc(&AudioEngineDesc::default())
    }

    #[test]
    fn gain_combines_all_factors() {
        let mut s = settings();
        s.sound_volume = 0.5;
        s.music_volume = 40.0;
        assert!((s.effective_gain(0.5, 0.5, false) - 0.125).abs() < 1e-6);
        assert!((s.effective_gain(1.0, 1.0, true) - 0.4).abs() < 1e-6);
        assert_eq!(s.effective_gain(-2.0, 1.0, false), 0.0);

        s.app_active = false;
        s.background_gain = 0.5;
        assert!((s.effective_gain(1.0, 1.0, false) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn pitch_is_clamped_and_music_is_unaffected() {
        let mut s = settings();
        s.sound_pitch = 42.0;
        assert_eq!(s.effective_pitch(false), MAX_SOUND_PITCH);
        assert_eq!(s.effective_pitch(true), 1.0);
        s.sound_pitch = 0.0;
        assert_eq!(s.effective_pitch(false), MIN_SOUND_PITCH);
    }

    #[test]
    fn muted_or_background_music_is_inaudible() {
        let mut s = settings();
        assert!(s.music_audible());
        s.music_volume = 0.0;
        assert!(!s.music_audible());
        s.music_volume = 80.0;
        s.app_active = false;
        assert!(!s.music_audible());
    }
}
