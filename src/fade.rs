//! Time-based gain ramps keyed by play id.

use crate::play_id::PlayId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeDirection {
    /// Ramp down to 0, then stop the source.
    Out,
    /// Ramp up to 1.
    In,
}

#[derive(Debug, Clone, Copy)]
pub struct FadeEntry {
    pub play_id: PlayId,
    pub start: Instant,
    pub end: Instant,
    pub direction: FadeDirection,
    /// Level at `start`: 1 for a fresh fade-out, 0 for a fade-in, or wherever
    /// the fade it replaced had got to.
    pub from: f32,
}

impl FadeEntry {
    /// Fade level at `now`, in `[0, 1]`.
    pub fn level(&self, now: Instant) -> f32 {
        let span = self.end.saturating_duration_since(self.start);
        let progress = if span.is_zero() {
            1.0
        } else {
            (now.saturating_duration_since(self.start).as_secs_f64() / span.as_secs_f64())
                .clamp(0.0, 1.0) as f32
        };
        match self.direction {
            FadeDirection::Out => self.from * (1.0 - progress),
            FadeDirection::In => self.from + (1.0 - self.from) * progress,
        }
    }

    pub fn is_complete(&self, now: Instant) -> bool {
        now > self.end
    }
}

/// What the scheduler should do with an entry after it has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeStep {
    Continue,
    /// The target is gone; forget the entry.
    Drop,
}

pub struct FadeScheduler {
    entries: HashMap<PlayId, FadeEntry>,
    min_interval: Duration,
    last_update: Option<Instant>,
}

impl FadeScheduler {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            min_interval,
            last_update: None,
        }
    }

    /// Registers a fade.
    ///
    /// A running fade in the same direction is left untouched, and a fade-in
    /// never interrupts a fade-out. A fade-out replaces a running fade-in and
    /// ramps down from the level the fade-in had reached.
    pub fn start(
        &mut self,
        play_id: PlayId,
        now: Instant,
        duration: Duration,
        direction: FadeDirection,
    ) -> Option<FadeEntry> {
        let from = match (self.entries.get(&play_id), direction) {
            (Some(existing), FadeDirection::Out) if existing.direction == FadeDirection::In => {
                log::debug!("Fade-out replaces fade-in for {}", play_id);
                existing.level(now)
            }
            (Some(_), _) => return None,
            (None, FadeDirection::Out) => 1.0,
            (None, FadeDirection::In) => 0.0,
        };
        let entry = FadeEntry {
            play_id,
            start: now,
            end: now + duration,
            direction,
            from,
        };
        self.entries.insert(play_id, entry);
        Some(entry)
    }

    pub fn cancel(&mut self, play_id: PlayId) -> bool {
        self.entries.remove(&play_id).is_some()
    }

    pub fn is_active(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, play_id: PlayId) -> Option<&FadeEntry> {
        self.entries.get(&play_id)
    }

    /// Applies every entry at `now`, at most once per `min_interval`.
    ///
    /// `apply` receives the entry, its level and whether its window has elapsed.
    /// Completed entries are removed after `apply` runs, so the final call for
    /// an entry happens exactly once.
    pub fn advance<F>(&mut self, now: Instant, mut apply: F) -> bool
    where
        F: FnMut(&FadeEntry, f32, bool) -> FadeStep,
    {
        if let Some(last) = self.last_update {
            if now.saturating_duration_since(last) < self.min_interval {
                return false;
            }
        }
        self.last_update = Some(now);

        self.entries.retain(|_, entry| {
            let complete = entry.is_complete(now);
            let level = if complete {
                match entry.direction {
                    FadeDirection::Out => 0.0,
                    FadeDirection::In => 1.0,
                }
            } else {
                entry.level(now)
            };
            match apply(entry, level, complete) {
                FadeStep::Drop => {
                    log::debug!("Dropping fade for {}: source moved on", entry.play_id);
                    false
                }
                FadeStep::Continue => !complete,
            }
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fade_out_is_monotonic_and_completes_once() {
        let base = Instant::now();
        let id = PlayId::new(0, 1);
        let mut fades = FadeScheduler::new(Duration::from_millis(50));
        fades.start(id, base, Duration::from_millis(1000), FadeDirection::Out);

        let mut levels = Vec::new();
        let mut completions = 0;
        for ms in (0..=1200).step_by(50) {
            fades.advance(base + Duration::from_millis(ms), |_, level, done| {
                levels.push(level);
                if done {
                    completions += 1;
                }
                FadeStep::Continue
            });
        }

        assert!(levels.windows(2).all(|w| w[1] <= w[0]));
        assert_eq!(*levels.last().unwrap(), 0.0);
        assert_eq!(completions, 1);
        assert!(!fades.is_active());
    }

    #[test]
    fn updates_are_throttled() {
        let base = Instant::now();
        let mut fades = FadeScheduler::new(Duration::from_millis(50));
        fades.start(PlayId::new(1, 1), base, Duration::from_secs(1), FadeDirection::Out);

        assert!(fades.advance(base, |_, _, _| FadeStep::Continue));
        assert!(!fades.advance(base + Duration::from_millis(20), |_, _, _| FadeStep::Continue));
        assert!(fades.advance(base + Duration::from_millis(50), |_, _, _| FadeStep::Continue));
    }

    #[test]
    fn second_start_keeps_original_window() {
        let base = Instant::now();
        let id = PlayId::new(2, 9);
        let mut fades = FadeScheduler::new(Duration::ZERO);
        assert!(fades.start(id, base, Duration::from_secs(1), FadeDirection::Out).is_some());
        assert!(fades
            .start(id, base + Duration::from_millis(500), Duration::from_secs(5), FadeDirection::Out)
            .is_none());
        assert_eq!(fades.get(id).unwrap().end, base + Duration::from_secs(1));
    }

    #[test]
    fn stale_targets_are_dropped() {
        let base = Instant::now();
        let mut fades = FadeScheduler::new(Duration::ZERO);
        fades.start(PlayId::new(3, 1), base, Duration::from_secs(1), FadeDirection::Out);
        fades.advance(base, |_, _, _| FadeStep::Drop);
        assert!(fades.is_empty());
    }

    #[test]
    fn fade_in_rises() {
        let base = Instant::now();
        let entry = FadeEntry {
            play_id: PlayId::new(0, 0),
            start: base,
            end: base + Duration::from_millis(200),
            direction: FadeDirection::In,
            from: 0.0,
        };
        assert_eq!(entry.level(base), 0.0);
        assert!((entry.level(base + Duration::from_millis(100)) - 0.5).abs() < 1e-6);
        assert_eq!(entry.level(base + Duration::from_millis(300)), 1.0);
    }

    #[test]
    fn fade_out_takes_over_a_fade_in() {
        let base = Instant::now();
        let id = PlayId::new(4, 2);
        let mut fades = FadeScheduler::new(Duration::ZERO);
        fades.start(id, base, Duration::from_secs(2), FadeDirection::In);
        let half = base + Duration::from_secs(1);

        assert!(fades.start(id, half, Duration::from_secs(1), FadeDirection::In).is_none());
        let out = fades
            .start(id, half, Duration::from_millis(500), FadeDirection::Out)
            .unwrap();
        assert_eq!(out.direction, FadeDirection::Out);
        assert!((out.level(half) - 0.5).abs() < 1e-6);
        assert!((out.level(half + Duration::from_millis(250)) - 0.25).abs() < 1e-6);
        assert!(fades.start(id, half, Duration::from_secs(1), FadeDirection::In).is_none());

        let mut completed = Vec::new();
        fades.advance(half + Duration::from_secs(1), |entry, level, done| {
            completed.push((entry.direction, level, done));
            FadeStep::Continue
        });
        assert_eq!(completed, vec![(FadeDirection::Out, 0.0, true)]);
        assert!(fades.is_empty());
    }
}
