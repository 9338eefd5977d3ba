//! Rate-limited warnings and the slot-lock leak watchdog.

use crate::pool::SourcePool;
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Logs each distinct warning once.
///
/// Used for faults that would otherwise repeat every tick, such as a backend
/// rejecting a parameter or a file that fails to decode.
#[derive(Default)]
pub struct LogOnce {
    seen: HashSet<String>,
    suppressed: u64,
}

impl LogOnce {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emits `message` at warn level unless `key` was already reported.
    pub fn warn(&mut self, key: impl Into<String>, message: impl FnOnce() -> String) -> bool {
        if self.seen.insert(key.into()) {
            log::warn!("{}", message());
            true
        } else {
            self.suppressed += 1;
            false
        }
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }
}

/// Reports slot locks held for too long.
///
/// Never recovers anything: a leaked guard is a client bug and the slot stays
/// locked. Each acquisition is reported at most once.
pub struct LeakWatchdog {
    threshold: Duration,
    interval: Duration,
    last_scan: Option<Instant>,
    reported: Vec<Option<u64>>,
}

impl LeakWatchdog {
    pub fn new(slot_count: usize, threshold: Duration, interval: Duration) -> Self {
        Self {
            threshold,
            interval,
            last_scan: None,
            reported: vec![None; slot_count],
        }
    }

    /// Scans the pool if a scan is due. Returns the slots newly reported.
    pub fn scan(&mut self, pool: &SourcePool, now: Instant) -> Vec<usize> {
        if let Some(last) = self.last_scan {
            if now.saturating_duration_since(last) < self.interval {
                return Vec::new();
            }
        }
        self.last_scan = Some(now);

        let mut flagged = Vec::new();
        for (slot, source) in pool.sources().iter().enumerate() {
            let Some(holder) = source.holder() else {
                continue;
            };
            let held = now.saturating_duration_since(holder.since);
            if held <= self.threshold || self.reported[slot] == Some(holder.acquisition) {
                continue;
            }
            log::warn!(
                "Slot {} locked by {} for {:?}; guard probably leaked",
                slot,
                holder.tag,
                held
            );
            self.reported[slot] = Some(holder.acquisition);
            flagged.push(slot);
        }
        flagged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::LockTag;

    #[test]
    fn log_once_suppresses_repeats() {
        let mut once = LogOnce::new();
        assert!(once.warn("decode:a.ogg", || "bad file".to_string()));
        assert!(!once.warn("decode:a.ogg", || unreachable!()));
        assert!(once.warn("decode:b.ogg", || "bad file".to_string()));
        assert_eq!(once.suppressed(), 1);
    }

    #[test]
    fn long_held_lock_is_reported_once() {
        let pool = SourcePool::new(2);
        let mut watchdog = LeakWatchdog::new(2, Duration::from_secs(10), Duration::from_secs(1));
        let _lock = pool.source(1).unwrap().lock(LockTag::Named("cutscene"));
        let base = Instant::now();

        assert!(watchdog.scan(&pool, base + Duration::from_secs(5)).is_empty());
        assert_eq!(watchdog.scan(&pool, base + Duration::from_secs(11)), vec![1]);
        assert!(watchdog.scan(&pool, base + Duration::from_secs(13)).is_empty());
    }

    #[test]
    fn scans_are_rate_limited() {
        let pool = SourcePool::new(1);
        let mut watchdog = LeakWatchdog::new(1, Duration::ZERO, Duration::from_secs(1));
        let base = Instant::now();
        let lock = pool.source(0).unwrap().lock(LockTag::Named("held"));

        // The first scan is due; a second one inside the interval is skipped even after re-locking.
        assert_eq!(watchdog.scan(&pool, base + Duration::from_millis(500)).len(), 1);
        drop(lock);
        let _again = pool.source(0).unwrap().lock(LockTag::Named("held"));
        assert!(watchdog.scan(&pool, base + Duration::from_millis(900)).is_empty());
    }
}
