//! The fixed-size source pool.
//!
//! Each slot pairs a [`ClientSource`] (shared, lock-protected, used from the
//! client thread) with a [`ServerSource`] (owned by the audio thread). The
//! pool itself only holds the client halves and the free-list; the audio
//! thread keeps the server halves alongside its backend.

mod client_source;
mod server_source;

pub use client_source::{ClientSource, LockHolder, LockTag, SlotLock, SourceGuard};
pub use server_source::{ServerSource, SourceEnv, SourceState};

use crate::play_id::PlayId;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOutcome {
    Reclaimed,
    /// A client currently holds the slot.
    SlotLocked,
    /// Commands for the slot are still queued.
    InFlight,
    /// The free-list was busy; try again next tick.
    FreeListContended,
}

pub struct SourcePool {
    sources: Vec<ClientSource>,
    free: Mutex<Vec<usize>>,
}

impl SourcePool {
    pub fn new(slot_count: usize) -> Self {
        Self {
            sources: (0..slot_count).map(ClientSource::new).collect(),
            // Popped from the back, so slot 0 is handed out first.
            free: Mutex::new((0..slot_count).rev().collect()),
        }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn source(&self, slot: usize) -> Option<&ClientSource> {
        self.sources.get(slot)
    }

    pub fn sources(&self) -> &[ClientSource] {
        &self.sources
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Takes a slot off the free-list and locks it for a new session.
    ///
    /// The free-list lock is released before the slot lock is taken, so the
    /// two are never held together on this path.
    pub fn reserve(&self, tag: LockTag) -> Option<(SlotLock<'_>, PlayId)> {
        let slot = self.free.lock().pop()?;
        let lock = self.sources[slot].lock(tag);
        let play_id = lock.reserve();
        log::debug!("Reserved {} for {}", play_id, tag);
        Some((lock, play_id))
    }

    /// Locks the slot `play_id` points at, if that session is still live.
    pub fn lock_existing(&self, play_id: PlayId, tag: LockTag) -> Option<SlotLock<'_>> {
        let source = self.sources.get(play_id.slot())?;
        if !Self::is_live(source, play_id) {
            return None;
        }
        let lock = source.lock(tag);
        // Re-check now that the slot cannot change under us.
        Self::is_live(source, play_id).then_some(lock)
    }

    /// Lock-free check that `play_id` still names an in-use session.
    pub fn is_live_id(&self, play_id: PlayId) -> bool {
        self.sources
            .get(play_id.slot())
            .is_some_and(|source| Self::is_live(source, play_id))
    }

    fn is_live(source: &ClientSource, play_id: PlayId) -> bool {
        !source.is_available() && source.play_id() == play_id
    }

    /// Returns `slot` to the free-list if no client holds it and nothing is in flight.
    ///
    /// `retire` runs under the slot lock before the slot is published. It must
    /// be idempotent: when the free-list is contended the slot stays reserved
    /// and the whole reclaim is retried on a later tick.
    pub fn reclaim(
        &self,
        slot: usize,
        block_on_free_list: bool,
        retire: impl FnOnce(),
    ) -> ReclaimOutcome {
        let source = &self.sources[slot];
        let Some(lock) = source.try_lock(LockTag::Named("reclaim")) else {
            return ReclaimOutcome::SlotLocked;
        };
        if source.queue_depth() > 0 {
            return ReclaimOutcome::InFlight;
        }

        retire();

        let mut free = if block_on_free_list {
            self.free.lock()
        } else {
            match self.free.try_lock() {
                Some(free) => free,
                None => return ReclaimOutcome::FreeListContended,
            }
        };
        lock.release_to_pool();
        free.push(slot);
        ReclaimOutcome::Reclaimed
    }

    #[cfg(test)]
    pub(crate) fn hold_free_list(&self) -> parking_lot::MutexGuard<'_, Vec<usize>> {
        self.free.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const TAG: LockTag = LockTag::Named("test");

    #[test]
    fn reserve_until_exhausted() {
        let pool = SourcePool::new(3);
        let ids: Vec<PlayId> = (0..3)
            .map(|_| pool.reserve(TAG).map(|(_, id)| id).unwrap())
            .collect();
        assert_eq!(ids.iter().map(|id| id.slot()).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(pool.reserve(TAG).is_none());
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn stale_ids_do_not_lock() {
        let pool = SourcePool::new(1);
        let (lock, first) = pool.reserve(TAG).unwrap();
        drop(lock);
        assert!(pool.lock_existing(first, TAG).is_some());

        assert_eq!(pool.reclaim(0, false, || {}), ReclaimOutcome::Reclaimed);
        assert!(pool.lock_existing(first, TAG).is_none());

        let (_lock, second) = pool.reserve(TAG).unwrap();
        assert_ne!(first, second);
        assert!(!pool.is_live_id(first));
        assert!(pool.is_live_id(second));
    }

    #[test]
    fn reclaim_respects_both_locking_domains() {
        let pool = SourcePool::new(1);
        let (lock, _) = pool.reserve(TAG).unwrap();
        assert_eq!(pool.reclaim(0, false, || {}), ReclaimOutcome::SlotLocked);

        lock.begin_command();
        drop(lock);
        assert_eq!(pool.reclaim(0, false, || {}), ReclaimOutcome::InFlight);
        pool.source(0).unwrap().acknowledge();

        let held = pool.hold_free_list();
        let mut retired = 0;
        assert_eq!(
            pool.reclaim(0, false, || retired += 1),
            ReclaimOutcome::FreeListContended
        );
        drop(held);
        assert_eq!(pool.reclaim(0, false, || retired += 1), ReclaimOutcome::Reclaimed);
        assert_eq!(retired, 2);
        assert!(pool.source(0).unwrap().is_available());
    }

    #[test]
    fn at_most_one_owner_under_contention() {
        let pool = SourcePool::new(1);
        let source = pool.source(0).unwrap();
        let inside = AtomicBool::new(false);
        let entries = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for t in 0..8 {
                let inside = &inside;
                let entries = &entries;
                scope.spawn(move || {
                    for i in 0..500 {
                        let lock = if (t + i) % 2 == 0 {
                            Some(source.lock(TAG))
                        } else {
                            source.try_lock(TAG)
                        };
                        if let Some(_lock) = lock {
                            assert!(!inside.swap(true, Ordering::SeqCst), "two owners at once");
                            entries.fetch_add(1, Ordering::Relaxed);
                            std::hint::spin_loop();
                            inside.store(false, Ordering::SeqCst);
                        }
                    }
                });
            }
        });
        assert!(entries.load(Ordering::Relaxed) >= 8 * 250);
    }
}
