//! Versioned playback identifiers.

use std::fmt;

const SLOT_BITS: u32 = 16;
const SLOT_MASK: u32 = (1 << SLOT_BITS) - 1;

/// Number of distinct play counts before the counter wraps.
pub const PLAY_COUNT_MODULUS: u32 = 1 << SLOT_BITS;

/// Identifies one playback session on one pool slot.
///
/// Laid out as `(play_count << 16) | slot`. The play count is bumped every time
/// the slot is reserved, so an id from an earlier session never matches the
/// slot's current one.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PlayId(u32);

impl PlayId {
    pub fn new(slot: usize, play_count: u16) -> Self {
        debug_assert!(slot as u32 <= SLOT_MASK, "slot {} out of range", slot);
        Self(((play_count as u32) << SLOT_BITS) | (slot as u32 & SLOT_MASK))
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn slot(self) -> usize {
        (self.0 & SLOT_MASK) as usize
    }

    pub fn play_count(self) -> u16 {
        (self.0 >> SLOT_BITS) as u16
    }

    /// The id the same slot gets on its next reservation.
    pub fn successor(self) -> Self {
        Self::new(self.slot(), next_play_count(self.play_count()))
    }
}

/// Wrapping increment; the modulus is greater than one so the result always differs.
pub(crate) fn next_play_count(count: u16) -> u16 {
    count.wrapping_add(1)
}

impl fmt::Display for PlayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PlayId({}#{})", self.slot(), self.play_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_slot_and_count() {
        let id = PlayId::new(29, 7);
        assert_eq!(id.slot(), 29);
        assert_eq!(id.play_count(), 7);
        assert_eq!(id.raw(), (7 << 16) | 29);
        assert_eq!(PlayId::from_raw(id.raw()), id);
    }

    #[test]
    fn successor_differs_across_wrap() {
        let last = PlayId::new(3, u16::MAX);
        let wrapped = last.successor();
        assert_ne!(wrapped, last);
        assert_eq!(wrapped.play_count(), 0);
        assert_eq!(wrapped.slot(), 3);

        let first_after_wrap = wrapped.successor();
        assert_ne!(first_after_wrap, wrapped);
        assert_eq!(first_after_wrap.play_count(), 1);
    }

    #[test]
    fn every_sequential_reservation_is_fresh() {
        let mut id = PlayId::new(0, 0);
        for _ in 0..(PLAY_COUNT_MODULUS + 5) {
            let next = id.successor();
            assert_ne!(next, id);
            id = next;
        }
    }
}
