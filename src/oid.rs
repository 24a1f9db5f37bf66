//! A process-wide, thread-safe, monotonic ObjectId generator.
//!
//! Grounded on the 12-byte layout in spec.md §3: a 4-byte big-endian timestamp
//! (seconds), a 5-byte per-process random value, and a 3-byte big-endian counter
//! that increases monotonically modulo 2^24. Unlike `bson::oid::ObjectId` (whose
//! generation strategy is an implementation detail of the BSON crate we treat as
//! an opaque codec per spec.md §1), this generator's monotonicity is one of the
//! driver's own testable properties (spec.md §8 item 2), so it is owned here.

use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use rand::RngCore;

static COUNTER: AtomicU32 = AtomicU32::new(0);

fn process_random() -> [u8; 5] {
    use std::sync::OnceLock;
    static RANDOM: OnceLock<[u8; 5]> = OnceLock::new();
    *RANDOM.get_or_init(|| {
        let mut bytes = [0u8; 5];
        rand::rng().fill_bytes(&mut bytes);
        bytes
    })
}

/// A 12-byte MongoDB ObjectId.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    /// Generates a new ObjectId. Safe to call concurrently from any number of threads; the
    /// trailing counter is strictly non-decreasing modulo 2^24 (spec.md §8 item 2).
    pub fn new() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32;
        let random = process_random();
        let count = COUNTER.fetch_add(1, Ordering::Relaxed) & 0x00FF_FFFF;

        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&timestamp.to_be_bytes());
        bytes[4..9].copy_from_slice(&random);
        bytes[9] = (count >> 16) as u8;
        bytes[10] = (count >> 8) as u8;
        bytes[11] = count as u8;
        Self(bytes)
    }

    pub fn bytes(&self) -> [u8; 12] {
        self.0
    }

    /// The trailing 3-byte counter, widened to a plain integer for ordering comparisons.
    pub fn counter(&self) -> u32 {
        ((self.0[9] as u32) << 16) | ((self.0[10] as u32) << 8) | self.0[11] as u32
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<ObjectId> for bson::oid::ObjectId {
    fn from(id: ObjectId) -> Self {
        bson::oid::ObjectId::from_bytes(id.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generates_unique_ids() {
        let ids: HashSet<_> = (0..1000).map(|_| ObjectId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn counter_is_monotonic_within_a_second_bucket() {
        let ids: Vec<ObjectId> = (0..500).map(|_| ObjectId::new()).collect();
        for window in ids.windows(2) {
            let (a, b) = (window[0], window[1]);
            if a.bytes()[0..4] == b.bytes()[0..4] {
                let expected = (a.counter() + 1) & 0x00FF_FFFF;
                assert_eq!(b.counter(), expected);
            }
        }
    }

    #[test]
    fn concurrent_generation_is_monotonic() {
        use std::thread;
        let handles: Vec<_> = (0..8)
            .map(|_| thread::spawn(|| (0..200).map(|_| ObjectId::new()).collect::<Vec<_>>()))
            .collect();
        let mut all: Vec<ObjectId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        let counters: HashSet<_> = all.iter().map(|id| id.counter()).collect();
        // With 1600 generations the 24-bit counter space is never exhausted, so every
        // counter value issued must be unique even though timestamps interleave.
        assert_eq!(counters.len(), all.len());
    }
}
