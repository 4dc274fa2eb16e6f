//! A lock-free open-addressing HashMap from `u64` Keys to `u64` Values
//!
//! The Map never grows on its own. It is sized on creation so that at most
//! half of its Slots are ever occupied, which keeps the expected Probe-Length
//! constant. Keys are expected to already be well distributed Hashes (see
//! [`crate::registry::hash_name`]), so they are used directly as the starting
//! Point of the Probe-Sequence.
//!
//! Once a Key has claimed a Slot, it stays in that Slot. Removing a Key only
//! clears its Value, leaving a Tombstone behind, that can later be compacted
//! using [`ConcurrentHashMap::reclaim`].
//!
//! # Example
//! ```rust
//! # use memsync::hash_map::{ConcurrentHashMap, NULL_VALUE};
//! let map = ConcurrentHashMap::with_capacity(100).unwrap();
//!
//! assert_eq!(Ok(NULL_VALUE), map.set(42, 7));
//! assert_eq!(7, map.get(42));
//! assert_eq!(Ok(7), map.set(42, 9));
//! assert_eq!(NULL_VALUE, map.get(43));
//! ```
//!
//! # Reference:
//! * [The World's Simplest Lock-Free Hash Table](https://preshing.com/20130605/the-worlds-simplest-lock-free-hash-table/)

use std::{
    fmt::Debug,
    sync::atomic::{AtomicU64, Ordering},
};

use thiserror::Error;

use crate::error::ConfigError;

/// The Key that marks an unclaimed Slot, this can't be used as an actual Key
pub const NULL_KEY: u64 = u64::MAX;
/// The Value that marks an absent Entry
pub const NULL_VALUE: u64 = u64::MAX;

const MIN_SLOTS: usize = 8;

/// The Errors returned by the Map-Operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HashMapError {
    /// The [`NULL_KEY`] was used as a Key
    #[error("the null key can't be stored in the map")]
    NullKey,
    /// Every Slot is claimed by another Key
    #[error("every slot of the map is claimed")]
    Full,
    /// The Target of a Migration has fewer Slots than the Source
    #[error("cannot migrate {from} slots into {to} slots")]
    TooSmall {
        /// The Slot-Count of the Source
        from: usize,
        /// The Slot-Count of the Target
        to: usize,
    },
}

/// The Progress of an incremental Migration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrateStatus {
    /// The Number of Entries copied by this Call
    pub moved: usize,
    /// Whether or not every Slot has been visited
    pub complete: bool,
}

struct Slot {
    key: AtomicU64,
    value: AtomicU64,
}

impl Slot {
    fn empty() -> Self {
        Self {
            key: AtomicU64::new(NULL_KEY),
            value: AtomicU64::new(NULL_VALUE),
        }
    }
}

/// The lock-free HashMap
pub struct ConcurrentHashMap {
    slots: Box<[Slot]>,
    mask: u64,
    /// The next Slot to visit during a Migration
    migrate_cursor: usize,
}

impl ConcurrentHashMap {
    /// Creates a new Map that can hold `capacity` Keys, while staying at or
    /// below a load factor of 50%.
    ///
    /// The Map will have `max(8, nextpow2(capacity * 2))` Slots.
    pub fn with_capacity(capacity: usize) -> Result<Self, ConfigError> {
        let slot_count = capacity
            .checked_mul(2)
            .and_then(usize::checked_next_power_of_two)
            .ok_or(ConfigError::CapacityOverflow {
                requested: capacity,
                max: usize::MAX / 4,
            })?
            .max(MIN_SLOTS);

        let slots: Box<[Slot]> = (0..slot_count).map(|_| Slot::empty()).collect();

        Ok(Self {
            slots,
            mask: (slot_count - 1) as u64,
            migrate_cursor: 0,
        })
    }

    /// The Slots visited when looking for the given Key, in order
    fn probe(&self, key: u64) -> impl Iterator<Item = &Slot> + '_ {
        (0..self.slots.len() as u64)
            .map(move |step| &self.slots[(key.wrapping_add(step) & self.mask) as usize])
    }

    /// Finds the Slot that belongs to the Key, claiming an empty one if the
    /// Key is not yet present
    fn claim(&self, key: u64) -> Result<&Slot, HashMapError> {
        if key == NULL_KEY {
            return Err(HashMapError::NullKey);
        }

        for slot in self.probe(key) {
            let probed = slot.key.load(Ordering::Acquire);
            if probed == key {
                return Ok(slot);
            }
            if probed != NULL_KEY {
                continue;
            }

            match slot.key.compare_exchange(
                NULL_KEY,
                key,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(slot),
                // Another Thread claimed it for the same Key in the meantime
                Err(actual) if actual == key => return Ok(slot),
                Err(_) => continue,
            };
        }

        Err(HashMapError::Full)
    }

    /// Finds the Slot that belongs to the Key, without claiming anything
    fn find(&self, key: u64) -> Option<&Slot> {
        if key == NULL_KEY {
            return None;
        }

        for slot in self.probe(key) {
            match slot.key.load(Ordering::Acquire) {
                probed if probed == key => return Some(slot),
                // An insert for this Key would never have skipped this Slot
                NULL_KEY => return None,
                _ => continue,
            };
        }

        None
    }

    /// Stores the Value for the given Key, replacing any previous Value
    ///
    /// # Returns
    /// The previous Value or [`NULL_VALUE`] if the Key had no Value
    pub fn set(&self, key: u64, value: u64) -> Result<u64, HashMapError> {
        let slot = self.claim(key)?;
        Ok(slot.value.swap(value, Ordering::AcqRel))
    }

    /// Stores the Value for the given Key, only if the Key has no Value yet
    ///
    /// # Returns
    /// * `Ok(NULL_VALUE)` if the Value was stored
    /// * `Ok(existing)` if the Key already had a Value, which is left as is
    pub fn insert(&self, key: u64, value: u64) -> Result<u64, HashMapError> {
        let slot = self.claim(key)?;

        match slot.value.compare_exchange(
            NULL_VALUE,
            value,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(NULL_VALUE),
            Err(existing) => Ok(existing),
        }
    }

    /// Loads the Value for the given Key
    ///
    /// # Returns
    /// The Value or [`NULL_VALUE`] if the Key is not present
    pub fn get(&self, key: u64) -> u64 {
        match self.find(key) {
            Some(slot) => slot.value.load(Ordering::Acquire),
            None => NULL_VALUE,
        }
    }

    /// Removes the Value of the given Key, leaving a Tombstone
    ///
    /// # Returns
    /// The removed Value or [`NULL_VALUE`] if the Key had no Value
    pub fn remove(&self, key: u64) -> u64 {
        match self.find(key) {
            Some(slot) => slot.value.swap(NULL_VALUE, Ordering::AcqRel),
            None => NULL_VALUE,
        }
    }

    /// Counts the Keys that currently have a Value.
    ///
    /// This has to visit every Slot and should not be used on hot paths
    pub fn size(&self) -> usize {
        self.entries().count()
    }

    /// Iterates over a Snapshot of all the Key-Value Pairs
    pub fn entries(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.slots.iter().filter_map(|slot| {
            let key = slot.key.load(Ordering::Acquire);
            let value = slot.value.load(Ordering::Acquire);
            if key != NULL_KEY && value != NULL_VALUE {
                Some((key, value))
            } else {
                None
            }
        })
    }

    /// The Number of Keys the Map was sized for
    pub fn capacity(&self) -> usize {
        self.slots.len() / 2
    }

    /// The Number of Slots backing the Map
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Resets every Slot to be empty
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot.key.get_mut() = NULL_KEY;
            *slot.value.get_mut() = NULL_VALUE;
        }
        self.migrate_cursor = 0;
    }

    /// Empties the Map through a shared Reference, nobody else may use the
    /// Map until this returns
    pub(crate) fn reset(&self) {
        for slot in self.slots.iter() {
            slot.key.store(NULL_KEY, Ordering::Relaxed);
            slot.value.store(NULL_VALUE, Ordering::Relaxed);
        }
    }

    /// Frees the Slots of all Tombstones by rebuilding the Table, so every
    /// remaining Key ends up in the earliest Slot of its Probe-Sequence.
    ///
    /// # Returns
    /// The Number of Tombstones that were removed
    pub fn reclaim(&mut self) -> usize {
        let reclaimed = self
            .slots
            .iter()
            .filter(|slot| {
                slot.key.load(Ordering::Relaxed) != NULL_KEY
                    && slot.value.load(Ordering::Relaxed) == NULL_VALUE
            })
            .count();

        if reclaimed == 0 {
            return 0;
        }

        // Re-inserting into an empty Table can't be confused by Keys, whose
        // Cluster wraps around the End of the Table
        let fresh: Box<[Slot]> = (0..self.slots.len()).map(|_| Slot::empty()).collect();
        let old = std::mem::replace(&mut self.slots, fresh);

        for slot in old.into_vec() {
            let key = slot.key.into_inner();
            let value = slot.value.into_inner();
            if key == NULL_KEY || value == NULL_VALUE {
                continue;
            }

            let mut target = key & self.mask;
            while *self.slots[target as usize].key.get_mut() != NULL_KEY {
                target = (target + 1) & self.mask;
            }
            let target = &mut self.slots[target as usize];
            *target.key.get_mut() = key;
            *target.value.get_mut() = value;
        }

        log::debug!("Reclaimed {} tombstones", reclaimed);

        reclaimed
    }

    /// Copies up to `max_moves` live Entries into `other`, continuing where
    /// the previous Call stopped.
    ///
    /// Keys that already have a Value in `other` keep it, as that Value was
    /// stored after the Migration started and is therefore newer.
    ///
    /// `other` may be used concurrently by other Threads while this is
    /// running, but this Map must not be modified until the Migration is
    /// complete.
    pub fn migrate(
        &mut self,
        other: &ConcurrentHashMap,
        max_moves: usize,
    ) -> Result<MigrateStatus, HashMapError> {
        if other.slot_count() < self.slot_count() {
            return Err(HashMapError::TooSmall {
                from: self.slot_count(),
                to: other.slot_count(),
            });
        }

        let mut moved = 0;
        while moved < max_moves && self.migrate_cursor < self.slots.len() {
            let slot = &mut self.slots[self.migrate_cursor];
            let key = *slot.key.get_mut();
            let value = *slot.value.get_mut();
            self.migrate_cursor += 1;

            if key != NULL_KEY && value != NULL_VALUE {
                other.insert(key, value)?;
                moved += 1;
            }
        }

        Ok(MigrateStatus {
            moved,
            complete: self.migrate_cursor >= self.slots.len(),
        })
    }
}

impl Debug for ConcurrentHashMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConcurrentHashMap (slots: {})", self.slots.len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn slot_counts() {
        assert_eq!(8, ConcurrentHashMap::with_capacity(0).unwrap().slot_count());
        assert_eq!(8, ConcurrentHashMap::with_capacity(3).unwrap().slot_count());
        assert_eq!(256, ConcurrentHashMap::with_capacity(100).unwrap().slot_count());
        assert_eq!(256, ConcurrentHashMap::with_capacity(128).unwrap().slot_count());
        assert_eq!(512, ConcurrentHashMap::with_capacity(129).unwrap().slot_count());
    }

    #[test]
    fn capacity_overflow() {
        assert!(ConcurrentHashMap::with_capacity(usize::MAX).is_err());
    }

    #[test]
    fn set_get() {
        let map = ConcurrentHashMap::with_capacity(100).unwrap();

        assert_eq!(Ok(NULL_VALUE), map.set(42, 7));
        assert_eq!(7, map.get(42));
        assert_eq!(Ok(7), map.set(42, 9));
        assert_eq!(9, map.get(42));
        assert_eq!(NULL_VALUE, map.get(43));
    }

    #[test]
    fn null_key() {
        let map = ConcurrentHashMap::with_capacity(4).unwrap();

        assert_eq!(Err(HashMapError::NullKey), map.set(NULL_KEY, 1));
        assert_eq!(NULL_VALUE, map.get(NULL_KEY));
    }

    #[test]
    fn colliding_keys() {
        let map = ConcurrentHashMap::with_capacity(4).unwrap();

        // All of these start probing at the same Slot
        map.set(1, 10).unwrap();
        map.set(9, 90).unwrap();
        map.set(17, 170).unwrap();

        assert_eq!(10, map.get(1));
        assert_eq!(90, map.get(9));
        assert_eq!(170, map.get(17));
        assert_eq!(NULL_VALUE, map.get(25));
    }

    #[test]
    fn full_map() {
        let map = ConcurrentHashMap::with_capacity(4).unwrap();

        for key in 0..8 {
            map.set(key, key).unwrap();
        }
        assert_eq!(Err(HashMapError::Full), map.set(100, 1));
        // Existing Keys can still be updated
        assert_eq!(Ok(3), map.set(3, 33));
    }

    #[test]
    fn insert_keeps_existing() {
        let map = ConcurrentHashMap::with_capacity(4).unwrap();

        assert_eq!(Ok(NULL_VALUE), map.insert(5, 1));
        assert_eq!(Ok(1), map.insert(5, 2));
        assert_eq!(1, map.get(5));

        map.remove(5);
        assert_eq!(Ok(NULL_VALUE), map.insert(5, 3));
        assert_eq!(3, map.get(5));
    }

    #[test]
    fn remove_leaves_tombstone() {
        let map = ConcurrentHashMap::with_capacity(4).unwrap();

        map.set(1, 10).unwrap();
        map.set(9, 90).unwrap();

        assert_eq!(10, map.remove(1));
        assert_eq!(NULL_VALUE, map.get(1));
        assert_eq!(90, map.get(9));
        assert_eq!(1, map.size());
    }

    #[test]
    fn reclaim_moves_displaced_keys() {
        let mut map = ConcurrentHashMap::with_capacity(4).unwrap();

        map.set(1, 10).unwrap();
        map.set(9, 90).unwrap();
        map.set(2, 20).unwrap();
        map.remove(1);

        assert_eq!(1, map.reclaim());
        assert_eq!(NULL_VALUE, map.get(1));
        assert_eq!(90, map.get(9));
        assert_eq!(20, map.get(2));

        assert_eq!(2, map.size());
        assert_eq!(0, map.reclaim());
    }

    #[test]
    fn reclaim_wrapping_cluster() {
        let mut map = ConcurrentHashMap::with_capacity(4).unwrap();

        // 7, 15 and 23 all start at the last Slot and wrap around
        map.set(7, 70).unwrap();
        map.set(15, 150).unwrap();
        map.set(23, 230).unwrap();
        map.remove(15);

        assert_eq!(1, map.reclaim());
        assert_eq!(70, map.get(7));
        assert_eq!(230, map.get(23));
        assert_eq!(NULL_VALUE, map.get(15));
    }

    #[test]
    fn reclaim_cluster_across_the_end() {
        let mut map = ConcurrentHashMap::with_capacity(8).unwrap();
        assert_eq!(16, map.slot_count());

        // 14 and 30 fill the last two Slots, everything after them wraps
        // around into the Cluster at the Start of the Table
        let keys = [14, 30, 15, 1, 17, 33, 3, 16];
        for key in keys.iter() {
            map.set(*key, key * 10).unwrap();
        }
        map.remove(30);
        map.remove(33);

        assert_eq!(2, map.reclaim());
        for key in keys.iter().filter(|key| **key != 30 && **key != 33) {
            assert_eq!(key * 10, map.get(*key), "lost key {}", key);
        }
        assert_eq!(NULL_VALUE, map.get(30));
        assert_eq!(NULL_VALUE, map.get(33));
        assert_eq!(6, map.size());

        // Every Slot is either empty or holds a live Key again
        let occupied = map
            .slots
            .iter()
            .filter(|slot| slot.key.load(Ordering::Relaxed) != NULL_KEY)
            .count();
        assert_eq!(6, occupied);
    }

    #[test]
    fn clear() {
        let mut map = ConcurrentHashMap::with_capacity(4).unwrap();

        map.set(1, 1).unwrap();
        map.clear();

        assert_eq!(0, map.size());
        assert_eq!(NULL_VALUE, map.get(1));
    }

    #[test]
    fn migrate_incrementally() {
        let mut small = ConcurrentHashMap::with_capacity(4).unwrap();
        for key in 0..4 {
            small.set(key * 3, key).unwrap();
        }
        small.remove(3);

        let large = ConcurrentHashMap::with_capacity(16).unwrap();

        let mut moved = 0;
        loop {
            let status = small.migrate(&large, 1).unwrap();
            assert!(status.moved <= 1);
            moved += status.moved;
            if status.complete {
                break;
            }
        }

        assert_eq!(3, moved);
        assert_eq!(3, large.size());
        assert_eq!(0, large.get(0));
        assert_eq!(NULL_VALUE, large.get(3));
        assert_eq!(3, large.get(9));
    }

    #[test]
    fn migrate_keeps_newer_values() {
        let mut small = ConcurrentHashMap::with_capacity(4).unwrap();
        small.set(5, 1).unwrap();
        small.set(6, 1).unwrap();

        let large = ConcurrentHashMap::with_capacity(16).unwrap();
        large.set(5, 2).unwrap();

        let status = small.migrate(&large, 10).unwrap();
        assert!(status.complete);

        assert_eq!(2, large.get(5));
        assert_eq!(1, large.get(6));
    }

    #[test]
    fn migrate_into_smaller() {
        let mut large = ConcurrentHashMap::with_capacity(16).unwrap();
        let small = ConcurrentHashMap::with_capacity(4).unwrap();

        assert_eq!(
            Err(HashMapError::TooSmall { from: 32, to: 8 }),
            large.migrate(&small, 10)
        );
    }

    #[test]
    fn concurrent_distinct_keys() {
        let map = Arc::new(ConcurrentHashMap::with_capacity(4000).unwrap());

        let handles: Vec<_> = (0..4u64)
            .map(|thread| {
                let c_map = map.clone();
                std::thread::spawn(move || {
                    for i in 0..1000u64 {
                        let key = (thread * 1000 + i).wrapping_mul(0x9E3779B97F4A7C15);
                        c_map.set(key, i).unwrap();
                        assert_eq!(i, c_map.get(key));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(4000, map.size());
    }
}
