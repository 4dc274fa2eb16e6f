use std::{
    fmt::Debug,
    sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
};

use crate::{
    error::ConfigError,
    tagged::{AtomicTaggedIndex, TaggedIndex, NULL_INDEX},
};

use super::{PoolError, MAX_CAPACITY};

struct Slot<T> {
    /// The next free Slot, only meaningful while this Slot is free
    next: AtomicU32,
    in_use: AtomicBool,
    value: T,
}

/// A lock-free Pool of typed Slots
///
/// Every Slot is initialized once, when the Pool is created, and stays alive
/// until the Pool is dropped. Allocation only hands out the Index of a Slot,
/// so a Slot can be read safely even by a Thread that lost a race for it,
/// which is what the lock-free Datastructures built on top of this rely on.
///
/// The free Slots form a Treiber-Stack, whose Head is an
/// [`AtomicTaggedIndex`] to rule out the ABA-Problem on the Head.
///
/// # Example
/// ```rust
/// # use memsync::pool::ConcurrentPool;
/// # use std::sync::atomic::{AtomicU64, Ordering};
/// let pool = ConcurrentPool::new_with(4, |_| AtomicU64::new(0)).unwrap();
///
/// let index = pool.allocate().unwrap();
/// pool.get(index).unwrap().store(13, Ordering::SeqCst);
///
/// pool.deallocate(index).unwrap();
/// assert_eq!(4, pool.count_available());
/// ```
pub struct ConcurrentPool<T> {
    slots: Box<[Slot<T>]>,
    head: AtomicTaggedIndex,
    available: AtomicUsize,
}

impl<T> ConcurrentPool<T> {
    /// Creates a new Pool with `capacity` Slots, initializing each of them
    /// with the Value returned by `init` for its Index
    pub fn new_with<F>(capacity: usize, mut init: F) -> Result<Self, ConfigError>
    where
        F: FnMut(u32) -> T,
    {
        if capacity > MAX_CAPACITY {
            return Err(ConfigError::CapacityOverflow {
                requested: capacity,
                max: MAX_CAPACITY,
            });
        }

        let slots: Box<[Slot<T>]> = (0..capacity)
            .map(|index| {
                let next = if index + 1 < capacity {
                    (index + 1) as u32
                } else {
                    NULL_INDEX
                };

                Slot {
                    next: AtomicU32::new(next),
                    in_use: AtomicBool::new(false),
                    value: init(index as u32),
                }
            })
            .collect();

        let head = if capacity > 0 { 0 } else { NULL_INDEX };

        Ok(Self {
            slots,
            head: AtomicTaggedIndex::new(TaggedIndex::new(head, 0)),
            available: AtomicUsize::new(capacity),
        })
    }

    /// Attempts to take a free Slot out of the Pool
    ///
    /// # Returns
    /// * `Some(index)` of the Slot that is now owned by the Caller
    /// * `None` if the Pool is exhausted
    pub fn allocate(&self) -> Option<u32> {
        let mut head = self.head.load(Ordering::Acquire);

        loop {
            if head.is_null() {
                return None;
            }

            // The Slot may be handed out and returned by other Threads while
            // we read this, in which case the Tag of the Head changed and the
            // CAS below fails
            let next = self.slots[head.index() as usize]
                .next
                .load(Ordering::Relaxed);

            match self.head.compare_exchange(
                head,
                head.with_index(next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let slot = &self.slots[head.index() as usize];
                    slot.in_use.store(true, Ordering::Release);
                    self.available.fetch_sub(1, Ordering::Relaxed);

                    return Some(head.index());
                }
                Err(current) => {
                    head = current;
                }
            };
        }
    }

    /// Returns the Slot at the given Index to the Pool
    ///
    /// # Errors
    /// * [`PoolError::ForeignIndex`] if the Index is out of Bounds
    /// * [`PoolError::DoubleFree`] if the Slot is not currently allocated
    pub fn deallocate(&self, index: u32) -> Result<(), PoolError> {
        let slot = self
            .slots
            .get(index as usize)
            .ok_or(PoolError::ForeignIndex(index))?;

        if !slot.in_use.swap(false, Ordering::AcqRel) {
            return Err(PoolError::DoubleFree(index));
        }

        let mut head = self.head.load(Ordering::Acquire);
        loop {
            slot.next.store(head.index(), Ordering::Relaxed);

            match self.head.compare_exchange(
                head,
                head.with_index(index),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.available.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(current) => {
                    head = current;
                }
            };
        }
    }

    /// Returns a Reference to the Slot at the given Index, regardless of
    /// whether or not it is currently allocated
    pub fn get(&self, index: u32) -> Option<&T> {
        self.slots.get(index as usize).map(|slot| &slot.value)
    }

    /// Iterates over all the Slots in the Pool, both free and allocated ones
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| (index as u32, &slot.value))
    }

    /// The Number of free Slots, this is only a Snapshot
    pub fn count_available(&self) -> usize {
        self.available.load(Ordering::Relaxed)
    }

    /// The total Number of Slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl<T> Debug for ConcurrentPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ConcurrentPool<{}> (capacity: {}, available: {})",
            std::any::type_name::<T>(),
            self.capacity(),
            self.count_available()
        )
    }
}
