//! An Index bundled with a generation Tag, packed into a single machine word
//!
//! Lock-free algorithms that recycle their Nodes are prone to the ABA-Problem:
//! a thread reads Index `A`, the Node at `A` gets removed and reused, and the
//! thread's later compare-and-swap still succeeds because it sees `A` again.
//! Every successful move of a [`TaggedIndex`] bumps its Tag, so the recycled
//! `A` carries a different Tag and the stale CAS fails.
//!
//! # Wrap-Around
//! The Tag is 32 bits wide and wraps. A thread that stalls for exactly
//! 2^32 moves of the same word could still observe a false match. This is an
//! accepted theoretical race and is not closed.

use std::fmt::Debug;

use atomic::{Atomic, Ordering};

/// The Index value that marks the absence of a Target
pub const NULL_INDEX: u32 = u32::MAX;

/// An (Index, Tag) pair
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C, align(8))]
pub struct TaggedIndex {
    index: u32,
    tag: u32,
}

impl TaggedIndex {
    /// A Tagged-Index pointing at nothing, with a Tag of 0
    pub const NULL: Self = Self::new(NULL_INDEX, 0);

    /// Creates a new Tagged-Index
    pub const fn new(index: u32, tag: u32) -> Self {
        Self { index, tag }
    }

    /// The Index part
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// The Tag part
    pub const fn tag(&self) -> u32 {
        self.tag
    }

    /// Checks if the Index is the [`NULL_INDEX`]
    pub const fn is_null(&self) -> bool {
        self.index == NULL_INDEX
    }

    /// Returns a Tagged-Index for the new Target with the Tag advanced by one
    pub const fn with_index(&self, index: u32) -> Self {
        Self {
            index,
            tag: self.tag.wrapping_add(1),
        }
    }
}

impl Debug for TaggedIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "TaggedIndex(null, tag: {})", self.tag)
        } else {
            write!(f, "TaggedIndex({}, tag: {})", self.index, self.tag)
        }
    }
}

impl From<u64> for TaggedIndex {
    fn from(raw: u64) -> Self {
        Self {
            index: (raw & 0xffffffff) as u32,
            tag: (raw >> 32) as u32,
        }
    }
}
impl From<TaggedIndex> for u64 {
    fn from(raw: TaggedIndex) -> Self {
        ((raw.tag as u64) << 32) | (raw.index as u64)
    }
}

/// A [`TaggedIndex`] that can be shared between Threads
pub struct AtomicTaggedIndex(Atomic<TaggedIndex>);

impl AtomicTaggedIndex {
    /// Creates a new Atomic with the given initial Value
    pub const fn new(initial: TaggedIndex) -> Self {
        Self(Atomic::new(initial))
    }

    /// Whether or not the Pair is updated using a native atomic Instruction
    /// on this Platform, instead of a fallback Lock
    pub fn is_lock_free() -> bool {
        Atomic::<TaggedIndex>::is_lock_free()
    }

    /// Loads the current Value
    pub fn load(&self, order: Ordering) -> TaggedIndex {
        self.0.load(order)
    }

    /// Stores a new Value, ignoring whatever was stored before
    pub fn store(&self, value: TaggedIndex, order: Ordering) {
        self.0.store(value, order)
    }

    /// Attempts to replace `current` with `new`, succeeding only if both the
    /// Index and the Tag still match
    pub fn compare_exchange(
        &self,
        current: TaggedIndex,
        new: TaggedIndex,
        success: Ordering,
        failure: Ordering,
    ) -> Result<TaggedIndex, TaggedIndex> {
        self.0.compare_exchange(current, new, success, failure)
    }
}

impl Debug for AtomicTaggedIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Atomic{:?}", self.load(Ordering::Relaxed))
    }
}
