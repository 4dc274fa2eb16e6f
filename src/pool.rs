//! Fixed-Size Block Pools
//!
//! A [`Pool`] divides an [`Arena`] into `capacity` Blocks of `stride` bytes
//! and hands them out by Index in O(1). The free Blocks form a singly linked
//! list, but instead of storing the Links inside the free Blocks themselves,
//! they live in a side-array with one Entry per Block, so no live Memory is
//! ever reinterpreted as a Link.
//!
//! The [`Pool`] is not thread-safe on its own. [`ConcurrentPool`] provides the
//! same Index based allocation for typed Slots using a lock-free free-list.
//!
//! # Example
//! ```rust
//! # use memsync::pool::{Pool, NULL_INDEX};
//! let mut pool = Pool::with_capacity(16, 2, 8).unwrap();
//!
//! let first = pool.allocate();
//! let second = pool.allocate();
//! assert_eq!(NULL_INDEX, pool.allocate());
//!
//! let ptr = pool.pointer(first).unwrap();
//! assert_eq!(first, pool.index(ptr.as_ptr()));
//!
//! pool.deallocate(first).unwrap();
//! pool.deallocate(second).unwrap();
//! assert_eq!(2, pool.count_available());
//! ```

use std::{fmt::Debug, ptr::NonNull};

use thiserror::Error;

use crate::{arena::Arena, error::ConfigError};

mod concurrent;
pub use concurrent::ConcurrentPool;

pub use crate::tagged::NULL_INDEX;

/// Marks a Block that is currently handed out, in the Link-Array
const ALLOCATED: u32 = u32::MAX - 1;

/// The largest Number of Blocks a Pool can manage, every Index below this is
/// a valid Block-Index
pub const MAX_CAPACITY: usize = (u32::MAX - 1) as usize;

/// The Errors for returning a Block to a Pool
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The Index does not belong to any Block of the Pool
    #[error("index {0} does not belong to this pool")]
    ForeignIndex(u32),
    /// The Block is not currently allocated
    #[error("block {0} is already free")]
    DoubleFree(u32),
}

/// A Pool of fixed-size Blocks
pub struct Pool<'a> {
    arena: Arena<'a>,
    block_size: usize,
    stride: usize,
    /// The next free Block for every free Block, or [`ALLOCATED`] for the
    /// Blocks that are currently in use
    links: Vec<u32>,
    head: u32,
    free: usize,
}

impl Pool<'static> {
    /// Creates a new Pool that owns its Arena
    pub fn with_capacity(
        block_size: usize,
        capacity: usize,
        alignment: usize,
    ) -> Result<Self, ConfigError> {
        let stride = Self::stride_for(block_size, alignment)?;
        let required = stride
            .checked_mul(capacity)
            .ok_or(ConfigError::CapacityOverflow {
                requested: capacity,
                max: MAX_CAPACITY,
            })?;

        let arena = Arena::allocate(required, alignment)?;
        Self::new(arena, block_size, capacity, alignment)
    }
}

impl<'a> Pool<'a> {
    /// Creates a new Pool on top of the given Arena
    ///
    /// # Errors
    /// * the `capacity` exceeds [`MAX_CAPACITY`]
    /// * the `block_size` is smaller than the Index type
    /// * the `alignment` is not a power of two
    /// * the `arena` is not aligned to `alignment`
    /// * the `arena` cannot hold `capacity` Blocks
    pub fn new(
        arena: Arena<'a>,
        block_size: usize,
        capacity: usize,
        alignment: usize,
    ) -> Result<Self, ConfigError> {
        if capacity > MAX_CAPACITY {
            return Err(ConfigError::CapacityOverflow {
                requested: capacity,
                max: MAX_CAPACITY,
            });
        }
        let stride = Self::stride_for(block_size, alignment)?;
        if !arena.is_aligned(alignment) {
            return Err(ConfigError::Unaligned(alignment));
        }

        let required = stride
            .checked_mul(capacity)
            .ok_or(ConfigError::CapacityOverflow {
                requested: capacity,
                max: MAX_CAPACITY,
            })?;
        if arena.len() < required {
            return Err(ConfigError::ArenaTooSmall {
                available: arena.len(),
                required,
            });
        }

        let mut pool = Self {
            arena,
            block_size,
            stride,
            links: vec![NULL_INDEX; capacity],
            head: NULL_INDEX,
            free: 0,
        };
        pool.reset();

        log::debug!(
            "Created pool of {} blocks with a stride of {} bytes",
            capacity,
            stride
        );

        Ok(pool)
    }

    fn stride_for(block_size: usize, alignment: usize) -> Result<usize, ConfigError> {
        if block_size < std::mem::size_of::<u32>() {
            return Err(ConfigError::BlockTooSmall(block_size));
        }
        if !alignment.is_power_of_two() {
            return Err(ConfigError::InvalidAlignment(alignment));
        }

        block_size
            .checked_add(alignment - 1)
            .map(|size| size & !(alignment - 1))
            .ok_or(ConfigError::BlockTooSmall(block_size))
    }

    /// Marks every Block as free again, invalidating all outstanding Indices
    pub fn reset(&mut self) {
        let capacity = self.links.len();
        for (index, link) in self.links.iter_mut().enumerate() {
            *link = if index + 1 < capacity {
                (index + 1) as u32
            } else {
                NULL_INDEX
            };
        }

        self.head = if capacity > 0 { 0 } else { NULL_INDEX };
        self.free = capacity;
    }

    /// Takes a Block out of the Pool
    ///
    /// # Returns
    /// The Index of the Block, or [`NULL_INDEX`] if the Pool is exhausted
    pub fn allocate(&mut self) -> u32 {
        let index = self.head;
        if index == NULL_INDEX {
            log::debug!("Pool exhausted ({} blocks)", self.links.len());
            return NULL_INDEX;
        }

        let link = &mut self.links[index as usize];
        self.head = *link;
        *link = ALLOCATED;
        self.free -= 1;

        index
    }

    /// Returns a Block to the Pool
    ///
    /// # Errors
    /// * [`PoolError::ForeignIndex`] if the Index was never produced by this
    ///   Pool
    /// * [`PoolError::DoubleFree`] if the Block is already free
    pub fn deallocate(&mut self, index: u32) -> Result<(), PoolError> {
        let link = self
            .links
            .get_mut(index as usize)
            .ok_or(PoolError::ForeignIndex(index))?;
        if *link != ALLOCATED {
            return Err(PoolError::DoubleFree(index));
        }

        *link = self.head;
        self.head = index;
        self.free += 1;

        Ok(())
    }

    /// Returns the Block pointed to by `ptr` to the Pool
    pub fn deallocate_ptr(&mut self, ptr: *const u8) -> Result<(), PoolError> {
        match self.index(ptr) {
            NULL_INDEX => Err(PoolError::ForeignIndex(NULL_INDEX)),
            index => self.deallocate(index),
        }
    }

    /// Converts a Block-Index into a Pointer to the Start of that Block
    pub fn pointer(&self, index: u32) -> Option<NonNull<u8>> {
        if (index as usize) < self.links.len() {
            Some(self.arena.ptr_at(index as usize * self.stride))
        } else {
            None
        }
    }

    /// Converts a Pointer to the Start of a Block back into its Index
    ///
    /// # Returns
    /// The Index or [`NULL_INDEX`] if the Pointer is not owned by this Pool
    pub fn index(&self, ptr: *const u8) -> u32 {
        match self.block_offset(ptr) {
            Some(offset) => (offset / self.stride) as u32,
            None => NULL_INDEX,
        }
    }

    /// Checks if the Pointer points to the Start of one of the Blocks
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.block_offset(ptr).is_some()
    }

    fn block_offset(&self, ptr: *const u8) -> Option<usize> {
        let offset = self.arena.offset_of(ptr)?;
        if offset % self.stride == 0 && offset / self.stride < self.links.len() {
            Some(offset)
        } else {
            None
        }
    }

    /// The Contents of an allocated Block
    pub fn block(&self, index: u32) -> Option<&[u8]> {
        if !self.is_allocated(index) {
            return None;
        }

        let ptr = self.arena.ptr_at(index as usize * self.stride);
        // # Safety:
        // The Block lies within the Arena and is handed out by this Pool, the
        // returned borrow is tied to `self`
        Some(unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.block_size) })
    }

    /// The mutable Contents of an allocated Block
    pub fn block_mut(&mut self, index: u32) -> Option<&mut [u8]> {
        if !self.is_allocated(index) {
            return None;
        }

        let ptr = self.arena.ptr_at(index as usize * self.stride);
        // # Safety:
        // The Block lies within the Arena and we have exclusive access to the
        // Pool for the duration of the borrow
        Some(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.block_size) })
    }

    fn is_allocated(&self, index: u32) -> bool {
        self.links.get(index as usize).copied() == Some(ALLOCATED)
    }

    /// The Number of Blocks that are currently free
    pub fn count_available(&self) -> usize {
        self.free
    }

    /// The total Number of Blocks
    pub fn capacity(&self) -> usize {
        self.links.len()
    }

    /// The usable Size of every Block
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// The Distance between the Starts of two neighbouring Blocks
    pub fn stride(&self) -> usize {
        self.stride
    }
}

impl<'a> Debug for Pool<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("block_size", &self.block_size)
            .field("stride", &self.stride)
            .field("capacity", &self.capacity())
            .field("available", &self.free)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn fill_drain_refill() {
        let mut pool = Pool::with_capacity(16, 20, 16).unwrap();

        let first_round: Vec<_> = (0..20).map(|_| pool.allocate()).collect();
        assert!(first_round.iter().all(|i| *i != NULL_INDEX));
        assert_eq!(20, first_round.iter().collect::<HashSet<_>>().len());

        assert_eq!(NULL_INDEX, pool.allocate());

        for index in first_round {
            pool.deallocate(index).unwrap();
        }
        assert_eq!(20, pool.count_available());

        for _ in 0..20 {
            assert_ne!(NULL_INDEX, pool.allocate());
        }
        assert_eq!(0, pool.count_available());
    }

    #[test]
    fn pointer_index_inverse() {
        let mut pool = Pool::with_capacity(24, 8, 8).unwrap();

        for _ in 0..8 {
            let index = pool.allocate();
            let ptr = pool.pointer(index).unwrap();

            assert_eq!(index, pool.index(ptr.as_ptr()));
            assert_eq!(Some(ptr), pool.pointer(pool.index(ptr.as_ptr())));
        }
    }

    #[test]
    fn stride_rounds_to_alignment() {
        let pool = Pool::with_capacity(20, 4, 16).unwrap();

        assert_eq!(20, pool.block_size());
        assert_eq!(32, pool.stride());
    }

    #[test]
    fn foreign_pointers() {
        let pool = Pool::with_capacity(16, 4, 16).unwrap();
        let first = pool.pointer(0).unwrap().as_ptr();

        assert!(pool.owns(first));
        // Not at the Start of a Block
        assert!(!pool.owns(first.wrapping_add(1)));
        assert_eq!(NULL_INDEX, pool.index(first.wrapping_add(1)));
        // Past the last Block
        assert!(!pool.owns(first.wrapping_add(64)));
        assert_eq!(None, pool.pointer(4));
    }

    #[test]
    fn deallocate_errors() {
        let mut pool = Pool::with_capacity(8, 2, 8).unwrap();

        assert_eq!(Err(PoolError::ForeignIndex(2)), pool.deallocate(2));

        let index = pool.allocate();
        pool.deallocate(index).unwrap();
        assert_eq!(Err(PoolError::DoubleFree(index)), pool.deallocate(index));
    }

    #[test]
    fn invalid_configurations() {
        assert_eq!(
            ConfigError::BlockTooSmall(2),
            Pool::with_capacity(2, 4, 4).unwrap_err()
        );
        assert_eq!(
            ConfigError::InvalidAlignment(12),
            Pool::with_capacity(16, 4, 12).unwrap_err()
        );

        let arena = Arena::allocate(64, 8).unwrap();
        assert_eq!(
            ConfigError::ArenaTooSmall {
                available: 64,
                required: 128
            },
            Pool::new(arena, 16, 8, 8).unwrap_err()
        );
    }

    #[test]
    fn unaligned_arena() {
        let mut backing = vec![0u64; 8];
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(backing.as_mut_ptr() as *mut u8, 64)
        };
        // Skip one byte so the Arena can't be aligned to 8
        let arena = Arena::from_slice(&mut bytes[1..]);

        assert_eq!(
            ConfigError::Unaligned(8),
            Pool::new(arena, 8, 4, 8).unwrap_err()
        );
    }

    #[test]
    fn block_access() {
        let mut pool = Pool::with_capacity(8, 2, 8).unwrap();
        let index = pool.allocate();

        pool.block_mut(index).unwrap().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(Some(&[1u8, 2, 3, 4, 5, 6, 7, 8][..]), pool.block(index));

        pool.deallocate(index).unwrap();
        assert_eq!(None, pool.block(index));
    }
}
