//! A Two-Level Segregated Fit Allocator, serving variable-sized Allocations
//! out of a single [`Arena`] in constant Time
//!
//! Finding a Block, splitting it and merging it with its Neighbours once it
//! is freed again are all O(1), regardless of how many Allocations are alive.
//! The Headers of the Blocks are stored in the Arena right in front of the
//! User-Data, so no Operation touches the global Allocator. Every Allocation
//! therefore takes up an additional [`MIN_ALIGNMENT`] bytes.
//!
//! The Allocator itself needs exclusive Access for every Operation, use
//! [`SharedTlsfAllocator`] to share it between Threads.
//!
//! # Example
//! ```rust
//! # use memsync::tlsf::{AllocateOptions, TlsfAllocator};
//! let mut allocator = TlsfAllocator::with_capacity(4096).unwrap();
//!
//! let ptr = allocator
//!     .allocate(100, "example", AllocateOptions::default())
//!     .unwrap();
//! assert!(allocator.size(ptr.as_ptr()).unwrap() >= 100);
//!
//! allocator.deallocate(ptr.as_ptr()).unwrap();
//! assert_eq!(0, allocator.stats().num_allocations);
//! ```

mod heap;
pub use heap::MIN_ALIGNMENT;

use std::{collections::HashMap, fmt::Debug, ptr::NonNull};

use thiserror::Error;

use crate::{arena::Arena, error::ConfigError};

use heap::{Heap, HEADER_SIZE};

/// The Errors returned when freeing Memory
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TlsfError {
    /// The Pointer does not point into the Heap
    #[error("pointer {0:#x} does not belong to this heap")]
    ForeignPointer(usize),
    /// No Allocation starts at the Pointer, it was most likely already freed
    #[error("no allocation starts at offset {0}")]
    NotAllocated(usize),
    /// The Heap failed its Consistency-Check and can't be used anymore
    #[error("the heap is corrupted")]
    Corrupted,
}

/// The Options for a single Allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocateOptions {
    alignment: usize,
}

impl AllocateOptions {
    /// Allocations aligned to [`MIN_ALIGNMENT`]
    pub const fn new() -> Self {
        Self {
            alignment: MIN_ALIGNMENT,
        }
    }

    /// Allocations aligned to the given Power of two, Alignments below
    /// [`MIN_ALIGNMENT`] are raised to it
    pub fn with_alignment(alignment: usize) -> Result<Self, ConfigError> {
        if !alignment.is_power_of_two() || alignment > (1 << 30) {
            return Err(ConfigError::InvalidAlignment(alignment));
        }

        Ok(Self {
            alignment: alignment.max(MIN_ALIGNMENT),
        })
    }

    /// The Alignment of the returned Pointers
    pub const fn alignment(&self) -> usize {
        self.alignment
    }
}

impl Default for AllocateOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// A Snapshot of the Usage of the Allocator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// The Number of live Allocations
    pub num_allocations: usize,
    /// The Bytes taken up by the Blocks of all live Allocations, including
    /// their Headers
    pub allocated_bytes: usize,
    /// The highest Value `allocated_bytes` ever had
    pub allocated_bytes_peak: usize,
    /// The Size of the Heap
    pub capacity_bytes: usize,
    /// The Number of free Blocks
    pub num_free_blocks: usize,
    /// The Size of the largest free Block
    pub largest_free_block_bytes: usize,
}

/// A Description of a single Block, used or free
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// The Offset of the Block from the Start of the Arena
    pub offset: usize,
    /// The Size of the Block, including its Header
    pub size: usize,
    /// Whether or not the Block is allocated
    pub used: bool,
    /// The Label of the Allocation that uses the Block
    pub label: Option<&'static str>,
}

/// The Tag of a used Block holds the log2 of its Alignment in the upper
/// Byte and the Id of its Label in the rest
const ALIGNMENT_SHIFT: u32 = 24;
const LABEL_MASK: u32 = (1 << ALIGNMENT_SHIFT) - 1;

fn round_up(value: usize, to: usize) -> Option<usize> {
    Some(value.checked_add(to - 1)? & !(to - 1))
}

/// The Allocator
pub struct TlsfAllocator<'a> {
    arena: Arena<'a>,
    heap: Heap,
    /// Every Label seen so far, a used Block stores the Index into this
    labels: Vec<&'static str>,
    label_ids: HashMap<(usize, usize), u32>,
    num_allocations: usize,
    allocated_bytes: usize,
    allocated_bytes_peak: usize,
    poisoned: bool,
}

impl TlsfAllocator<'static> {
    /// Creates a new Allocator over an Arena of `bytes` bytes, that is
    /// obtained from the system allocator
    pub fn with_capacity(bytes: usize) -> Result<Self, ConfigError> {
        Self::new(Arena::allocate(bytes, MIN_ALIGNMENT)?)
    }
}

impl<'a> TlsfAllocator<'a> {
    /// Creates a new Allocator over the Arena, which has to be aligned to
    /// [`MIN_ALIGNMENT`].
    ///
    /// Only the first 4GiB of the Arena can be used, the Rest is ignored.
    pub fn new(arena: Arena<'a>) -> Result<Self, ConfigError> {
        if !arena.is_aligned(MIN_ALIGNMENT) {
            return Err(ConfigError::Unaligned(MIN_ALIGNMENT));
        }

        // The smallest Allocation needs a Header and a Granule of User-Data
        let required = 2 * MIN_ALIGNMENT;
        let usable = arena.len().min(u32::MAX as usize) & !(MIN_ALIGNMENT - 1);
        if usable < required {
            return Err(ConfigError::ArenaTooSmall {
                available: arena.len(),
                required,
            });
        }
        if usable < arena.len() {
            log::debug!("Using {} of the {} arena bytes", usable, arena.len());
        }

        // # Safety:
        // The Arena is aligned, at least `usable` bytes long and is moved into
        // the Allocator together with the Heap, so it outlives it. The Memory
        // itself never moves along with the Arena.
        let heap = unsafe { Heap::new(arena.ptr_at(0), usable as u32) };

        log::debug!("Created TLSF heap of {} bytes", usable);

        Ok(Self {
            arena,
            heap,
            labels: Vec::new(),
            label_ids: HashMap::new(),
            num_allocations: 0,
            allocated_bytes: 0,
            allocated_bytes_peak: 0,
            poisoned: false,
        })
    }

    /// The Arena the Heap is placed in
    pub fn arena(&self) -> &Arena<'a> {
        &self.arena
    }

    /// The Id under which the Label is stored in the Block-Headers.
    ///
    /// Only a Label that was never seen before has to be recorded.
    fn label_id(&mut self, label: &'static str) -> u32 {
        let key = (label.as_ptr() as usize, label.len());
        if let Some(id) = self.label_ids.get(&key) {
            return *id;
        }

        if self.labels.len() >= LABEL_MASK as usize {
            log::warn!("Too many distinct labels, dropping {:?}", label);
            return LABEL_MASK;
        }

        let id = self.labels.len() as u32;
        self.labels.push(label);
        self.label_ids.insert(key, id);
        id
    }

    fn label(&self, tag: u32) -> Option<&'static str> {
        self.labels.get((tag & LABEL_MASK) as usize).copied()
    }

    /// Finds the used Block of the Allocation at `ptr`, returning the Block
    /// and the Offset of `ptr`
    fn locate(&self, ptr: *const u8) -> Result<(u32, u32), TlsfError> {
        let offset = match self.arena.offset_of(ptr) {
            Some(offset) if offset < self.heap.capacity() as usize => offset,
            _ => return Err(TlsfError::ForeignPointer(ptr as usize)),
        };
        if offset % MIN_ALIGNMENT != 0 || offset < HEADER_SIZE as usize {
            return Err(TlsfError::NotAllocated(offset));
        }

        // Right in front of the User-Data is either the Offset of the
        // User-Data itself, if it directly follows the Header, or the Offset
        // of the Block, if the Allocation was padded for its Alignment
        let user = offset as u32;
        let link = self.heap.word(user - 4);
        let block = if link == user { user - HEADER_SIZE } else { link };

        if self.heap.is_allocation(block, user) {
            Ok((block, user))
        } else {
            Err(TlsfError::NotAllocated(offset))
        }
    }

    /// Allocates at least `bytes` bytes, aligned as requested by the Options.
    ///
    /// The Label is only used for Diagnostics, see
    /// [`walk_heap`](TlsfAllocator::walk_heap).
    ///
    /// # Returns
    /// * `Some(ptr)` to the start of the Allocation
    /// * `None` if no free Block is large enough
    pub fn allocate(
        &mut self,
        bytes: usize,
        label: &'static str,
        options: AllocateOptions,
    ) -> Option<NonNull<u8>> {
        if self.poisoned {
            log::error!("Refusing to allocate {:?} from a corrupted heap", label);
            return None;
        }

        let alignment = options.alignment();
        let data = round_up(bytes.max(1), MIN_ALIGNMENT)?;
        let total = data
            .checked_add(HEADER_SIZE as usize)?
            .checked_add(alignment - MIN_ALIGNMENT)?;
        let total = u32::try_from(total).ok()?;

        let block = match self.heap.allocate(total) {
            Some(block) => block,
            None => {
                log::debug!("TLSF heap exhausted, {} bytes for {:?}", bytes, label);
                return None;
            }
        };

        let base = self.arena.as_ptr() as usize;
        let start = base + (block + HEADER_SIZE) as usize;
        let user = (round_up(start, alignment)? - base) as u32;

        let tag = (alignment.trailing_zeros() << ALIGNMENT_SHIFT) | self.label_id(label);
        self.heap.set_allocation(block, user, tag);
        if user - block > HEADER_SIZE {
            // The Padding is at least one Granule, so the Link to the Block
            // never overlaps the Header
            self.heap.set_word(user - 4, block);
            self.heap.shrink(block, (user - block) + data as u32);
        }

        self.num_allocations += 1;
        self.allocated_bytes += self.heap.size(block) as usize;
        self.allocated_bytes_peak = self.allocated_bytes_peak.max(self.allocated_bytes);

        log::trace!("Allocated {} bytes at {} for {:?}", bytes, user, label);

        Some(self.arena.ptr_at(user as usize))
    }

    /// Resizes the Allocation, keeping its Contents up to the smaller of the
    /// two Sizes.
    ///
    /// Growing first tries to extend the Block in place, otherwise the
    /// Contents are moved into a new Allocation with the same Alignment and
    /// Label. A null Pointer behaves like
    /// [`allocate`](TlsfAllocator::allocate).
    ///
    /// # Returns
    /// * `Some(ptr)` to the resized Allocation, which may have moved
    /// * `None` if there is not enough Memory or `ptr` is not a live
    ///   Allocation, in which case the original Allocation is left untouched
    pub fn reallocate(&mut self, ptr: *mut u8, bytes: usize) -> Option<NonNull<u8>> {
        if ptr.is_null() {
            return self.allocate(bytes, "reallocate", AllocateOptions::default());
        }
        if self.poisoned {
            return None;
        }

        let (block, user) = match self.locate(ptr) {
            Ok(found) => found,
            Err(e) => {
                log::error!("Reallocating {:p}: {}", ptr, e);
                return None;
            }
        };

        let lead = user - block;
        let data = round_up(bytes.max(1), MIN_ALIGNMENT)?;
        let needed = u32::try_from(data.checked_add(lead as usize)?).ok()?;
        let old_size = self.heap.size(block);

        if needed <= old_size {
            self.heap.shrink(block, needed);
            self.allocated_bytes -= (old_size - self.heap.size(block)) as usize;
            return NonNull::new(ptr);
        }

        if self.heap.grow(block, needed) {
            self.allocated_bytes += (self.heap.size(block) - old_size) as usize;
            self.allocated_bytes_peak = self.allocated_bytes_peak.max(self.allocated_bytes);
            log::trace!("Grew allocation at {} in place to {} bytes", user, bytes);
            return NonNull::new(ptr);
        }

        let tag = self.heap.tag(block);
        let options = AllocateOptions {
            alignment: 1 << (tag >> ALIGNMENT_SHIFT),
        };
        let label = self.label(tag).unwrap_or("reallocate");
        let moved = self.allocate(bytes, label, options)?;

        let old_usable = (old_size - lead) as usize;
        // # Safety:
        // Both Ranges lie within the Arena and belong to two different live
        // Allocations, so they can't overlap
        unsafe { std::ptr::copy_nonoverlapping(ptr, moved.as_ptr(), old_usable.min(bytes)) };

        if let Err(e) = self.deallocate(ptr) {
            log::error!("Releasing the old block after moving it: {}", e);
        }

        Some(moved)
    }

    /// Frees the Allocation, a null Pointer is ignored
    pub fn deallocate(&mut self, ptr: *mut u8) -> Result<(), TlsfError> {
        if ptr.is_null() {
            return Ok(());
        }
        if self.poisoned {
            return Err(TlsfError::Corrupted);
        }

        let (block, user) = self.locate(ptr)?;
        let tag = self.heap.tag(block);

        self.num_allocations -= 1;
        self.allocated_bytes -= self.heap.size(block) as usize;
        self.heap.free(block);

        log::trace!("Freed {} for {:?}", user, self.label(tag));

        Ok(())
    }

    /// The usable Size of the Allocation, which is at least the requested
    /// Size
    pub fn size(&self, ptr: *const u8) -> Option<usize> {
        let (block, user) = self.locate(ptr).ok()?;
        Some((block + self.heap.size(block) - user) as usize)
    }

    /// Checks if the Pointer points into the Heap
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.arena
            .offset_of(ptr)
            .map_or(false, |offset| offset < self.heap.capacity() as usize)
    }

    /// Collects the current Statistics, this walks over all Blocks
    pub fn stats(&self) -> Stats {
        let (num_free_blocks, largest_free_block) = self.heap.free_summary();

        Stats {
            num_allocations: self.num_allocations,
            allocated_bytes: self.allocated_bytes,
            allocated_bytes_peak: self.allocated_bytes_peak,
            capacity_bytes: self.heap.capacity() as usize,
            num_free_blocks,
            largest_free_block_bytes: largest_free_block as usize,
        }
    }

    /// Checks the whole Heap for Consistency.
    ///
    /// A Heap that fails the Check is poisoned, every following Allocation
    /// fails until it is [`reset`](TlsfAllocator::reset).
    pub fn valid(&mut self) -> bool {
        if self.poisoned {
            return false;
        }

        if let Err(reason) = self.check() {
            log::error!("TLSF heap is corrupted: {}", reason);
            self.poisoned = true;
            return false;
        }

        true
    }

    fn check(&self) -> Result<(), String> {
        self.heap.check()?;

        let mut allocations = 0;
        let mut allocated = 0;
        let mut result = Ok(());
        self.heap.walk(|block, size, used| {
            if !used || result.is_err() {
                return;
            }
            allocations += 1;
            allocated += size as usize;

            let user = self.heap.user(block);
            let label = self.heap.tag(block) & LABEL_MASK;
            if !self.heap.is_allocation(block, user) || user as usize % MIN_ALIGNMENT != 0 {
                result = Err(format!("block {} has an invalid user offset {}", block, user));
            } else if user - block > HEADER_SIZE && self.heap.word(user - 4) != block {
                result = Err(format!("padded allocation at {} lost its block link", user));
            } else if label != LABEL_MASK && label as usize >= self.labels.len() {
                result = Err(format!("block {} has an unknown label {}", block, label));
            }
        });
        result?;

        if allocations != self.num_allocations {
            return Err(format!(
                "{} blocks are used but {} allocations are live",
                allocations, self.num_allocations
            ));
        }
        if allocated != self.allocated_bytes {
            return Err(format!(
                "{} bytes are allocated but {} are accounted for",
                allocated, self.allocated_bytes
            ));
        }

        Ok(())
    }

    /// Whether or not a failed Consistency-Check disabled the Heap
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Discards all Allocations and starts over with an empty Heap.
    ///
    /// Any Pointer handed out before must not be used afterwards.
    pub fn reset(&mut self) {
        if self.num_allocations > 0 {
            log::debug!(
                "Resetting heap with {} live allocations",
                self.num_allocations
            );
        }

        self.heap.reset();
        self.num_allocations = 0;
        self.allocated_bytes = 0;
        self.poisoned = false;
    }

    /// Calls `f` for every Block of the Heap, in Address-Order
    pub fn walk_heap<F>(&self, mut f: F)
    where
        F: FnMut(BlockInfo),
    {
        self.heap.walk(|offset, size, used| {
            let label = if used {
                self.label(self.heap.tag(offset))
            } else {
                None
            };

            f(BlockInfo {
                offset: offset as usize,
                size: size as usize,
                used,
                label,
            })
        });
    }
}

impl<'a> Debug for TlsfAllocator<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TlsfAllocator (capacity: {}, allocations: {})",
            self.heap.capacity(),
            self.num_allocations
        )
    }
}

impl<'a> Drop for TlsfAllocator<'a> {
    fn drop(&mut self) {
        if self.num_allocations == 0 {
            return;
        }

        log::error!(
            "Dropped TLSF allocator with {} outstanding allocations ({} bytes)",
            self.num_allocations,
            self.allocated_bytes
        );
        self.walk_heap(|block| {
            if block.used {
                log::debug!("Leaked {:?} at offset {}", block.label, block.offset);
            }
        });
    }
}

/// A [`TlsfAllocator`] that can be shared between Threads, by serializing
/// every Operation with a Spin-Lock
pub struct SharedTlsfAllocator<'a> {
    inner: spin::Mutex<TlsfAllocator<'a>>,
}

impl<'a> SharedTlsfAllocator<'a> {
    /// Wraps the Allocator
    pub fn new(allocator: TlsfAllocator<'a>) -> Self {
        Self {
            inner: spin::Mutex::new(allocator),
        }
    }

    /// Locks the Allocator for a Sequence of Operations
    pub fn lock(&self) -> spin::MutexGuard<'_, TlsfAllocator<'a>> {
        self.inner.lock()
    }

    /// See [`TlsfAllocator::allocate`]
    pub fn allocate(
        &self,
        bytes: usize,
        label: &'static str,
        options: AllocateOptions,
    ) -> Option<NonNull<u8>> {
        self.inner.lock().allocate(bytes, label, options)
    }

    /// See [`TlsfAllocator::reallocate`]
    pub fn reallocate(&self, ptr: *mut u8, bytes: usize) -> Option<NonNull<u8>> {
        self.inner.lock().reallocate(ptr, bytes)
    }

    /// See [`TlsfAllocator::deallocate`]
    pub fn deallocate(&self, ptr: *mut u8) -> Result<(), TlsfError> {
        self.inner.lock().deallocate(ptr)
    }

    /// See [`TlsfAllocator::size`]
    pub fn size(&self, ptr: *const u8) -> Option<usize> {
        self.inner.lock().size(ptr)
    }

    /// See [`TlsfAllocator::owns`]
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.inner.lock().owns(ptr)
    }

    /// See [`TlsfAllocator::stats`]
    pub fn stats(&self) -> Stats {
        self.inner.lock().stats()
    }

    /// See [`TlsfAllocator::valid`]
    pub fn valid(&self) -> bool {
        self.inner.lock().valid()
    }

    /// Unwraps the Allocator again
    pub fn into_inner(self) -> TlsfAllocator<'a> {
        self.inner.into_inner()
    }
}

impl<'a> Debug for SharedTlsfAllocator<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedTlsfAllocator ()")
    }
}
