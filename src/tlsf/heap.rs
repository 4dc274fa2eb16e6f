//! The Bookkeeping of the Allocator, overlaid on the Arena itself
//!
//! Every Block starts with a 16 byte Header, that is addressed by the Offset
//! of the Block from the Start of the Arena:
//!
//! | Offset | free Block              | used Block                  |
//! |--------|-------------------------|-----------------------------|
//! | +0     | Size (bit 0: used)      | Size (bit 0: used)          |
//! | +4     | physically previous     | physically previous         |
//! | +8     | previous in Free-List   | Tag (Alignment and Label)   |
//! | +12    | next in Free-List       | Offset of the User-Data     |
//!
//! The physically next Block directly follows the current one, so it does
//! not need a Link. The Size always covers the Header.
//!
//! The Size-Classes use a linear-log Binning: Sizes below 256 bytes are
//! split into 16 linear Sub-Bins of 16 bytes each, every Power of two above
//! that is split into 16 Sub-Bins as well. Two Bitmaps track which Bins and
//! Sub-Bins are non-empty, so finding a fitting Block is a couple of
//! bit-scans.
//!
//! # Reference:
//! * [TLSF: a New Dynamic Memory Allocator for Real-Time Systems](http://www.gii.upv.es/tlsf/files/ecrts04_tlsf.pdf)

use std::ptr::NonNull;

pub(super) const ALIGN_LOG2: u32 = 4;
/// The Granularity of all Block-Sizes and Offsets
pub const MIN_ALIGNMENT: usize = 1 << ALIGN_LOG2;
/// The Size of the Header in front of every Block
pub(super) const HEADER_SIZE: u32 = MIN_ALIGNMENT as u32;

const SUB_BINS_LOG2: u32 = 4;
const SUB_BIN_COUNT: usize = 1 << SUB_BINS_LOG2;
const LINEAR_LOG2: u32 = 8;
const BIN_COUNT: usize = (u32::BITS - LINEAR_LOG2 + 1) as usize;
const LIST_COUNT: usize = BIN_COUNT * SUB_BIN_COUNT;

const SIZE: u32 = 0;
const PREV_PHYS: u32 = 4;
const PREV_FREE: u32 = 8;
const NEXT_FREE: u32 = 12;
const TAG: u32 = 8;
const USER: u32 = 12;

const USED: u32 = 1;
const SIZE_MASK: u32 = !(MIN_ALIGNMENT as u32 - 1);
/// Marks a missing Link inside a Header
const NONE: u32 = u32::MAX;

fn link(raw: u32) -> Option<u32> {
    if raw == NONE {
        None
    } else {
        Some(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Bin {
    bin: u32,
    sub_bin: u32,
}

impl Bin {
    fn index(&self) -> usize {
        self.bin as usize * SUB_BIN_COUNT + self.sub_bin as usize
    }

    /// The Bin a free Block of the given Size is stored in
    fn round_down(size: u32) -> Self {
        if size < (1 << LINEAR_LOG2) {
            return Self {
                bin: 0,
                sub_bin: size >> ALIGN_LOG2,
            };
        }

        let log2 = u32::BITS - 1 - size.leading_zeros();
        Self {
            bin: log2 - LINEAR_LOG2 + 1,
            sub_bin: (size >> (log2 - SUB_BINS_LOG2)) - SUB_BIN_COUNT as u32,
        }
    }

    /// The first Bin in which every Block can hold the given Size, together
    /// with the Size rounded up to the Granularity of that Bin
    fn round_up(size: u32) -> Option<(u32, Self)> {
        let rounded = if size < (1 << LINEAR_LOG2) {
            size
        } else {
            let log2 = u32::BITS - 1 - size.leading_zeros();
            let step = 1u32 << (log2 - SUB_BINS_LOG2);
            size.checked_add(step - 1)? & !(step - 1)
        };

        Some((rounded, Self::round_down(rounded)))
    }
}

pub(super) struct Heap {
    base: NonNull<u8>,
    capacity: u32,
    heads: [Option<u32>; LIST_COUNT],
    bitmap_0: u32,
    bitmap_1: [u32; BIN_COUNT],
}

// # Safety:
// The Heap is the only one accessing the Headers in its Memory, and it is
// only ever used through `&mut self` for Modifications
unsafe impl Send for Heap {}

impl Heap {
    /// Creates a Heap with a single free Block spanning the `capacity`,
    /// which has to be a non-zero Multiple of [`MIN_ALIGNMENT`]
    ///
    /// # Safety
    /// `base` has to point to `capacity` bytes, aligned to [`MIN_ALIGNMENT`],
    /// that stay valid for as long as the Heap lives. Nothing else may write
    /// to that Memory, except into the User-Data of allocated Blocks.
    pub unsafe fn new(base: NonNull<u8>, capacity: u32) -> Self {
        debug_assert!(capacity >= HEADER_SIZE && capacity & !SIZE_MASK == 0);

        let mut heap = Self {
            base,
            capacity,
            heads: [None; LIST_COUNT],
            bitmap_0: 0,
            bitmap_1: [0; BIN_COUNT],
        };
        heap.reset();
        heap
    }

    /// Forgets all Blocks and starts over with a single free one
    pub fn reset(&mut self) {
        self.heads = [None; LIST_COUNT];
        self.bitmap_0 = 0;
        self.bitmap_1 = [0; BIN_COUNT];

        self.set_size(0, self.capacity, false);
        self.set_word(PREV_PHYS, NONE);
        self.insert_free(0);
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Reads the Word at the given Offset, which has to be in bounds and
    /// aligned to 4 bytes
    pub fn word(&self, offset: u32) -> u32 {
        debug_assert!(offset % 4 == 0 && offset as u64 + 4 <= self.capacity as u64);

        // # Safety:
        // The Offset lies within the Memory of the Heap and the Memory is
        // aligned to 16 bytes, so the Word is properly aligned as well
        unsafe { self.base.as_ptr().add(offset as usize).cast::<u32>().read() }
    }

    /// Writes the Word at the given Offset, which has to be in bounds and
    /// aligned to 4 bytes
    pub fn set_word(&mut self, offset: u32, value: u32) {
        debug_assert!(offset % 4 == 0 && offset as u64 + 4 <= self.capacity as u64);

        // # Safety:
        // See `word`
        unsafe {
            self.base
                .as_ptr()
                .add(offset as usize)
                .cast::<u32>()
                .write(value)
        }
    }

    pub fn size(&self, id: u32) -> u32 {
        self.word(id + SIZE) & SIZE_MASK
    }

    pub fn is_used(&self, id: u32) -> bool {
        self.word(id + SIZE) & USED != 0
    }

    fn set_size(&mut self, id: u32, size: u32, used: bool) {
        self.set_word(id + SIZE, size | if used { USED } else { 0 });
    }

    fn mark(&mut self, id: u32, used: bool) {
        let size = self.size(id);
        self.set_size(id, size, used);
    }

    fn prev_phys(&self, id: u32) -> Option<u32> {
        link(self.word(id + PREV_PHYS))
    }

    fn next_phys(&self, id: u32) -> Option<u32> {
        let next = id as u64 + self.size(id) as u64;
        if next < self.capacity as u64 {
            Some(next as u32)
        } else {
            None
        }
    }

    fn set_prev_phys(&mut self, id: u32, prev: Option<u32>) {
        self.set_word(id + PREV_PHYS, prev.unwrap_or(NONE));
    }

    fn prev_free(&self, id: u32) -> Option<u32> {
        link(self.word(id + PREV_FREE))
    }

    fn next_free(&self, id: u32) -> Option<u32> {
        link(self.word(id + NEXT_FREE))
    }

    fn set_prev_free(&mut self, id: u32, prev: Option<u32>) {
        self.set_word(id + PREV_FREE, prev.unwrap_or(NONE));
    }

    fn set_next_free(&mut self, id: u32, next: Option<u32>) {
        self.set_word(id + NEXT_FREE, next.unwrap_or(NONE));
    }

    /// The Tag stored in the Header of a used Block
    pub fn tag(&self, id: u32) -> u32 {
        self.word(id + TAG)
    }

    /// The Offset of the User-Data of a used Block
    pub fn user(&self, id: u32) -> u32 {
        self.word(id + USER)
    }

    /// Stores the Details of the Allocation in the Header of a used Block
    pub fn set_allocation(&mut self, id: u32, user: u32, tag: u32) {
        debug_assert!(self.is_used(id));

        self.set_word(id + TAG, tag);
        self.set_word(id + USER, user);
    }

    /// Checks if `id` is a used Block, whose User-Data starts at `user`.
    ///
    /// This only reads Memory in front of `user`, so it is safe to call with
    /// arbitrary Values as long as `user` lies within the Heap.
    pub fn is_allocation(&self, id: u32, user: u32) -> bool {
        id & !SIZE_MASK == 0
            && id as u64 + HEADER_SIZE as u64 <= user as u64
            && (user as u64) < self.capacity as u64
            && self.is_used(id)
            && self.user(id) == user
            && id as u64 + (self.size(id) as u64) > user as u64
    }

    fn set_bits(&mut self, bin: Bin) {
        self.bitmap_0 |= 1 << bin.bin;
        self.bitmap_1[bin.bin as usize] |= 1 << bin.sub_bin;
    }

    fn clear_bits(&mut self, bin: Bin) {
        let second = &mut self.bitmap_1[bin.bin as usize];
        *second &= !(1 << bin.sub_bin);
        if *second == 0 {
            self.bitmap_0 &= !(1 << bin.bin);
        }
    }

    fn insert_free(&mut self, id: u32) {
        let bin = Bin::round_down(self.size(id));
        let head = self.heads[bin.index()];

        self.mark(id, false);
        self.set_prev_free(id, None);
        self.set_next_free(id, head);

        match head {
            Some(head) => self.set_prev_free(head, Some(id)),
            None => self.set_bits(bin),
        };
        self.heads[bin.index()] = Some(id);
    }

    fn extract_free(&mut self, id: u32) {
        let bin = Bin::round_down(self.size(id));
        let prev = self.prev_free(id);
        let next = self.next_free(id);

        match prev {
            Some(prev) => self.set_next_free(prev, next),
            None => {
                self.heads[bin.index()] = next;
                if next.is_none() {
                    self.clear_bits(bin);
                }
            }
        };
        if let Some(next) = next {
            self.set_prev_free(next, prev);
        }
    }

    /// Finds the first non-empty Bin, that only contains Blocks of at least
    /// the Size of the given Bin
    fn search(&self, start: Bin) -> Option<Bin> {
        let mut bin = start.bin;
        let mut second = self.bitmap_1[bin as usize] & (!0u32 << start.sub_bin);

        if second == 0 {
            let first = self.bitmap_0 & (!0u32).checked_shl(bin + 1).unwrap_or(0);
            if first == 0 {
                return None;
            }

            bin = first.trailing_zeros();
            second = self.bitmap_1[bin as usize];
        }

        Some(Bin {
            bin,
            sub_bin: second.trailing_zeros(),
        })
    }

    /// Merges the physically next Block into the given one
    fn absorb_next(&mut self, id: u32) {
        let next = match self.next_phys(id) {
            Some(next) => next,
            None => return,
        };

        let size = self.size(id) + self.size(next);
        let used = self.is_used(id);
        self.set_size(id, size, used);

        if let Some(after) = self.next_phys(id) {
            self.set_prev_phys(after, Some(id));
        }
    }

    /// Cuts the Block down to `size` bytes, if the Rest is large enough to
    /// form its own Block, and hands the Rest back as free Memory
    fn split(&mut self, id: u32, size: u32) {
        let remainder = self.size(id) - size;
        if remainder < HEADER_SIZE {
            return;
        }

        let after = self.next_phys(id);
        let used = self.is_used(id);
        self.set_size(id, size, used);

        let rest = id + size;
        self.set_size(rest, remainder, false);
        self.set_prev_phys(rest, Some(id));
        if let Some(after) = after {
            self.set_prev_phys(after, Some(rest));
        }

        self.release(rest);
    }

    /// Marks the Block as free, merges it with its free Neighbours and puts
    /// the Result into the Free-Lists
    fn release(&mut self, id: u32) {
        self.mark(id, false);

        if let Some(next) = self.next_phys(id) {
            if !self.is_used(next) {
                self.extract_free(next);
                self.absorb_next(id);
            }
        }

        let mut id = id;
        if let Some(prev) = self.prev_phys(id) {
            if !self.is_used(prev) {
                self.extract_free(prev);
                self.absorb_next(prev);
                id = prev;
            }
        }

        self.insert_free(id);
    }

    /// Takes a Block of at least `size` bytes, Header included, out of the
    /// Heap. The Size has to be a Multiple of [`MIN_ALIGNMENT`].
    pub fn allocate(&mut self, size: u32) -> Option<u32> {
        let (rounded, start) = Bin::round_up(size)?;
        let bin = self.search(start)?;
        let id = self.heads[bin.index()]?;

        self.extract_free(id);
        self.mark(id, true);
        // Splitting at the rounded Size keeps the Block in the Bin that
        // Requests of the same Size search in, once it is freed again
        self.split(id, rounded);

        Some(id)
    }

    pub fn free(&mut self, id: u32) {
        debug_assert!(self.is_used(id));

        // Stale Pointers into the Block must not be mistaken for it anymore
        self.set_word(id + USER, NONE);
        self.release(id);
    }

    /// Attempts to grow the used Block to at least `size` bytes, without
    /// moving it, by taking Memory from the physically next Block
    pub fn grow(&mut self, id: u32, size: u32) -> bool {
        let current = self.size(id);
        if current >= size {
            return true;
        }

        let next = match self.next_phys(id) {
            Some(next) if !self.is_used(next) => next,
            _ => return false,
        };
        if (current as u64 + self.size(next) as u64) < (size as u64) {
            return false;
        }

        self.extract_free(next);
        self.absorb_next(id);
        self.split(id, size);
        true
    }

    /// Shrinks the used Block down to the Bin-Granularity above `size`,
    /// returning the Rest to the Heap
    pub fn shrink(&mut self, id: u32, size: u32) {
        let target = Bin::round_up(size).map_or(size, |(rounded, _)| rounded);
        if self.size(id) > target {
            self.split(id, target);
        }
    }

    /// Calls `f(offset, size, used)` for every Block in Address-Order.
    ///
    /// Stops early at a Block with a Size of zero, which only exists in a
    /// corrupted Heap.
    pub fn walk<F>(&self, mut f: F)
    where
        F: FnMut(u32, u32, bool),
    {
        let mut offset = 0u64;
        while offset < self.capacity as u64 {
            let id = offset as u32;
            let size = self.size(id);
            if size == 0 {
                break;
            }

            f(id, size, self.is_used(id));
            offset += size as u64;
        }
    }

    /// The Number of free Blocks and the Size of the largest one
    pub fn free_summary(&self) -> (usize, u32) {
        let mut count = 0;
        let mut largest = 0;
        self.walk(|_, size, used| {
            if !used {
                count += 1;
                largest = largest.max(size);
            }
        });
        (count, largest)
    }

    /// Checks if the Offset could be the Start of a Block
    fn in_bounds(&self, id: u32) -> bool {
        id & !SIZE_MASK == 0 && id < self.capacity
    }

    /// Checks every Invariant of the Heap, describing the first Violation
    pub fn check(&self) -> Result<(), String> {
        let mut expected_offset = 0u64;
        let mut prev: Option<u32> = None;
        let mut prev_free = false;
        let mut free_blocks = 0;

        while expected_offset < self.capacity as u64 {
            let id = expected_offset as u32;

            if self.prev_phys(id) != prev {
                return Err(format!("block {} has a broken back link", id));
            }
            let size = self.size(id);
            if size == 0 || id as u64 + size as u64 > self.capacity as u64 {
                return Err(format!("block {} has an invalid size {}", id, size));
            }
            if !self.is_used(id) {
                if prev_free {
                    return Err(format!("block {} follows another free block", id));
                }
                free_blocks += 1;
            }

            expected_offset += size as u64;
            prev_free = !self.is_used(id);
            prev = Some(id);
        }

        if expected_offset != self.capacity as u64 {
            return Err(format!(
                "blocks cover {} bytes instead of {}",
                expected_offset, self.capacity
            ));
        }

        let limit = self.capacity as usize / MIN_ALIGNMENT;
        let mut listed = 0;
        for (index, head) in self.heads.iter().enumerate() {
            let bin = index / SUB_BIN_COUNT;
            let sub_bin = index % SUB_BIN_COUNT;
            let marked = self.bitmap_1[bin] & (1 << sub_bin) != 0;
            if marked != head.is_some() {
                return Err(format!("bitmap disagrees with list {}:{}", bin, sub_bin));
            }

            let mut previous = None;
            let mut current = *head;
            while let Some(id) = current {
                listed += 1;
                if listed > limit {
                    return Err("free lists contain a cycle".to_string());
                }
                if !self.in_bounds(id) {
                    return Err(format!("free list {}:{} points to {}", bin, sub_bin, id));
                }

                if self.is_used(id) {
                    return Err(format!("used block {} is in a free list", id));
                }
                if Bin::round_down(self.size(id)).index() != index {
                    return Err(format!("block {} is in the wrong free list", id));
                }
                if self.prev_free(id) != previous {
                    return Err(format!("block {} has a broken free link", id));
                }

                previous = Some(id);
                current = self.next_free(id);
            }
        }

        for bin in 0..BIN_COUNT {
            let marked = self.bitmap_0 & (1 << bin) != 0;
            if marked != (self.bitmap_1[bin] != 0) {
                return Err(format!("first level bitmap disagrees with bin {}", bin));
            }
        }

        if listed != free_blocks {
            return Err(format!(
                "{} free blocks but {} are listed",
                free_blocks, listed
            ));
        }

        Ok(())
    }

    #[cfg(test)]
    pub(super) fn corrupt(&mut self) {
        let size = self.size(0) + HEADER_SIZE;
        let used = self.is_used(0);
        self.set_size(0, size, used);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;

    fn heap(arena: &Arena<'_>) -> Heap {
        // # Safety:
        // The Arena outlives the Heap in every Test
        unsafe { Heap::new(arena.ptr_at(0), arena.len() as u32) }
    }

    #[test]
    fn binning() {
        assert_eq!(Bin { bin: 0, sub_bin: 1 }, Bin::round_down(16));
        assert_eq!(Bin { bin: 0, sub_bin: 15 }, Bin::round_down(240));
        assert_eq!(Bin { bin: 1, sub_bin: 0 }, Bin::round_down(256));
        assert_eq!(Bin { bin: 1, sub_bin: 15 }, Bin::round_down(511));
        assert_eq!(Bin { bin: 2, sub_bin: 0 }, Bin::round_down(512));
        assert_eq!(Bin { bin: 2, sub_bin: 1 }, Bin::round_down(544));
        assert_eq!(
            Bin {
                bin: BIN_COUNT as u32 - 1,
                sub_bin: 15
            },
            Bin::round_down(u32::MAX)
        );
    }

    #[test]
    fn rounding_up() {
        assert_eq!(Some((48, Bin { bin: 0, sub_bin: 3 })), Bin::round_up(48));
        assert_eq!(Some((512, Bin { bin: 2, sub_bin: 0 })), Bin::round_up(500));
        assert_eq!(Some((544, Bin { bin: 2, sub_bin: 1 })), Bin::round_up(528));
        assert_eq!(None, Bin::round_up(u32::MAX - 8));
    }

    #[test]
    fn headers_live_in_the_arena() {
        let arena = Arena::allocate(1024, MIN_ALIGNMENT).unwrap();
        let mut heap = heap(&arena);

        let a = heap.allocate(64).unwrap();
        heap.set_allocation(a, a + HEADER_SIZE, 7);

        assert_eq!(64 | USED, heap.word(a + SIZE));
        assert_eq!(NONE, heap.word(a + PREV_PHYS));
        assert_eq!(7, heap.tag(a));
        assert!(heap.is_allocation(a, a + HEADER_SIZE));
        assert!(!heap.is_allocation(a, a + 2 * HEADER_SIZE));

        // The Rest was split off right behind the Block
        assert_eq!(1024 - 64, heap.size(64));
        assert_eq!(Some(a), heap.prev_phys(64));

        heap.free(a);
        assert!(!heap.is_allocation(a, a + HEADER_SIZE));
    }

    #[test]
    fn split_and_merge() {
        let arena = Arena::allocate(1024, MIN_ALIGNMENT).unwrap();
        let mut heap = heap(&arena);

        let a = heap.allocate(64).unwrap();
        let b = heap.allocate(64).unwrap();
        let c = heap.allocate(64).unwrap();
        assert_eq!(0, a);
        assert_eq!(64, b);
        assert_eq!(128, c);
        assert_eq!(Ok(()), heap.check());
        assert_eq!((1, 1024 - 192), heap.free_summary());

        heap.free(b);
        assert_eq!((2, 1024 - 192), heap.free_summary());
        heap.free(c);
        assert_eq!((1, 1024 - 64), heap.free_summary());
        heap.free(a);
        assert_eq!((1, 1024), heap.free_summary());
        assert_eq!(Ok(()), heap.check());
    }

    #[test]
    fn exhaustion() {
        let arena = Arena::allocate(256, MIN_ALIGNMENT).unwrap();
        let mut heap = heap(&arena);

        assert!(heap.allocate(256).is_some());
        assert_eq!(None, heap.allocate(16));
    }

    #[test]
    fn grow_in_place() {
        let arena = Arena::allocate(1024, MIN_ALIGNMENT).unwrap();
        let mut heap = heap(&arena);

        let a = heap.allocate(64).unwrap();
        let b = heap.allocate(64).unwrap();
        assert!(!heap.grow(a, 128));

        heap.free(b);
        assert!(heap.grow(a, 128));
        assert_eq!(128, heap.size(a));
        assert_eq!(Ok(()), heap.check());

        heap.shrink(a, 32);
        assert_eq!(32, heap.size(a));
        assert_eq!((1, 1024 - 32), heap.free_summary());
        assert_eq!(Ok(()), heap.check());
    }

    #[test]
    fn detects_corruption() {
        let arena = Arena::allocate(1024, MIN_ALIGNMENT).unwrap();
        let mut heap = heap(&arena);
        heap.allocate(64).unwrap();

        heap.corrupt();
        assert!(heap.check().is_err());
    }

    #[test]
    fn reset_frees_everything() {
        let arena = Arena::allocate(512, MIN_ALIGNMENT).unwrap();
        let mut heap = heap(&arena);
        heap.allocate(128).unwrap();
        heap.allocate(128).unwrap();

        heap.reset();
        assert_eq!((1, 512), heap.free_summary());
        assert_eq!(Ok(()), heap.check());
    }
}
