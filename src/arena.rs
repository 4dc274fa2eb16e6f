//! A contiguous byte region that an allocator is overlaid on
//!
//! An Arena either owns its memory, in which case it was obtained from the
//! system allocator and is released again once the Arena is dropped, or it
//! borrows memory supplied by the caller, which then has to outlive the
//! Arena. The borrow is tracked by the lifetime parameter.
//!
//! # Example
//! ```rust
//! # use memsync::arena::Arena;
//! let mut backing = vec![0u8; 256];
//! let arena = Arena::from_slice(&mut backing);
//!
//! assert_eq!(256, arena.len());
//! assert!(!arena.owns_memory());
//! ```

use std::{
    alloc::{self, Layout},
    fmt::Debug,
    marker::PhantomData,
    ptr::NonNull,
};

use crate::error::ConfigError;

/// A Region of raw Memory
pub struct Arena<'a> {
    ptr: NonNull<u8>,
    len: usize,
    /// The Layout used to obtain the Memory, only set if we own it
    layout: Option<Layout>,
    _marker: PhantomData<&'a mut [u8]>,
}

impl Arena<'static> {
    /// Obtains a new zeroed Arena of `len` bytes from the system allocator,
    /// starting at an address aligned to `align`.
    ///
    /// The Memory is returned to the system allocator once the Arena is
    /// dropped.
    pub fn allocate(len: usize, align: usize) -> Result<Self, ConfigError> {
        if !align.is_power_of_two() {
            return Err(ConfigError::InvalidAlignment(align));
        }

        // Zero-sized allocations are not allowed by the system allocator, so
        // we always request at least one byte
        let layout = Layout::from_size_align(len.max(1), align)
            .map_err(|_| ConfigError::OutOfMemory(len))?;

        // # Safety:
        // The Layout has a non-zero size
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(ConfigError::OutOfMemory(len))?;

        log::debug!("Allocated arena of {} bytes at {:p}", len, ptr);

        Ok(Self {
            ptr,
            len,
            layout: Some(layout),
            _marker: PhantomData,
        })
    }
}

impl<'a> Arena<'a> {
    /// Wraps caller-owned Memory, which has to outlive the Arena
    pub fn from_slice(slice: &'a mut [u8]) -> Self {
        let len = slice.len();
        // A slice pointer is never null, even for empty slices
        let ptr = NonNull::new(slice.as_mut_ptr()).unwrap_or_else(NonNull::dangling);

        Self {
            ptr,
            len,
            layout: None,
            _marker: PhantomData,
        }
    }

    /// The Length of the Arena in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Checks if the Arena has a length of zero
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether or not the Arena will release its Memory once dropped
    pub fn owns_memory(&self) -> bool {
        self.layout.is_some()
    }

    /// The Start of the Arena
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// The Start of the Arena
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Checks if the Start of the Arena is aligned to `align` bytes
    pub fn is_aligned(&self, align: usize) -> bool {
        align.is_power_of_two() && (self.ptr.as_ptr() as usize) & (align - 1) == 0
    }

    /// Returns the Offset of the given Pointer from the Start of the Arena,
    /// if it points into the Arena
    pub fn offset_of(&self, ptr: *const u8) -> Option<usize> {
        let offset = (ptr as usize).checked_sub(self.ptr.as_ptr() as usize)?;
        if offset < self.len {
            Some(offset)
        } else {
            None
        }
    }

    /// Checks if the given Pointer points into the Arena
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.offset_of(ptr).is_some()
    }

    /// Returns a Pointer to the Byte at the given Offset
    pub(crate) fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset <= self.len);

        // # Safety:
        // The Offset is within the Bounds of the Arena (or one past its end),
        // so the resulting Pointer is in bounds and not null
        unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) }
    }
}

impl<'a> Debug for Arena<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("owns_memory", &self.owns_memory())
            .finish()
    }
}

impl<'a> Drop for Arena<'a> {
    fn drop(&mut self) {
        if let Some(layout) = self.layout.take() {
            // # Safety:
            // The Memory was obtained from the system allocator using exactly
            // this Layout and is only released here
            unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

// Safety:
// The Arena behaves like a `&mut [u8]` or a `Box<[u8]>`, both of which can be
// sent across threads
unsafe impl<'a> Send for Arena<'a> {}
// Safety:
// Shared access only exposes raw pointers and the length, any actual access
// to the memory goes through the allocator that owns the Arena
unsafe impl<'a> Sync for Arena<'a> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_aligned() {
        let arena = Arena::allocate(1024, 64).unwrap();

        assert_eq!(1024, arena.len());
        assert!(arena.is_aligned(64));
        assert!(arena.owns_memory());
    }

    #[test]
    fn allocate_invalid_alignment() {
        assert_eq!(
            ConfigError::InvalidAlignment(24),
            Arena::allocate(1024, 24).unwrap_err()
        );
    }

    #[test]
    fn borrowed_slice() {
        let mut backing = vec![0u8; 32];
        let arena = Arena::from_slice(&mut backing);

        assert_eq!(32, arena.len());
        assert!(!arena.owns_memory());
    }

    #[test]
    fn offsets() {
        let arena = Arena::allocate(16, 16).unwrap();
        let start = arena.as_ptr();

        assert_eq!(Some(0), arena.offset_of(start));
        assert_eq!(Some(15), arena.offset_of(start.wrapping_add(15)));
        assert_eq!(None, arena.offset_of(start.wrapping_add(16)));
        assert!(!arena.contains(std::ptr::null()));
    }
}
