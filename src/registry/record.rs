use std::{path::PathBuf, sync::atomic::AtomicU32};

use parking_lot::Mutex;

/// A Reference to an Entry of a Registry
///
/// The Generation makes sure that an Entry, that was unmade in the meantime
/// and whose Slot is now used for another Name, is not mistaken for the
/// original one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Entry {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl Entry {
    /// The Slot used by the Entry
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The Generation of the Slot this Entry refers to
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// The State of an Entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// The Entry is waiting for its Handle to be created on the next Flush
    Making,
    /// The Handle was created successfully
    Made,
    /// The last Creation failed and there is no Handle
    Failed,
    /// The Entry will be destroyed on the next Flush
    Unmaking,
    /// One of the permanent Placeholders
    Placeholder,
}

/// The Values that exist once for every Registry, one of each Kind of
/// Placeholder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholders<T> {
    /// Used for Names that were never made
    pub missing: T,
    /// Shown by Entries whose Creation failed
    pub failed: T,
    /// Shown by Entries that are waiting for their first Creation
    pub making: T,
}

impl<T> Placeholders<T> {
    /// The Names under which the Placeholders are registered
    pub const NAMES: [&'static str; 3] = ["missing", "failed", "making"];

    pub(crate) fn into_named(self) -> [(&'static str, T); 3] {
        let [missing, failed, making] = Self::NAMES;
        [
            (missing, self.missing),
            (failed, self.failed),
            (making, self.making),
        ]
    }
}

pub(crate) struct Record<P, H> {
    pub key: u64,
    pub name: String,
    pub path: Option<PathBuf>,
    /// `None` while the Slot is free
    pub state: Option<EntryState>,
    /// The Payload for the next Creation
    pub pending: Option<P>,
    /// The most recently created Handle
    pub real: Option<H>,
    /// Whether the last Creation failed
    pub failed: bool,
    pub queued_make: bool,
    pub queued_unmake: bool,
}

impl<P, H> Record<P, H> {
    pub fn free() -> Self {
        Self {
            key: 0,
            name: String::new(),
            path: None,
            state: None,
            pending: None,
            real: None,
            failed: false,
            queued_make: false,
            queued_unmake: false,
        }
    }
}

pub(crate) struct FileInfo<P, H> {
    /// Bumped every time the Slot is freed, only modified while holding the
    /// Lock of the Record
    pub generation: AtomicU32,
    pub record: Mutex<Record<P, H>>,
}

impl<P, H> FileInfo<P, H> {
    pub fn free() -> Self {
        Self {
            generation: AtomicU32::new(0),
            record: Mutex::new(Record::free()),
        }
    }
}
