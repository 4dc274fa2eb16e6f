//! A Name-to-Handle Table, whose Handles are created and destroyed later by a
//! single dedicated Thread
//!
//! Creating the actual Handles often has to happen on one specific Thread,
//! for example because they live on a Device that is not thread-safe. The
//! Registry is therefore split into two Halves:
//! * [`Registry`]: can be cloned and shared with any Number of Threads, which
//!   request Entries to be made or unmade. Requesting never touches the
//!   underlying Resource and returns immediately.
//! * [`Flusher`]: owns the [`Lifetime`] and performs the pending Requests,
//!   whenever [`Flusher::flush`] is called on the Thread that is allowed to.
//!
//! Until an Entry has been flushed, it shows one of the Placeholders that
//! were created together with the Registry.
//!
//! # Blocking
//! [`Registry::get`] never blocks. Everything else that accesses a single
//! Entry ([`Registry::make`], [`Registry::unmake`], [`Registry::value`], ...)
//! locks that Entry for a short Moment, so it can wait on a Flush of that
//! same Entry. [`Registry::make`] and [`Registry::unmake`] also wait while
//! the Flusher compacts the Lookup, which only happens after more Entries
//! than the Lookup can hold have been unmade since the last Compaction.
//!
//! # Example
//! ```rust
//! # use memsync::{config::RegistryConfig, registry::{registry, Lifetime, Placeholders}};
//! struct Strings;
//!
//! impl Lifetime for Strings {
//!     type Payload = String;
//!     type Handle = String;
//!     type Error = String;
//!
//!     fn create(&mut self, payload: String, _name: &str) -> Result<String, String> {
//!         Ok(payload.to_uppercase())
//!     }
//!     fn destroy(&mut self, _handle: String) {}
//! }
//!
//! let placeholders = Placeholders {
//!     missing: "missing".to_string(),
//!     failed: "failed".to_string(),
//!     making: "making".to_string(),
//! };
//! let (mut flusher, registry) =
//!     registry(RegistryConfig::default(), Strings, placeholders).unwrap();
//!
//! let entry = registry.make_named("greeting", "hello".to_string(), None, false).unwrap();
//! assert_eq!(Some("MAKING".to_string()), registry.value(entry));
//!
//! flusher.flush(10);
//! assert_eq!(Some("HELLO".to_string()), registry.value(entry));
//! ```

mod record;
pub use record::{Entry, EntryState, Placeholders};

use std::{
    fmt::{Debug, Display},
    ops::Deref,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::{MutexGuard, RwLock};
use thiserror::Error;

use crate::{
    config::RegistryConfig,
    error::ConfigError,
    hash_map::{ConcurrentHashMap, HashMapError, NULL_KEY, NULL_VALUE},
    pool::ConcurrentPool,
    queue::ConcurrentQueue,
};

use record::{FileInfo, Record};

/// Creates and destroys the Handles of a Registry
///
/// Both Operations are only ever called by the [`Flusher`], so they may rely
/// on running on the Thread that owns the Flusher.
pub trait Lifetime {
    /// The Data needed to create a Handle
    type Payload: Send;
    /// The Handle handed out to Users of the Registry
    type Handle: Clone + Send + Sync;
    /// The Error returned by a failed Creation
    type Error: Display;

    /// Creates the Handle for the Entry with the given Name
    fn create(&mut self, payload: Self::Payload, name: &str) -> Result<Self::Handle, Self::Error>;

    /// Destroys a Handle that was previously created
    fn destroy(&mut self, handle: Self::Handle);
}

/// The Errors returned by the Registry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The Registry could not be set up
    #[error("invalid registry configuration: {0}")]
    Config(#[from] ConfigError),
    /// One of the Placeholders could not be created
    #[error("creating the {name:?} placeholder failed: {reason}")]
    Placeholder {
        /// The Name of the Placeholder
        name: &'static str,
        /// The Error returned by the Lifetime
        reason: String,
    },
    /// The [`NULL_KEY`] was used as a Key
    #[error("the null key can't be used as a registry key")]
    NullKey,
    /// Every Entry is already in use
    #[error("every entry of the registry is in use")]
    Full,
    /// The Entry was unmade and its Slot may have been reused
    #[error("the entry {0:?} is no longer valid")]
    Stale(Entry),
    /// Placeholders can't be unmade
    #[error("the placeholder {0:?} can't be unmade")]
    PermanentEntry(Entry),
    /// The Flusher was dropped, so nothing will be made anymore
    #[error("the flusher of the registry was dropped")]
    Closed,
}

impl From<HashMapError> for RegistryError {
    fn from(e: HashMapError) -> Self {
        match e {
            HashMapError::NullKey => Self::NullKey,
            HashMapError::Full | HashMapError::TooSmall { .. } => Self::Full,
        }
    }
}

/// Hashes a Name into the Key used for it in the Registry (64-bit FNV-1a).
///
/// The result is never the [`NULL_KEY`].
pub fn hash_name(name: &str) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;

    let hash = name.bytes().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ byte as u64).wrapping_mul(PRIME)
    });

    if hash == NULL_KEY {
        0
    } else {
        hash
    }
}

/// One of the two Lookups, which can't be rebuilt while it is pinned
struct Pinned<'a> {
    map: &'a ConcurrentHashMap,
    readers: &'a AtomicUsize,
}

impl<'a> Deref for Pinned<'a> {
    type Target = ConcurrentHashMap;

    fn deref(&self) -> &Self::Target {
        self.map
    }
}

impl<'a> Drop for Pinned<'a> {
    fn drop(&mut self) {
        self.readers.fetch_sub(1, Ordering::Release);
    }
}

struct Shared<L: Lifetime> {
    entries: ConcurrentPool<FileInfo<L::Payload, L::Handle>>,
    /// The Lookup from Keys to Entries. Only `lookups[current]` is in use,
    /// the other one is rebuilt from it without Tombstones when compacting.
    lookups: [ConcurrentHashMap; 2],
    current: AtomicUsize,
    /// The Number of Readers pinning each of the Lookups
    readers: [AtomicUsize; 2],
    /// Held shared while modifying the Lookup and exclusively while compacting
    compacting: RwLock<()>,
    makes: ConcurrentQueue<u32>,
    unmakes: ConcurrentQueue<u32>,
    pending: AtomicUsize,
    placeholders: Placeholders<(Entry, L::Handle)>,
    closed: AtomicBool,
    config: RegistryConfig,
}

impl<L: Lifetime> Shared<L> {
    fn info(&self, index: u32) -> &FileInfo<L::Payload, L::Handle> {
        match self.entries.get(index) {
            Some(info) => info,
            None => unreachable!("registry queues only hold indices of its own entries"),
        }
    }

    /// Locks the Record of the Entry, if the Entry is still valid
    fn lock(
        &self,
        entry: Entry,
    ) -> Result<MutexGuard<'_, Record<L::Payload, L::Handle>>, RegistryError> {
        let info = self
            .entries
            .get(entry.index)
            .ok_or(RegistryError::Stale(entry))?;

        let record = info.record.lock();
        if info.generation.load(Ordering::Acquire) != entry.generation || record.state.is_none()
        {
            return Err(RegistryError::Stale(entry));
        }

        Ok(record)
    }

    /// Pins the current Lookup for reading, without blocking
    fn pin(&self) -> Pinned<'_> {
        loop {
            let current = self.current.load(Ordering::SeqCst);
            self.readers[current].fetch_add(1, Ordering::SeqCst);

            // The Lookup was switched before we got to announce ourselves
            if self.current.load(Ordering::SeqCst) == current {
                return Pinned {
                    map: &self.lookups[current],
                    readers: &self.readers[current],
                };
            }
            self.readers[current].fetch_sub(1, Ordering::Release);
        }
    }

    /// Runs `f` on the current Lookup, which will not be compacted until `f`
    /// returns
    fn modify<R>(&self, f: impl FnOnce(&ConcurrentHashMap) -> R) -> R {
        let _gate = self.compacting.read();
        f(&self.lookups[self.current.load(Ordering::Acquire)])
    }

    /// Copies every live Key into the spare Lookup and switches over to it.
    ///
    /// # Returns
    /// The Number of Keys that were kept
    fn compact(&self) -> usize {
        let _gate = self.compacting.write();
        let current = self.current.load(Ordering::Acquire);
        let spare = 1 - current;

        // Readers that pinned the spare Lookup before the last Switch may
        // still be using it
        while self.readers[spare].load(Ordering::SeqCst) != 0 {
            std::hint::spin_loop();
        }

        let target = &self.lookups[spare];
        target.reset();

        let mut kept = 0;
        for (key, value) in self.lookups[current].entries() {
            match target.insert(key, value) {
                Ok(_) => kept += 1,
                Err(e) => log::error!("Moving key {} into the compacted lookup: {}", key, e),
            };
        }

        self.current.store(spare, Ordering::SeqCst);
        kept
    }

    fn enqueue(&self, queue: &ConcurrentQueue<u32>, index: u32) -> Result<(), RegistryError> {
        if queue.push(index).is_err() {
            log::error!("Registry request queue is full, dropping request for {}", index);
            return Err(RegistryError::Full);
        }

        self.pending.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn dequeue(&self, queue: &ConcurrentQueue<u32>) -> Option<u32> {
        let index = queue.try_pop()?;
        self.pending.fetch_sub(1, Ordering::Relaxed);
        Some(index)
    }
}

/// The Half of a Registry that requests Entries to be made or unmade
pub struct Registry<L: Lifetime> {
    shared: Arc<Shared<L>>,
}

/// The Half of a Registry that owns the [`Lifetime`] and carries out the
/// Requests
pub struct Flusher<L: Lifetime> {
    shared: Arc<Shared<L>>,
    lifetime: L,
    /// The Number of Keys removed from the Lookup since it was last compacted
    removed: usize,
}

/// Creates a new Registry with room for `config.capacity` Entries.
///
/// The Placeholders are created right away, using the given Lifetime.
pub fn registry<L: Lifetime>(
    config: RegistryConfig,
    mut lifetime: L,
    placeholders: Placeholders<L::Payload>,
) -> Result<(Flusher<L>, Registry<L>), RegistryError> {
    let total = config
        .capacity
        .checked_add(Placeholders::<L::Payload>::NAMES.len())
        .ok_or(ConfigError::CapacityOverflow {
            requested: config.capacity,
            max: usize::MAX - Placeholders::<L::Payload>::NAMES.len(),
        })?;

    let entries = ConcurrentPool::new_with(total, |_| FileInfo::free())?;
    let lookup = ConcurrentHashMap::with_capacity(total)?;
    let spare = ConcurrentHashMap::with_capacity(total)?;
    let makes = ConcurrentQueue::new(total)?;
    let unmakes = ConcurrentQueue::new(total)?;

    let mut created: Vec<(Entry, L::Handle)> = Vec::with_capacity(3);
    for (name, payload) in placeholders.into_named() {
        let handle = match lifetime.create(payload, name) {
            Ok(handle) => handle,
            Err(e) => {
                for (_, handle) in created {
                    lifetime.destroy(handle);
                }
                return Err(RegistryError::Placeholder {
                    name,
                    reason: e.to_string(),
                });
            }
        };

        let index = match entries.allocate() {
            Some(index) => index,
            None => unreachable!("the entry pool has room for the placeholders"),
        };
        let key = hash_name(name);
        lookup.insert(key, index as u64)?;

        if let Some(info) = entries.get(index) {
            let mut record = info.record.lock();
            record.key = key;
            record.name = name.to_string();
            record.state = Some(EntryState::Placeholder);
            record.real = Some(handle.clone());
        }

        created.push((
            Entry {
                index,
                generation: 0,
            },
            handle,
        ));
    }

    let mut created = created.into_iter();
    let (missing, failed, making) = match (created.next(), created.next(), created.next()) {
        (Some(missing), Some(failed), Some(making)) => (missing, failed, making),
        _ => unreachable!("exactly three placeholders are created"),
    };

    log::debug!("Created registry with {} entries", config.capacity);

    let shared = Arc::new(Shared {
        entries,
        lookups: [lookup, spare],
        current: AtomicUsize::new(0),
        readers: [AtomicUsize::new(0), AtomicUsize::new(0)],
        compacting: RwLock::new(()),
        makes,
        unmakes,
        pending: AtomicUsize::new(0),
        placeholders: Placeholders {
            missing,
            failed,
            making,
        },
        closed: AtomicBool::new(false),
        config,
    });

    Ok((
        Flusher {
            shared: shared.clone(),
            lifetime,
            removed: 0,
        },
        Registry { shared },
    ))
}

impl<L: Lifetime> Registry<L> {
    /// Requests the Entry for the Key to be made from the Payload.
    ///
    /// * If there is no Entry for the Key yet, a new one is created that
    ///   shows the "making" Placeholder until the next Flush.
    /// * If the Entry already has been made, it is returned as is and the
    ///   Payload is dropped, unless `force` is set, in which case it will be
    ///   made again. The old Handle stays visible until the new one replaces
    ///   it.
    /// * Otherwise the Payload replaces any Payload still waiting to be made.
    ///
    /// This locks the Entry and may wait for a Compaction of the Lookup, see
    /// [Blocking](crate::registry#blocking).
    pub fn make(
        &self,
        key: u64,
        name: impl Into<String>,
        payload: L::Payload,
        path: Option<PathBuf>,
        force: bool,
    ) -> Result<Entry, RegistryError> {
        if key == NULL_KEY {
            return Err(RegistryError::NullKey);
        }
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(RegistryError::Closed);
        }
        let name = name.into();

        loop {
            let existing = self.shared.pin().get(key);

            if existing != NULL_VALUE {
                let index = existing as u32;
                let info = self.shared.info(index);
                let mut record = info.record.lock();

                // The Entry was unmade and possibly reused before we got the
                // Lock, so we have to look it up again
                if record.key != key || record.state.is_none() {
                    continue;
                }

                let entry = Entry {
                    index,
                    generation: info.generation.load(Ordering::Acquire),
                };

                match record.state {
                    Some(EntryState::Placeholder) => return Ok(entry),
                    Some(EntryState::Made) if !force => return Ok(entry),
                    _ => {}
                };

                // Nothing changes, if the Request can't be queued
                if !record.queued_make {
                    self.shared.enqueue(&self.shared.makes, index)?;
                    record.queued_make = true;
                }

                record.name = name;
                record.path = path;
                record.pending = Some(payload);
                record.state = Some(EntryState::Making);

                return Ok(entry);
            }

            let index = self.shared.entries.allocate().ok_or(RegistryError::Full)?;
            let info = self.shared.info(index);
            let mut record = info.record.lock();

            match self.shared.modify(|lookup| lookup.insert(key, index as u64)) {
                Ok(NULL_VALUE) => {}
                Ok(_) => {
                    // Another Thread created the Entry first, so use theirs
                    drop(record);
                    self.release_slot(index);
                    continue;
                }
                Err(e) => {
                    drop(record);
                    self.release_slot(index);
                    return Err(e.into());
                }
            };

            *record = Record {
                key,
                name,
                path,
                state: Some(EntryState::Making),
                pending: Some(payload),
                real: None,
                failed: false,
                queued_make: false,
                queued_unmake: false,
            };

            let entry = Entry {
                index,
                generation: info.generation.load(Ordering::Acquire),
            };

            if let Err(e) = self.shared.enqueue(&self.shared.makes, index) {
                self.shared.modify(|lookup| lookup.remove(key));
                *record = Record::free();
                drop(record);
                self.release_slot(index);
                return Err(e);
            }
            record.queued_make = true;

            log::trace!("Registered {:?} as {:?}", record.name, entry);
            return Ok(entry);
        }
    }

    /// Requests the Entry for the Name to be made, see [`Registry::make`]
    pub fn make_named(
        &self,
        name: &str,
        payload: L::Payload,
        path: Option<PathBuf>,
        force: bool,
    ) -> Result<Entry, RegistryError> {
        self.make(hash_name(name), name, payload, path, force)
    }

    fn release_slot(&self, index: u32) {
        if let Err(e) = self.shared.entries.deallocate(index) {
            log::error!("Releasing registry entry {}: {}", index, e);
        }
    }

    /// Requests the Entry to be destroyed on the next Flush.
    ///
    /// Until then, the Entry still shows its last Value. This locks the Entry,
    /// see [Blocking](crate::registry#blocking).
    pub fn unmake(&self, entry: Entry) -> Result<(), RegistryError> {
        let mut record = self.shared.lock(entry)?;

        match record.state {
            Some(EntryState::Placeholder) => return Err(RegistryError::PermanentEntry(entry)),
            Some(EntryState::Unmaking) => return Ok(()),
            _ => {}
        };

        record.state = Some(EntryState::Unmaking);
        record.pending = None;

        if !record.queued_unmake {
            self.shared.enqueue(&self.shared.unmakes, entry.index)?;
            record.queued_unmake = true;
        }

        Ok(())
    }

    /// Looks up the Entry for the Key, without blocking
    pub fn get(&self, key: u64) -> Option<Entry> {
        let lookup = self.shared.pin();

        loop {
            let value = lookup.get(key);
            if value == NULL_VALUE {
                return None;
            }

            let index = value as u32;
            let generation = self.shared.info(index).generation.load(Ordering::Acquire);

            // Make sure the Slot was not handed to another Key, while we
            // loaded the Generation
            if lookup.get(key) == value {
                return Some(Entry { index, generation });
            }
        }
    }

    /// Looks up the Entry for the Name, see [`Registry::get`]
    pub fn get_by_name(&self, name: &str) -> Option<Entry> {
        self.get(hash_name(name))
    }

    /// The Handle the Entry currently shows.
    ///
    /// This is the most recently created Handle or, if there is none, the
    /// "failed" or "making" Placeholder. Once the [`Flusher`] was dropped,
    /// every Handle is destroyed and there is no Value anymore.
    ///
    /// This locks the Entry, see [Blocking](crate::registry#blocking).
    pub fn value(&self, entry: Entry) -> Option<L::Handle> {
        if self.shared.closed.load(Ordering::Acquire) {
            return None;
        }
        let record = self.shared.lock(entry).ok()?;

        if let Some(real) = record.real.as_ref() {
            return Some(real.clone());
        }

        let (_, placeholder) = if record.failed {
            &self.shared.placeholders.failed
        } else {
            &self.shared.placeholders.making
        };
        Some(placeholder.clone())
    }

    /// The current State of the Entry
    pub fn state(&self, entry: Entry) -> Option<EntryState> {
        self.shared.lock(entry).ok()?.state
    }

    /// The Name of the Entry
    pub fn name(&self, entry: Entry) -> Option<String> {
        Some(self.shared.lock(entry).ok()?.name.clone())
    }

    /// The Path the Entry was made from, if one was given
    pub fn path(&self, entry: Entry) -> Option<PathBuf> {
        self.shared.lock(entry).ok()?.path.clone()
    }

    /// The Number of Entries in use, not counting the Placeholders
    pub fn len(&self) -> usize {
        let entries = &self.shared.entries;
        (entries.capacity() - entries.count_available())
            .saturating_sub(Placeholders::<L::Payload>::NAMES.len())
    }

    /// Checks if no Entries are in use
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The Number of Requests waiting for the next Flush
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Relaxed)
    }

    /// The Entry of the "missing" Placeholder
    pub fn missing(&self) -> Entry {
        self.shared.placeholders.missing.0
    }

    /// The Entry of the "failed" Placeholder
    pub fn failed(&self) -> Entry {
        self.shared.placeholders.failed.0
    }

    /// The Entry of the "making" Placeholder
    pub fn making(&self) -> Entry {
        self.shared.placeholders.making.0
    }

    /// The Configuration the Registry was created with
    pub fn config(&self) -> &RegistryConfig {
        &self.shared.config
    }
}

impl<L: Lifetime> Clone for Registry<L> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<L: Lifetime> Debug for Registry<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Registry<{}> (entries: {}, pending: {})",
            std::any::type_name::<L>(),
            self.len(),
            self.pending()
        )
    }
}

impl<L: Lifetime> Flusher<L> {
    /// Carries out up to `max_operations` pending Requests, Makes before
    /// Unmakes.
    ///
    /// # Returns
    /// The Number of Requests that were processed
    pub fn flush(&mut self, max_operations: usize) -> usize {
        let mut processed = 0;

        while processed < max_operations {
            if let Some(index) = self.shared.dequeue(&self.shared.makes) {
                self.make_one(index);
            } else if let Some(index) = self.shared.dequeue(&self.shared.unmakes) {
                self.unmake_one(index);
            } else {
                break;
            }
            processed += 1;
        }

        if self.removed > self.shared.lookups[0].capacity() {
            let kept = self.shared.compact();
            log::debug!(
                "Compacted registry lookup after {} removals, kept {} keys",
                self.removed,
                kept
            );
            self.removed = 0;
        }

        if processed > 0 {
            log::debug!("Flushed {} registry requests", processed);
        }

        processed
    }

    /// Carries out up to `flush_batch` pending Requests, as configured
    pub fn flush_batch(&mut self) -> usize {
        self.flush(self.shared.config.flush_batch)
    }

    /// The Lifetime used to create and destroy the Handles
    pub fn lifetime(&self) -> &L {
        &self.lifetime
    }

    /// The Lifetime used to create and destroy the Handles
    pub fn lifetime_mut(&mut self) -> &mut L {
        &mut self.lifetime
    }

    fn make_one(&mut self, index: u32) {
        let info = self.shared.info(index);

        let (payload, name) = {
            let mut record = info.record.lock();
            record.queued_make = false;

            if record.state != Some(EntryState::Making) {
                return;
            }
            match record.pending.take() {
                Some(payload) => (payload, record.name.clone()),
                None => return,
            }
        };

        // The Lock is not held during the Creation, so Users can keep on
        // reading the old Value
        let created = self.lifetime.create(payload, &name);

        let mut record = info.record.lock();
        let settled = record.state == Some(EntryState::Making) && record.pending.is_none();

        match created {
            Ok(handle) => {
                let old = record.real.replace(handle);
                record.failed = false;
                if settled {
                    record.state = Some(EntryState::Made);
                }
                drop(record);

                log::trace!("Made {:?}", name);
                if let Some(old) = old {
                    self.lifetime.destroy(old);
                }
            }
            Err(e) => {
                log::warn!("Making {:?} failed: {}", name, e);

                if record.real.is_none() {
                    record.failed = true;
                }
                if settled {
                    record.state = Some(if record.real.is_some() {
                        EntryState::Made
                    } else {
                        EntryState::Failed
                    });
                }
            }
        };
    }

    fn unmake_one(&mut self, index: u32) {
        let info = self.shared.info(index);

        let mut record = info.record.lock();
        record.queued_unmake = false;

        // It was made again after the Request
        if record.state != Some(EntryState::Unmaking) {
            return;
        }

        let real = record.real.take();
        let key = record.key;
        self.shared.modify(|lookup| lookup.remove(key));
        info.generation.fetch_add(1, Ordering::AcqRel);
        log::trace!("Unmade {:?}", record.name);
        *record = Record::free();
        drop(record);

        self.removed += 1;
        if let Err(e) = self.shared.entries.deallocate(index) {
            log::error!("Releasing registry entry {}: {}", index, e);
        }

        if let Some(real) = real {
            self.lifetime.destroy(real);
        }
    }
}

impl<L: Lifetime> Debug for Flusher<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Flusher<{}> ()", std::any::type_name::<L>())
    }
}

impl<L: Lifetime> Drop for Flusher<L> {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);

        let mut destroyed = 0;
        for (_, info) in self.shared.entries.iter() {
            let real = info.record.lock().real.take();
            if let Some(real) = real {
                self.lifetime.destroy(real);
                destroyed += 1;
            }
        }

        log::debug!("Destroyed {} registry handles", destroyed);
    }
}
