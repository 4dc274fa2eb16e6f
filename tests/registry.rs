use std::{
    collections::HashSet,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use memsync::{
    config::RegistryConfig,
    registry::{registry, EntryState, Lifetime, Placeholders},
};
use parking_lot::Mutex;
use test_env_log::test;

/// Hands out increasing Ids and tracks which of them are alive
#[derive(Default)]
struct Tracker {
    next: u64,
    alive: Arc<Mutex<HashSet<u64>>>,
}

impl Lifetime for Tracker {
    type Payload = u64;
    type Handle = u64;
    type Error = String;

    fn create(&mut self, payload: u64, name: &str) -> Result<u64, String> {
        if payload == 0 {
            return Err(format!("{} has no content", name));
        }

        self.next += 1;
        self.alive.lock().insert(self.next);
        Ok(self.next)
    }

    fn destroy(&mut self, handle: u64) {
        assert!(self.alive.lock().remove(&handle), "destroyed {} twice", handle);
    }
}

fn placeholders() -> Placeholders<u64> {
    Placeholders {
        missing: 1,
        failed: 1,
        making: 1,
    }
}

#[test]
fn concurrent_make_and_flush() {
    let config = RegistryConfig::builder().capacity(256).flush_batch(16).build();
    let tracker = Tracker::default();
    let alive = tracker.alive.clone();
    let (mut flusher, registry) = registry(config, tracker, placeholders()).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let producers: Vec<_> = (0..4)
        .map(|thread| {
            let c_registry = registry.clone();
            thread::spawn(move || {
                for i in 0..64 {
                    let name = format!("{}/{}", thread, i);
                    let path = PathBuf::from(format!("assets/{}.bin", name));
                    let entry = c_registry
                        .make_named(&name, i + 1, Some(path), false)
                        .unwrap();

                    if i % 4 == 0 {
                        c_registry.unmake(entry).unwrap();
                    }
                }
            })
        })
        .collect();

    // Flush on this Thread while the Producers are still running
    let c_done = done.clone();
    let watcher = thread::spawn(move || {
        for producer in producers {
            producer.join().unwrap();
        }
        c_done.store(true, Ordering::SeqCst);
    });

    while !done.load(Ordering::SeqCst) {
        flusher.flush_batch();
        thread::yield_now();
    }
    watcher.join().unwrap();
    while registry.pending() > 0 {
        flusher.flush_batch();
    }

    assert_eq!(4 * 48, registry.len());
    for thread in 0..4 {
        for i in 0..64 {
            let entry = registry.get_by_name(&format!("{}/{}", thread, i));
            if i % 4 == 0 {
                assert_eq!(None, entry);
            } else {
                let entry = entry.unwrap();
                assert_eq!(Some(EntryState::Made), registry.state(entry));
                assert!(registry.value(entry).is_some());
            }
        }
    }

    // 3 Placeholders and every remaining Entry
    assert_eq!(3 + 4 * 48, alive.lock().len());
    log::info!("{:?}", registry);

    drop(flusher);
    assert!(alive.lock().is_empty());
}

#[test]
fn forced_remakes_from_many_threads() {
    let tracker = Tracker::default();
    let alive = tracker.alive.clone();
    let (mut flusher, registry) =
        registry(RegistryConfig::default(), tracker, placeholders()).unwrap();

    let entry = registry.make_named("shared", 1, None, false).unwrap();
    flusher.flush(1);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let c_registry = registry.clone();
            thread::spawn(move || {
                for i in 0..100 {
                    let again = c_registry.make_named("shared", i + 2, None, true).unwrap();
                    assert_eq!(entry, again);
                    // The Entry always shows some Handle
                    assert!(c_registry.value(entry).is_some());
                }
            })
        })
        .collect();

    for _ in 0..50 {
        flusher.flush(4);
        thread::yield_now();
    }
    for handle in handles {
        handle.join().unwrap();
    }
    flusher.flush(100);

    assert_eq!(Some(EntryState::Made), registry.state(entry));
    // The Placeholders and the latest Handle of the Entry
    assert_eq!(4, alive.lock().len());
}

#[test]
fn failed_creation_uses_placeholder() {
    let (mut flusher, registry) =
        registry(RegistryConfig::default(), Tracker::default(), placeholders()).unwrap();

    let entry = registry.make_named("empty", 0, None, false).unwrap();
    flusher.flush_batch();

    assert_eq!(Some(EntryState::Failed), registry.state(entry));
    assert_eq!(
        registry.value(registry.failed()),
        registry.value(entry)
    );
}
