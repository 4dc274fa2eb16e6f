use std::{ops::Div, sync::Arc, thread};

use memsync::{
    config::RegistryConfig,
    latch::CountdownLatch,
    queue::ConcurrentQueue,
    registry::{registry, Lifetime, Placeholders},
    tlsf::{AllocateOptions, SharedTlsfAllocator, TlsfAllocator},
};

const ITERATIONS: usize = 100000;
const SENDER_THREADS: usize = 8;

/// Creates Handles by storing the Payload in a shared TLSF Heap
struct HeapLifetime {
    heap: Arc<SharedTlsfAllocator<'static>>,
}

impl Lifetime for HeapLifetime {
    type Payload = Vec<u8>;
    type Handle = usize;
    type Error = String;

    fn create(&mut self, payload: Vec<u8>, name: &str) -> Result<usize, String> {
        let ptr = self
            .heap
            .allocate(payload.len(), "registry", AllocateOptions::default())
            .ok_or_else(|| format!("no room for {} ({} bytes)", name, payload.len()))?;

        // # Safety:
        // The Allocation is at least as large as the Payload
        unsafe { std::ptr::copy_nonoverlapping(payload.as_ptr(), ptr.as_ptr(), payload.len()) };

        Ok(ptr.as_ptr() as usize)
    }

    fn destroy(&mut self, handle: usize) {
        if let Err(e) = self.heap.deallocate(handle as *mut u8) {
            log::error!("Destroying handle {:#x}: {}", handle, e);
        }
    }
}

fn queue_demo() {
    let queue = Arc::new(ConcurrentQueue::new(1024).expect("Creating the queue"));
    let latch = Arc::new(CountdownLatch::new(SENDER_THREADS as isize));

    let senders: Vec<_> = (0..SENDER_THREADS)
        .map(|_| {
            let c_queue = queue.clone();
            let c_latch = latch.clone();
            thread::spawn(move || {
                let start = std::time::Instant::now();
                for i in 0..ITERATIONS {
                    let mut value = i as u64;
                    while let Err(rejected) = c_queue.push(value) {
                        value = rejected;
                        std::hint::spin_loop();
                    }
                }
                let duration = start.elapsed();

                log::info!(
                    "Duration: {:?} / {}, Per-Push: {:?}",
                    duration,
                    ITERATIONS,
                    duration.div(ITERATIONS as u32)
                );
                c_latch.release().expect("Releasing the latch");
            })
        })
        .collect();

    let c_queue = queue.clone();
    let receiver = thread::spawn(move || {
        let mut received = 0;
        while received < SENDER_THREADS * ITERATIONS {
            c_queue.pop();
            received += 1;
        }
        received
    });

    latch.wait();
    log::info!("All senders are done");

    for sender in senders {
        sender.join().unwrap();
    }
    let received = receiver.join().unwrap();
    log::info!("Received {} values", received);
}

fn registry_demo() {
    let heap = Arc::new(SharedTlsfAllocator::new(
        TlsfAllocator::with_capacity(1 << 20).expect("Creating the heap"),
    ));

    let placeholders = Placeholders {
        missing: b"missing".to_vec(),
        failed: b"failed".to_vec(),
        making: b"making".to_vec(),
    };
    let (mut flusher, registry) = registry(
        RegistryConfig::from_env(),
        HeapLifetime { heap: heap.clone() },
        placeholders,
    )
    .expect("Creating the registry");

    let producers: Vec<_> = (0..4)
        .map(|thread| {
            let c_registry = registry.clone();
            thread::spawn(move || {
                for i in 0..16 {
                    let name = format!("asset-{}-{}", thread, i);
                    let payload = vec![thread as u8; 64 + i * 16];
                    if let Err(e) = c_registry.make_named(&name, payload, None, false) {
                        log::warn!("Requesting {}: {}", name, e);
                    }
                }
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }

    while registry.pending() > 0 {
        flusher.flush_batch();
    }
    log::info!(
        "Made {} entries, heap stats: {:?}",
        registry.len(),
        heap.stats()
    );

    drop(flusher);
    log::info!("After teardown: {:?}", heap.stats());
}

pub fn main() {
    env_logger::init();

    queue_demo();
    registry_demo();
}
