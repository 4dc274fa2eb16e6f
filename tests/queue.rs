use std::{collections::HashMap, sync::Arc, thread};

use memsync::queue::ConcurrentQueue;
use test_env_log::test;

#[test]
fn single_producer_order() {
    let queue = Arc::new(ConcurrentQueue::new(16).unwrap());

    let c_queue = queue.clone();
    let producer = thread::spawn(move || {
        for i in 0..10000u32 {
            let mut value = i;
            while let Err(rejected) = c_queue.push(value) {
                value = rejected;
                thread::yield_now();
            }
        }
    });

    for expected in 0..10000u32 {
        assert_eq!(expected, queue.pop());
    }
    producer.join().unwrap();

    assert!(queue.is_empty());
}

#[test]
fn per_producer_order() {
    let producers = 4u64;
    let per_producer = 20000u64;
    let queue = Arc::new(ConcurrentQueue::new(128).unwrap());

    let handles: Vec<_> = (0..producers)
        .map(|producer| {
            let c_queue = queue.clone();
            thread::spawn(move || {
                for sequence in 0..per_producer {
                    let mut value = (producer, sequence);
                    while let Err(rejected) = c_queue.push(value) {
                        value = rejected;
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..2)
        .map(|_| {
            let c_queue = queue.clone();
            thread::spawn(move || {
                let mut popped = Vec::new();
                for _ in 0..(producers * per_producer / 2) {
                    popped.push(c_queue.pop());
                }
                popped
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let mut counts: HashMap<u64, u64> = HashMap::new();
    for consumer in consumers {
        let mut last: HashMap<u64, u64> = HashMap::new();
        for (producer, sequence) in consumer.join().unwrap() {
            // Every Consumer sees the Values of one Producer in push Order
            if let Some(previous) = last.insert(producer, sequence) {
                assert!(previous < sequence);
            }
            *counts.entry(producer).or_default() += 1;
        }
    }

    for producer in 0..producers {
        assert_eq!(Some(&per_producer), counts.get(&producer));
    }
    assert!(queue.is_empty());
    log::info!("Drained {} values", producers * per_producer);
}

#[test]
fn clear_empties() {
    let queue = ConcurrentQueue::new(32).unwrap();
    for i in 0..32 {
        queue.push(format!("value-{}", i)).unwrap();
    }
    assert_eq!(32, queue.size());

    queue.clear();
    assert!(queue.is_empty());
    assert_eq!(None, queue.try_pop());
}
