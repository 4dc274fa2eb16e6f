use std::{sync::Arc, thread};

use criterion::{black_box, Criterion, Throughput};
use memsync::queue::ConcurrentQueue;

pub fn enqueue_dequeue(ctx: &mut Criterion) {
    let mut group = ctx.benchmark_group("queue");

    group.throughput(Throughput::Elements(2));

    group.bench_function("enqueue-dequeue", |b| {
        let queue = ConcurrentQueue::<u64>::new(10).unwrap();

        b.iter(|| {
            let _ = queue.push(black_box(13));
            assert_eq!(Some(13), queue.try_pop());
        });
    });
}

pub fn std_enqueue_dequeue(ctx: &mut Criterion) {
    let mut group = ctx.benchmark_group("std-mpsc");

    group.throughput(Throughput::Elements(2));

    group.bench_function("enqueue-dequeue", |b| {
        let (tx, rx) = std::sync::mpsc::sync_channel::<u64>(10);

        b.iter(|| {
            let _ = tx.send(black_box(13));
            assert_eq!(Ok(13), rx.try_recv());
        });
    });
}

pub fn concurrent_enqueue(ctx: &mut Criterion) {
    let mut group = ctx.benchmark_group("queue-concurrent");

    for producers in [1u64, 2, 4] {
        group.throughput(Throughput::Elements(producers * 1000));

        group.bench_function(format!("{}-producers", producers), |b| {
            b.iter(|| {
                let queue = Arc::new(ConcurrentQueue::<u64>::new(256).unwrap());

                let handles: Vec<_> = (0..producers)
                    .map(|_| {
                        let c_queue = queue.clone();
                        thread::spawn(move || {
                            for i in 0..1000 {
                                let mut value = i;
                                while let Err(rejected) = c_queue.push(value) {
                                    value = rejected;
                                    thread::yield_now();
                                }
                            }
                        })
                    })
                    .collect();

                for _ in 0..(producers * 1000) {
                    black_box(queue.pop());
                }

                for handle in handles {
                    handle.join().unwrap();
                }
            });
        });
    }
}
