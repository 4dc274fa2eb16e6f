use std::alloc::{GlobalAlloc, Layout, System};

use criterion::{black_box, Criterion, Throughput};
use memsync::tlsf::{AllocateOptions, TlsfAllocator};
use rand::Rng;

pub fn allocate_deallocate(ctx: &mut Criterion) {
    let mut group = ctx.benchmark_group("allocator::tlsf::alloc_dealloc");

    group.throughput(Throughput::Elements(1));

    group.bench_function("alloc-dealloc 8", |b| {
        let mut allocator = TlsfAllocator::with_capacity(1024 * 1024).unwrap();

        b.iter(|| {
            let ptr = allocator
                .allocate(black_box(8), "bench", AllocateOptions::default())
                .unwrap();
            allocator.deallocate(ptr.as_ptr()).unwrap();
        });
    });
}

pub fn mixed_sizes(ctx: &mut Criterion) {
    let mut group = ctx.benchmark_group("allocator::tlsf::mixed");

    group.throughput(Throughput::Elements(64));

    group.bench_function("alloc-64-dealloc-64", |b| {
        let mut allocator = TlsfAllocator::with_capacity(4 * 1024 * 1024).unwrap();
        let mut rng = rand::thread_rng();
        let sizes: Vec<usize> = (0..64).map(|_| rng.gen_range(1..=4096)).collect();

        b.iter(|| {
            let pointers: Vec<_> = sizes
                .iter()
                .map(|size| {
                    allocator
                        .allocate(*size, "bench", AllocateOptions::default())
                        .unwrap()
                })
                .collect();
            for ptr in pointers.into_iter().rev() {
                allocator.deallocate(ptr.as_ptr()).unwrap();
            }
        });
    });
}

pub fn system_alloc(ctx: &mut Criterion) {
    let mut group = ctx.benchmark_group("allocator::system::alloc_dealloc");

    group.throughput(Throughput::Elements(1));

    group.bench_function("alloc-dealloc 8", |b| {
        let layout = Layout::from_size_align(8, 16).unwrap();

        b.iter(|| unsafe {
            let ptr = System.alloc(black_box(layout));
            System.dealloc(ptr, layout);
        });
    });
}
