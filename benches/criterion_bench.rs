use criterion::{criterion_group, criterion_main};

mod queue;
mod tlsf;

criterion_group!(
    maps,
    hash_map::concurrent_map_inserts,
    hash_map::std_map_inserts
);

criterion_group!(
    queues,
    queue::enqueue_dequeue,
    queue::std_enqueue_dequeue,
    queue::concurrent_enqueue
);

criterion_group!(
    allocators,
    pool::allocate_deallocate,
    pool::concurrent_allocate_deallocate,
    tlsf::allocate_deallocate,
    tlsf::mixed_sizes,
    tlsf::system_alloc
);

criterion_main!(queues, maps, allocators);
