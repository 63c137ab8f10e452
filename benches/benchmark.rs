use criterion::{criterion_group, criterion_main, Criterion};

use mandelgrid::{
    distributed::TaskSheet,
    render::{kernel, Viewport},
    scheduler::queue::{ConcurrentPriorityQueue, Priority},
};

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("compute_64x64_strip", |b| {
        let viewport = Viewport::default();
        let sheet = TaskSheet::new(0..64, 64, viewport.mapping(64, 64), 256);
        b.iter(|| kernel::compute_rows(&sheet));
    });

    c.bench_function("compute_64x64_strip_parallel", |b| {
        let viewport = Viewport::default();
        let sheet = TaskSheet::new(0..64, 64, viewport.mapping(64, 64), 256);
        b.iter(|| kernel::compute_rows_parallel(&sheet));
    });

    c.bench_function("queue_mixed_priorities", |b| {
        let queue = ConcurrentPriorityQueue::new();
        b.iter(|| {
            for i in 0..64_u32 {
                let priority = if i % 2 == 0 {
                    Priority::High
                } else {
                    Priority::Low
                };
                queue.enqueue(i, priority).unwrap();
            }
            while queue.try_dequeue().is_some() {}
        });
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
