//! Benchmarks for the concurrent containers.
//!
//! Measures uncontended single-thread throughput and contended
//! multi-thread throughput for each container, plus the read-heavy path
//! the double-buffered sequence is built for.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use shoal::{DataPool, Queue, ReadVec, Stack};
use std::sync::Arc;
use std::thread;

const OPS_PER_ITER: u64 = 10_000;
const THREADS: u64 = 4;

// ============================================================================
// Single-thread throughput
// ============================================================================

fn bench_single_thread(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_thread");
    group.throughput(Throughput::Elements(OPS_PER_ITER));

    group.bench_function("stack_push_pop", |b| {
        let stack = Stack::new();
        b.iter(|| {
            for i in 0..OPS_PER_ITER {
                stack.push(black_box(i));
            }
            for _ in 0..OPS_PER_ITER {
                black_box(stack.try_pop());
            }
        });
    });

    group.bench_function("queue_push_pop", |b| {
        let queue = Queue::new();
        b.iter(|| {
            for i in 0..OPS_PER_ITER {
                queue.push(black_box(i));
            }
            for _ in 0..OPS_PER_ITER {
                black_box(queue.try_pop());
            }
        });
    });

    group.bench_function("pool_push_pop", |b| {
        let pool = DataPool::new();
        b.iter(|| {
            for i in 0..OPS_PER_ITER {
                pool.push(black_box(i));
            }
            for _ in 0..OPS_PER_ITER {
                black_box(pool.try_pop());
            }
        });
    });

    group.finish();
}

// ============================================================================
// Contended throughput
// ============================================================================

fn contended<C: Send + Sync + 'static>(
    container: Arc<C>,
    push: fn(&C, u64),
    pop: fn(&C) -> Option<u64>,
) {
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let container = Arc::clone(&container);
            thread::spawn(move || {
                for i in 0..OPS_PER_ITER / THREADS {
                    push(&container, t * OPS_PER_ITER + i);
                    black_box(pop(&container));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

fn bench_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended");
    group.throughput(Throughput::Elements(OPS_PER_ITER));
    group.sample_size(20);

    group.bench_function("stack", |b| {
        b.iter(|| {
            contended(
                Arc::new(Stack::new()),
                |s, v| s.push(v),
                |s| s.try_pop(),
            )
        });
    });

    group.bench_function("queue", |b| {
        b.iter(|| {
            contended(
                Arc::new(Queue::new()),
                |q, v| q.push(v),
                |q| q.try_pop(),
            )
        });
    });

    group.bench_function("pool", |b| {
        b.iter(|| {
            contended(
                Arc::new(DataPool::new()),
                |p, v| p.push(v),
                |p| p.try_pop(),
            )
        });
    });

    group.finish();
}

// ============================================================================
// Read-heavy sequence workload
// ============================================================================

fn bench_read_vec(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_vec");

    group.throughput(Throughput::Elements(OPS_PER_ITER));
    group.bench_function("try_at_hot", |b| {
        let vec = ReadVec::new();
        for v in 0..128u64 {
            vec.push_back(v);
        }
        b.iter(|| {
            for i in 0..OPS_PER_ITER {
                black_box(vec.try_at((i % 128) as usize));
            }
        });
    });

    group.throughput(Throughput::Elements(256));
    group.bench_function("push_back_commit", |b| {
        b.iter(|| {
            let vec = ReadVec::new();
            for v in 0..256u64 {
                vec.push_back(black_box(v));
            }
            vec
        });
    });

    group.finish();
}

criterion_group!(benches, bench_single_thread, bench_contended, bench_read_vec);
criterion_main!(benches);
