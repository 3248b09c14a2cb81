//! End-to-end container scenarios exercised through the public API.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use shoal::{DataPool, Queue, ReadVec, Stack};

/// Queue is FIFO for a single thread: 1, 2, 3 come back in order.
#[test]
fn queue_fifo_round_trip() {
    let queue = Queue::new();
    queue.push(1);
    queue.push(2);
    queue.push(3);

    assert_eq!(queue.try_pop(), Some(1));
    assert_eq!(queue.try_pop(), Some(2));
    assert_eq!(queue.try_pop(), Some(3));
    assert_eq!(queue.try_pop(), None);
}

/// Stack is LIFO for a single thread: 1, 2, 3 come back reversed.
#[test]
fn stack_lifo_round_trip() {
    let stack = Stack::new();
    stack.push(1);
    stack.push(2);
    stack.push(3);

    assert_eq!(stack.try_pop(), Some(3));
    assert_eq!(stack.try_pop(), Some(2));
    assert_eq!(stack.try_pop(), Some(1));
    assert_eq!(stack.try_pop(), None);
}

/// The pool returns pushed values as a set, with a fourth pop failing.
#[test]
fn pool_set_round_trip() {
    let pool = DataPool::new();
    pool.push(10);
    pool.push(20);
    pool.push(30);

    let mut values = HashSet::new();
    for _ in 0..3 {
        values.insert(pool.try_pop().expect("pool should hold a value"));
    }
    assert_eq!(values, HashSet::from([10, 20, 30]));
    assert_eq!(pool.try_pop(), None);
}

/// Sequence edit script: push 1, 2, 3; insert 9 at index 1; observe
/// [1, 9, 2, 3]; conditional erase succeeds only on the matching value.
#[test]
fn read_vec_insert_and_conditional_erase() {
    let vec = ReadVec::new();
    vec.push_back(1);
    vec.push_back(2);
    vec.push_back(3);

    assert!(vec.try_insert(1, 9));
    assert_eq!(vec.try_at(0), Some(1));
    assert_eq!(vec.try_at(1), Some(9));
    assert_eq!(vec.try_at(2), Some(2));
    assert_eq!(vec.try_at(3), Some(3));

    assert!(vec.test_and_erase(1, &9));
    assert!(!vec.test_and_erase(1, &42));
    assert_eq!(vec.try_at(1), Some(2));
}

/// Eight producers, eight consumers, 8000 values: the consumed multiset
/// equals the produced set and nothing is invented or lost.
#[test]
fn queue_producer_consumer_swarm() {
    const THREADS: u64 = 8;
    const PER_PRODUCER: u64 = 1_000;
    const TOTAL: u64 = THREADS * PER_PRODUCER;

    let queue = Arc::new(Queue::new());
    let consumed = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..THREADS)
        .map(|p| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    queue.push(p * PER_PRODUCER + i);
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..THREADS)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let consumed = Arc::clone(&consumed);
            thread::spawn(move || {
                let mut seen = Vec::new();
                while consumed.load(Ordering::Relaxed) < TOTAL as usize {
                    if let Some(v) = queue.try_pop() {
                        assert!(v < TOTAL, "popped a value never pushed: {}", v);
                        seen.push(v);
                        consumed.fetch_add(1, Ordering::Relaxed);
                    } else {
                        thread::yield_now();
                    }
                }
                seen
            })
        })
        .collect();

    for p in producers {
        p.join().unwrap();
    }
    let mut all = HashSet::new();
    for c in consumers {
        for v in c.join().unwrap() {
            assert!(all.insert(v), "value {} consumed twice", v);
        }
    }
    assert_eq!(all.len(), TOTAL as usize, "values lost");
}

/// The same swarm shape over the stack and the pool, which promise the
/// multiset but no order.
#[test]
fn unordered_containers_preserve_multisets() {
    const THREADS: u64 = 4;
    const PER_PRODUCER: u64 = 500;
    const TOTAL: u64 = THREADS * PER_PRODUCER;

    fn swarm(push: impl Fn(u64) + Send + Sync + 'static, pop: impl Fn() -> Option<u64> + Send + Sync + 'static) {
        let push = Arc::new(push);
        let pop = Arc::new(pop);
        let consumed = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..THREADS)
            .map(|p| {
                let push = Arc::clone(&push);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        push(p * PER_PRODUCER + i);
                    }
                })
            })
            .collect();
        let consumers: Vec<_> = (0..THREADS)
            .map(|_| {
                let pop = Arc::clone(&pop);
                let consumed = Arc::clone(&consumed);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while consumed.load(Ordering::Relaxed) < TOTAL as usize {
                        if let Some(v) = pop() {
                            seen.push(v);
                            consumed.fetch_add(1, Ordering::Relaxed);
                        } else {
                            thread::yield_now();
                        }
                    }
                    seen
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        let mut all = HashSet::new();
        for c in consumers {
            for v in c.join().unwrap() {
                assert!(all.insert(v), "value {} extracted twice", v);
            }
        }
        assert_eq!(all.len(), TOTAL as usize, "values lost");
    }

    let stack = Arc::new(Stack::new());
    {
        let s = Arc::clone(&stack);
        let p = Arc::clone(&stack);
        swarm(move |v| s.push(v), move || p.try_pop());
    }

    let pool = Arc::new(DataPool::new());
    {
        let s = Arc::clone(&pool);
        let p = Arc::clone(&pool);
        swarm(move |v| s.push(v), move || p.try_pop());
    }
}
