//! FIFO queue built on flat combining.
//!
//! # Design
//!
//! Instead of every thread CASing on shared head/tail words, each thread
//! publishes its request (push or pop) on a per-thread *publication
//! record* linked into a lock-free list. One thread at a time acquires the
//! combiner lock and applies the whole batch of pending requests to a plain
//! singly linked FIFO chain that only the combiner ever touches. Everyone
//! else spins on their own record (with backoff and yield) until a response
//! kind appears. This amortizes synchronization: the FIFO chain itself needs
//! no atomics beyond the head word, because combining serializes access to
//! it.
//!
//! Technique per Hendler, Incze, Shavit and Tzafrir, "Flat Combining and the
//! Synchronization-Parallelism Tradeoff".
//!
//! # Record lifecycle
//!
//! A record belongs to one (queue, thread) pair. It is allocated on the
//! thread's first operation against the queue, cached in thread-local
//! storage keyed by a process-unique queue id, and owned by the queue (a
//! ledger frees every record when the queue drops, so records survive
//! thread exit without leaking). A record whose owner goes quiet is
//! unlinked from the publication list once its age trails the combiner's
//! pass counter by more than the aging threshold; its owner re-enlists on
//! the next operation after observing `active == false`.
//!
//! # Ordering rationale
//!
//! ```text
//! owner:    write value cell, Release-store request kind
//! combiner: Acquire-load kind, take value, apply
//! combiner: write response value, Release-store response kind
//! owner:    Acquire-load kind, take response value
//! ```
//!
//! The release/acquire pairs on the `kind` byte carry the value cell across
//! threads in both directions. Publication-list linking is a Release CAS on
//! the list head paired with the combiner's Acquire load.
//!
//! # Guarantees
//!
//! Each request linearizes when the combiner stamps its response. Requests
//! combined in one pass apply in publication-list order (newest first), so
//! FIFO holds for any single thread's operations but not between pushes
//! posted concurrently. `is_empty` is a stale hint.

#[cfg(not(loom))]
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicU8};

#[cfg(loom)]
use loom::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicU8};

use std::cell::{RefCell, UnsafeCell};
use std::ptr;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use std::sync::Mutex;

use crossbeam_utils::{Backoff, CachePadded};

/// Combiner passes an idle record may lag behind before it is unlinked
/// from the publication list.
pub const MAX_RECORD_AGE: u64 = 100;

// Request/response kinds carried by a record's `kind` byte. The owner
// writes the request kinds, the combiner writes the response kinds, and
// the owner acknowledges a response by resetting to `KIND_NULL`.
const KIND_NULL: u8 = 0;
const KIND_PUSH: u8 = 1;
const KIND_POP: u8 = 2;
const KIND_RESP_PUSH: u8 = 3;
const KIND_RESP_POP: u8 = 4;
const KIND_RESP_POP_FAIL: u8 = 5;

/// FIFO chain node. Only the combiner allocates, links, and frees these.
struct Node<T> {
    next: *mut Node<T>,
    value: T,
}

/// Per-thread publication record.
struct Record<T> {
    /// Publication-list link. Written by the owner when enlisting and by
    /// the combiner when unlinking.
    next: AtomicPtr<Record<T>>,
    /// `false` once the combiner has retired the record; the owner must
    /// re-enlist before its next request is visible.
    active: AtomicBool,
    /// Pass number of the last request served; compared against the pass
    /// counter to retire idle records. Combiner-written.
    age: AtomicU64,
    /// Request/response state machine; see the `KIND_*` constants.
    kind: AtomicU8,
    /// Payload cell, carried across threads by the `kind` handoff.
    value: UnsafeCell<Option<T>>,
}

/// Concurrent FIFO queue.
///
/// Shared by reference across threads; all operations take `&self`.
pub struct Queue<T> {
    /// Process-unique id keying the thread-local record cache, so records
    /// are never confused across queue lifetimes at a reused address.
    id: u64,
    /// Head of the publication list. Padded: enlisting threads CAS it while
    /// the combiner walks it.
    pub_head: CachePadded<AtomicPtr<Record<T>>>,
    /// Combiner lock flag. Acquired opportunistically by whichever waiter
    /// finds it free.
    combiner_lock: CachePadded<AtomicBool>,
    /// Monotonic combiner pass counter. Combiner-written; wide enough that
    /// wraparound dwarfs any aging threshold.
    passes: AtomicU64,
    /// FIFO chain head. Stored only by the combiner; loaded by `is_empty`.
    head: AtomicPtr<Node<T>>,
    /// FIFO chain tail plus anything else only the combiner touches.
    /// Guarded by `combiner_lock`.
    tail: UnsafeCell<*mut Node<T>>,
    /// Ledger of every record handed out, freed on drop.
    records: Mutex<Vec<usize>>,
    max_record_age: u64,
}

unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

static NEXT_QUEUE_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

#[cfg(not(loom))]
thread_local! {
    /// Per-thread cache of (queue id, record pointer) pairs.
    static RECORDS: RefCell<Vec<(u64, usize)>> = const { RefCell::new(Vec::new()) };
}

#[cfg(loom)]
loom::thread_local! {
    static RECORDS: RefCell<Vec<(u64, usize)>> = RefCell::new(Vec::new());
}

impl<T> Queue<T> {
    /// Creates an empty queue with the default aging threshold
    /// ([`MAX_RECORD_AGE`]).
    pub fn new() -> Self {
        Self::with_max_record_age(MAX_RECORD_AGE)
    }

    /// Creates an empty queue that retires idle publication records after
    /// `max_record_age` combiner passes.
    ///
    /// # Panics
    ///
    /// Panics if `max_record_age` is zero.
    pub fn with_max_record_age(max_record_age: u64) -> Self {
        assert!(max_record_age > 0, "max_record_age must be > 0");
        Self {
            id: NEXT_QUEUE_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            pub_head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            combiner_lock: CachePadded::new(AtomicBool::new(false)),
            passes: AtomicU64::new(0),
            head: AtomicPtr::new(ptr::null_mut()),
            tail: UnsafeCell::new(ptr::null_mut()),
            records: Mutex::new(Vec::new()),
            max_record_age,
        }
    }

    /// Appends `value` to the back of the queue.
    ///
    /// Returns once a combiner (possibly this thread) has applied the
    /// request.
    pub fn push(&self, value: T) {
        let record = self.thread_record();
        let response = self.run_request(record, KIND_PUSH, Some(value));
        debug_assert!(response.is_none());
    }

    /// Removes the value at the front of the queue, or returns `None` if
    /// the queue was empty when the combiner served the request.
    pub fn try_pop(&self) -> Option<T> {
        let record = self.thread_record();
        self.run_request(record, KIND_POP, None)
    }

    /// Returns whether the queue appeared empty.
    ///
    /// A hint: another thread's push may already be combined by the time
    /// the answer is used.
    pub fn is_empty(&self) -> bool {
        self.head.load(Acquire).is_null()
    }

    /// Publishes a request on `record` and spins until a combiner responds.
    fn run_request(&self, record: &Record<T>, kind: u8, payload: Option<T>) -> Option<T> {
        // SAFETY: Between a response acknowledgment and the next request
        // kind store, the value cell is owner-exclusive: the combiner only
        // touches it while the kind byte holds a request kind.
        unsafe {
            *record.value.get() = payload;
        }
        record.kind.store(kind, Release);
        self.enlist(record);

        let backoff = Backoff::new();
        loop {
            match record.kind.load(Acquire) {
                KIND_RESP_PUSH => {
                    record.kind.store(KIND_NULL, Relaxed);
                    return None;
                }
                KIND_RESP_POP => {
                    // SAFETY: The acquire load of the response kind pairs
                    // with the combiner's release store after it filled the
                    // cell; the cell is owner-exclusive again.
                    let value = unsafe { (*record.value.get()).take() };
                    debug_assert!(value.is_some(), "pop response without a value");
                    record.kind.store(KIND_NULL, Relaxed);
                    return value;
                }
                KIND_RESP_POP_FAIL => {
                    record.kind.store(KIND_NULL, Relaxed);
                    return None;
                }
                _ => {}
            }

            if !record.active.load(Acquire) {
                // Retired for idleness before the combiner saw this
                // request; the pending kind survives, only the link is
                // gone.
                self.enlist(record);
            } else if self.try_lock_combiner() {
                // SAFETY: We hold the combiner lock.
                unsafe { self.combine() };
                self.unlock_combiner();
            } else {
                Self::wait_briefly(&backoff);
            }
        }
    }

    /// Links `record` at the head of the publication list if it is not
    /// already linked.
    fn enlist(&self, record: &Record<T>) {
        if record.active.load(Acquire) {
            return;
        }
        record.active.store(true, Relaxed);

        let record_ptr = record as *const Record<T> as *mut Record<T>;
        let mut head = self.pub_head.load(Relaxed);
        loop {
            record.next.store(head, Relaxed);
            match self
                .pub_head
                .compare_exchange_weak(head, record_ptr, Release, Relaxed)
            {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// One combiner pass: serve every pending request in publication-list
    /// order and retire records idle for more than the aging threshold.
    ///
    /// # Safety
    ///
    /// Caller must hold the combiner lock.
    unsafe fn combine(&self) {
        let pass = self.passes.load(Relaxed).wrapping_add(1);
        self.passes.store(pass, Relaxed);

        let mut prev: *mut Record<T> = ptr::null_mut();
        let mut cur = self.pub_head.load(Acquire);
        while !cur.is_null() {
            let record = &*cur;
            // Snapshot the link first: once a record is unlinked its owner
            // may re-enlist it at the head and rewrite `next` underneath us.
            let next = record.next.load(Acquire);
            let kind = record.kind.load(Acquire);
            let mut unlinked = false;

            match kind {
                KIND_PUSH => {
                    record.age.store(pass, Relaxed);
                    let value = (*record.value.get())
                        .take()
                        .expect("push request without a payload");
                    self.fifo_push(value);
                    record.kind.store(KIND_RESP_PUSH, Release);
                }
                KIND_POP => {
                    record.age.store(pass, Relaxed);
                    match self.fifo_pop() {
                        Some(value) => {
                            // Fill the cell before the release store so the
                            // waiter that observes the response also
                            // observes the value.
                            *record.value.get() = Some(value);
                            record.kind.store(KIND_RESP_POP, Release);
                        }
                        None => record.kind.store(KIND_RESP_POP_FAIL, Release),
                    }
                }
                KIND_NULL => {
                    if pass.wrapping_sub(record.age.load(Relaxed)) > self.max_record_age {
                        if prev.is_null() {
                            // Head unlink must CAS: a fresh record may have
                            // been prepended since we loaded the head. If
                            // the CAS loses, leave the record for a later
                            // pass rather than dropping the newcomers.
                            if self
                                .pub_head
                                .compare_exchange(cur, next, AcqRel, Acquire)
                                .is_ok()
                            {
                                record.active.store(false, Release);
                                unlinked = true;
                            }
                        } else {
                            (*prev).next.store(next, Relaxed);
                            record.active.store(false, Release);
                            unlinked = true;
                        }
                    }
                }
                // A response awaiting acknowledgment; the owner is still
                // live, so refresh its age.
                _ => record.age.store(pass, Relaxed),
            }

            // Track the predecessor from *our* linkage knowledge, not the
            // active flag: an unlinked record can be re-enlisted at the
            // head concurrently, and splicing through it would orphan the
            // rest of the list.
            if !unlinked {
                prev = cur;
            }
            cur = next;
        }
    }

    /// Appends to the FIFO chain. Combiner-only.
    unsafe fn fifo_push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            next: ptr::null_mut(),
            value,
        }));
        let tail = &mut *self.tail.get();
        if tail.is_null() {
            debug_assert!(self.head.load(Relaxed).is_null());
            self.head.store(node, Release);
        } else {
            (**tail).next = node;
        }
        *tail = node;
    }

    /// Removes from the FIFO chain, freeing the node. Combiner-only, which
    /// is what makes the immediate free sound: no other thread ever holds a
    /// chain pointer.
    unsafe fn fifo_pop(&self) -> Option<T> {
        let head = self.head.load(Relaxed);
        if head.is_null() {
            return None;
        }
        let node = Box::from_raw(head);
        self.head.store(node.next, Release);
        if node.next.is_null() {
            // The chain drained; reset the tail so the next push does not
            // link through the node we just freed.
            *self.tail.get() = ptr::null_mut();
        }
        Some(node.value)
    }

    #[inline]
    fn try_lock_combiner(&self) -> bool {
        !self.combiner_lock.load(Relaxed) && !self.combiner_lock.swap(true, Acquire)
    }

    #[inline]
    fn unlock_combiner(&self) {
        self.combiner_lock.store(false, Release);
    }

    /// Returns this thread's record for this queue, allocating and
    /// registering one on first use.
    fn thread_record(&self) -> &Record<T> {
        let ptr = RECORDS.with(|cell| {
            let mut cached = cell.borrow_mut();
            if let Some(&(_, ptr)) = cached.iter().find(|&&(id, _)| id == self.id) {
                return ptr;
            }
            let record = Box::into_raw(Box::new(Record {
                next: AtomicPtr::new(ptr::null_mut::<Record<T>>()),
                active: AtomicBool::new(false),
                age: AtomicU64::new(self.passes.load(Relaxed)),
                kind: AtomicU8::new(KIND_NULL),
                value: UnsafeCell::new(None),
            }));
            self.records
                .lock()
                .expect("record ledger poisoned")
                .push(record as usize);
            cached.push((self.id, record as usize));
            record as usize
        });
        // SAFETY: The record is owned by this queue's ledger and freed only
        // when the queue drops, which cannot happen while `&self` is live.
        unsafe { &*(ptr as *const Record<T>) }
    }

    #[cfg(not(loom))]
    fn wait_briefly(backoff: &Backoff) {
        // Brief exponential spin, then yield the time slice so
        // oversubscribed workloads keep making progress.
        backoff.snooze();
    }

    #[cfg(loom)]
    fn wait_briefly(_backoff: &Backoff) {
        loom::thread::yield_now();
    }

    /// Publication-list length. Test observability for record aging; only
    /// meaningful while no thread is mutating the list.
    #[cfg(test)]
    fn publication_len(&self) -> usize {
        let mut n = 0;
        let mut cur = self.pub_head.load(Acquire);
        while !cur.is_null() {
            n += 1;
            // SAFETY: Records are freed only on queue drop.
            cur = unsafe { &*cur }.next.load(Acquire);
        }
        n
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        // Drain the FIFO chain.
        let mut node = self.head.load(Relaxed);
        while !node.is_null() {
            // SAFETY: `&mut self` proves quiescence; each node freed once.
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next;
        }

        // Free every record ever handed out. Unacknowledged response
        // values drop with their record.
        let records = std::mem::take(&mut *self.records.lock().expect("record ledger poisoned"));
        for ptr in records {
            // SAFETY: The ledger is the unique owner of each record.
            drop(unsafe { Box::from_raw(ptr as *mut Record<T>) });
        }
    }
}

// ============================================================================
// Tests
// ============================================================================


// ============================================================================
// Loom Tests
// ============================================================================

#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use loom::sync::Arc;
    use loom::thread;

    /// Push/pop handoff through the publication protocol: a pop either
    /// misses or observes the pushed value in full; nothing is lost.
    #[test]
    fn loom_push_pop_handoff() {
        loom::model(|| {
            let queue = Arc::new(Queue::new());

            let producer = {
                let queue = queue.clone();
                thread::spawn(move || queue.push(7u32))
            };
            let consumer = {
                let queue = queue.clone();
                thread::spawn(move || queue.try_pop())
            };

            producer.join().unwrap();
            match consumer.join().unwrap() {
                Some(v) => assert_eq!(v, 7),
                None => assert_eq!(queue.try_pop(), Some(7)),
            }
            assert_eq!(queue.try_pop(), None);
        });
    }
}

// ============================================================================
// Property Tests
// ============================================================================
