//! Unordered data pool over a growing chain of slot blocks.
//!
//! # Design
//!
//! Values are parked in whichever slot a producer manages to claim, and
//! extracted from whichever occupied slot a consumer reaches first. The pool
//! promises multiset semantics only: callers get back exactly the values
//! they put in, in no particular order.
//!
//! Storage is a singly linked chain of blocks, newest block first. Each
//! block owns a fixed slice of slots; when a producer exhausts the chain
//! without claiming a slot, it prepends a new block sized by a geometric
//! factor of the current head block and rescans. The chain only grows.
//!
//! # Slot handoff
//!
//! Each slot carries two atomic flags acting as a one-producer/
//! one-consumer baton around its value cell:
//!
//! ```text
//! writable=true, readable=false   empty (initial)
//!   producer: writable.swap(false, Acquire)   (exclusive claim)
//! writable=false, readable=false  write-claimed
//!   producer: store value, readable.store(true, Release)
//! writable=false, readable=true   full
//!   consumer: readable.swap(false, Acquire)   (exclusive claim)
//! writable=false, readable=false  read-claimed
//!   consumer: take value, writable.store(true, Release)   (back to empty)
//! ```
//!
//! At most one producer can observe the `writable` transition and at most
//! one consumer the `readable` transition; each then has exclusive use of
//! the value cell until it releases the opposite flag. The release store on
//! publish pairs with the acquire swap on claim, so the value is always
//! fully visible to the thread that wins the baton.
//!
//! # Reclamation
//!
//! `clear` detaches the whole chain by installing a fresh head block.
//! Traversals (push and pop walk the chain with only a shared reference)
//! run inside an epoch pin, and the detached chain is handed to the epoch
//! collector, so a block dies only after every traversal that could still
//! reach it has unpinned.
//!
//! # Progress
//!
//! Both `push` and `try_pop` complete whenever some slot is in the matching
//! state. A specific thread can be starved under adversarial scheduling;
//! callers must not rely on per-thread fairness.

#[cfg(not(loom))]
use std::sync::atomic::AtomicBool;

#[cfg(loom)]
use loom::sync::atomic::AtomicBool;

use std::cell::UnsafeCell;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned};
use crossbeam_utils::CachePadded;

/// Slot count of the first block (and of the fresh block `clear` installs).
pub const INITIAL_SLOTS: usize = 11;

/// Size factor between a block and the next one prepended after it.
pub const GROWTH_FACTOR: f64 = 1.5;

/// One value cell plus its producer/consumer handoff flags.
struct Slot<T> {
    /// `true` ⇒ a producer may claim this slot.
    writable: AtomicBool,
    /// `true` ⇒ a consumer may claim this slot.
    readable: AtomicBool,
    /// Occupied exactly while the slot sits between publish and consume.
    /// Wrapped in `UnsafeCell` because the flag baton, not a lock, grants
    /// access: the winning claimant has exclusive use until it releases the
    /// opposite flag.
    value: UnsafeCell<Option<T>>,
}

// SAFETY: The flag baton grants exclusive access to the value cell; a slot
// may be shared between threads because at most one thread can hold each
// side of the baton at a time.
unsafe impl<T: Send> Send for Slot<T> {}
unsafe impl<T: Send> Sync for Slot<T> {}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            writable: AtomicBool::new(true),
            readable: AtomicBool::new(false),
            value: UnsafeCell::new(None),
        }
    }

    /// Claims the slot for writing. The relaxed pre-check keeps losing
    /// producers from hammering the flag's cache line with RMWs.
    #[inline]
    fn try_claim_write(&self) -> bool {
        self.writable.load(Relaxed) && self.writable.swap(false, Acquire)
    }

    /// Publishes `value` into a write-claimed slot.
    #[inline]
    fn publish(&self, value: T) {
        // SAFETY: The caller won the `writable` claim, so this thread has
        // exclusive use of the cell; the consumer cannot touch it until the
        // release store below.
        unsafe {
            *self.value.get() = Some(value);
        }
        self.readable.store(true, Release);
    }

    /// Claims a full slot and moves its value out, returning the slot to
    /// the empty state.
    #[inline]
    fn try_consume(&self) -> Option<T> {
        if !(self.readable.load(Relaxed) && self.readable.swap(false, Acquire)) {
            return None;
        }
        // SAFETY: Winning the `readable` claim grants exclusive use of the
        // cell; the acquire swap pairs with the producer's release store so
        // the value is fully visible. Taking it ends the value's lifetime at
        // its logical removal.
        let value = unsafe { (*self.value.get()).take() };
        debug_assert!(value.is_some(), "claimed a readable slot with no value");
        self.writable.store(true, Release);
        value
    }
}

/// A fixed run of slots plus the link to the next (older) block.
struct Block<T> {
    slots: Box<[Slot<T>]>,
    /// Written once before the block is published; loads during traversal
    /// still go through the epoch so detached chains stay sound.
    next: Atomic<Block<T>>,
}

impl<T> Block<T> {
    fn with_len(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| Slot::new()).collect(),
            next: Atomic::null(),
        }
    }
}

/// Unordered concurrent bag.
///
/// `push` always succeeds (growing storage if needed); `try_pop` extracts
/// *some* value with no order guarantee. Shared by reference across
/// threads.
pub struct DataPool<T> {
    /// Newest block. Padded: growth and `clear` CAS this word while every
    /// traversal loads it.
    head: CachePadded<Atomic<Block<T>>>,
    initial_slots: usize,
    growth: f64,
}

unsafe impl<T: Send> Send for DataPool<T> {}
unsafe impl<T: Send> Sync for DataPool<T> {}

impl<T> DataPool<T> {
    /// Creates a pool with the default block sizing
    /// ([`INITIAL_SLOTS`], [`GROWTH_FACTOR`]).
    pub fn new() -> Self {
        Self::with_config(INITIAL_SLOTS, GROWTH_FACTOR)
    }

    /// Creates a pool with explicit block sizing.
    ///
    /// # Panics
    ///
    /// Panics if `initial_slots` is zero or `growth` is not a finite value
    /// of at least 1.0.
    pub fn with_config(initial_slots: usize, growth: f64) -> Self {
        assert!(initial_slots > 0, "initial_slots must be > 0");
        assert!(
            growth.is_finite() && growth >= 1.0,
            "growth must be finite and >= 1.0"
        );
        Self {
            head: CachePadded::new(Atomic::new(Block::with_len(initial_slots))),
            initial_slots,
            growth,
        }
    }

    /// Inserts `value` into the pool.
    ///
    /// Walks the chain for a claimable slot; if every slot is taken,
    /// prepends a new block of `floor(head_len * growth)` slots and rescans.
    pub fn push(&self, value: T) {
        let guard = epoch::pin();
        loop {
            match self.claim_slot(&guard) {
                Some(slot) => {
                    slot.publish(value);
                    return;
                }
                None => self.grow(&guard),
            }
        }
    }

    /// Extracts some value, or returns `None` if the full chain was scanned
    /// without finding one.
    pub fn try_pop(&self) -> Option<T> {
        let guard = epoch::pin();
        let mut block = self.head.load(Acquire, &guard);
        // SAFETY: Blocks reached from a pinned load stay alive for the pin;
        // `clear` only defers destruction of detached chains.
        while let Some(b) = unsafe { block.as_ref() } {
            for slot in b.slots.iter() {
                if let Some(value) = slot.try_consume() {
                    return Some(value);
                }
            }
            block = b.next.load(Acquire, &guard);
        }
        None
    }

    /// Discards every value and resets the pool to a fresh block of the
    /// initial size.
    ///
    /// Concurrent pushes that already claimed a slot in the old chain land
    /// in blocks that are about to be retired; such values are linearized
    /// before the clear and are dropped with their block.
    pub fn clear(&self) {
        let guard = epoch::pin();
        let fresh = Owned::new(Block::with_len(self.initial_slots)).into_shared(&guard);
        let mut head = self.head.load(Acquire, &guard);
        loop {
            match self
                .head
                .compare_exchange(head, fresh, AcqRel, Acquire, &guard)
            {
                Ok(_) => break,
                Err(err) => head = err.current,
            }
        }

        let detached = head.as_raw() as *mut Block<T> as usize;
        if detached == 0 {
            return;
        }
        // SAFETY: The chain is unreachable from the pool; only already
        // pinned traversals may still hold references, and the deferred
        // closure runs after every such pin is released.
        unsafe {
            guard.defer_unchecked(move || drop_chain(detached as *mut Block<T>));
        }
    }

    /// Finds and write-claims a free slot anywhere on the chain.
    fn claim_slot<'g>(&self, guard: &'g Guard) -> Option<&'g Slot<T>> {
        let mut block = self.head.load(Acquire, guard);
        // SAFETY: As in `try_pop`, the pin keeps every reachable block alive.
        while let Some(b) = unsafe { block.as_ref() } {
            for slot in b.slots.iter() {
                if slot.try_claim_write() {
                    return Some(slot);
                }
            }
            block = b.next.load(Acquire, guard);
        }
        None
    }

    /// Prepends a block sized from the current head block.
    ///
    /// The size may be computed from a stale head under contention; any
    /// fresh block provides claimable slots regardless of its size.
    fn grow(&self, guard: &Guard) {
        let mut head = self.head.load(Acquire, guard);
        // SAFETY: Pinned load; see `try_pop`.
        let head_len = unsafe { head.as_ref() }.map_or(self.initial_slots, |b| b.slots.len());
        let next_len = ((head_len as f64) * self.growth) as usize;
        let mut block = Owned::new(Block::with_len(next_len.max(1)));
        loop {
            block.next.store(head, Relaxed);
            match self
                .head
                .compare_exchange(head, block, Release, Acquire, guard)
            {
                Ok(_) => return,
                Err(err) => {
                    head = err.current;
                    block = err.new;
                }
            }
        }
    }
}

impl<T> Default for DataPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for DataPool<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` proves quiescence; the chain is walked and
        // freed exactly once, dropping any still-parked values with it.
        unsafe {
            let guard = epoch::unprotected();
            let head = self.head.load(Relaxed, guard).as_raw() as *mut Block<T>;
            drop_chain(head);
        }
    }
}

/// Frees a detached block chain, dropping any values still in slots.
///
/// # Safety
///
/// The chain must be unreachable and quiescent: no thread may still hold a
/// reference into it.
unsafe fn drop_chain<T>(mut block: *mut Block<T>) {
    while !block.is_null() {
        let boxed = Box::from_raw(block);
        block = boxed
            .next
            .load(Relaxed, epoch::unprotected())
            .as_raw() as *mut Block<T>;
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

    /// Two producers race one slot: exactly one may observe the writable
    /// transition.
    #[test]
    fn loom_slot_single_write_claim() {
        loom::model(|| {
            let slot = Arc::new(Slot::<u32>::new());

            let a = {
                let slot = slot.clone();
                thread::spawn(move || slot.try_claim_write())
            };
            let b = {
                let slot = slot.clone();
                thread::spawn(move || slot.try_claim_write())
            };

            let a = a.join().unwrap();
            let b = b.join().unwrap();
            assert!(a ^ b, "exactly one producer must win the claim");
        });
    }

    /// A consumer that wins the readable claim must observe the published
    /// value in full.
    #[test]
    fn loom_slot_handoff_visibility() {
        loom::model(|| {
            let slot = Arc::new(Slot::<u32>::new());

            let producer = {
                let slot = slot.clone();
                thread::spawn(move || {
                    assert!(slot.try_claim_write());
                    slot.publish(42);
                })
            };
            let consumer = {
                let slot = slot.clone();
                thread::spawn(move || slot.try_consume())
            };

            producer.join().unwrap();
            if let Some(v) = consumer.join().unwrap() {
                assert_eq!(v, 42);
            }
        });
    }
}

// ============================================================================
// Property Tests
// ============================================================================
