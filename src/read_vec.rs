//! Growable indexed sequence with lock-free readers and serialized writers.
//!
//! # Design
//!
//! Managed arrays are hostile to concurrency: any write can reallocate or
//! shift storage out from under a reader. This container trades write
//! throughput for wait-free-ish reads by keeping *two* arrays of per-element
//! heap pointers and swapping their roles on every commit:
//!
//! - The **read buffer** is what `try_at`/`size` observe. It is never
//!   mutated while it holds the read role.
//! - The **write buffer** is mutated by at most one writer at a time (all
//!   writers serialize on a mutex), then published by swapping the two role
//!   pointers.
//!
//! Elements are individually boxed; the buffers only store pointers, so
//! both buffers can share the same element set between commits.
//!
//! # Reader protocol
//!
//! A reader raises the reader counter, *then* loads the read-buffer
//! pointer, copies the element pointer at its index, clones the pointee,
//! and lowers the counter. Raising the counter first pins the buffer: a
//! writer that has swapped waits until the counter drains to zero, at which
//! point no reader can still be dereferencing pre-swap state.
//!
//! # Writer protocol (publish-swap)
//!
//! Under the write lock, after mutating the write buffer:
//!
//! 1. swap the role pointers, so the mutated buffer becomes the read
//!    buffer;
//! 2. **drain barrier I**: spin until the reader counter is zero;
//! 3. sync the former read buffer (growing its array if needed and copying
//!    the pointer set) so both buffers agree again; this runs after the
//!    barrier so its array is never reallocated under a live reader;
//! 4. free every element parked on the pending-delete stack;
//! 5. **drain barrier II**: spin until the counter is zero again, so no
//!    reader that straddled step 4 can outlive it holding a freed pointer.
//!
//! Removal operations park element pointers on the pending-delete stack
//! (a [`Stack`] of raw pointers) instead of freeing them inline; step 4 is
//! the only place elements die.
//!
//! # Ordering rationale
//!
//! Reader (`counter.fetch_add` then `read.load`) and writer (`read.store`
//! then `counter.load`) form a store-buffer pattern; both sides use SeqCst
//! so a writer that observes a drained counter knows later readers must
//! observe the swapped pointer. Acquire/release alone does not exclude the
//! stale-pointer/zero-counter outcome.
//!
//! # Guarantees
//!
//! `size` and `capacity` are hints, stale the moment they return. Capacity
//! never shrinks. `try_at` never observes freed storage (the drain
//! barriers), and writes are totally ordered by the lock.

#[cfg(not(loom))]
use std::sync::atomic::{AtomicPtr, AtomicUsize};

#[cfg(loom)]
use loom::sync::atomic::{AtomicPtr, AtomicUsize};

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::ptr;
use std::sync::atomic::Ordering::{Relaxed, SeqCst};
use std::sync::Mutex;

use crossbeam_utils::{Backoff, CachePadded};

use crate::stack::Stack;

/// Element capacity both buffers start with.
pub const INITIAL_CAPACITY: usize = 7;

/// Capacity growth factor on reallocation.
pub const GROWTH_FACTOR: f64 = 1.5;

/// One role's array of element pointers.
///
/// Fields are plain: the read role is immutable while observable, and every
/// mutation happens either under the write lock after a drain barrier or
/// before the buffer is first published.
struct Buffer<T> {
    ptrs: *mut *mut T,
    len: usize,
    cap: usize,
}

impl<T> Buffer<T> {
    fn with_capacity(cap: usize) -> Self {
        let layout = Layout::array::<*mut T>(cap).expect("buffer capacity overflows layout");
        // SAFETY: `cap` is validated non-zero by the container constructors,
        // so the layout is non-zero-sized.
        let raw = unsafe { alloc(layout) } as *mut *mut T;
        if raw.is_null() {
            handle_alloc_error(layout);
        }
        Self {
            ptrs: raw,
            len: 0,
            cap,
        }
    }

    /// # Safety
    ///
    /// Must be called exactly once, with no outstanding references into the
    /// array.
    unsafe fn free_array(&mut self) {
        dealloc(
            self.ptrs as *mut u8,
            Layout::array::<*mut T>(self.cap).expect("buffer capacity overflows layout"),
        );
    }
}

/// Element pointer parked until the next publish frees it.
struct Retired<T>(*mut T);

// SAFETY: A retired pointer is an owned heap element in transit between
// threads; only the publishing writer ever dereferences it again.
unsafe impl<T: Send> Send for Retired<T> {}

/// Growable indexed sequence with lock-free readers.
///
/// Reads (`try_at`, `size`, `capacity`, `iter`) never block. Writes
/// serialize on an internal lock and pay for the reader guarantees:
/// every commit swaps the double buffer and waits out in-flight readers.
pub struct ReadVec<T> {
    /// Buffer currently holding the read role.
    read: CachePadded<AtomicPtr<Buffer<T>>>,
    /// Buffer currently holding the write role. Only touched under the
    /// write lock; atomic so the role swap needs no extra synchronization.
    write: AtomicPtr<Buffer<T>>,
    /// In-flight reader count; the writer's drain barriers spin on it.
    readers: CachePadded<AtomicUsize>,
    /// Pending-delete stack: element pointers removed from the sequence but
    /// possibly still referenced by a reader of the pre-swap buffer.
    retired: Stack<Retired<T>>,
    write_lock: Mutex<()>,
    growth: f64,
}

// SAFETY: Readers clone `&T` from any thread (`T: Sync`) and writers drop
// elements possibly created on another thread (`T: Send`); everything else
// is synchronized by the lock, the role atomics, and the drain barriers.
unsafe impl<T: Send + Sync> Send for ReadVec<T> {}
unsafe impl<T: Send + Sync> Sync for ReadVec<T> {}

/// Decrements the reader counter even if a clone panics mid-observation.
struct ReadPin<'a, T> {
    vec: &'a ReadVec<T>,
}

impl<T> Drop for ReadPin<'_, T> {
    fn drop(&mut self) {
        self.vec.readers.fetch_sub(1, SeqCst);
    }
}

impl<T> ReadVec<T> {
    /// Creates an empty sequence with the default sizing
    /// ([`INITIAL_CAPACITY`], [`GROWTH_FACTOR`]).
    pub fn new() -> Self {
        Self::with_config(INITIAL_CAPACITY, GROWTH_FACTOR)
    }

    /// Creates an empty sequence with an explicit initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_config(capacity, GROWTH_FACTOR)
    }

    /// Creates an empty sequence with explicit capacity and growth.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or `growth` is not a finite value of at
    /// least 1.0.
    pub fn with_config(capacity: usize, growth: f64) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        assert!(
            growth.is_finite() && growth >= 1.0,
            "growth must be finite and >= 1.0"
        );
        Self {
            read: CachePadded::new(AtomicPtr::new(Box::into_raw(Box::new(
                Buffer::with_capacity(capacity),
            )))),
            write: AtomicPtr::new(Box::into_raw(Box::new(Buffer::with_capacity(capacity)))),
            readers: CachePadded::new(AtomicUsize::new(0)),
            retired: Stack::new(),
            write_lock: Mutex::new(()),
            growth,
        }
    }

    /// Copies out the element at `index`, or returns `None` if `index` was
    /// out of range at the observation point.
    ///
    /// Lock-free: never waits on writers.
    pub fn try_at(&self, index: usize) -> Option<T>
    where
        T: Clone,
    {
        let _pin = self.pin_reader();
        // SAFETY: The raised counter pins the buffer this load observes:
        // the writer frees or mutates pre-swap state only after the counter
        // drains. Element pointers below `len` are valid for the pin.
        unsafe {
            let buf = &*self.read.load(SeqCst);
            if index < buf.len {
                let elem = *buf.ptrs.add(index);
                Some((*elem).clone())
            } else {
                None
            }
        }
    }

    /// Number of elements at the observation point. A hint under
    /// concurrent writes.
    pub fn size(&self) -> usize {
        let _pin = self.pin_reader();
        // SAFETY: As in `try_at`.
        unsafe { (*self.read.load(SeqCst)).len }
    }

    /// Whether the sequence appeared empty. A hint.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Element capacity at the observation point. Never decreases.
    pub fn capacity(&self) -> usize {
        let _pin = self.pin_reader();
        // SAFETY: As in `try_at`.
        unsafe { (*self.read.load(SeqCst)).cap }
    }

    /// Best-effort iterator yielding cloned elements from index 0 upward,
    /// ending at the first index observed out of range. Concurrent writes
    /// may shift what a given index holds between steps.
    pub fn iter(&self) -> Iter<'_, T>
    where
        T: Clone,
    {
        Iter {
            vec: self,
            index: 0,
        }
    }

    /// Appends `value` at the end of the sequence.
    pub fn push_back(&self, value: T) {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let wbuf = self.write_buffer();
        self.reserve(wbuf, wbuf.len + 1);
        // SAFETY: Write role is exclusively ours under the lock; capacity
        // was just ensured.
        unsafe {
            *wbuf.ptrs.add(wbuf.len) = Box::into_raw(Box::new(value));
        }
        wbuf.len += 1;
        self.publish();
    }

    /// Removes the last element, returning `false` if the sequence was
    /// empty.
    ///
    /// The removed element is not returned: it may still be shared with
    /// in-flight readers. Observe it with `try_at(size() - 1)` first if the
    /// value is needed.
    pub fn try_pop_back(&self) -> bool {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let wbuf = self.write_buffer();
        if wbuf.len == 0 {
            return false;
        }
        let last = wbuf.len - 1;
        self.retire_at(wbuf, last);
        self.publish();
        true
    }

    /// Inserts `value` at `index`, shifting later elements right. Returns
    /// `false` without side effect if `index >= size`.
    pub fn try_insert(&self, index: usize, value: T) -> bool {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let wbuf = self.write_buffer();
        if index >= wbuf.len {
            return false;
        }
        self.reserve(wbuf, wbuf.len + 1);
        // SAFETY: Exclusive write role; capacity ensured; the overlapping
        // copy shifts `[index, len)` one slot right.
        unsafe {
            ptr::copy(
                wbuf.ptrs.add(index),
                wbuf.ptrs.add(index + 1),
                wbuf.len - index,
            );
            *wbuf.ptrs.add(index) = Box::into_raw(Box::new(value));
        }
        wbuf.len += 1;
        self.publish();
        true
    }

    /// Removes the element at `index`, shifting later elements left.
    /// Returns `false` without side effect if `index >= size`.
    ///
    /// Under concurrent writes the element at `index` may not be the one a
    /// prior read observed; use [`test_and_erase`](Self::test_and_erase) to
    /// remove a specific value.
    pub fn try_erase(&self, index: usize) -> bool {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let wbuf = self.write_buffer();
        if index >= wbuf.len {
            return false;
        }
        self.retire_at(wbuf, index);
        self.publish();
        true
    }

    /// Removes the element at `index` only if it compares equal to
    /// `expected`. Returns `false` without side effect otherwise.
    pub fn test_and_erase(&self, index: usize, expected: &T) -> bool
    where
        T: PartialEq,
    {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let wbuf = self.write_buffer();
        if index >= wbuf.len {
            return false;
        }
        // SAFETY: Exclusive write role; the element is alive (readers only
        // share it immutably).
        let matches = unsafe { *(*wbuf.ptrs.add(index)) == *expected };
        if !matches {
            return false;
        }
        self.retire_at(wbuf, index);
        self.publish();
        true
    }

    /// Removes every element. Capacity is preserved.
    pub fn clear(&self) {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let wbuf = self.write_buffer();
        for i in 0..wbuf.len {
            // SAFETY: Exclusive write role; each pointer parked once.
            unsafe {
                self.retired.push(Retired(*wbuf.ptrs.add(i)));
            }
        }
        wbuf.len = 0;
        self.publish();
    }

    fn pin_reader(&self) -> ReadPin<'_, T> {
        self.readers.fetch_add(1, SeqCst);
        ReadPin { vec: self }
    }

    /// Exclusive reference to the write-role buffer. Caller must hold the
    /// write lock.
    #[allow(clippy::mut_from_ref)]
    fn write_buffer(&self) -> &mut Buffer<T> {
        // SAFETY: The write role is only ever touched under the write lock,
        // and the previous publish drained all readers of this buffer.
        unsafe { &mut *self.write.load(Relaxed) }
    }

    /// Parks the element at `index` on the pending-delete stack and closes
    /// the gap.
    fn retire_at(&self, wbuf: &mut Buffer<T>, index: usize) {
        // SAFETY: Exclusive write role; `index < len` checked by callers.
        unsafe {
            self.retired.push(Retired(*wbuf.ptrs.add(index)));
            ptr::copy(
                wbuf.ptrs.add(index + 1),
                wbuf.ptrs.add(index),
                wbuf.len - index - 1,
            );
        }
        wbuf.len -= 1;
    }

    /// Grows `buf` by the growth factor so it can hold at least `min_cap`
    /// pointers, preserving contents.
    fn reserve(&self, buf: &mut Buffer<T>, min_cap: usize) {
        if buf.cap >= min_cap {
            return;
        }
        let new_cap = (((min_cap as f64) * self.growth) as usize).max(min_cap);
        let layout = Layout::array::<*mut T>(new_cap).expect("buffer capacity overflows layout");
        // SAFETY: Exclusive access to `buf`; the old array is released with
        // the layout it was allocated with.
        unsafe {
            let raw = alloc(layout) as *mut *mut T;
            if raw.is_null() {
                handle_alloc_error(layout);
            }
            ptr::copy_nonoverlapping(buf.ptrs, raw, buf.len);
            buf.free_array();
            buf.ptrs = raw;
            buf.cap = new_cap;
        }
    }

    /// Reallocates `buf` to exactly `cap` pointers if it is smaller,
    /// without preserving contents.
    fn match_capacity(&self, buf: &mut Buffer<T>, cap: usize) {
        if buf.cap >= cap {
            return;
        }
        let layout = Layout::array::<*mut T>(cap).expect("buffer capacity overflows layout");
        // SAFETY: Exclusive access to `buf`; the old array is released with
        // the layout it was allocated with.
        unsafe {
            let raw = alloc(layout) as *mut *mut T;
            if raw.is_null() {
                handle_alloc_error(layout);
            }
            buf.free_array();
            buf.ptrs = raw;
            buf.cap = cap;
        }
    }

    /// The publish-swap. Caller must hold the write lock, with its borrow
    /// of the write buffer already dead.
    fn publish(&self) {
        let new_read = self.write.load(Relaxed);
        let old_read = self.read.load(Relaxed);

        // 1. Swap roles: the mutated buffer becomes visible to readers.
        self.read.store(new_read, SeqCst);
        self.write.store(old_read, Relaxed);

        // 2. Drain barrier I: readers of the pre-swap buffer finish.
        self.wait_for_readers();

        // 3. Sync the former read buffer; it now takes the write role and
        //    no reader can touch it anymore. Capacities are equalized
        //    exactly (not via the growth factor) so the two buffers
        //    converge and the capacity a reader observes never decreases
        //    across role swaps.
        // SAFETY: Post-barrier, this thread has exclusive access to
        // `old_read`; `new_read` is only read (readers share it immutably).
        unsafe {
            let src = &*new_read;
            let dst = &mut *old_read;
            self.match_capacity(dst, src.cap);
            ptr::copy_nonoverlapping(src.ptrs, dst.ptrs, src.len);
            dst.len = src.len;
        }

        // 4. Free retired elements. Neither buffer references them, and
        //    every reader that could have copied one out is drained.
        while let Some(Retired(p)) = self.retired.try_pop() {
            // SAFETY: The pointer was removed from the sequence under this
            // same lock acquisition or an earlier one; it is unreachable.
            drop(unsafe { Box::from_raw(p) });
        }

        // 5. Drain barrier II: no reader that entered during step 4 leaves
        //    holding a pointer freed by it.
        self.wait_for_readers();
    }

    fn wait_for_readers(&self) {
        let backoff = Backoff::new();
        while self.readers.load(SeqCst) != 0 {
            Self::wait_briefly(&backoff);
        }
    }

    #[cfg(not(loom))]
    fn wait_briefly(backoff: &Backoff) {
        backoff.snooze();
    }

    #[cfg(loom)]
    fn wait_briefly(_backoff: &Backoff) {
        loom::thread::yield_now();
    }
}

impl<T> Default for ReadVec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for ReadVec<T> {
    fn drop(&mut self) {
        let read = self.read.load(Relaxed);
        let write = self.write.load(Relaxed);
        // Every publish leaves both buffers carrying the same pointer set
        // and the pending-delete stack drained, so elements are freed once,
        // via the read buffer.
        debug_assert!(self.retired.is_empty());
        // SAFETY: `&mut self` proves quiescence; each element and both
        // buffer allocations are freed exactly once.
        unsafe {
            let rbuf = &mut *read;
            for i in 0..rbuf.len {
                drop(Box::from_raw(*rbuf.ptrs.add(i)));
            }
            (*read).free_array();
            (*write).free_array();
            drop(Box::from_raw(read));
            drop(Box::from_raw(write));
        }
    }
}

/// Best-effort element iterator; see [`ReadVec::iter`].
pub struct Iter<'a, T> {
    vec: &'a ReadVec<T>,
    index: usize,
}

impl<T: Clone> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let value = self.vec.try_at(self.index)?;
        self.index += 1;
        Some(value)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(all(test, not(loom)))]
#[path = "read_vec_tests.rs"]
mod read_vec_tests;
