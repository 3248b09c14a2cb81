//! Lock-free LIFO stack over an atomic singly linked chain.
//!
//! # Design
//!
//! A Treiber stack: the head is an atomic pointer to the newest node, each
//! node links to the next-older one, and both `push` and `try_pop` are CAS
//! loops on the head. Neither operation fails under contention; a lost CAS
//! refreshes its snapshot and retries, and `try_pop` returns `None` only
//! when it genuinely observed an empty chain.
//!
//! # Reclamation
//!
//! Popping a node does not make it immediately freeable: a concurrent
//! `try_pop` may have loaded the same head snapshot and is about to read its
//! `next` link. Freeing eagerly would also reopen the classic ABA window,
//! where a recycled allocation reappears at the same address and a stale CAS
//! succeeds against it. Nodes are therefore retired through epoch-based
//! reclamation: every operation runs pinned, and a popped node is deferred
//! until no pinned thread can still hold a snapshot of it.
//!
//! # Ordering rationale
//!
//! ```text
//! push: write node fields, then Release-CAS head  →  pop: Acquire-load head, then read node
//! ```
//!
//! The release on the publishing CAS pairs with the acquire on the head load
//! so a claimed node's value and next link are fully visible to the popper.

use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crossbeam_epoch::{self as epoch, Atomic, Owned};
use crossbeam_utils::CachePadded;

/// Lock-free LIFO stack.
///
/// Shared by reference across threads; all operations take `&self`.
/// The stack owns its nodes: values still on the chain are dropped when the
/// stack is dropped.
pub struct Stack<T> {
    /// Newest node, or null when empty. Padded: every operation CASes this
    /// word, and it would otherwise share a line with neighboring fields.
    head: CachePadded<Atomic<Node<T>>>,
}

struct Node<T> {
    /// Wrapped so a popped node's storage can be released without dropping
    /// the value a second time (the value is moved out by the popper).
    value: ManuallyDrop<T>,
    next: Atomic<Node<T>>,
}

unsafe impl<T: Send> Send for Stack<T> {}
unsafe impl<T: Send> Sync for Stack<T> {}

impl<T> Stack<T> {
    /// Creates an empty stack.
    pub fn new() -> Self {
        Self {
            head: CachePadded::new(Atomic::null()),
        }
    }

    /// Pushes `value` onto the top of the stack.
    ///
    /// Lock-free; retries internally on contention and cannot fail.
    pub fn push(&self, value: T) {
        let mut node = Owned::new(Node {
            value: ManuallyDrop::new(value),
            next: Atomic::null(),
        });

        let guard = epoch::pin();
        loop {
            let head = self.head.load(Relaxed, &guard);
            node.next.store(head, Relaxed);
            match self.head.compare_exchange(head, node, Release, Relaxed, &guard) {
                Ok(_) => return,
                // The CAS hands the node back on failure; refresh and retry.
                Err(err) => node = err.new,
            }
        }
    }

    /// Pops the most recently pushed value, or returns `None` if the stack
    /// was empty at the observation point.
    pub fn try_pop(&self) -> Option<T> {
        let guard = epoch::pin();
        loop {
            let head = self.head.load(Acquire, &guard);
            // SAFETY: A non-null head is a node published by `push` and kept
            // alive by the pin for at least the lifetime of `guard`.
            let node = unsafe { head.as_ref() }?;
            let next = node.next.load(Relaxed, &guard);
            if self
                .head
                .compare_exchange(head, next, Acquire, Relaxed, &guard)
                .is_ok()
            {
                // SAFETY: The successful CAS unlinked `head`; this thread is
                // the unique popper of that node, so moving the value out and
                // retiring the storage happens exactly once. The deferred
                // destruction runs after every pinned snapshot is gone, and
                // the node's `Drop`-less value wrapper prevents a double
                // drop.
                unsafe {
                    let value = ptr::read(&*node.value);
                    guard.defer_destroy(head);
                    return Some(value);
                }
            }
        }
    }

    /// Returns whether the stack appeared empty.
    ///
    /// A hint: another thread may push or pop before the answer is used.
    pub fn is_empty(&self) -> bool {
        let guard = epoch::pin();
        self.head.load(Acquire, &guard).is_null()
    }
}

impl<T> Default for Stack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Stack<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` proves no concurrent access; the unprotected
        // guard is allowed. Each remaining node is freed exactly once and
        // its value dropped in place.
        unsafe {
            let guard = epoch::unprotected();
            let mut head = self.head.load(Relaxed, guard);
            while let Some(node) = head.as_ref() {
                let next = node.next.load(Relaxed, guard);
                let mut owned = head.into_owned();
                ManuallyDrop::drop(&mut owned.value);
                drop(owned);
                head = next;
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================


// ============================================================================
// Property Tests
// ============================================================================
