//! Concurrent in-memory containers for many-threaded workloads.
//!
//! # Scope
//! Four independent containers, each generic over its element type and safe
//! to share across threads by reference:
//!
//! - [`Stack`]: lock-free LIFO over an atomic singly linked chain.
//! - [`Queue`]: FIFO built on flat combining; one thread at a time drains a
//!   batch of requests published by the others.
//! - [`DataPool`]: unordered bag over growable slot blocks with per-slot
//!   producer/consumer handoff flags. No extraction order.
//! - [`ReadVec`]: growable indexed sequence with lock-free readers and
//!   mutex-serialized writers over a double buffer.
//!
//! # Design themes
//! - `try_` operations report unavailability by value (`Option`/`bool`);
//!   nothing blocks on emptiness and nothing logs.
//! - Spin waits back off and yield so oversubscribed workloads degrade
//!   gracefully.
//! - Reclamation is explicit: the stack and pool retire memory through
//!   epochs, the queue frees nodes inside its single-threaded combiner, and
//!   the vector parks removed elements until its reader drain barriers pass.
//!
//! # Consistency notes
//! The containers compose no guarantees across one another: no transactional
//! composition, no ordering between containers. Emptiness probes
//! (`is_empty`, `size`) are hints that may be stale by the time the caller
//! acts on them.
//!
//! # Safety
//! The containers use `unsafe` internally (raw node chains, value cells
//! handed between threads). Invariants are documented per module; read them
//! before extending the internals.

pub mod pool;
pub mod queue;
pub mod read_vec;
pub mod stack;

pub use pool::DataPool;
pub use queue::Queue;
pub use read_vec::ReadVec;
pub use stack::Stack;
