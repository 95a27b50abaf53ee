//! Petek: generational epoch-based memory reclamation for lock-free
//! data structures.
//!
//! Petek defers the freeing of memory unlinked from a lock-free structure
//! until no thread can still hold a reference to it. Threads bracket every
//! access to shared nodes in a *critical section* ([`pin`]); freed chunks
//! are parked in a per-thread ring of three epoch buckets and recycled only
//! after every participating thread has been observed past two epoch
//! boundaries.
//!
//! # Key Features
//!
//! - **Typed allocators**: cache-line-aligned chunks with per-type,
//!   per-thread free-lists; the hot path never touches a lock.
//! - **Pre-free hooks**: per-allocator callbacks run right before a chunk
//!   becomes reusable.
//! - **Nested critical sections**: only the outermost [`pin`] publishes an
//!   epoch and drives the global epoch forward.
//! - **Tagged atomics**: [`Atomic`]/[`Shared`] pack a pointer and a
//!   one-bit mark into a single word so both change under one CAS.
//!
//! # Example
//!
//! ```rust
//! use petek::{pin, register_allocator, alloc_chunk, defer_free};
//!
//! let id = register_allocator(64, None);
//! let chunk = alloc_chunk(id);
//!
//! let guard = pin();
//! // ... publish `chunk` in a lock-free structure, later unlink it ...
//! unsafe { defer_free(id, chunk) };
//! drop(guard);
//! ```

#![warn(missing_docs)]

mod align;
mod alloc;
mod atomic;
mod epoch;
mod guard;
mod spin;

pub use align::{CacheAligned, CACHE_LINE_SIZE};
pub use alloc::AllocatorId;
pub use atomic::{Atomic, Shared};
pub use epoch::FreeHook;
pub use guard::{
    alloc_chunk, defer_free, flush, init, pin, register_allocator, teardown, Guard,
};

// Re-export for convenience
pub use core::sync::atomic::Ordering;
