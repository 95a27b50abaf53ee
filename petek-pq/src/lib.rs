//! Lock-free skip-list priority queue.
//!
//! A min-ordered concurrent priority queue keyed by `u64`. Insert and
//! delete-min are lock-free: removal first *logically* deletes a node by
//! setting a mark bit packed into a level-0 link, and physical unlinking
//! is batched and amortized, so neither operation ever blocks the other.
//! Node lifetime is managed by [`petek`]'s epoch reclamation: unlinked
//! nodes are recycled only once no thread can still observe them.
//!
//! # Example
//!
//! ```rust
//! use petek_pq::PriorityQueue;
//!
//! let pq = PriorityQueue::new(10);
//! pq.insert(5, 500);
//! pq.insert(3, 300);
//! assert_eq!(pq.delete_min(), Some(300));
//! assert_eq!(pq.delete_min(), Some(500));
//! assert_eq!(pq.delete_min(), None);
//! ```

#![warn(missing_docs)]

pub mod skiplist;

pub use skiplist::{PriorityQueue, MAX_LEVEL};
