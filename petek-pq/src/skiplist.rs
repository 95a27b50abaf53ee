//! Skip-list priority queue with amortized physical deletion.
//!
//! Keys order the queue; the minimum is always the first live node at the
//! bottom level. Delete-min claims a node by setting the mark bit of the
//! level-0 link pointing at it (a single `fetch_or`), so the marker sits
//! on the *preceding* pointer and marked links form a prefix of the
//! bottom list. Physical unlinking is deferred: once a delete-min has
//! walked past `max_offset` claimed nodes, it swings the head pointers
//! past the whole dead prefix in one batch and hands the detached nodes
//! to the reclamation layer.

use core::ptr;
use core::sync::atomic::AtomicBool;
use std::cell::RefCell;
use std::sync::OnceLock;

use crossbeam_utils::Backoff;
use petek::{
    alloc_chunk, defer_free, pin, register_allocator, AllocatorId, Atomic, Guard, Ordering,
    Shared,
};
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};

/// Maximum node height. Geometric level choice makes heights above this
/// astronomically unlikely before the table itself stops paying off.
pub const MAX_LEVEL: usize = 32;

/// Tag bit marking a level-0 link whose target has been claimed.
const DELETED: usize = 1;

/// Skip-list element. `next[l]` is live for `l < level`; the level-0 word
/// carries the deletion mark in its low bit.
#[repr(C)]
struct Node {
    key: u64,
    value: usize,
    level: usize,
    /// Set from allocation until every level of the node is wired.
    /// Restructure refuses to swing head past a node still wiring.
    inserting: AtomicBool,
    next: [Atomic<Node>; MAX_LEVEL],
}

impl Node {
    /// A node whose own level-0 link is marked has had its successor
    /// claimed, which (marked links forming a prefix) means the node
    /// itself was claimed before that. This is the "definitely dead"
    /// test used by walkers.
    #[inline]
    fn is_dead(&self, guard: &Guard) -> bool {
        self.next[0].load(Ordering::Acquire, guard).tag() == DELETED
    }
}

/// Shared allocator for all queues: one node type, one chunk size.
fn node_allocator() -> AllocatorId {
    static NODE_ALLOCATOR: OnceLock<AllocatorId> = OnceLock::new();
    *NODE_ALLOCATOR
        .get_or_init(|| register_allocator(core::mem::size_of::<Node>(), Some(reset_node)))
}

/// Pre-free hook: a recycled chunk must not resurface with a stale mark
/// or a stale wiring flag.
unsafe fn reset_node(chunk: *mut u8) {
    let node = chunk.cast::<Node>();
    // SAFETY: the reclamation layer guarantees exclusive access when the
    // hook runs.
    unsafe {
        ptr::addr_of_mut!((*node).inserting).write(AtomicBool::new(false));
        ptr::addr_of_mut!((*node).next[0]).write(Atomic::null());
    }
}

/// Geometric level with parameter 1/2, capped at [`MAX_LEVEL`].
fn random_level() -> usize {
    thread_local! {
        static RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_entropy());
    }
    RNG.with(|rng| {
        let bits = rng.borrow_mut().next_u64();
        (bits.trailing_ones() as usize + 1).min(MAX_LEVEL)
    })
}

/// Search snapshot: per level the last node with key below the target and
/// its successor, plus the tail of the dead bottom-level prefix if the
/// walk passed through one.
struct Located<'g> {
    preds: [Shared<'g, Node>; MAX_LEVEL],
    succs: [Shared<'g, Node>; MAX_LEVEL],
    del: Shared<'g, Node>,
}

/// A concurrent min-priority queue over `u64` keys with word-sized
/// payloads.
///
/// All operations take `&self` and may be called from any number of
/// threads. Keys `0` and `u64::MAX` are reserved for the sentinels.
pub struct PriorityQueue {
    head: *mut Node,
    tail: *mut Node,
    /// Claimed nodes a delete-min may walk past before it batches up
    /// physical unlinking.
    max_offset: usize,
}

// SAFETY: the queue is a pair of pointers to nodes whose shared mutation
// happens exclusively through atomics under the reclamation protocol.
unsafe impl Send for PriorityQueue {}
unsafe impl Sync for PriorityQueue {}

impl PriorityQueue {
    /// Create an empty queue.
    ///
    /// `max_offset` tunes how much dead prefix a delete-min tolerates
    /// before restructuring: small values reclaim eagerly but contend on
    /// the head, large values do the opposite. 10 is a good default.
    pub fn new(max_offset: usize) -> Self {
        petek::init();
        let tail = alloc_node(u64::MAX, 0, MAX_LEVEL, false);
        let head = alloc_node(0, 0, MAX_LEVEL, false);
        for level in 0..MAX_LEVEL {
            // SAFETY: both sentinels are unpublished.
            unsafe { &*head }.next[level].store(
                // SAFETY: tail outlives the queue.
                unsafe { Shared::from_raw(tail) },
                Ordering::Relaxed,
            );
        }
        Self {
            head,
            tail,
            max_offset,
        }
    }

    /// Insert `value` under `key`.
    ///
    /// Keys must lie strictly between the sentinels: `0 < key < u64::MAX`.
    /// Duplicate keys are kept; ordering among equals is unspecified.
    /// The node is visible to `delete_min` when this returns.
    pub fn insert(&self, key: u64, value: usize) {
        debug_assert!(
            key > 0 && key < u64::MAX,
            "petek-pq: key {key} is reserved for a sentinel"
        );
        let guard = pin();
        let level = random_level();
        let node = alloc_node(key, value, level, true);
        // SAFETY: node is ours until the level-0 CAS publishes it.
        let new = unsafe { Shared::from_raw(node) };
        let backoff = Backoff::new();

        // Bottom-level linkage: the commit point.
        let mut loc = loop {
            let loc = self.locate_preds(key, &guard);
            // SAFETY: node is still private.
            unsafe { &*node }.next[0].store(loc.succs[0], Ordering::Relaxed);
            // SAFETY: preds are non-null nodes observed under the guard.
            let pred = unsafe { loc.preds[0].deref() };
            match pred.next[0].compare_exchange(
                loc.succs[0],
                new,
                Ordering::Release,
                Ordering::Relaxed,
                &guard,
            ) {
                Ok(_) => break loc,
                // Either the predecessor got claimed (its link word grew
                // a mark) or its successor changed. Re-locate and retry.
                Err(_) => backoff.spin(),
            }
        };

        // SAFETY: the node is published and protected by the guard.
        let node_ref = unsafe { new.deref() };

        // Higher levels are best-effort shortcuts.
        let mut lvl = 1;
        while lvl < node_ref.level {
            // A mark on our own level-0 link means the node was already
            // consumed; reintroducing it above would resurrect it.
            if node_ref.is_dead(&guard) {
                break;
            }
            let succ = loc.succs[lvl];
            // SAFETY: succ is non-null (chains end at the tail sentinel).
            if unsafe { succ.deref() }.is_dead(&guard) || succ == loc.del {
                break;
            }
            node_ref.next[lvl].store(succ, Ordering::Relaxed);
            // SAFETY: preds are non-null nodes observed under the guard.
            let pred = unsafe { loc.preds[lvl].deref() };
            match pred.next[lvl].compare_exchange(
                succ,
                new,
                Ordering::Release,
                Ordering::Relaxed,
                &guard,
            ) {
                Ok(_) => lvl += 1,
                Err(_) => {
                    // Competing insert or restructure moved the level.
                    backoff.spin();
                    loc = self.locate_preds(key, &guard);
                    if loc.succs[0] != new {
                        // No longer found at the bottom: the node has been
                        // claimed and unlinked. Leave the rest unwired.
                        break;
                    }
                }
            }
        }

        node_ref.inserting.store(false, Ordering::Release);
    }

    /// Remove and return the payload of a minimal-key node, or `None`
    /// when the queue is empty.
    pub fn delete_min(&self) -> Option<usize> {
        let guard = pin();
        // SAFETY: sentinels live as long as the queue.
        let head = unsafe { &*self.head };
        let obs_head = head.next[0].load(Ordering::Acquire, &guard);
        let mut newhead: Shared<'_, Node> = Shared::null();
        let mut offset = 0usize;
        // SAFETY: head outlives the queue.
        let mut x: Shared<'_, Node> = unsafe { Shared::from_raw(self.head) };

        let claimed = loop {
            // SAFETY: the walk only visits head and nodes reachable from
            // it under the guard.
            let node = unsafe { x.deref() };
            let nxt = node.next[0].load(Ordering::Acquire, &guard);
            if nxt.with_tag(0).as_ptr() == self.tail {
                // Reached the tail without a live node: empty.
                return None;
            }
            // Never let the head swing past a node that is still wiring
            // its upper levels.
            if newhead.is_null() && node.inserting.load(Ordering::Acquire) {
                newhead = x;
            }
            if nxt.tag() == DELETED {
                // Successor already claimed; keep walking the prefix.
                offset += 1;
                x = nxt.with_tag(0);
                continue;
            }
            // Claim the successor: one fetch_or sets the mark and tells
            // us whether we won. This is the linearization point.
            let old = node.next[0].fetch_or(DELETED, Ordering::AcqRel, &guard);
            offset += 1;
            if old.tag() == 0 {
                break old.with_tag(0);
            }
            // Lost the race; the winner took this successor.
            x = old.with_tag(0);
        };

        // SAFETY: a claimed node is not recycled while we hold the guard.
        let value = unsafe { claimed.deref() }.value;

        if offset > self.max_offset {
            self.try_restructure(obs_head, newhead, claimed, &guard);
        }
        Some(value)
    }

    /// Batch physical deletion: swing the head past the dead prefix at
    /// every level and retire the detached nodes.
    fn try_restructure<'g>(
        &self,
        obs_head: Shared<'g, Node>,
        newhead: Shared<'g, Node>,
        claimed: Shared<'g, Node>,
        guard: &'g Guard,
    ) {
        // SAFETY: head outlives the queue.
        let head = unsafe { &*self.head };
        if head.next[0].load(Ordering::Acquire, guard) != obs_head {
            // Somebody else already moved the head past our observation.
            return;
        }
        let nh = if newhead.is_null() { claimed } else { newhead };
        // Winning this CAS grants the exclusive right to unlink and
        // retire everything before `nh`. The stored link keeps its mark:
        // `nh` is itself a claimed node.
        if head.next[0]
            .compare_exchange(
                obs_head,
                nh.with_tag(DELETED),
                Ordering::AcqRel,
                Ordering::Relaxed,
                guard,
            )
            .is_err()
        {
            return;
        }

        self.restructure(guard);

        // The nodes between the old and the new head are unreachable from
        // every level now; hand them to the reclamation layer.
        let mut cur = obs_head.with_tag(0);
        while cur.as_ptr() != nh.as_ptr() {
            // SAFETY: the detached prefix stays readable under our guard.
            let next = unsafe { cur.deref() }
                .next[0]
                .load(Ordering::Acquire, guard)
                .with_tag(0);
            // SAFETY: the chunk came from `node_allocator()`, has been
            // unlinked from all levels, and is retired exactly once by
            // the thread that won the head CAS.
            unsafe { defer_free(node_allocator(), cur.as_ptr().cast()) };
            cur = next;
        }
    }

    /// Swing `head.next[l]` past dead nodes for every shortcut level,
    /// top-down. Stops at the first live node, or at a node still
    /// wiring, whose shortcut links are not yet stable.
    fn restructure(&self, guard: &Guard) {
        // SAFETY: head outlives the queue.
        let head = unsafe { &*self.head };
        // SAFETY: same.
        let mut pred: Shared<'_, Node> = unsafe { Shared::from_raw(self.head) };
        let mut lvl = MAX_LEVEL - 1;
        while lvl > 0 {
            let h = head.next[lvl].load(Ordering::Acquire, guard);
            // SAFETY: chains are null-free; they end at the tail.
            if !unsafe { h.deref() }.is_dead(guard) {
                lvl -= 1;
                continue;
            }
            let mut cur = unsafe { pred.deref() }
                .next[lvl]
                .load(Ordering::Acquire, guard)
                .with_tag(0);
            loop {
                // SAFETY: nodes on the walk are protected by the guard.
                let node = unsafe { cur.deref() };
                if !node.is_dead(guard) || node.inserting.load(Ordering::Acquire) {
                    break;
                }
                pred = cur;
                cur = node.next[lvl].load(Ordering::Acquire, guard).with_tag(0);
            }
            if head
                .next[lvl]
                .compare_exchange(h, cur, Ordering::AcqRel, Ordering::Relaxed, guard)
                .is_ok()
            {
                lvl -= 1;
            }
            // On CAS failure, retry the same level against the new head.
        }
    }

    /// Per level, find the last node with a key below `key` following
    /// live links, its successor, and the tail of the dead bottom-level
    /// prefix if one was crossed.
    ///
    /// Dead nodes observed on shortcut levels are spliced out on the way;
    /// a failed splice restarts the walk from the head.
    fn locate_preds<'g>(&self, key: u64, guard: &'g Guard) -> Located<'g> {
        let backoff = Backoff::new();
        'restart: loop {
            let mut preds = [Shared::null(); MAX_LEVEL];
            let mut succs = [Shared::null(); MAX_LEVEL];
            let mut del = Shared::null();
            // SAFETY: head outlives the queue.
            let mut pred: Shared<'g, Node> = unsafe { Shared::from_raw(self.head) };
            let mut lvl = MAX_LEVEL;
            while lvl > 0 {
                lvl -= 1;
                // SAFETY: preds and their successors stay readable under
                // the guard.
                let mut link = unsafe { pred.deref() }.next[lvl].load(Ordering::Acquire, guard);
                let mut d = link.tag() == DELETED;
                let mut cur = link.with_tag(0);
                loop {
                    // SAFETY: chains are null-free; they end at the tail.
                    let node = unsafe { cur.deref() };
                    let dead = node.is_dead(guard);
                    if lvl > 0 && dead {
                        // Splice the dead node out of this shortcut level.
                        let succ = node.next[lvl].load(Ordering::Acquire, guard).with_tag(0);
                        // SAFETY: pred was observed under this guard.
                        match unsafe { pred.deref() }.next[lvl].compare_exchange(
                            cur,
                            succ,
                            Ordering::AcqRel,
                            Ordering::Relaxed,
                            guard,
                        ) {
                            Ok(_) => {
                                cur = succ;
                                continue;
                            }
                            Err(_) => {
                                backoff.spin();
                                continue 'restart;
                            }
                        }
                    }
                    if node.key < key || dead || (lvl == 0 && d) {
                        if lvl == 0 && d {
                            // Bottom-level node claimed but not yet
                            // physically unlinked; remember the last one.
                            del = cur;
                        }
                        pred = cur;
                        link = node.next[lvl].load(Ordering::Acquire, guard);
                        d = link.tag() == DELETED;
                        cur = link.with_tag(0);
                    } else {
                        break;
                    }
                }
                preds[lvl] = pred;
                succs[lvl] = cur;
            }
            return Located { preds, succs, del };
        }
    }
}

impl Drop for PriorityQueue {
    /// Tear the queue down. Must not run concurrently with any other
    /// operation on the queue.
    fn drop(&mut self) {
        {
            let guard = pin();
            // SAFETY: no concurrent operations; all nodes are ours.
            let mut cur = unsafe { &*self.head }
                .next[0]
                .load(Ordering::Acquire, &guard)
                .with_tag(0);
            while cur.as_ptr() != self.tail {
                // SAFETY: same.
                let next = unsafe { cur.deref() }
                    .next[0]
                    .load(Ordering::Acquire, &guard)
                    .with_tag(0);
                // SAFETY: node unlinked by teardown, retired once.
                unsafe { defer_free(node_allocator(), cur.as_ptr().cast()) };
                cur = next;
            }
            // SAFETY: sentinels are retired last, exactly once.
            unsafe {
                defer_free(node_allocator(), self.head.cast());
                defer_free(node_allocator(), self.tail.cast());
            }
        }
        petek::flush();
    }
}

/// Allocate and initialize a node from the shared typed allocator.
fn alloc_node(key: u64, value: usize, level: usize, inserting: bool) -> *mut Node {
    let node = alloc_chunk(node_allocator()).cast::<Node>();
    // SAFETY: the chunk is exclusively ours and sized/aligned for Node.
    unsafe {
        ptr::write(
            node,
            Node {
                key,
                value,
                level,
                inserting: AtomicBool::new(inserting),
                next: core::array::from_fn(|_| Atomic::null()),
            },
        );
    }
    node
}
