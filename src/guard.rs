//! Guard and Handle for critical section management.
//!
//! Each thread owns a `Handle` in TLS: its pin nesting count, its cached
//! epoch, and one cache per typed allocator (a free-list plus a ring of
//! three deferred buckets). `pin()` publishes the global epoch, reclaims
//! whatever buckets have expired, and attempts one global epoch advance.

use crate::align::alloc_chunk_raw;
use crate::alloc::{dealloc_chain, pop_chunk, push_chunk, AllocatorId};
use crate::epoch::{global, FreeHook, Orphan, GRACE_EPOCHS, NUM_EPOCHS};
use core::cell::{Cell, RefCell};
use core::marker::PhantomData as marker;
use core::ptr;

/// RAII guard representing an active critical section.
///
/// While a Guard exists, the thread's published epoch protects every
/// chunk loaded during this critical section from being recycled. Nested
/// [`pin`] calls are cheap: only the outermost one publishes an epoch and
/// does reclamation work, and the epoch is withdrawn when the last guard
/// on the thread is dropped.
pub struct Guard {
    _private: (),
    marker: marker<*mut ()>,
}

impl Drop for Guard {
    #[inline]
    fn drop(&mut self) {
        // Use try_with to handle process teardown gracefully. During
        // static destructor execution TLS may already be destroyed, and
        // panicking in a destructor causes SIGABRT.
        let _ = HANDLE.try_with(|handle| handle.unpin());
    }
}

/// One deferred-free bucket: a chunk batch stamped with the epoch its
/// chunks were freed in. Deferred chunks may still be read by slow
/// threads, so the batch lives beside them; their bytes are untouched
/// until reclamation.
struct Bucket {
    chunks: Vec<*mut u8>,
    epoch: u64,
}

impl Bucket {
    const fn new() -> Self {
        Self {
            chunks: Vec::new(),
            epoch: 0,
        }
    }
}

/// Per-allocator, per-thread chunk cache.
struct TypeCache {
    /// Reusable chunks, chained through their first word. Everything here
    /// has already survived the grace period and had its hook run.
    free: *mut u8,
    /// Deferred chunks, indexed by `epoch % NUM_EPOCHS`.
    defer: [Bucket; NUM_EPOCHS],
}

impl TypeCache {
    const fn new() -> Self {
        Self {
            free: ptr::null_mut(),
            defer: [Bucket::new(), Bucket::new(), Bucket::new()],
        }
    }
}

/// Thread-local state: pin nesting, cached epoch, allocator caches.
struct Handle {
    /// Thread ID (lazily allocated on first pin).
    tid: Cell<Option<usize>>,
    /// Number of live Guard instances on this thread. Only the outermost
    /// pin() publishes the epoch; unpin withdraws it at zero.
    pin_count: Cell<usize>,
    /// Epoch published by the current critical section.
    cached_epoch: Cell<u64>,
    /// One cache per allocator id.
    caches: RefCell<Vec<TypeCache>>,
}

impl Handle {
    const fn new() -> Self {
        Self {
            tid: Cell::new(None),
            pin_count: Cell::new(0),
            cached_epoch: Cell::new(0),
            caches: RefCell::new(Vec::new()),
        }
    }

    /// Get or allocate this thread's id.
    #[inline]
    fn tid(&self) -> usize {
        match self.tid.get() {
            Some(tid) => tid,
            None => {
                let tid = global().alloc_tid();
                self.tid.set(Some(tid));
                tid
            }
        }
    }

    /// Enter a critical section.
    fn pin(&self) -> Guard {
        let count = self.pin_count.get();
        self.pin_count.set(count + 1);

        if count > 0 {
            // Nested pin: the outermost guard's epoch still protects us.
            return Guard {
                _private: (),
                marker,
            };
        }

        let registry = global();
        let record = registry.record(self.tid());

        // Publish the current global epoch. Re-check after publishing:
        // an advance between the load and the store would leave us
        // observing epoch e while advertising e-1, and a second advance
        // could then recycle chunks we are about to traverse.
        let mut epoch = registry.current_epoch();
        loop {
            record.publish(epoch);
            let now = registry.current_epoch();
            if now == epoch {
                break;
            }
            epoch = now;
        }
        self.cached_epoch.set(epoch);

        // Recycle buckets that have aged out under the published epoch.
        self.reclaim(epoch);

        // Attempt one global advance. On success the freshly expired
        // buckets become reusable right away; our own published epoch is
        // now one behind and catches up on the next pin.
        if registry.try_advance() {
            self.reclaim(epoch + 1);
            registry.adopt_orphans(true);
        }

        Guard {
            _private: (),
            marker,
        }
    }

    /// Leave a critical section.
    #[inline]
    fn unpin(&self) {
        let count = self.pin_count.get();
        // Saturating: a dummy Guard created while TLS was unavailable was
        // never pinned.
        self.pin_count.set(count.saturating_sub(1));
        if count == 1 {
            if let Some(tid) = self.tid.get() {
                global().record(tid).quiesce();
            }
        }
    }

    /// Move every bucket whose grace period has passed onto its
    /// free-list, running the allocator hook on each chunk first.
    fn reclaim(&self, current: u64) {
        let registry = global();
        let mut caches = self.caches.borrow_mut();
        for (index, cache) in caches.iter_mut().enumerate() {
            for bucket in cache.defer.iter_mut() {
                if bucket.chunks.is_empty() || bucket.epoch + GRACE_EPOCHS > current {
                    continue;
                }
                let hook = registry.allocator(index).hook;
                for chunk in bucket.chunks.drain(..) {
                    // SAFETY: the bucket aged past the grace period, so no
                    // thread can still reference the chunk; it is
                    // exclusively ours now.
                    unsafe {
                        if let Some(hook) = hook {
                            hook(chunk);
                        }
                        push_chunk(&mut cache.free, chunk);
                    }
                }
            }
        }
    }

    /// Make sure a cache exists for allocator `index`.
    fn ensure_cache(&self, index: usize) {
        let mut caches = self.caches.borrow_mut();
        while caches.len() <= index {
            caches.push(TypeCache::new());
        }
    }

    /// Allocate a chunk, preferring this thread's free-list.
    fn alloc(&self, id: AllocatorId) -> *mut u8 {
        self.ensure_cache(id.0);
        let mut caches = self.caches.borrow_mut();
        // SAFETY: the free chain is owned by this thread.
        let reused = unsafe { pop_chunk(&mut caches[id.0].free) };
        if !reused.is_null() {
            return reused;
        }
        drop(caches);
        alloc_chunk_raw(global().allocator(id.0).layout)
    }

    /// Defer a chunk, stamping it with the current critical section's
    /// epoch.
    ///
    /// # Safety
    ///
    /// See [`defer_free`].
    unsafe fn defer(&self, id: AllocatorId, chunk: *mut u8) {
        debug_assert!(
            self.pin_count.get() > 0,
            "petek: defer_free outside a critical section"
        );
        self.ensure_cache(id.0);
        let epoch = self.cached_epoch.get();
        let mut caches = self.caches.borrow_mut();
        let cache = &mut caches[id.0];
        let bucket = &mut cache.defer[(epoch % NUM_EPOCHS as u64) as usize];
        if !bucket.chunks.is_empty() && bucket.epoch != epoch {
            // The slot still holds a batch from three epochs back; that
            // one is long expired, so fold it into the free-list first.
            let hook = global().allocator(id.0).hook;
            for old in bucket.chunks.drain(..) {
                // SAFETY: a batch whose stamp differs from the current
                // epoch in the same ring slot is at least NUM_EPOCHS old.
                unsafe {
                    if let Some(hook) = hook {
                        hook(old);
                    }
                    push_chunk(&mut cache.free, old);
                }
            }
        }
        bucket.epoch = epoch;
        bucket.chunks.push(chunk);
    }

    /// Force reclamation on the calling thread: attempt epoch advances
    /// and recycle every bucket that expires along the way.
    fn flush(&self) {
        let registry = global();
        for _ in 0..=NUM_EPOCHS {
            let _ = registry.try_advance();
            self.reclaim(registry.current_epoch());
        }
        registry.adopt_orphans(true);
    }

    /// Thread-exit cleanup: return quiesced chunks to the system and hand
    /// deferred ones over to the registry as orphans.
    fn cleanup(&self) {
        let Some(tid) = self.tid.get() else { return };
        let registry = global();
        let mut caches = self.caches.borrow_mut();
        for (index, cache) in caches.iter_mut().enumerate() {
            let layout = registry.allocator(index).layout;
            let free = cache.free;
            cache.free = ptr::null_mut();
            // SAFETY: free-list chunks already survived their grace
            // period and are owned by this thread.
            unsafe { dealloc_chain(free, layout) };
            for bucket in cache.defer.iter_mut() {
                if bucket.chunks.is_empty() {
                    continue;
                }
                registry.push_orphan(Orphan {
                    allocator: index,
                    chunks: std::mem::take(&mut bucket.chunks),
                    epoch: bucket.epoch,
                });
            }
        }
        self.tid.set(None);
        registry.free_tid(tid);
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.cleanup();
    }
}

thread_local! {
    static HANDLE: Handle = const { Handle::new() };
}

/// Initialize the reclamation subsystem.
///
/// The registry is also created lazily on first use; calling this up
/// front just makes the initialization point explicit. Idempotent.
pub fn init() {
    let _ = global();
}

/// Tear down deferred state.
///
/// Requires quiescence: no thread may hold a [`Guard`]. Reclaims all
/// orphaned garbage immediately and drains the calling thread's caches.
/// Other threads' caches are released when those threads exit. The
/// allocator table stays valid, so the subsystem remains usable.
pub fn teardown() {
    let registry = global();
    assert!(
        !registry.any_active(),
        "petek: teardown with active critical sections"
    );
    let _ = HANDLE.try_with(|handle| {
        // Everything this thread deferred is safe under quiescence: age
        // the buckets out by advancing past the grace period.
        for _ in 0..=NUM_EPOCHS {
            let _ = registry.try_advance();
        }
        handle.reclaim(registry.current_epoch());
        handle.cleanup();
    });
    registry.adopt_orphans(false);
}

/// Enter a critical section.
///
/// Returns a [`Guard`]; while it lives, every [`Shared`](crate::Shared)
/// loaded on this thread stays valid. Nesting is supported; only the
/// outermost call publishes an epoch.
#[inline]
pub fn pin() -> Guard {
    // During process teardown TLS may be destroyed. Return a dummy guard
    // whose drop is also a no-op.
    HANDLE.try_with(|handle| handle.pin()).unwrap_or(Guard {
        _private: (),
        marker,
    })
}

/// Register a typed allocator.
///
/// `size` is the chunk payload size; chunks are rounded up to whole cache
/// lines. The optional `hook` runs on each chunk right before it becomes
/// reusable. Aborts if the allocator table is full.
pub fn register_allocator(size: usize, hook: Option<FreeHook>) -> AllocatorId {
    AllocatorId(global().register_allocator(size, hook))
}

/// Allocate a cache-line-aligned chunk from a registered allocator.
///
/// Reuses a chunk from the calling thread's free-list when one is
/// available. Aborts on OOM. May be called outside a critical section.
pub fn alloc_chunk(id: AllocatorId) -> *mut u8 {
    HANDLE
        .try_with(|handle| handle.alloc(id))
        .unwrap_or_else(|_| alloc_chunk_raw(global().allocator(id.0).layout))
}

/// Defer the freeing of `chunk` until every thread has passed two epoch
/// boundaries.
///
/// # Safety
///
/// - `chunk` must have been returned by [`alloc_chunk`] with the same
///   `id`, and must already be unlinked from the shared structure.
/// - The caller must be inside a critical section.
/// - The chunk must not be deferred more than once, nor accessed by the
///   caller afterwards.
pub unsafe fn defer_free(id: AllocatorId, chunk: *mut u8) {
    // During process teardown TLS may be destroyed. Leak the chunk;
    // process memory is reclaimed by the OS on exit.
    let _ = HANDLE.try_with(|handle| unsafe { handle.defer(id, chunk) });
}

/// Flush reclamation on the calling thread.
///
/// Attempts epoch advances and recycles every bucket of the calling
/// thread that expires along the way; also reclaims expired orphans. Call
/// before dropping a structure to release memory promptly. Other threads'
/// caches are unaffected.
pub fn flush() {
    let _ = HANDLE.try_with(|handle| handle.flush());
}
