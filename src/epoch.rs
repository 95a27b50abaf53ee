//! Global epoch counter, thread descriptor table, and allocator registry.
//!
//! The singleton [`Registry`] holds:
//! - the monotonic global epoch (buckets are indexed `epoch % 3`),
//! - a leaked table of per-thread descriptors, with thread ids allocated
//!   and recycled under a spin lock,
//! - the typed-allocator table (chunk layout + optional pre-free hook),
//! - orphan garbage handed over by exiting threads.
//!
//! Hot paths (publish, scan, advance) are plain atomics; the lock covers
//! register/deregister and orphan hand-off only.

use crate::align::{chunk_layout, dealloc_chunk_raw, CacheAligned};
use crate::spin::SpinLock;
use once_cell::race::OnceBox;
use std::alloc::Layout;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Hook invoked on a chunk immediately before it becomes reusable.
///
/// Runs once per reclaimed chunk, before the chunk is pushed onto a
/// free-list (or returned to the system). The hook must not allocate or
/// free through petek itself.
pub type FreeHook = unsafe fn(*mut u8);

/// Number of epoch buckets per allocator cache. A chunk freed in epoch `e`
/// is reusable once the global epoch reaches `e + 2`, so three buckets
/// always suffice.
pub(crate) const NUM_EPOCHS: usize = 3;

/// Epochs a chunk stays deferred before it may be recycled.
pub(crate) const GRACE_EPOCHS: u64 = 2;

// Maximum concurrent threads. Configurable via cargo features:
//   petek = { features = ["max-threads-512"] }
// Default: 128.
#[cfg(feature = "max-threads-1024")]
pub(crate) const MAX_THREADS: usize = 1024;
#[cfg(all(feature = "max-threads-512", not(feature = "max-threads-1024")))]
pub(crate) const MAX_THREADS: usize = 512;
#[cfg(all(
    feature = "max-threads-256",
    not(any(feature = "max-threads-512", feature = "max-threads-1024"))
))]
pub(crate) const MAX_THREADS: usize = 256;
#[cfg(not(any(
    feature = "max-threads-256",
    feature = "max-threads-512",
    feature = "max-threads-1024"
)))]
pub(crate) const MAX_THREADS: usize = 128;

/// Maximum number of typed allocators for the process lifetime.
pub(crate) const MAX_ALLOCATORS: usize = 32;

/// Per-thread descriptor. Padded so descriptors of different threads never
/// share a cache line.
#[repr(align(128))]
pub(crate) struct ThreadRecord {
    /// Epoch published while the thread is in a critical section;
    /// 0 while quiescent. Epochs start at 1, so 0 is unambiguous.
    epoch: AtomicU64,
}

impl ThreadRecord {
    fn new() -> Self {
        Self {
            epoch: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn publish(&self, epoch: u64) {
        self.epoch.store(epoch, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn quiesce(&self) {
        self.epoch.store(0, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn published(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }
}

/// Immutable description of a typed allocator, set at registration.
#[derive(Copy, Clone)]
pub(crate) struct AllocatorInfo {
    pub(crate) layout: Layout,
    pub(crate) hook: Option<FreeHook>,
}

struct AllocatorSlot {
    info: UnsafeCell<MaybeUninit<AllocatorInfo>>,
}

/// Deferred garbage of an exited thread: a chunk batch plus the epoch it
/// was freed in. Adopted and reclaimed by whichever thread next drives
/// reclamation.
pub(crate) struct Orphan {
    pub(crate) allocator: usize,
    pub(crate) chunks: Vec<*mut u8>,
    pub(crate) epoch: u64,
}

/// Global reclamation state.
pub(crate) struct Registry {
    /// Monotonic global epoch; starts at 1. Isolated on its own cache
    /// line: every pin reads it and every advance CASes it, while the
    /// neighboring fields are cold.
    epoch: CacheAligned<AtomicU64>,
    /// Leaked descriptor table, indexed by thread id.
    records: &'static [ThreadRecord],
    /// High-water mark of allocated thread ids.
    next_tid: AtomicUsize,
    /// Recycled thread ids.
    free_tids: SpinLock<Vec<usize>>,
    /// Published allocator count; slots below it are immutable.
    allocator_count: AtomicUsize,
    allocators: [AllocatorSlot; MAX_ALLOCATORS],
    /// Register/deregister lock for the allocator table.
    registration: SpinLock<()>,
    /// Garbage handed over by exiting threads.
    orphans: SpinLock<Vec<Orphan>>,
}

// SAFETY: raw pointers in `orphans` are exclusively owned batches, and
// the allocator slots are only written under `registration` before the
// count is published with Release.
unsafe impl Send for Registry {}
unsafe impl Sync for Registry {}

impl Registry {
    fn new() -> Self {
        let mut records = Vec::with_capacity(MAX_THREADS);
        for _ in 0..MAX_THREADS {
            records.push(ThreadRecord::new());
        }
        Self {
            epoch: CacheAligned::new(AtomicU64::new(1)),
            records: Box::leak(records.into_boxed_slice()),
            next_tid: AtomicUsize::new(0),
            free_tids: SpinLock::new(Vec::new()),
            allocator_count: AtomicUsize::new(0),
            allocators: core::array::from_fn(|_| AllocatorSlot {
                info: UnsafeCell::new(MaybeUninit::uninit()),
            }),
            registration: SpinLock::new(()),
            orphans: SpinLock::new(Vec::new()),
        }
    }

    #[inline]
    pub(crate) fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn record(&self, tid: usize) -> &ThreadRecord {
        &self.records[tid]
    }

    /// Attempt one global epoch advance.
    ///
    /// Succeeds only if every thread currently in a critical section has
    /// published the current epoch; quiescent threads never block the
    /// advance. Returns true on success.
    pub(crate) fn try_advance(&self) -> bool {
        let cur = self.epoch.load(Ordering::SeqCst);
        let high = self.next_tid.load(Ordering::Acquire).min(MAX_THREADS);
        for tid in 0..high {
            let seen = self.records[tid].published();
            if seen != 0 && seen != cur {
                return false;
            }
        }
        self.epoch
            .compare_exchange(cur, cur + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    /// Allocate a thread id, recycling exited ones first.
    pub(crate) fn alloc_tid(&self) -> usize {
        {
            let mut free = self.free_tids.lock();
            if let Some(tid) = free.pop() {
                return tid;
            }
        }
        // Claim ids with a CAS rather than fetch_add: a failed capacity
        // check must leave next_tid untouched, or a caught panic would
        // strand descriptor slots that were never handed out.
        loop {
            let current = self.next_tid.load(Ordering::Relaxed);
            assert!(
                current < MAX_THREADS,
                "petek: exceeded maximum thread count ({MAX_THREADS})"
            );
            match self.next_tid.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current,
                Err(_) => continue,
            }
        }
    }

    /// Release a thread id for recycling. The caller must already be
    /// quiescent.
    pub(crate) fn free_tid(&self, tid: usize) {
        self.records[tid].quiesce();
        let mut free = self.free_tids.lock();
        free.push(tid);
    }

    /// Register a typed allocator and return its table index.
    pub(crate) fn register_allocator(&self, size: usize, hook: Option<FreeHook>) -> usize {
        let _reg = self.registration.lock();
        let index = self.allocator_count.load(Ordering::Relaxed);
        assert!(
            index < MAX_ALLOCATORS,
            "petek: exceeded maximum allocator count ({MAX_ALLOCATORS})"
        );
        let info = AllocatorInfo {
            layout: chunk_layout(size),
            hook,
        };
        // SAFETY: slots at or above `allocator_count` are unpublished, and
        // the registration lock serializes writers.
        unsafe { (*self.allocators[index].info.get()).write(info) };
        self.allocator_count.store(index + 1, Ordering::Release);
        index
    }

    /// Look up a registered allocator.
    #[inline]
    pub(crate) fn allocator(&self, index: usize) -> AllocatorInfo {
        let count = self.allocator_count.load(Ordering::Acquire);
        assert!(index < count, "petek: unregistered allocator id {index}");
        // SAFETY: slots below the Acquire-loaded count were fully written
        // before the Release store that published them and are immutable.
        unsafe { (*self.allocators[index].info.get()).assume_init() }
    }

    /// Hand over an exiting thread's deferred garbage.
    pub(crate) fn push_orphan(&self, orphan: Orphan) {
        let mut orphans = self.orphans.lock();
        orphans.push(orphan);
    }

    /// Reclaim adopted garbage.
    ///
    /// With `only_expired`, batches are reclaimed only once the global
    /// epoch has moved two past their free epoch; `teardown` passes false
    /// because quiescence is its caller's contract.
    pub(crate) fn adopt_orphans(&self, only_expired: bool) {
        let current = self.current_epoch();
        let adopted: Vec<Orphan> = {
            let mut orphans = self.orphans.lock();
            if only_expired {
                let mut ready = Vec::new();
                let mut i = 0;
                while i < orphans.len() {
                    if orphans[i].epoch + GRACE_EPOCHS <= current {
                        ready.push(orphans.swap_remove(i));
                    } else {
                        i += 1;
                    }
                }
                ready
            } else {
                std::mem::take(&mut *orphans)
            }
        };
        for orphan in adopted {
            let info = self.allocator(orphan.allocator);
            for chunk in orphan.chunks {
                // SAFETY: the batch is exclusively owned once removed from
                // the orphan list, and its epoch condition (or teardown
                // quiescence) guarantees no thread still references it.
                unsafe {
                    if let Some(hook) = info.hook {
                        hook(chunk);
                    }
                    dealloc_chunk_raw(chunk, info.layout);
                }
            }
        }
    }

    /// True if any thread is currently inside a critical section.
    pub(crate) fn any_active(&self) -> bool {
        let high = self.next_tid.load(Ordering::Acquire).min(MAX_THREADS);
        (0..high).any(|tid| self.records[tid].published() != 0)
    }
}

/// Global singleton instance.
static GLOBAL: OnceBox<Registry> = OnceBox::new();

/// Get a reference to the global registry, creating it on first use.
#[inline]
pub(crate) fn global() -> &'static Registry {
    GLOBAL.get_or_init(|| Box::new(Registry::new()))
}
