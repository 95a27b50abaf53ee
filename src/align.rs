//! Cache-line alignment and aligned raw chunk allocation.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::ops::{Deref, DerefMut};

/// Cache line size of the target architecture, in bytes.
///
/// Every chunk handed out by the typed allocators is sized and aligned to
/// this, which is also what guarantees the low pointer bit is free for
/// the tag in [`Atomic`](crate::Atomic). aarch64 gets 128 because recent
/// cores prefetch line pairs; s390x lines are genuinely 256 bytes; 64
/// covers x86_64 and everything else.
pub const CACHE_LINE_SIZE: usize = if cfg!(target_arch = "s390x") {
    256
} else if cfg!(target_arch = "aarch64") {
    128
} else {
    64
};

/// Pads and aligns a value to [`CACHE_LINE_SIZE`].
///
/// Used for hot shared words (like the global epoch counter) that would
/// otherwise false-share a line with cold neighbors. The alignment
/// attribute must mirror the constant above, since `repr(align)` only
/// takes literals.
#[cfg_attr(target_arch = "s390x", repr(align(256)))]
#[cfg_attr(target_arch = "aarch64", repr(align(128)))]
#[cfg_attr(
    not(any(target_arch = "s390x", target_arch = "aarch64")),
    repr(align(64))
)]
#[derive(Default, Debug)]
pub struct CacheAligned<T> {
    value: T,
}

impl<T> CacheAligned<T> {
    /// Move `value` onto its own cache line.
    pub fn new(value: T) -> Self {
        Self { value }
    }

    /// Unwrap the padded value.
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> Deref for CacheAligned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for CacheAligned<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

/// Layout for a chunk of at least `size` bytes, rounded up to a whole
/// number of cache lines and aligned to one.
///
/// The minimum size is one pointer: free chunks thread their free-list
/// link through their own first word.
pub(crate) fn chunk_layout(size: usize) -> Layout {
    let size = size.max(std::mem::size_of::<usize>());
    let size = (size + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1);
    Layout::from_size_align(size, CACHE_LINE_SIZE).expect("chunk size overflows layout")
}

/// Allocate a fresh cache-line-aligned chunk. Aborts on OOM.
pub(crate) fn alloc_chunk_raw(layout: Layout) -> *mut u8 {
    // SAFETY: layout has non-zero size by construction in chunk_layout.
    let ptr = unsafe { alloc(layout) };
    if ptr.is_null() {
        handle_alloc_error(layout);
    }
    ptr
}

/// Return a chunk to the system allocator.
///
/// # Safety
///
/// `ptr` must have been allocated with exactly `layout` via
/// [`alloc_chunk_raw`] and must not be referenced afterwards.
pub(crate) unsafe fn dealloc_chunk_raw(ptr: *mut u8, layout: Layout) {
    // SAFETY: caller guarantees ptr/layout pairing.
    unsafe { dealloc(ptr, layout) }
}
