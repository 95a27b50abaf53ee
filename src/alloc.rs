//! Chunk bookkeeping for typed allocators.
//!
//! Free chunks (quiesced, no reader can hold them) are chained through
//! their own first word, so the free-list costs no side allocations.
//! Deferred chunks must stay byte-identical while slow readers may still
//! dereference them, so those are batched in plain vectors instead and
//! only get their link word written once the grace period has passed.

use std::alloc::Layout;

use crate::align::dealloc_chunk_raw;

/// Identifier of a registered typed allocator.
///
/// Returned by [`register_allocator`](crate::register_allocator); valid for
/// the rest of the process lifetime.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AllocatorId(pub(crate) usize);

/// Push `chunk` onto the free chain rooted at `head`.
///
/// # Safety
///
/// `chunk` must be a live chunk of at least pointer size, exclusively
/// owned by the caller, with no remaining readers, and not already on any
/// chain.
#[inline]
pub(crate) unsafe fn push_chunk(head: &mut *mut u8, chunk: *mut u8) {
    // SAFETY: caller guarantees the chunk is writable and owned.
    unsafe {
        *(chunk as *mut *mut u8) = *head;
    }
    *head = chunk;
}

/// Pop a chunk off the free chain rooted at `head`, or return null.
///
/// # Safety
///
/// All chunks on the chain must be live and exclusively owned through
/// `head`.
#[inline]
pub(crate) unsafe fn pop_chunk(head: &mut *mut u8) -> *mut u8 {
    let chunk = *head;
    if !chunk.is_null() {
        // SAFETY: the link was written by push_chunk.
        *head = unsafe { *(chunk as *mut *mut u8) };
    }
    chunk
}

/// Return every chunk of a free chain to the system allocator.
///
/// # Safety
///
/// The chain must be exclusively owned, and every chunk must have been
/// allocated with `layout`.
pub(crate) unsafe fn dealloc_chain(head: *mut u8, layout: Layout) {
    let mut chunk = head;
    while !chunk.is_null() {
        // SAFETY: chain links were written by push_chunk.
        let next = unsafe { *(chunk as *mut *mut u8) };
        // SAFETY: caller guarantees ownership and layout pairing.
        unsafe { dealloc_chunk_raw(chunk, layout) };
        chunk = next;
    }
}
