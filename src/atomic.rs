//! Tagged atomic pointers with guard-protected access.
//!
//! [`Atomic<T>`] stores a pointer and a one-bit tag in a single word, so a
//! pointer and its mark change together under one compare-exchange and
//! readers can never observe a torn update. [`Shared<'g, T>`] is the
//! guard-lifetime view of a loaded word.

use crate::guard::Guard;
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Mask of the tag bit. Chunk alignment is at least a cache line, so the
/// low pointer bit is always free.
const TAG_MASK: usize = 1;

/// A word holding a pointer to `T` plus a one-bit tag.
///
/// Loads require a live [`Guard`]: the guard's critical section is what
/// keeps the pointee from being reclaimed while the caller dereferences
/// it.
pub struct Atomic<T> {
    data: AtomicUsize,
    _marker: PhantomData<*mut T>,
}

unsafe impl<T: Send + Sync> Send for Atomic<T> {}
unsafe impl<T: Send + Sync> Sync for Atomic<T> {}

impl<T> Atomic<T> {
    /// Creates a new atomic word from an untagged pointer.
    #[inline]
    pub fn new(ptr: *mut T) -> Self {
        Self {
            data: AtomicUsize::new(ptr as usize),
            _marker: PhantomData,
        }
    }

    /// Creates a null atomic word.
    #[inline]
    pub fn null() -> Self {
        Self::new(ptr::null_mut())
    }

    /// Loads the word (pointer and tag) as a [`Shared`].
    #[inline]
    pub fn load<'g>(&self, order: Ordering, _guard: &'g Guard) -> Shared<'g, T> {
        Shared {
            data: self.data.load(order),
            _marker: PhantomData,
        }
    }

    /// Stores a word.
    #[inline]
    pub fn store(&self, ptr: Shared<'_, T>, order: Ordering) {
        self.data.store(ptr.data, order);
    }

    /// Compares and exchanges the full word. The tag participates in the
    /// comparison: a CAS expecting an untagged word fails if the tag has
    /// been set in the meantime.
    #[inline]
    pub fn compare_exchange<'g>(
        &self,
        current: Shared<'_, T>,
        new: Shared<'_, T>,
        success: Ordering,
        failure: Ordering,
        _guard: &'g Guard,
    ) -> Result<Shared<'g, T>, Shared<'g, T>> {
        match self
            .data
            .compare_exchange(current.data, new.data, success, failure)
        {
            Ok(prev) => Ok(Shared {
                data: prev,
                _marker: PhantomData,
            }),
            Err(prev) => Err(Shared {
                data: prev,
                _marker: PhantomData,
            }),
        }
    }

    /// Sets tag bits on the word and returns the previous word.
    ///
    /// This is the one-instruction "mark" primitive: the pointer part is
    /// untouched, so the returned word tells both who the successor was
    /// and whether the mark was already set.
    #[inline]
    pub fn fetch_or<'g>(&self, tag: usize, order: Ordering, _guard: &'g Guard) -> Shared<'g, T> {
        Shared {
            data: self.data.fetch_or(tag & TAG_MASK, order),
            _marker: PhantomData,
        }
    }

    /// Swaps the word with a new value.
    #[inline]
    pub fn swap<'g>(&self, new: Shared<'_, T>, order: Ordering, _guard: &'g Guard) -> Shared<'g, T> {
        Shared {
            data: self.data.swap(new.data, order),
            _marker: PhantomData,
        }
    }
}

impl<T> Default for Atomic<T> {
    fn default() -> Self {
        Self::null()
    }
}

/// A word loaded from an [`Atomic`], valid for the guard lifetime `'g`.
///
/// Carries both the pointer and the tag bit. Pointer accessors strip the
/// tag; word comparisons (`==`, CAS) include it.
///
/// # Safety
///
/// The pointee is only guaranteed alive while the guard that produced the
/// value exists. Dereferencing after the guard is dropped is undefined
/// behavior.
pub struct Shared<'g, T> {
    data: usize,
    _marker: PhantomData<(&'g Guard, *mut T)>,
}

impl<'g, T> Shared<'g, T> {
    /// Creates a shared word from a raw, untagged pointer.
    ///
    /// # Safety
    ///
    /// The caller must ensure the pointer stays valid for the guard
    /// lifetime it gets used under.
    #[inline]
    pub unsafe fn from_raw(ptr: *mut T) -> Self {
        Self {
            data: ptr as usize,
            _marker: PhantomData,
        }
    }

    /// The null word.
    #[inline]
    pub fn null() -> Self {
        Self {
            data: 0,
            _marker: PhantomData,
        }
    }

    /// Returns the pointer with the tag stripped.
    #[inline]
    pub fn as_ptr(&self) -> *mut T {
        (self.data & !TAG_MASK) as *mut T
    }

    /// Returns the tag bit.
    #[inline]
    pub fn tag(&self) -> usize {
        self.data & TAG_MASK
    }

    /// Returns the same pointer with the given tag.
    #[inline]
    pub fn with_tag(&self, tag: usize) -> Self {
        Self {
            data: (self.data & !TAG_MASK) | (tag & TAG_MASK),
            _marker: PhantomData,
        }
    }

    /// True if the pointer part is null (any tag).
    #[inline]
    pub fn is_null(&self) -> bool {
        self.as_ptr().is_null()
    }

    /// Converts to an optional reference, ignoring the tag.
    ///
    /// # Safety
    ///
    /// The pointer must be valid for `'g` (i.e. loaded under the guard
    /// from a structure this reclamation scheme manages).
    #[inline]
    pub unsafe fn as_ref(&self) -> Option<&'g T> {
        let ptr = self.as_ptr();
        if ptr.is_null() {
            None
        } else {
            // SAFETY: caller guarantees pointer validity for 'g.
            unsafe { Some(&*ptr) }
        }
    }

    /// Converts to a reference without checking for null.
    ///
    /// # Safety
    ///
    /// The pointer must be non-null and valid for `'g`.
    #[inline]
    pub unsafe fn deref(&self) -> &'g T {
        // SAFETY: caller guarantees a non-null, valid pointer.
        unsafe { &*self.as_ptr() }
    }
}

impl<'g, T> Clone for Shared<'g, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'g, T> Copy for Shared<'g, T> {}

impl<'g, T> PartialEq for Shared<'g, T> {
    /// Full-word equality: two views of the same pointer with different
    /// tags are not equal.
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl<'g, T> Eq for Shared<'g, T> {}

impl<'g, T> core::fmt::Debug for Shared<'g, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Shared({:p}, tag={})", self.as_ptr(), self.tag())
    }
}
