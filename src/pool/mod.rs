mod extent;
mod memory;
mod mmap;

use crate::AllocationFailure;
use std::ptr::NonNull;

pub(crate) use extent::Extents;
pub use memory::*;
pub use mmap::*;

/// Largest region a page source will hand out. Chain headers record sizes
/// as u32.
pub const MAX_PAGE_SIZE: usize = u32::MAX as usize;

/// A source of contiguous byte regions ("pages") carved out of a fixed
/// block of memory.
///
/// Allocation can fail even when the total free space would be enough,
/// because the free space is fragmented. Callers must treat
/// [`AllocationFailure`] as an expected outcome.
pub trait PageSource: Send + Sync {
    /// Allocate a page of at least `size` bytes.
    ///
    /// # Panics
    /// Panics if `size` is zero or larger than [`MAX_PAGE_SIZE`]. Those are
    /// caller bugs, not capacity problems.
    fn allocate(&self, size: usize) -> Result<Page, AllocationFailure>;

    /// Return a page to the source for reuse.
    ///
    /// # Panics
    /// Panics if the page was not issued by this source.
    fn release(&self, page: Page);

    /// Total bytes managed by this source
    fn capacity(&self) -> usize;

    /// Bytes currently handed out
    fn allocated(&self) -> usize;

    /// Bytes not currently handed out, possibly fragmented
    fn free(&self) -> usize {
        self.capacity() - self.allocated()
    }

    /// Size of the largest page that could be allocated right now
    fn largest_free(&self) -> usize;
}

/// A contiguous region of memory owned by whoever holds this value.
///
/// Pages are move-only: the region is exclusively owned until it is handed
/// back through [`PageSource::release`].
pub struct Page {
    ptr: NonNull<u8>,
    offset: usize,
    len: usize,
}

// SAFETY: a Page is the only handle to its region; the region itself lives
// in memory owned by the page source, which is Send + Sync.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    /// SAFETY: `base + offset .. base + offset + len` must lie inside memory
    /// owned by the issuing page source and must not be handed out twice.
    pub(crate) unsafe fn new(base: *mut u8, offset: usize, len: usize) -> Self {
        Self {
            // SAFETY: caller guarantees base is a live allocation
            ptr: unsafe { NonNull::new_unchecked(base.add(offset)) },
            offset,
            len,
        }
    }

    /// Usable length of the page in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset of this page within its page source
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// View the page contents.
    ///
    /// # Safety
    /// The page source that issued this page must still be alive.
    pub unsafe fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Mutably view the page contents.
    ///
    /// # Safety
    /// The page source that issued this page must still be alive.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// Validate an allocation request, panicking on caller bugs.
pub(crate) fn check_request(size: usize) {
    if size == 0 {
        panic!("page allocation of zero bytes requested");
    }
    if size > MAX_PAGE_SIZE {
        panic!("page allocation of {size} bytes exceeds maximum of {MAX_PAGE_SIZE}");
    }
}
