use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::Mutex;
use crate::pool::{check_request, Extents, Page, PageSource};
use crate::AllocationFailure;

/// A page source carved out of one heap block allocated up front.
pub struct MemoryPool {
    /// Pointer to the allocated heap memory
    heap_ptr: *mut u8,

    /// Layout used for allocation (needed for deallocation)
    layout: Layout,

    /// Free space bookkeeping for the heap
    extents: Mutex<Extents>,
}

// SAFETY: MemoryPool is safe to send between threads because:
// 1. heap_ptr is allocated once at construction and never moved or freed until Drop
// 2. Each Page handed out covers a disjoint range of the heap
// 3. The extent map is only touched under its mutex
unsafe impl Send for MemoryPool {}

// SAFETY: MemoryPool is safe to share between threads because all methods
// take &self and serialize bookkeeping through the extent mutex.
unsafe impl Sync for MemoryPool {}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        // SAFETY: heap_ptr was allocated with this layout in build()
        // and has not been deallocated yet
        unsafe {
            dealloc(self.heap_ptr, self.layout);
        }
    }
}

impl MemoryPool {
    fn extents(&self) -> std::sync::MutexGuard<'_, Extents> {
        // Bookkeeping is updated atomically under the lock, so a panic in
        // another thread cannot leave it half-written.
        self.extents.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PageSource for MemoryPool {
    fn allocate(&self, size: usize) -> Result<Page, AllocationFailure> {
        check_request(size);

        let (offset, len) = self
            .extents()
            .allocate(size)
            .ok_or(AllocationFailure { requested: size })?;

        // SAFETY: the extent lies inside the heap and was just removed from
        // the free map, so no other page covers it
        Ok(unsafe { Page::new(self.heap_ptr, offset, len) })
    }

    fn release(&self, page: Page) {
        let end = page.offset() + page.len();
        if end > self.layout.size() {
            panic!(
                "Page [{}, {}) was not issued by this pool (size {})",
                page.offset(),
                end,
                self.layout.size()
            );
        }
        self.extents().release(page.offset(), page.len());
    }

    fn capacity(&self) -> usize {
        self.extents().capacity()
    }

    fn allocated(&self) -> usize {
        self.extents().allocated()
    }

    fn largest_free(&self) -> usize {
        self.extents().largest_free()
    }
}

pub struct MemoryPoolBuilder {
    heap_size: usize,
}

impl Default for MemoryPoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPoolBuilder {
    pub fn new() -> Self {
        Self {
            heap_size: 64 * 1024 * 1024,
        }
    }

    /// Set the total heap size in bytes (default: 64MB)
    pub fn heap_size(mut self, size: usize) -> Self {
        self.heap_size = size;
        self
    }

    pub fn build(self) -> Result<MemoryPool, std::io::Error> {
        // Allocate the entire heap as a single page-aligned block
        // Use 2MB alignment for potential huge page support on systems that support it
        // Falls back to regular pages if huge pages are not available
        const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024; // 2MB
        const REGULAR_PAGE_SIZE: usize = 4096;

        let actual_size = Extents::new(self.heap_size).capacity();
        if actual_size == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("heap size ({}) is too small", self.heap_size),
            ));
        }

        let alignment = if actual_size >= HUGE_PAGE_SIZE && actual_size.is_multiple_of(HUGE_PAGE_SIZE)
        {
            HUGE_PAGE_SIZE
        } else {
            REGULAR_PAGE_SIZE
        };

        let layout = Layout::from_size_align(actual_size, alignment)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        // Use alloc_zeroed to get zero-initialized memory
        let heap_ptr = unsafe { alloc_zeroed(layout) };
        if heap_ptr.is_null() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                format!("Failed to allocate {} bytes for pool heap", actual_size),
            ));
        }

        // Pre-fault all pages by touching them
        // This forces the OS to allocate physical pages now rather than on first access
        // which avoids page faults during critical write operations
        unsafe {
            // One write per page is sufficient to fault the entire page
            const PAGE_SIZE: usize = 4096;

            for i in (0..actual_size).step_by(PAGE_SIZE) {
                std::ptr::write_volatile(heap_ptr.add(i), 0u8);
            }
        }

        Ok(MemoryPool {
            heap_ptr,
            layout,
            extents: Mutex::new(Extents::new(actual_size)),
        })
    }
}
