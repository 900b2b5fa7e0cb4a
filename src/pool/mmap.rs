use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use memmap2::MmapMut;
use crate::pool::{check_request, Extents, Page, PageSource};
use crate::AllocationFailure;

/// A page source backed by a memory mapping, either anonymous or over a file.
pub struct MmapPool {
    /// Memory mapped region backing the pool. Pages hold raw pointers into
    /// this mapping, so it must live as long as the pool. Dropping this
    /// unmaps the memory.
    mmap: MmapMut,

    /// Start of the mapping, taken once from the mutable mapping at build
    base: *mut u8,

    /// Free space bookkeeping for the mapping
    extents: Mutex<Extents>,
}

// SAFETY: the mapping is never remapped after construction, pages cover
// disjoint ranges and bookkeeping is serialized through the extent mutex.
unsafe impl Send for MmapPool {}
unsafe impl Sync for MmapPool {}

impl MmapPool {
    fn extents(&self) -> std::sync::MutexGuard<'_, Extents> {
        self.extents.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PageSource for MmapPool {
    fn allocate(&self, size: usize) -> Result<Page, AllocationFailure> {
        check_request(size);

        let (offset, len) = self
            .extents()
            .allocate(size)
            .ok_or(AllocationFailure { requested: size })?;

        // SAFETY: the extent lies inside the mapping and is no longer free
        Ok(unsafe { Page::new(self.base, offset, len) })
    }

    fn release(&self, page: Page) {
        let end = page.offset() + page.len();
        if end > self.mmap.len() {
            panic!(
                "Page [{}, {}) was not issued by this pool (size {})",
                page.offset(),
                end,
                self.mmap.len()
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

pub struct MmapPoolBuilder {
    heap_size: usize,
    path: Option<PathBuf>,
}

impl Default for MmapPoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MmapPoolBuilder {
    /// Anonymous mapping by default; see [`path`](Self::path).
    pub fn new() -> Self {
        Self {
            heap_size: 64 * 1024 * 1024,
            path: None,
        }
    }

    /// Set the total mapping size in bytes (default: 64MB)
    pub fn heap_size(mut self, size: usize) -> Self {
        self.heap_size = size;
        self
    }

    /// Back the mapping with a file at `path`. The file is created or
    /// truncated on build.
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn build(self) -> Result<MmapPool, std::io::Error> {
        let actual_size = Extents::new(self.heap_size).capacity();
        if actual_size == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("heap size ({}) is too small", self.heap_size),
            ));
        }

        let mut mmap = match &self.path {
            Some(path) => {
                // Create or open the backing file
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)?;

                file.set_len(actual_size as u64)?;

                unsafe { MmapMut::map_mut(&file)? }
            }
            None => MmapMut::map_anon(actual_size)?,
        };

        let base = mmap.as_mut_ptr();

        Ok(MmapPool {
            mmap,
            base,
            extents: Mutex::new(Extents::new(actual_size)),
        })
    }
}
