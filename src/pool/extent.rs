//! First-fit extent allocator over a fixed address range
//!
//! Free space is kept as a map from offset to length. Allocation takes the
//! lowest-addressed extent that fits and splits it; release reinserts the
//! extent and merges it with free neighbours. Nothing ever moves, so mixed
//! sizes fragment the range the way a real off-heap store does.

use std::collections::BTreeMap;

/// Allocation granularity in bytes
pub(crate) const ALIGNMENT: usize = 8;

pub(crate) struct Extents {
    /// offset -> length of every free extent, never adjacent to each other
    free: BTreeMap<usize, usize>,
    capacity: usize,
    allocated: usize,
}

impl Extents {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity & !(ALIGNMENT - 1);
        let mut free = BTreeMap::new();
        if capacity > 0 {
            free.insert(0, capacity);
        }
        Self {
            free,
            capacity,
            allocated: 0,
        }
    }

    /// Round a request up to the allocation granularity
    pub fn aligned(size: usize) -> usize {
        (size + ALIGNMENT - 1) & !(ALIGNMENT - 1)
    }

    /// Reserve `size` bytes (rounded up), returning the offset and the
    /// rounded length.
    pub fn allocate(&mut self, size: usize) -> Option<(usize, usize)> {
        let size = Self::aligned(size);
        let (offset, len) = self
            .free
            .iter()
            .find(|(_, len)| **len >= size)
            .map(|(offset, len)| (*offset, *len))?;

        self.free.remove(&offset);
        if len > size {
            self.free.insert(offset + size, len - size);
        }
        self.allocated += size;
        Some((offset, size))
    }

    /// Return an extent previously handed out by `allocate`.
    pub fn release(&mut self, offset: usize, size: usize) {
        let size = Self::aligned(size);
        assert!(
            offset + size <= self.capacity,
            "release of [{offset}, {}) outside capacity {}",
            offset + size,
            self.capacity
        );

        let mut start = offset;
        let mut len = size;

        if let Some((&prev, &prev_len)) = self.free.range(..offset).next_back() {
            assert!(prev + prev_len <= offset, "double release of extent at {offset}");
            if prev + prev_len == offset {
                self.free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }

        if let Some((&next, _)) = self.free.range(offset..).next() {
            assert!(next >= offset + size, "double release of extent at {offset}");
        }
        if let Some(next_len) = self.free.remove(&(offset + size)) {
            len += next_len;
        }

        self.free.insert(start, len);
        self.allocated -= size;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub fn largest_free(&self) -> usize {
        self.free.values().copied().max().unwrap_or(0)
    }

    #[cfg(test)]
    pub fn free_extents(&self) -> usize {
        self.free.len()
    }
}
