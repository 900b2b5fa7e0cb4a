//! Off-heap chain map
//!
//! Each chain is stored as one contiguous page from the segment's page
//! source (layout in [`crate::record`]). The key index is an ordinary
//! hash map on the heap; the chain bytes never are.
//!
//! Writes that fit in a chain's current page are done in place. Writes that
//! don't allocate a new page, copy, and only then release the old page, so
//! a failed allocation leaves the stored chain untouched.

use crate::chain::Chain;
use crate::pool::{Page, PageSource};
use crate::record::{self, ChainHeader};
use crate::recovery::EvictionPolicy;
use crate::segment::{ChainMap, Evicted};
use crate::AllocationFailure;
use ahash::RandomState;
use bytes::Bytes;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;

/// Smallest page handed to a chain
const MIN_CHAIN_CAPACITY: usize = 64;

/// Unused capacity below this is not worth a shrink
const SHRINK_THRESHOLD: usize = 64;

struct Slot {
    page: Page,
    /// Insertion order within the segment, for oldest-first eviction
    seq: u64,
}

pub struct OffHeapChainMap<P: PageSource> {
    source: Arc<P>,
    chains: HashMap<u64, Slot, RandomState>,
    next_seq: u64,
    /// Sum of the used bytes of every chain
    occupied: usize,
    /// Sum of the page lengths of every chain
    allocated: usize,
}

impl<P: PageSource> OffHeapChainMap<P> {
    pub fn new(source: Arc<P>) -> Self {
        Self {
            source,
            chains: HashMap::with_hasher(RandomState::new()),
            next_seq: 0,
            occupied: 0,
            allocated: 0,
        }
    }

    fn header(key: u64, page: &Page, operation: &str) -> ChainHeader {
        // SAFETY: every page in this map was issued by self.source, which the
        // map keeps alive
        let data = unsafe { page.as_slice() };
        ChainHeader::from_bytes_with_context(data, key, operation)
    }

    /// Allocate a page for a chain of `needed` bytes.
    ///
    /// Prefers a power-of-two page so that a run of appends does not
    /// reallocate every time, and falls back to an exact fit under pressure.
    fn allocate(source: &P, needed: usize) -> Result<Page, AllocationFailure> {
        if needed > crate::pool::MAX_PAGE_SIZE {
            return Err(AllocationFailure { requested: needed });
        }

        let preferred = needed
            .checked_next_power_of_two()
            .unwrap_or(usize::MAX)
            .clamp(MIN_CHAIN_CAPACITY, crate::pool::MAX_PAGE_SIZE);

        if preferred > needed
            && let Ok(page) = source.allocate(preferred)
        {
            return Ok(page);
        }

        source
            .allocate(needed)
            .map_err(|_| AllocationFailure { requested: needed })
    }

    /// Write a fully encoded chain for `key`, reusing its page when possible.
    fn install(&mut self, key: u64, encoded: &[u8]) -> Result<(), AllocationFailure> {
        let needed = encoded.len();

        match self.chains.get_mut(&key) {
            Some(slot) => {
                let old_used = Self::header(key, &slot.page, "install").used();
                let capacity = slot.page.len();

                // Move when the chain no longer fits, or when it now uses so
                // little of its page that a tighter one is worth trying
                let oversized = capacity > MIN_CHAIN_CAPACITY && needed.saturating_mul(4) < capacity;
                if needed > capacity || oversized {
                    match Self::allocate(&self.source, needed) {
                        Ok(page) => {
                            let old = std::mem::replace(&mut slot.page, page);
                            self.allocated = self.allocated + slot.page.len() - old.len();
                            self.source.release(old);
                        }
                        Err(failure) if needed > capacity => return Err(failure),
                        Err(_) => {}
                    }
                }

                // SAFETY: page issued by self.source, which is alive
                unsafe { slot.page.as_mut_slice()[..needed].copy_from_slice(encoded) };
                self.occupied = self.occupied + needed - old_used;
            }
            None => {
                let mut page = Self::allocate(&self.source, needed)?;
                // SAFETY: page issued by self.source, which is alive
                unsafe { page.as_mut_slice()[..needed].copy_from_slice(encoded) };
                self.allocated += page.len();
                self.occupied += needed;
                let seq = self.next_seq;
                self.next_seq += 1;
                self.chains.insert(key, Slot { page, seq });
            }
        }

        Ok(())
    }

    /// Return a removed slot's page, returning the bytes released.
    fn release_slot(&mut self, key: u64, slot: Slot) -> usize {
        let used = Self::header(key, &slot.page, "release").used();
        let bytes = slot.page.len();
        self.occupied -= used;
        self.allocated -= bytes;
        self.source.release(slot.page);
        bytes
    }
}

/// Element payloads of a chain as byte slices
fn payloads(chain: &Chain) -> impl Iterator<Item = &[u8]> + Clone {
    chain.elements().map(|element| &element[..])
}

impl<P: PageSource> ChainMap for OffHeapChainMap<P> {
    fn get(&self, key: u64) -> Chain {
        match self.chains.get(&key) {
            Some(slot) => {
                let header = Self::header(key, &slot.page, "get");
                // SAFETY: page issued by self.source, which is alive
                record::decode(unsafe { slot.page.as_slice() }, header)
            }
            None => Chain::empty(),
        }
    }

    fn append(&mut self, key: u64, payload: &Bytes) -> Result<(), AllocationFailure> {
        // Only the readable bytes are copied; the caller's view is never advanced
        let bytes: &[u8] = payload;

        match self.chains.get_mut(&key) {
            Some(slot) => {
                let header = Self::header(key, &slot.page, "append");
                let used = header.used();
                let needed = used + record::element_size(bytes.len());

                if needed > slot.page.len() {
                    let mut page = Self::allocate(&self.source, needed)?;
                    // SAFETY: both pages issued by self.source, which is alive
                    unsafe {
                        page.as_mut_slice()[..used].copy_from_slice(&slot.page.as_slice()[..used]);
                    }
                    let old = std::mem::replace(&mut slot.page, page);
                    self.allocated = self.allocated + slot.page.len() - old.len();
                    self.source.release(old);
                }

                // SAFETY: page issued by self.source, which is alive
                let data = unsafe { slot.page.as_mut_slice() };
                record::write_element(data, used, bytes);
                ChainHeader::new(header.count() + 1, needed as u32).to_bytes(data);
                self.occupied += needed - used;
            }
            None => {
                let needed = ChainHeader::SIZE + record::element_size(bytes.len());
                let mut page = Self::allocate(&self.source, needed)?;

                // SAFETY: page issued by self.source, which is alive
                let data = unsafe { page.as_mut_slice() };
                record::write_element(data, ChainHeader::SIZE, bytes);
                ChainHeader::new(1, needed as u32).to_bytes(data);

                self.allocated += page.len();
                self.occupied += needed;
                let seq = self.next_seq;
                self.next_seq += 1;
                self.chains.insert(key, Slot { page, seq });
            }
        }

        Ok(())
    }

    fn get_and_append(&mut self, key: u64, payload: &Bytes) -> Result<Chain, AllocationFailure> {
        let before = self.get(key);
        self.append(key, payload)?;
        Ok(before)
    }

    fn replace_at_head(
        &mut self,
        key: u64,
        expected: &Chain,
        update: &Chain,
    ) -> Result<bool, AllocationFailure> {
        let encoded = match self.chains.get(&key) {
            None => {
                if !expected.is_empty() {
                    return Ok(false);
                }
                if update.is_empty() {
                    return Ok(true);
                }
                Some(record::encode(payloads(update)))
            }
            Some(slot) => {
                let header = Self::header(key, &slot.page, "replace_at_head");
                // SAFETY: page issued by self.source, which is alive
                let data = unsafe { slot.page.as_slice() };
                let mut current = record::elements(data, header);

                let matched = expected
                    .elements()
                    .all(|element| current.next() == Some(&element[..]));
                if !matched {
                    return Ok(false);
                }

                // Whatever `current` still yields was appended after the prefix
                let suffix: Vec<&[u8]> = current.collect();
                if update.is_empty() && suffix.is_empty() {
                    None
                } else {
                    Some(record::encode(payloads(update).chain(suffix.iter().copied())))
                }
            }
        };

        match encoded {
            Some(encoded) => self.install(key, &encoded)?,
            None => {
                self.remove(key);
            }
        }
        Ok(true)
    }

    fn put(&mut self, key: u64, chain: &Chain) -> Result<(), AllocationFailure> {
        if chain.is_empty() {
            self.remove(key);
            return Ok(());
        }
        let encoded = record::encode(payloads(chain));
        self.install(key, &encoded)
    }

    fn remove(&mut self, key: u64) -> bool {
        match self.chains.remove(&key) {
            Some(slot) => {
                self.release_slot(key, slot);
                true
            }
            None => false,
        }
    }

    fn clear(&mut self) {
        for (_, slot) in self.chains.drain() {
            self.source.release(slot.page);
        }
        self.occupied = 0;
        self.allocated = 0;
    }

    fn len(&self) -> usize {
        self.chains.len()
    }

    fn occupied_bytes(&self) -> usize {
        self.occupied
    }

    fn allocated_bytes(&self) -> usize {
        self.allocated
    }

    fn shrink(&mut self) -> usize {
        let mut reclaimed = 0;

        for (key, slot) in self.chains.iter_mut() {
            let used = Self::header(*key, &slot.page, "shrink").used();
            if slot.page.len() - used < SHRINK_THRESHOLD {
                continue;
            }

            // The tight page must exist before the old one goes back
            let Ok(mut page) = self.source.allocate(used) else {
                continue;
            };
            if page.len() >= slot.page.len() {
                self.source.release(page);
                continue;
            }

            // SAFETY: both pages issued by self.source, which is alive
            unsafe {
                page.as_mut_slice()[..used].copy_from_slice(&slot.page.as_slice()[..used]);
            }
            let old = std::mem::replace(&mut slot.page, page);
            reclaimed += old.len() - slot.page.len();
            self.source.release(old);
        }

        self.allocated -= reclaimed;
        reclaimed
    }

    fn evict(&mut self, policy: EvictionPolicy, protect: u64) -> Option<Evicted> {
        let count = self.chains.len() - usize::from(self.chains.contains_key(&protect));
        if count == 0 {
            return None;
        }

        let mut candidates = self.chains.iter().filter(|(key, _)| **key != protect);
        let victim = match policy {
            EvictionPolicy::None => return None,
            EvictionPolicy::Random => {
                let index = rand::rng().random_range(0..count);
                candidates.nth(index).map(|(key, _)| *key)
            }
            EvictionPolicy::Largest => candidates
                .max_by_key(|(_, slot)| slot.page.len())
                .map(|(key, _)| *key),
            EvictionPolicy::Oldest => candidates
                .min_by_key(|(_, slot)| slot.seq)
                .map(|(key, _)| *key),
        }?;

        let slot = self.chains.remove(&victim)?;
        let bytes = self.release_slot(victim, slot);
        Some(Evicted { key: victim, bytes })
    }
}

impl<P: PageSource> Drop for OffHeapChainMap<P> {
    fn drop(&mut self) {
        self.clear();
    }
}
