use crate::chain::Chain;
use crate::recovery::EvictionPolicy;
use crate::AllocationFailure;
use bytes::Bytes;

mod offheap;

pub use offheap::OffHeapChainMap;

/// A chain removed from a segment to reclaim space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evicted {
    /// Key whose chain was dropped
    pub key: u64,
    /// Bytes returned to the page source
    pub bytes: usize,
}

/// One shard of the key space: a map from key to chain.
///
/// Implementations are plain single-threaded data structures. The store
/// wraps each one in its own mutex, so every method runs inside the
/// segment-wide critical section and `&mut self` is the proof of exclusion.
///
/// Mutating methods never retry. On [`AllocationFailure`] they leave the map
/// exactly as it was and leave the caller's payload untouched; the store
/// decides whether to reclaim space and try again.
pub trait ChainMap: Send {
    /// Get the chain stored for `key`, or the empty chain if there is none
    fn get(&self, key: u64) -> Chain;

    /// Append `payload`'s readable bytes as a new element of the chain at
    /// `key`, creating the chain if absent.
    fn append(&mut self, key: u64, payload: &Bytes) -> Result<(), AllocationFailure>;

    /// Return the chain as it was, then append `payload` as in
    /// [`append`](Self::append). On failure nothing is appended and the read
    /// is discarded.
    fn get_and_append(&mut self, key: u64, payload: &Bytes) -> Result<Chain, AllocationFailure>;

    /// If `expected` is a prefix of the chain at `key`, replace that prefix
    /// with `update`, keeping every element after it. Otherwise do nothing.
    ///
    /// # Returns
    /// - `Ok(true)` if the prefix matched and the chain was rewritten
    /// - `Ok(false)` if the prefix did not match (no change)
    fn replace_at_head(
        &mut self,
        key: u64,
        expected: &Chain,
        update: &Chain,
    ) -> Result<bool, AllocationFailure>;

    /// Install `chain` as the whole chain for `key`. Installing the empty
    /// chain removes the key.
    fn put(&mut self, key: u64, chain: &Chain) -> Result<(), AllocationFailure>;

    /// Remove the chain at `key`, returning whether one existed
    fn remove(&mut self, key: u64) -> bool;

    /// Remove every chain
    fn clear(&mut self);

    /// Number of keys with a chain
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes holding chain data, headers included
    fn occupied_bytes(&self) -> usize;

    /// Bytes of pages held by this segment, including unused capacity
    fn allocated_bytes(&self) -> usize;

    /// Give back unused capacity at the tail of chain regions.
    ///
    /// # Returns
    /// Number of bytes returned to the page source.
    fn shrink(&mut self) -> usize;

    /// Drop one chain chosen by `policy`, never the chain at `protect`.
    ///
    /// # Returns
    /// The evicted chain, or `None` if nothing could be evicted.
    fn evict(&mut self, policy: EvictionPolicy, protect: u64) -> Option<Evicted>;
}
