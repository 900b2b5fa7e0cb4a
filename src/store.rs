//! Sharded chain store
//!
//! The store routes every key to one of a fixed set of segments by hash and
//! runs each request inside that segment's lock. Requests to different
//! segments never wait on each other.
//!
//! ```text
//!            key ──hash──► segment index
//!                              │
//!   ┌─────────┬─────────┬──────┴──┬─────────┐
//!   │ Mutex   │ Mutex   │ Mutex   │ Mutex   │   one lock per segment
//!   │ChainMap │ChainMap │ChainMap │ChainMap │
//!   └────┬────┴────┬────┴────┬────┴────┬────┘
//!        └─────────┴────┬────┴─────────┘
//!                  PageSource                    shared off-heap memory
//! ```
//!
//! A write that cannot allocate drops its segment lock and asks the
//! [`RecoveryPolicy`] to reclaim space, then retries. The write fails with
//! [`StoreError::StorageFull`] only when a recovery round makes no progress.

use crate::chain::Chain;
use crate::metrics::StoreMetrics;
use crate::pool::{MemoryPool, MemoryPoolBuilder, PageSource};
use crate::recovery::{EvictingRecovery, EvictionListener, EvictionPolicy, RecoveryPolicy};
use crate::segment::{ChainMap, OffHeapChainMap};
use crate::{AllocationFailure, StoreError};
use ahash::RandomState;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{trace, warn};

// Fixed seeds so that a key always routes to the same segment index, across
// store instances and process restarts.
const ROUTING_SEEDS: [u64; 4] = [
    0x243F_6A88_85A3_08D3,
    0x1319_8A2E_0370_7344,
    0xA409_3822_299F_31D0,
    0x082E_FA98_EC4E_6C89,
];

/// Point-in-time totals across all segments
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Keys with a non-empty chain
    pub chains: usize,
    /// Bytes of chain data, headers included
    pub occupied_bytes: usize,
    /// Bytes of pages held, including unused capacity
    pub allocated_bytes: usize,
}

pub struct Store<M = OffHeapChainMap<MemoryPool>, R = EvictingRecovery> {
    segments: Box<[Mutex<M>]>,
    hasher: RandomState,
    recovery: R,
    metrics: StoreMetrics,
}

impl Store {
    pub fn builder() -> StoreBuilder {
        StoreBuilder::new()
    }
}

impl<P, R> Store<OffHeapChainMap<P>, R>
where
    P: PageSource,
    R: RecoveryPolicy<OffHeapChainMap<P>>,
{
    /// Create `concurrency` off-heap segments sharing one page source.
    ///
    /// # Panics
    /// Panics if `concurrency` is zero.
    pub fn with_page_source(source: Arc<P>, concurrency: usize, recovery: R) -> Self {
        let segments = (0..concurrency)
            .map(|_| OffHeapChainMap::new(Arc::clone(&source)))
            .collect();
        Self::new(segments, recovery)
    }
}

impl<M, R> Store<M, R>
where
    M: ChainMap,
    R: RecoveryPolicy<M>,
{
    /// Create a store over the given segments.
    ///
    /// # Panics
    /// Panics if `segments` is empty.
    pub fn new(segments: Vec<M>, recovery: R) -> Self {
        assert!(!segments.is_empty(), "a store needs at least one segment");
        Self {
            segments: segments.into_iter().map(Mutex::new).collect(),
            hasher: RandomState::with_seeds(
                ROUTING_SEEDS[0],
                ROUTING_SEEDS[1],
                ROUTING_SEEDS[2],
                ROUTING_SEEDS[3],
            ),
            recovery,
            metrics: StoreMetrics::new(),
        }
    }

    /// Number of segments
    pub fn concurrency(&self) -> usize {
        self.segments.len()
    }

    /// The segment that owns `key`
    pub fn segment_index(&self, key: u64) -> usize {
        (self.hasher.hash_one(key) % self.segments.len() as u64) as usize
    }

    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    pub fn recovery(&self) -> &R {
        &self.recovery
    }

    /// Get the chain for `key`; the empty chain if the key has none
    pub async fn get(&self, key: u64) -> Chain {
        self.segments[self.segment_index(key)].lock().await.get(key)
    }

    /// Append `payload` as a new element of the chain at `key`.
    ///
    /// Only the readable bytes are stored. `payload` is left exactly as it
    /// was, whether the call succeeds, retries or fails.
    pub async fn append(&self, key: u64, payload: &Bytes) -> Result<(), StoreError> {
        self.metrics.append.increment();
        self.with_recovery(key, |segment| segment.append(key, payload))
            .await
    }

    /// Atomically read the chain at `key` and append `payload` to it.
    ///
    /// # Returns
    /// The chain as it was before the append. Any number of concurrent
    /// callers on the same key observe distinct, strictly nested chains.
    pub async fn get_and_append(&self, key: u64, payload: &Bytes) -> Result<Chain, StoreError> {
        self.metrics.get_and_append.increment();
        self.with_recovery(key, |segment| segment.get_and_append(key, payload))
            .await
    }

    /// Replace `expected` at the head of the chain at `key` with `update`.
    ///
    /// Elements appended after `expected` was read are kept, in order, after
    /// `update`. Replacing a whole chain with the empty chain removes the key.
    ///
    /// # Returns
    /// - `Ok(true)` if `expected` was a prefix and has been replaced
    /// - `Ok(false)` if it was not; the chain is unchanged
    pub async fn replace_at_head(
        &self,
        key: u64,
        expected: &Chain,
        update: &Chain,
    ) -> Result<bool, StoreError> {
        self.metrics.replace_at_head.increment();
        let replaced = self
            .with_recovery(key, |segment| segment.replace_at_head(key, expected, update))
            .await?;
        if !replaced {
            self.metrics.replace_at_head_mismatch.increment();
        }
        Ok(replaced)
    }

    /// Install `chain` as the whole chain for `key`, replacing any existing one
    pub async fn put(&self, key: u64, chain: &Chain) -> Result<(), StoreError> {
        self.with_recovery(key, |segment| segment.put(key, chain)).await
    }

    /// Remove the chain at `key`, returning whether one existed
    pub async fn remove(&self, key: u64) -> bool {
        self.segments[self.segment_index(key)]
            .lock()
            .await
            .remove(key)
    }

    /// Remove every chain, one segment at a time
    pub async fn clear(&self) {
        for segment in self.segments.iter() {
            segment.lock().await.clear();
        }
    }

    /// Number of keys with a chain
    pub async fn len(&self) -> usize {
        let mut len = 0;
        for segment in self.segments.iter() {
            len += segment.lock().await.len();
        }
        len
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Totals across segments. Segments are visited one at a time, so the
    /// result is not a snapshot under concurrent writes.
    pub async fn stats(&self) -> StoreStats {
        let mut stats = StoreStats::default();
        for segment in self.segments.iter() {
            let segment = segment.lock().await;
            stats.chains += segment.len();
            stats.occupied_bytes += segment.occupied_bytes();
            stats.allocated_bytes += segment.allocated_bytes();
        }
        stats
    }

    /// Run `operation` on the segment owning `key`, recovering from
    /// allocation failure for as long as the policy makes progress.
    ///
    /// The segment lock is held for one attempt only and is released before
    /// the policy runs.
    async fn with_recovery<T, F>(&self, key: u64, mut operation: F) -> Result<T, StoreError>
    where
        F: FnMut(&mut M) -> Result<T, AllocationFailure>,
    {
        let index = self.segment_index(key);

        loop {
            let result = {
                let mut segment = self.segments[index].lock().await;
                operation(&mut *segment)
            };

            let failure = match result {
                Ok(value) => return Ok(value),
                Err(failure) => failure,
            };

            self.metrics.alloc_fail.increment();
            trace!(
                key,
                segment = index,
                requested = failure.requested,
                "allocation failed, attempting recovery"
            );

            self.metrics.recovery.increment();
            self.metrics.recovery_active.increment();
            let progress = self
                .recovery
                .handle_oversize_mapping(&self.segments, index, key, &self.metrics)
                .await;
            self.metrics.recovery_active.decrement();

            if !progress {
                self.metrics.recovery_give_up.increment();
                warn!(
                    key,
                    segment = index,
                    requested = failure.requested,
                    "storage full, recovery reclaimed nothing"
                );
                return Err(StoreError::StorageFull {
                    key,
                    source: failure,
                });
            }
        }
    }
}

/// Builder for a [`Store`] over a [`MemoryPool`] with [`EvictingRecovery`]
pub struct StoreBuilder {
    concurrency: usize,
    heap_size: usize,
    eviction: EvictionPolicy,
    listener: Option<Arc<dyn EvictionListener>>,
}

impl Default for StoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self {
            concurrency: 16,
            heap_size: 64 * 1024 * 1024,
            eviction: EvictionPolicy::Random,
            listener: None,
        }
    }

    /// Set the number of independently locked segments (default: 16)
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the size of the memory pool in bytes (default: 64MB)
    pub fn heap_size(mut self, size: usize) -> Self {
        self.heap_size = size;
        self
    }

    /// Set how a segment picks a chain to evict (default: random)
    pub fn eviction(mut self, eviction: EvictionPolicy) -> Self {
        self.eviction = eviction;
        self
    }

    /// Register a callback notified with every evicted key
    pub fn eviction_listener(mut self, listener: impl EvictionListener + 'static) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    fn validate(&self) -> Result<(), std::io::Error> {
        if self.concurrency == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "concurrency must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn build(self) -> Result<Store, std::io::Error> {
        self.validate()?;
        let pool = MemoryPoolBuilder::new().heap_size(self.heap_size).build()?;
        self.build_with(Arc::new(pool))
    }

    /// Build over a caller-provided page source. The configured heap size is
    /// ignored.
    pub fn build_with<P: PageSource>(
        self,
        source: Arc<P>,
    ) -> Result<Store<OffHeapChainMap<P>, EvictingRecovery>, std::io::Error> {
        self.validate()?;
        let recovery = EvictingRecovery::new(self.eviction).with_shared_listener(self.listener);
        Ok(Store::with_page_source(source, self.concurrency, recovery))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Element;
    use crate::pool::MmapPoolBuilder;
    use crate::recovery::{EvictionPolicy, NoRecovery};
    use crate::segment::Evicted;
    use bytes::Buf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn create_test_store(concurrency: usize, heap_size: usize) -> Store {
        StoreBuilder::new()
            .concurrency(concurrency)
            .heap_size(heap_size)
            .build()
            .expect("Failed to create test store")
    }

    fn payload(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    fn chain(parts: &[&'static str]) -> Chain {
        parts.iter().map(|p| Element::from(*p)).collect()
    }

    fn sum(chain: &Chain) -> u64 {
        chain
            .elements()
            .map(|e| u64::from_le_bytes(e[..8].try_into().unwrap()))
            .sum()
    }

    fn number(value: u64) -> Bytes {
        Bytes::copy_from_slice(&value.to_le_bytes())
    }

    /// Segment that can never allocate
    struct FullSegment;

    impl ChainMap for FullSegment {
        fn get(&self, _key: u64) -> Chain {
            Chain::empty()
        }

        fn append(&mut self, _key: u64, payload: &Bytes) -> Result<(), AllocationFailure> {
            Err(AllocationFailure {
                requested: payload.len(),
            })
        }

        fn get_and_append(&mut self, _key: u64, payload: &Bytes) -> Result<Chain, AllocationFailure> {
            Err(AllocationFailure {
                requested: payload.len(),
            })
        }

        fn replace_at_head(
            &mut self,
            _key: u64,
            _expected: &Chain,
            update: &Chain,
        ) -> Result<bool, AllocationFailure> {
            Err(AllocationFailure {
                requested: update.len(),
            })
        }

        fn put(&mut self, _key: u64, chain: &Chain) -> Result<(), AllocationFailure> {
            Err(AllocationFailure {
                requested: chain.len(),
            })
        }

        fn remove(&mut self, _key: u64) -> bool {
            false
        }

        fn clear(&mut self) {}

        fn len(&self) -> usize {
            0
        }

        fn occupied_bytes(&self) -> usize {
            0
        }

        fn allocated_bytes(&self) -> usize {
            0
        }

        fn shrink(&mut self) -> usize {
            0
        }

        fn evict(&mut self, _policy: EvictionPolicy, _protect: u64) -> Option<Evicted> {
            None
        }
    }

    /// Claims progress a fixed number of times, then gives up
    struct CountingRecovery {
        rounds: AtomicUsize,
        progress_rounds: usize,
    }

    impl CountingRecovery {
        fn new(progress_rounds: usize) -> Self {
            Self {
                rounds: AtomicUsize::new(0),
                progress_rounds,
            }
        }
    }

    impl<M: ChainMap> RecoveryPolicy<M> for CountingRecovery {
        async fn handle_oversize_mapping(
            &self,
            _segments: &[Mutex<M>],
            _failing: usize,
            _key: u64,
            _metrics: &StoreMetrics,
        ) -> bool {
            self.rounds.fetch_add(1, Ordering::Relaxed) < self.progress_rounds
        }
    }

    #[tokio::test]
    async fn test_append_and_get_and_append() {
        let store = create_test_store(16, 1024 * 1024);
        assert_eq!(store.concurrency(), 16);

        store.append(1, &payload("A")).await.unwrap();
        store.append(1, &payload("B")).await.unwrap();
        assert_eq!(store.get(1).await, chain(&["A", "B"]));

        let before = store.get_and_append(1, &payload("C")).await.unwrap();
        assert_eq!(before, chain(&["A", "B"]));
        assert_eq!(store.get(1).await, chain(&["A", "B", "C"]));
    }

    #[tokio::test]
    async fn test_get_and_append_from_empty() {
        let store = create_test_store(16, 1024 * 1024);

        assert_eq!(store.get_and_append(1, &payload("A")).await.unwrap(), Chain::empty());
        assert_eq!(store.get(1).await, chain(&["A"]));

        assert_eq!(store.get_and_append(1, &payload("B")).await.unwrap(), chain(&["A"]));
        assert_eq!(store.get(1).await, chain(&["A", "B"]));
    }

    #[tokio::test]
    async fn test_replace_at_head_compaction() {
        let store = create_test_store(16, 1024 * 1024);
        for p in ["A", "B", "C"] {
            store.append(1, &payload(p)).await.unwrap();
        }

        let replaced = store
            .replace_at_head(1, &chain(&["A", "B"]), &chain(&["AB"]))
            .await
            .unwrap();
        assert!(replaced);
        assert_eq!(store.get(1).await, chain(&["AB", "C"]));
    }

    #[tokio::test]
    async fn test_replace_at_head_mismatch_is_noop() {
        let store = create_test_store(16, 1024 * 1024);
        for p in ["A", "B", "C"] {
            store.append(1, &payload(p)).await.unwrap();
        }

        let replaced = store
            .replace_at_head(1, &chain(&["X"]), &chain(&["Y"]))
            .await
            .unwrap();
        assert!(!replaced);
        assert_eq!(store.get(1).await, chain(&["A", "B", "C"]));
        assert_eq!(store.metrics().replace_at_head_mismatch.value(), 1);
    }

    #[tokio::test]
    async fn test_absent_key_reads_empty() {
        let store = create_test_store(4, 1024 * 1024);
        assert_eq!(store.get(99).await, Chain::empty());
        assert!(!store.remove(99).await);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_routing_is_stable() {
        let a = create_test_store(16, 64 * 1024);
        let b = create_test_store(16, 64 * 1024);

        for key in 0..1000 {
            let index = a.segment_index(key);
            assert!(index < 16);
            assert_eq!(index, a.segment_index(key));
            assert_eq!(index, b.segment_index(key));
        }
    }

    #[tokio::test]
    async fn test_put_remove_and_stats() {
        let store = create_test_store(4, 1024 * 1024);

        store.put(1, &chain(&["X", "Y"])).await.unwrap();
        store.append(2, &payload("Z")).await.unwrap();
        assert_eq!(store.get(1).await, chain(&["X", "Y"]));
        assert_eq!(store.len().await, 2);

        let stats = store.stats().await;
        assert_eq!(stats.chains, 2);
        assert!(stats.occupied_bytes > 0);
        assert!(stats.allocated_bytes >= stats.occupied_bytes);

        assert!(store.remove(1).await);
        assert_eq!(store.get(1).await, Chain::empty());

        store.clear().await;
        assert_eq!(store.stats().await, StoreStats::default());
    }

    #[tokio::test]
    async fn test_payload_untouched_across_retries() {
        let store = Store::new(vec![FullSegment, FullSegment], CountingRecovery::new(3));

        let data = Bytes::from(vec![1u8; 8]);
        let result = store.append(1, &data).await;

        assert_eq!(
            result,
            Err(StoreError::StorageFull {
                key: 1,
                source: AllocationFailure { requested: 8 },
            })
        );
        assert_eq!(data.remaining(), 8);
        assert_eq!(store.recovery().rounds.load(Ordering::Relaxed), 4);

        let metrics = store.metrics();
        assert_eq!(metrics.alloc_fail.value(), 4);
        assert_eq!(metrics.recovery.value(), 4);
        assert_eq!(metrics.recovery_give_up.value(), 1);
        assert_eq!(metrics.recovery_active.value(), 0);

        let update = Chain::build(&[data.clone()]);
        assert!(store.replace_at_head(1, &Chain::empty(), &update).await.is_err());
        assert_eq!(data.remaining(), 8);
        assert_eq!(update.elements().next().unwrap().payload().remaining(), 8);
    }

    #[tokio::test]
    async fn test_no_partial_mutation_on_failure() {
        let pool = Arc::new(MemoryPoolBuilder::new().heap_size(256).build().unwrap());
        let store = Store::with_page_source(pool, 1, NoRecovery);

        store.append(1, &Bytes::from(vec![1u8; 100])).await.unwrap();
        let before = store.get(1).await;

        let big = Bytes::from(vec![2u8; 100]);
        assert!(matches!(
            store.append(1, &big).await,
            Err(StoreError::StorageFull { key: 1, .. })
        ));
        assert!(store.get_and_append(1, &big).await.is_err());

        let update = Chain::from(vec![Element::from(vec![3u8; 300])]);
        assert!(store.replace_at_head(1, &before, &update).await.is_err());

        assert_eq!(store.get(1).await, before);
        assert_eq!(big.remaining(), 100);
    }

    #[tokio::test]
    async fn test_oversized_payload_is_storage_full() {
        let evicted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&evicted);
        let store = StoreBuilder::new()
            .concurrency(4)
            .heap_size(64 * 1024)
            .eviction_listener(move |_key: u64| {
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .build()
            .unwrap();

        for key in 0..8 {
            store.append(key, &payload("small")).await.unwrap();
        }

        let huge = Bytes::from(vec![0u8; 128 * 1024]);
        let err = store.append(100, &huge).await.unwrap_err();
        assert!(matches!(err, StoreError::StorageFull { key: 100, .. }));
        assert_eq!(huge.remaining(), 128 * 1024);

        // Everything else was evicted trying to make room
        assert!(store.is_empty().await);
        assert_eq!(evicted.load(Ordering::Relaxed), 8);
        assert_eq!(store.metrics().evict.value(), 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_get_and_append_is_atomic() {
        let store = Arc::new(create_test_store(16, 4 * 1024 * 1024));
        const TASKS: u64 = 8;
        const PER_TASK: u64 = 100;

        let handles: Vec<_> = (0..TASKS)
            .map(|task| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    for i in 0..PER_TASK {
                        let before = store
                            .get_and_append(7, &number(task * PER_TASK + i))
                            .await
                            .unwrap();
                        seen.push(before.len());
                    }
                    seen
                })
            })
            .collect();

        let mut lengths = Vec::new();
        for handle in handles {
            lengths.extend(handle.await.unwrap());
        }

        // Every caller saw a distinct prefix of the final chain
        lengths.sort_unstable();
        let expected: Vec<usize> = (0..(TASKS * PER_TASK) as usize).collect();
        assert_eq!(lengths, expected);

        let last = store.get(7).await;
        assert_eq!(last.len(), (TASKS * PER_TASK) as usize);

        // Each task's appends appear in the order it made them
        for task in 0..TASKS {
            let mine: Vec<u64> = last
                .elements()
                .map(|e| u64::from_le_bytes(e[..8].try_into().unwrap()))
                .filter(|v| v / PER_TASK == task)
                .collect();
            let in_order: Vec<u64> = (0..PER_TASK).map(|i| task * PER_TASK + i).collect();
            assert_eq!(mine, in_order);
        }
    }

    #[tokio::test]
    async fn test_segments_are_independent() {
        let store = create_test_store(16, 1024 * 1024);

        let a = 1;
        let b = (2..)
            .find(|key| store.segment_index(*key) != store.segment_index(a))
            .unwrap();

        let guard = store.segments[store.segment_index(a)].lock().await;

        let other = tokio::time::timeout(Duration::from_secs(5), store.append(b, &payload("b"))).await;
        assert!(matches!(other, Ok(Ok(()))));

        let blocked = tokio::time::timeout(Duration::from_millis(50), store.get(a)).await;
        assert!(blocked.is_err());

        drop(guard);
        assert_eq!(store.get(b).await, chain(&["b"]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_append_and_fold_keeps_sum() {
        let store = Arc::new(create_test_store(4, 1024 * 1024));
        const WRITERS: u64 = 4;
        const PER_WRITER: u64 = 200;

        let writers: Vec<_> = (0..WRITERS)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    for _ in 0..PER_WRITER {
                        store.append(1, &number(1)).await.unwrap();
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        let folder = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let mut folds = 0;
                for _ in 0..200 {
                    let current = store.get(1).await;
                    if current.len() > 1 {
                        let folded = Chain::build(&[number(sum(&current))]);
                        if store.replace_at_head(1, &current, &folded).await.unwrap() {
                            folds += 1;
                        }
                    }
                    tokio::task::yield_now().await;
                }
                folds
            })
        };

        for writer in writers {
            writer.await.unwrap();
        }
        folder.await.unwrap();

        assert_eq!(sum(&store.get(1).await), WRITERS * PER_WRITER);
    }

    const STRESS_KEYS: u64 = 500;
    const SMALL: usize = 1024;
    const LARGE: usize = 100 * 1024;

    fn stress_payload(key: u64, large: bool) -> Bytes {
        let len = if large { LARGE } else { SMALL };
        Bytes::from(vec![(key as usize * 7 + usize::from(large)) as u8; len])
    }

    /// Outcome of a stress run: the chain each key should now hold, the
    /// number of writes that failed and the number of evictions reported.
    struct StressRun {
        expected: Vec<Vec<Bytes>>,
        failures: usize,
        reported: usize,
    }

    /// One small write to each of 500 keys, then a large write to the first
    /// 50. Keys reported through `evicted` are dropped from the expected
    /// state as they are reported.
    async fn run_stress<M: ChainMap, R: RecoveryPolicy<M>>(
        store: &Store<M, R>,
        evicted: &std::sync::Mutex<Vec<u64>>,
    ) -> StressRun {
        let mut run = StressRun {
            expected: vec![Vec::new(); STRESS_KEYS as usize],
            failures: 0,
            reported: 0,
        };

        let writes = (0..STRESS_KEYS)
            .map(|key| (key, false))
            .chain((0..50).map(|key| (key, true)));

        for (key, large) in writes {
            let payload = stress_payload(key, large);
            let result = store.get_and_append(key, &payload).await;
            assert_eq!(payload.remaining(), if large { LARGE } else { SMALL });

            let dropped: Vec<u64> = evicted.lock().unwrap().drain(..).collect();
            for victim in dropped {
                assert_ne!(victim, key, "chain being written was evicted");
                run.expected[victim as usize].clear();
                run.reported += 1;
            }

            match result {
                Ok(before) => {
                    assert_eq!(before, Chain::build(&run.expected[key as usize]), "key {key}");
                    run.expected[key as usize].push(payload);
                }
                Err(StoreError::StorageFull { key: failed, .. }) => {
                    assert_eq!(failed, key);
                    run.failures += 1;
                }
            }
        }

        run
    }

    async fn assert_chains_match<M: ChainMap, R: RecoveryPolicy<M>>(
        store: &Store<M, R>,
        expected: &[Vec<Bytes>],
    ) {
        for (key, chain) in expected.iter().enumerate() {
            assert_eq!(store.get(key as u64).await, Chain::build(chain), "key {key}");
        }
        let live = expected.iter().filter(|chain| !chain.is_empty()).count();
        assert_eq!(store.len().await, live);
    }

    #[tokio::test]
    async fn test_failed_writes_leave_every_chain_intact() {
        let pool = Arc::new(MemoryPoolBuilder::new().heap_size(256 * 1024).build().unwrap());
        let store = Store::with_page_source(pool, 16, NoRecovery);
        let evicted = std::sync::Mutex::new(Vec::new());

        let run = run_stress(&store, &evicted).await;

        // The pool holds only a fraction of what is written
        assert!(run.failures > 0);
        assert!(run.failures < 550);
        assert_eq!(run.reported, 0);
        assert_eq!(store.metrics().recovery_give_up.value(), run.failures as u64);
        assert_chains_match(&store, &run.expected).await;
    }

    #[tokio::test]
    async fn test_eviction_under_pressure_keeps_chains_intact() {
        let evicted = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorder = Arc::clone(&evicted);
        let store = StoreBuilder::new()
            .concurrency(16)
            .heap_size(4 * 1024 * 1024)
            .eviction_listener(move |key: u64| recorder.lock().unwrap().push(key))
            .build()
            .unwrap();

        let run = run_stress(&store, &evicted).await;

        // 50 x 100KB does not fit next to everything else, so space is
        // reclaimed rather than writes failing
        assert_eq!(run.failures, 0);
        assert!(run.reported > 0);
        assert_eq!(run.reported as u64, store.metrics().evict.value());
        assert_chains_match(&store, &run.expected).await;
    }

    #[tokio::test]
    async fn test_store_over_mmap_pool() {
        let pool = Arc::new(MmapPoolBuilder::new().heap_size(256 * 1024).build().unwrap());
        let store = StoreBuilder::new()
            .concurrency(2)
            .build_with(pool)
            .unwrap();

        store.append(3, &payload("mapped")).await.unwrap();
        assert_eq!(store.get(3).await, chain(&["mapped"]));
    }

    #[test]
    fn test_builder_rejects_bad_config() {
        let err = StoreBuilder::new().concurrency(0).build().err().unwrap();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);

        let err = StoreBuilder::new().heap_size(0).build().err().unwrap();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_metrics_count_operations() {
        let store = create_test_store(2, 64 * 1024);
        store.append(1, &payload("a")).await.unwrap();
        store.get_and_append(1, &payload("b")).await.unwrap();
        store
            .replace_at_head(1, &chain(&["a"]), &chain(&["A"]))
            .await
            .unwrap();

        let metrics = store.metrics();
        assert_eq!(metrics.attribute("append"), Some(1));
        assert_eq!(metrics.attribute("get_and_append"), Some(1));
        assert_eq!(metrics.attribute("replace_at_head"), Some(1));
        assert_eq!(metrics.attribute("alloc_fail"), Some(0));
    }
}
