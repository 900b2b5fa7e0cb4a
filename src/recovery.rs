//! Recovery from allocation failure
//!
//! When a segment cannot allocate room for a write, the store releases that
//! segment's lock and hands control to a [`RecoveryPolicy`]. The policy tries
//! to reclaim space anywhere in the store and reports whether it made
//! progress; the store retries the write while it does.
//!
//! A policy may lock segments, including the failing one, but only one at a
//! time, so recovery can never deadlock against other writers.

use crate::metrics::StoreMetrics;
use crate::segment::ChainMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// How a segment picks a chain to drop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Uniformly random chain
    #[default]
    Random,
    /// Chain holding the most bytes
    Largest,
    /// Chain created earliest
    Oldest,
    /// Never evict; only slack is reclaimed
    None,
}

/// Notified with each key whose chain is dropped to reclaim space.
///
/// Called after the segment lock is released. Clients caching the chain for
/// that key must treat it as gone.
pub trait EvictionListener: Send + Sync {
    fn on_evict(&self, key: u64);
}

impl<F> EvictionListener for F
where
    F: Fn(u64) + Send + Sync,
{
    fn on_evict(&self, key: u64) {
        self(key)
    }
}

/// Strategy invoked when a segment fails to allocate
pub trait RecoveryPolicy<M: ChainMap>: Send + Sync {
    /// Try to reclaim space after segment `failing` could not store a write
    /// for `key`. The failing segment is not locked on entry.
    ///
    /// # Returns
    /// `true` if space was reclaimed and the write should be retried,
    /// `false` if the failure is terminal.
    fn handle_oversize_mapping(
        &self,
        segments: &[Mutex<M>],
        failing: usize,
        key: u64,
        metrics: &StoreMetrics,
    ) -> impl Future<Output = bool> + Send;
}

/// Never reclaims anything: the first allocation failure is reported
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRecovery;

impl<M: ChainMap> RecoveryPolicy<M> for NoRecovery {
    async fn handle_oversize_mapping(
        &self,
        _segments: &[Mutex<M>],
        _failing: usize,
        _key: u64,
        _metrics: &StoreMetrics,
    ) -> bool {
        false
    }
}

/// Reclaims slack first, then evicts.
///
/// Each round shrinks over-allocated chains in every segment. Only if that
/// frees nothing does it evict one chain per segment, visiting the segments
/// after the failing one first and the failing one last. The chain being
/// written is never evicted.
#[derive(Clone, Default)]
pub struct EvictingRecovery {
    eviction: EvictionPolicy,
    listener: Option<Arc<dyn EvictionListener>>,
}

impl EvictingRecovery {
    pub fn new(eviction: EvictionPolicy) -> Self {
        Self {
            eviction,
            listener: None,
        }
    }

    /// Register a callback for evicted keys
    pub fn with_listener(mut self, listener: impl EvictionListener + 'static) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    pub(crate) fn with_shared_listener(mut self, listener: Option<Arc<dyn EvictionListener>>) -> Self {
        self.listener = listener;
        self
    }
}

impl std::fmt::Debug for EvictingRecovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvictingRecovery")
            .field("eviction", &self.eviction)
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

impl<M: ChainMap> RecoveryPolicy<M> for EvictingRecovery {
    async fn handle_oversize_mapping(
        &self,
        segments: &[Mutex<M>],
        failing: usize,
        key: u64,
        metrics: &StoreMetrics,
    ) -> bool {
        let mut shrunk = 0;
        for segment in segments {
            shrunk += segment.lock().await.shrink();
        }
        if shrunk > 0 {
            metrics.shrink_bytes.add(shrunk as u64);
            debug!(failing, key, bytes = shrunk, "recovery reclaimed slack");
            return true;
        }

        let count = segments.len();
        let mut evicted_bytes = 0;
        for index in (failing + 1..failing + 1 + count).map(|i| i % count) {
            let evicted = segments[index].lock().await.evict(self.eviction, key);

            let Some(evicted) = evicted else {
                continue;
            };
            evicted_bytes += evicted.bytes;
            metrics.evict.increment();
            metrics.evict_bytes.add(evicted.bytes as u64);
            debug!(
                segment = index,
                key = evicted.key,
                bytes = evicted.bytes,
                "evicted chain"
            );
            if let Some(listener) = &self.listener {
                listener.on_evict(evicted.key);
            }
        }

        evicted_bytes > 0
    }
}
