//! Sharded off-heap chain store.
//!
//! Every key maps to a [`Chain`]: an append-only log of opaque byte
//! [`Element`]s. Chains live in memory handed out by a [`PageSource`] and are
//! sharded across independently locked segments. When a segment cannot find
//! contiguous room for a write, the [`Store`] runs a [`RecoveryPolicy`] and
//! retries, surfacing [`StoreError::StorageFull`] only when nothing more can be
//! reclaimed.
//!
//! ```ignore
//! use bytes::Bytes;
//! use chainstore::{Chain, StoreBuilder};
//!
//! let store = StoreBuilder::new().concurrency(16).heap_size(64 << 20).build()?;
//!
//! let before = store.get_and_append(1, &Bytes::from_static(b"A")).await?;
//! assert!(before.is_empty());
//!
//! let chain = store.get(1).await;
//! let folded = Chain::build(&[Bytes::from_static(b"folded")]);
//! store.replace_at_head(1, &chain, &folded).await?;
//! ```

mod chain;
mod metrics;
pub mod pool;
mod record;
mod recovery;
pub mod segment;
mod store;

// Public API exports
pub use chain::{Chain, Element};
pub use metrics::{Counter, Gauge, StoreMetrics};
pub use pool::{MemoryPool, MemoryPoolBuilder, MmapPool, MmapPoolBuilder, Page, PageSource};
pub use recovery::{EvictingRecovery, EvictionListener, EvictionPolicy, NoRecovery, RecoveryPolicy};
pub use segment::{ChainMap, Evicted, OffHeapChainMap};
pub use store::{Store, StoreBuilder, StoreStats};

use thiserror::Error;

/// No contiguous region of the requested size could be handed out.
///
/// Raised by page sources and segments. The operation that hit it has left
/// the stored state exactly as it was before the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unable to allocate {requested} contiguous bytes")]
pub struct AllocationFailure {
    /// Number of bytes that could not be allocated
    pub requested: usize,
}

/// Error types for store write operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Storage is full and the recovery policy could not reclaim any space
    #[error("storage full: no space could be reclaimed for key {key}")]
    StorageFull {
        key: u64,
        #[source]
        source: AllocationFailure,
    },
}
