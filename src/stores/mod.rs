//! Store and source contracts, plus the shipped implementations.
//!
//! The capability ladder goes `Source` (can serve) ⊂ `Store` (can also be
//! inspected) ⊂ `MutableStore` (can also record). The layered cache probes
//! capabilities through the accessor methods instead of downcasting.

mod disk;
mod file;
mod memory;

pub use disk::{DiskAdapter, FileInput, FileOutput, FileStoreAdapter, SidecarBackend, SIDECAR_NAME};
pub use file::FileStore;
pub use memory::{MemoryStore, DEFAULT_MEMORY_COST_LIMIT};

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    info::ResourceInfo, layered::LayeredCache, policy::CachePolicy, progress::Progress,
    receiver::Receiver,
};

/// A byte range within a complete resource.
///
/// `length` of `None` means "through the end of the resource".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteRange {
    /// Byte offset within the complete resource.
    pub offset: u64,
    /// Number of bytes requested, when bounded.
    pub length: Option<u64>,
}

impl ByteRange {
    /// A bounded range starting at `offset`.
    pub fn new(offset: u64, length: Option<u64>) -> Self {
        Self { offset, length }
    }

    /// The full resource.
    pub fn full() -> Self {
        Self::default()
    }

    /// Whether this range covers the complete resource.
    pub fn is_full(&self) -> bool {
        self.offset == 0 && self.length.is_none()
    }
}

/// A component that can serve byte resources keyed by URL.
#[async_trait]
pub trait Source: fmt::Debug + Send + Sync + 'static {
    /// Serves the requested range of `url` into `receiver`.
    ///
    /// The call enqueues onto the component's own execution context and the
    /// receiver callbacks are delivered from there; a miss is signalled as
    /// `on_aborted(None)`, never as an error.
    async fn fetch(
        &self,
        url: &str,
        range: ByteRange,
        policy: CachePolicy,
        progress: Progress,
        receiver: Box<dyn Receiver>,
    );

    /// This component viewed as a store, when it is one.
    fn as_store(&self) -> Option<&dyn Store> {
        None
    }

    /// This component viewed as a mutable store, when it is one.
    fn as_mutable(&self) -> Option<&dyn MutableStore> {
        None
    }

    /// This component viewed as a layered cache, when it is one.
    fn as_layered_mut(&mut self) -> Option<&mut LayeredCache> {
        None
    }

    /// A shared handle to this component as a store, when it is one.
    fn clone_store(self: Arc<Self>) -> Option<Arc<dyn Store>> {
        None
    }
}

/// A [`Source`] whose contents can be inspected without fetching.
#[async_trait]
pub trait Store: Source {
    /// Returns the stored metadata and byte count for `url`, or `(None,
    /// None)` when the store has no live entry.
    async fn peek(&self, url: &str) -> (Option<ResourceInfo>, Option<u64>);
}

/// A [`Store`] that can also record, re-policy, and remove entries.
#[async_trait]
pub trait MutableStore: Store {
    /// Returns a receiver that persists whatever stream is pushed into it,
    /// or `None` when this store cannot accept the write.
    async fn store_stream(&self, url: &str, policy: CachePolicy) -> Option<Box<dyn Receiver>>;

    /// Records a complete resource synchronously. An expired policy removes
    /// the entry instead.
    async fn store(&self, url: &str, info: ResourceInfo, policy: CachePolicy, data: Bytes);

    /// Replaces the stored policy in place. An expired policy removes the
    /// entry.
    async fn change(&self, url: &str, policy: CachePolicy);

    /// Removes the entry for `url`, if any.
    async fn remove(&self, url: &str);

    /// Removes every entry whose policy has expired.
    async fn remove_expired(&self);

    /// Removes every entry. Failures are logged, never raised.
    async fn remove_all(&self);
}
