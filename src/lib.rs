#![forbid(unsafe_code, future_incompatible)]
#![deny(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    nonstandard_style,
    unused_qualifications,
    unused_import_braces,
    unused_extern_crates,
    trivial_casts,
    trivial_numeric_casts
)]
//! An embeddable, layered streaming cache for HTTP byte resources.
//!
//! A caller asks for a URL (optionally a byte range) and the cache streams
//! back the bytes together with their metadata (MIME type, text encoding,
//! total length, selected response headers), transparently filling faster
//! tiers from slower ones. The building blocks all speak the same streaming
//! [`Receiver`] protocol and compose freely:
//!
//! - [`MemoryStore`]: a cost-bounded in-memory blob cache.
//! - [`FileStore`]: a persistent store with sidecar metadata, byte-range
//!   reads, resumable partial writes, and URL-prefix groups.
//! - [`Fetcher`]: an HTTP `GET` source honoring range semantics.
//! - [`LayeredCache`]: pairs a store with a source and orchestrates
//!   fallthrough, refresh, prefetch, and mutation fan-out.
//!
//! ## A memory-backed cache
//!
//! ```
//! use bytes::Bytes;
//! use webcache::{
//!     ByteRange, CachePolicy, LayeredCache, MemoryStore, MutableStore, Progress, ResourceInfo,
//! };
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let cache = LayeredCache::new(MemoryStore::new());
//! cache
//!     .store(
//!         "https://example.com/greeting",
//!         ResourceInfo::with_mime("text/plain"),
//!         CachePolicy::Keep,
//!         Bytes::from_static(b"hello"),
//!     )
//!     .await;
//!
//! let (info, data) = cache
//!     .fetch_bytes(
//!         "https://example.com/greeting",
//!         ByteRange::full(),
//!         CachePolicy::Default,
//!         Progress::new(),
//!     )
//!     .await;
//! assert_eq!(info.unwrap().mime_type, "text/plain");
//! assert_eq!(data.as_deref(), Some(&b"hello"[..]));
//! # });
//! ```
//!
//! ## A three-tier pipeline
//!
//! The `|` operator chains a store in front of a slower source. Bytes served
//! from the right end of the chain are persisted on their way through:
//!
//! ```no_run
//! use webcache::{ByteRange, CachePolicy, Fetcher, FileStore, MemoryStore, Progress};
//!
//! # async fn demo() -> webcache::Result<()> {
//! let cache = MemoryStore::new() | FileStore::with_name("WebCache")? | Fetcher::new();
//!
//! let (info, data) = cache
//!     .fetch_bytes(
//!         "https://example.com/logo.png",
//!         ByteRange::full(),
//!         CachePolicy::Default,
//!         Progress::new(),
//!     )
//!     .await;
//! # let _ = (info, data);
//! # Ok(())
//! # }
//! ```
//!
//! ## Policies
//!
//! Every write carries a [`CachePolicy`]: `Keep` never expires, `ExpiredAt`
//! expires at an absolute time, `Update` forces a source fetch before the
//! store is consulted, and `Default` defers to the enclosing group or
//! context. Expired entries are deleted on sight; [`MutableStore::change`]
//! re-policies an entry in place.
//!
//! ## Concurrency
//!
//! Each store owns a single serialized worker; every operation is an enqueue
//! that returns immediately, with results delivered through the receiver (or
//! a completion callback). Cancellation is cooperative via [`Progress`] and
//! checked at chunk boundaries.

mod error;
mod fetcher;
mod hash;
mod info;
mod layered;
mod policy;
mod progress;
mod receiver;
mod stores;

pub use crate::{
    error::{CacheError, Result},
    fetcher::{Fetcher, INTERNAL_REQUEST_HEADER},
    hash::url_hash,
    info::{
        add_whitelisted_header, is_whitelisted_header, set_whitelisted_headers,
        whitelisted_headers, ResourceInfo, StorageInfo, DEFAULT_MIME_TYPE,
    },
    layered::{LayeredCache, PrefetchCompletion},
    policy::CachePolicy,
    progress::Progress,
    receiver::{
        BufferCompletion, BufferOutcome, BufferSink, FilterCompletion, FilterEvent, Receiver,
        ReceiverFilter,
    },
    stores::{
        ByteRange, DiskAdapter, FileInput, FileOutput, FileStore, FileStoreAdapter, MemoryStore,
        MutableStore, SidecarBackend, Source, Store, DEFAULT_MEMORY_COST_LIMIT, SIDECAR_NAME,
    },
};
