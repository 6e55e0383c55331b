//! The store/source orchestrator.

use std::{fmt, ops::BitOr, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use http::response;
use tokio::sync::oneshot;

use crate::{
    error::CacheError,
    info::ResourceInfo,
    policy::CachePolicy,
    progress::Progress,
    receiver::{BufferOutcome, BufferSink, FilterCompletion, Receiver, ReceiverFilter},
    stores::{ByteRange, FileStore, MemoryStore, MutableStore, Source, Store},
};

/// How far a resumed prefetch rewinds, compensating for a possibly truncated
/// tail from an interrupted write.
const RESUME_REWIND: u64 = 4096;

/// Completion callback for [`LayeredCache::prefetch`].
pub type PrefetchCompletion = Box<dyn FnOnce(bool) + Send>;

/// A cache pairing one [`Store`] with one optional [`Source`].
///
/// A fetch consults the store first and falls through to the source on a
/// miss, teeing the source's bytes back into the store as they are served;
/// the [`CachePolicy::Update`] policy reverses the order. Since stores and
/// caches are sources themselves, caches chain:
///
/// ```no_run
/// use webcache::{Fetcher, FileStore, MemoryStore};
///
/// # fn main() -> webcache::Result<()> {
/// # let rt = tokio::runtime::Runtime::new()?;
/// # let _guard = rt.enter();
/// let cache = MemoryStore::new() | FileStore::with_name("WebCache")? | Fetcher::new();
/// # Ok(())
/// # }
/// ```
///
/// The cache performs no locking of its own; each component serializes its
/// own operations. A remove racing a source fill may leave the store empty
/// after the fetch appears to complete.
pub struct LayeredCache {
    store: Arc<dyn Store>,
    source: Option<Arc<dyn Source>>,
}

impl fmt::Debug for LayeredCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayeredCache")
            .field("store", &self.store)
            .field("source", &self.source)
            .finish()
    }
}

impl LayeredCache {
    /// A cache over a store, with no source behind it.
    pub fn new<S: Store>(store: S) -> Self {
        Self { store: Arc::new(store), source: None }
    }

    /// A cache over a store with a source behind it.
    pub fn with_source<S: Store, F: Source>(store: S, source: F) -> Self {
        Self { store: Arc::new(store), source: Some(Arc::new(source)) }
    }

    /// Appends a source to the end of the chain.
    ///
    /// If the current source is itself a cache, the new source lands behind
    /// its chain; if it is a plain store, the two are wrapped into a nested
    /// cache; a source that can do neither is replaced.
    pub fn connect(&mut self, source: Arc<dyn Source>) {
        let Some(mut existing) = self.source.take() else {
            self.source = Some(source);
            return;
        };
        if let Some(inner) = Arc::get_mut(&mut existing) {
            if let Some(layered) = inner.as_layered_mut() {
                layered.connect(source);
                self.source = Some(existing);
                return;
            }
        }
        match Arc::clone(&existing).clone_store() {
            Some(store) => {
                self.source = Some(Arc::new(Self { store, source: Some(source) }));
            }
            None => {
                log::debug!("replacing a source that cannot host a chain");
                self.source = Some(source);
            }
        }
    }

    /// Fetches a resource and buffers it fully in memory.
    ///
    /// Returns the metadata and bytes, or `None`s on a miss, an error, or a
    /// cancellation.
    pub async fn fetch_bytes(
        &self,
        url: &str,
        range: ByteRange,
        policy: CachePolicy,
        progress: Progress,
    ) -> (Option<ResourceInfo>, Option<Bytes>) {
        let (reply, rx) = oneshot::channel();
        let sink = BufferSink::new(
            usize::MAX,
            true,
            Box::new(move |outcome: BufferOutcome| {
                Box::pin(async move {
                    let _ = reply.send((outcome.info, outcome.data));
                })
            }),
        );
        self.fetch(url, range, policy, progress, Box::new(sink)).await;
        rx.await.unwrap_or((None, None))
    }

    /// Ensures a resource is fully materialized in the store.
    ///
    /// A complete entry reports success immediately. An incomplete one is
    /// resumed from just before its current tail; under
    /// [`CachePolicy::Update`] the source is always consulted.
    pub async fn prefetch(
        &self,
        url: &str,
        policy: CachePolicy,
        progress: Progress,
        completion: PrefetchCompletion,
    ) {
        let store = Arc::clone(&self.store);
        if policy == CachePolicy::Update {
            match self.source.clone() {
                Some(source) => {
                    let sink = Box::new(CompletionSink { completion: Some(completion) });
                    Self::fetch_via_source(
                        store,
                        source,
                        url.to_string(),
                        ByteRange::full(),
                        policy,
                        progress,
                        sink,
                    )
                    .await;
                }
                None => completion(false),
            }
            return;
        }

        let (info, length) = self.peek(url).await;
        if let (Some(info), Some(length)) = (&info, length) {
            if info.total_length == Some(length) {
                if progress.total() < 0 {
                    progress.set_total(1);
                }
                progress.add_completed(1);
                completion(true);
                return;
            }
        }
        let Some(source) = self.source.clone() else {
            completion(false);
            return;
        };
        let range = match (info.and_then(|i| i.total_length), length) {
            (Some(total), Some(length)) => {
                let offset = length.saturating_sub(RESUME_REWIND);
                ByteRange::new(offset, Some(total.saturating_sub(offset)))
            }
            _ => ByteRange::full(),
        };
        let sink = Box::new(CompletionSink { completion: Some(completion) });
        Self::fetch_via_source(store, source, url.to_string(), range, policy, progress, sink)
            .await;
    }

    /// Store miss (or source-first failure) falls through to the other side;
    /// anything that already produced bytes or a hard error is forwarded.
    fn fallthrough<F>(retry: F) -> FilterCompletion
    where
        F: FnOnce(Box<dyn Receiver>, Progress) -> futures::future::BoxFuture<'static, ()>,
        F: Send + 'static,
    {
        Box::new(move |found, event, inner, progress| {
            Box::pin(async move {
                if !found && event.error().is_none() && !progress.is_cancelled() {
                    retry(inner, progress).await;
                    None
                } else {
                    Some((inner, event))
                }
            })
        })
    }

    async fn fetch_store_first(
        store: Arc<dyn Store>,
        source: Arc<dyn Source>,
        url: String,
        range: ByteRange,
        policy: CachePolicy,
        progress: Progress,
        receiver: Box<dyn Receiver>,
    ) {
        let retry_store = Arc::clone(&store);
        let retry_url = url.clone();
        let completion = Self::fallthrough(move |inner, progress| {
            Box::pin(async move {
                Self::fetch_via_source(retry_store, source, retry_url, range, policy, progress, inner)
                    .await;
            })
        });
        let filtered = Box::new(ReceiverFilter::new(receiver).completion(completion));
        store.fetch(&url, range, policy, progress, filtered).await;
    }

    async fn fetch_source_first(
        store: Arc<dyn Store>,
        source: Arc<dyn Source>,
        url: String,
        range: ByteRange,
        policy: CachePolicy,
        progress: Progress,
        receiver: Box<dyn Receiver>,
    ) {
        let retry_store = Arc::clone(&store);
        let retry_url = url.clone();
        let completion = Self::fallthrough(move |inner, progress| {
            Box::pin(async move {
                retry_store.fetch(&retry_url, range, policy, progress, inner).await;
            })
        });
        let filtered = Box::new(ReceiverFilter::new(receiver).completion(completion));
        Self::fetch_via_source(store, source, url, range, policy, progress, filtered).await;
    }

    /// Delegates to the source, teeing served bytes into the store when the
    /// store can record them.
    async fn fetch_via_source(
        store: Arc<dyn Store>,
        source: Arc<dyn Source>,
        url: String,
        range: ByteRange,
        policy: CachePolicy,
        progress: Progress,
        receiver: Box<dyn Receiver>,
    ) {
        let receiver = match store.as_mutable() {
            Some(mutable) => match mutable.store_stream(&url, policy).await {
                Some(tee) => {
                    let boxed: Box<dyn Receiver> = Box::new(ReceiverFilter::new(receiver).tee(tee));
                    boxed
                }
                None => receiver,
            },
            None => receiver,
        };
        source.fetch(&url, range, policy, progress, receiver).await;
    }
}

#[async_trait]
impl Source for LayeredCache {
    async fn fetch(
        &self,
        url: &str,
        range: ByteRange,
        policy: CachePolicy,
        progress: Progress,
        receiver: Box<dyn Receiver>,
    ) {
        let store = Arc::clone(&self.store);
        match (self.source.clone(), policy == CachePolicy::Update) {
            (Some(source), true) => {
                Self::fetch_source_first(store, source, url.to_string(), range, policy, progress, receiver)
                    .await;
            }
            (Some(source), false) => {
                Self::fetch_store_first(store, source, url.to_string(), range, policy, progress, receiver)
                    .await;
            }
            (None, _) => store.fetch(url, range, policy, progress, receiver).await,
        }
    }

    fn as_store(&self) -> Option<&dyn Store> {
        Some(self)
    }

    fn as_mutable(&self) -> Option<&dyn MutableStore> {
        Some(self)
    }

    fn as_layered_mut(&mut self) -> Option<&mut LayeredCache> {
        Some(self)
    }

    fn clone_store(self: Arc<Self>) -> Option<Arc<dyn Store>> {
        Some(self)
    }
}

#[async_trait]
impl Store for LayeredCache {
    async fn peek(&self, url: &str) -> (Option<ResourceInfo>, Option<u64>) {
        let (info, length) = self.store.peek(url).await;
        if info.is_some() {
            return (info, length);
        }
        if let Some(source) = &self.source {
            if let Some(store) = source.as_store() {
                return store.peek(url).await;
            }
        }
        (None, None)
    }
}

#[async_trait]
impl MutableStore for LayeredCache {
    async fn store_stream(&self, url: &str, policy: CachePolicy) -> Option<Box<dyn Receiver>> {
        match self.store.as_mutable() {
            Some(mutable) => mutable.store_stream(url, policy).await,
            None => None,
        }
    }

    async fn store(&self, url: &str, info: ResourceInfo, policy: CachePolicy, data: Bytes) {
        if let Some(mutable) = self.store.as_mutable() {
            mutable.store(url, info, policy, data).await;
        }
    }

    async fn change(&self, url: &str, policy: CachePolicy) {
        if let Some(mutable) = self.store.as_mutable() {
            mutable.change(url, policy).await;
        }
        if let Some(source) = &self.source {
            if let Some(mutable) = source.as_mutable() {
                mutable.change(url, policy).await;
            }
        }
    }

    async fn remove(&self, url: &str) {
        if let Some(mutable) = self.store.as_mutable() {
            mutable.remove(url).await;
        }
        if let Some(source) = &self.source {
            if let Some(mutable) = source.as_mutable() {
                mutable.remove(url).await;
            }
        }
    }

    async fn remove_expired(&self) {
        if let Some(mutable) = self.store.as_mutable() {
            mutable.remove_expired().await;
        }
        if let Some(source) = &self.source {
            if let Some(mutable) = source.as_mutable() {
                mutable.remove_expired().await;
            }
        }
    }

    async fn remove_all(&self) {
        if let Some(mutable) = self.store.as_mutable() {
            mutable.remove_all().await;
        }
        if let Some(source) = &self.source {
            if let Some(mutable) = source.as_mutable() {
                mutable.remove_all().await;
            }
        }
    }
}

/// A receiver that only cares whether the stream finished.
struct CompletionSink {
    completion: Option<PrefetchCompletion>,
}

impl fmt::Debug for CompletionSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSink").finish_non_exhaustive()
    }
}

#[async_trait]
impl Receiver for CompletionSink {
    async fn on_inited(&mut self, _response: Option<&response::Parts>, _progress: &Progress) {}

    async fn on_started(&mut self, _info: &ResourceInfo, _offset: u64, _length: Option<u64>) {}

    async fn on_data(&mut self, _chunk: Bytes) {}

    async fn on_finished(&mut self) {
        if let Some(completion) = self.completion.take() {
            completion(true);
        }
    }

    async fn on_aborted(&mut self, _error: Option<CacheError>) {
        if let Some(completion) = self.completion.take() {
            completion(false);
        }
    }
}

impl<S: Source> BitOr<S> for LayeredCache {
    type Output = LayeredCache;

    fn bitor(mut self, source: S) -> LayeredCache {
        self.connect(Arc::new(source));
        self
    }
}

impl<S: Source> BitOr<S> for MemoryStore {
    type Output = LayeredCache;

    fn bitor(self, source: S) -> LayeredCache {
        LayeredCache::with_source(self, source)
    }
}

impl<S: Source> BitOr<S> for FileStore {
    type Output = LayeredCache;

    fn bitor(self, source: S) -> LayeredCache {
        LayeredCache::with_source(self, source)
    }
}
