//! A cost-bounded in-memory blob store.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use tokio::sync::{mpsc, oneshot};

use crate::{
    error::CacheError,
    info::{ResourceInfo, StorageInfo},
    policy::CachePolicy,
    progress::Progress,
    receiver::{BufferOutcome, BufferSink, Receiver},
    stores::{ByteRange, MutableStore, Source, Store},
};

/// Default cost ceiling: 128 MiB of payload bytes.
pub const DEFAULT_MEMORY_COST_LIMIT: u64 = 128 * 1024 * 1024;

/// A keyed blob cache bounded by total payload cost and entry count.
///
/// Every operation goes through a single serialized worker, so callers may
/// invoke freely from any task: a store-then-fetch for the same URL observes
/// the store, and two stores for the same URL are serialized with the last
/// writer winning. Eviction is approximate LRU; after every insert both the
/// cost and the count limit hold again.
#[derive(Clone)]
pub struct MemoryStore {
    tx: mpsc::UnboundedSender<Command>,
    cost_limit: u64,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore").field("cost_limit", &self.cost_limit).finish_non_exhaustive()
    }
}

enum Command {
    Fetch {
        url: String,
        range: ByteRange,
        progress: Progress,
        receiver: Box<dyn Receiver>,
    },
    Peek {
        url: String,
        reply: oneshot::Sender<(Option<ResourceInfo>, Option<u64>)>,
    },
    Insert {
        url: String,
        info: ResourceInfo,
        policy: CachePolicy,
        data: Bytes,
    },
    Change {
        url: String,
        policy: CachePolicy,
    },
    Remove {
        url: String,
    },
    RemoveExpired,
    RemoveAll,
}

struct MemoryEntry {
    meta: StorageInfo,
    data: Bytes,
}

impl MemoryEntry {
    fn cost(&self) -> u64 {
        self.data.len() as u64
    }
}

struct Worker {
    entries: LruCache<String, MemoryEntry>,
    total_cost: u64,
    cost_limit: u64,
    count_limit: usize,
}

impl MemoryStore {
    /// A store with the default 128 MiB cost limit and no count limit.
    ///
    /// Must be created within a tokio runtime: the store spawns its worker
    /// task on construction.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MEMORY_COST_LIMIT, usize::MAX)
    }

    /// A store bounded by the given payload cost and entry count.
    pub fn with_limits(cost_limit: u64, count_limit: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            entries: LruCache::unbounded(),
            total_cost: 0,
            cost_limit,
            count_limit,
        };
        tokio::spawn(worker.run(rx));
        Self { tx, cost_limit }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Fetch { url, range, progress, receiver } => {
                    self.fetch(url, range, progress, receiver).await;
                }
                Command::Peek { url, reply } => {
                    let _ = reply.send(self.peek(&url));
                }
                Command::Insert { url, info, policy, data } => {
                    self.insert(url, info, policy, data);
                }
                Command::Change { url, policy } => self.change(&url, policy),
                Command::Remove { url } => self.remove(&url),
                Command::RemoveExpired => self.remove_expired(),
                Command::RemoveAll => {
                    self.entries.clear();
                    self.total_cost = 0;
                }
            }
        }
    }

    async fn fetch(
        &mut self,
        url: String,
        range: ByteRange,
        progress: Progress,
        mut receiver: Box<dyn Receiver>,
    ) {
        receiver.on_inited(None, &progress).await;

        enum Lookup {
            Missing,
            Expired,
            Live(ResourceInfo, Bytes),
        }
        let lookup = match self.entries.get(&url) {
            None => Lookup::Missing,
            Some(entry) if entry.meta.policy.is_expired() => Lookup::Expired,
            Some(entry) => Lookup::Live(entry.meta.info.clone(), entry.data.clone()),
        };
        let (info, data) = match lookup {
            Lookup::Missing => {
                receiver.on_aborted(None).await;
                return;
            }
            Lookup::Expired => {
                self.remove(&url);
                receiver.on_aborted(None).await;
                return;
            }
            Lookup::Live(info, data) => (info, data),
        };

        let available = data.len() as u64;
        let offset = range.offset;
        let length = range.length.unwrap_or_else(|| available.saturating_sub(offset));
        if offset + length > available {
            receiver
                .on_aborted(Some(CacheError::RangeInvalid { offset, length: range.length }))
                .await;
            return;
        }
        if progress.total() < 0 {
            progress.set_total(length as i64);
        }
        receiver.on_started(&info, offset, Some(length)).await;
        if progress.is_cancelled() {
            receiver.on_aborted(None).await;
            return;
        }
        let slice = data.slice(offset as usize..(offset + length) as usize);
        progress.add_completed(slice.len() as u64);
        receiver.on_data(slice).await;
        receiver.on_finished().await;
    }

    fn peek(&mut self, url: &str) -> (Option<ResourceInfo>, Option<u64>) {
        let expired = match self.entries.peek(url) {
            None => return (None, None),
            Some(entry) => entry.meta.policy.is_expired(),
        };
        if expired {
            self.remove(url);
            return (None, None);
        }
        match self.entries.peek(url) {
            Some(entry) => (Some(entry.meta.info.clone()), Some(entry.data.len() as u64)),
            None => (None, None),
        }
    }

    fn insert(&mut self, url: String, info: ResourceInfo, policy: CachePolicy, data: Bytes) {
        if policy.is_expired() {
            self.remove(&url);
            return;
        }
        let entry = MemoryEntry { meta: StorageInfo::new(info, policy), data };
        self.total_cost += entry.cost();
        if let Some((_, old)) = self.entries.push(url, entry) {
            self.total_cost -= old.cost();
        }
        while self.total_cost > self.cost_limit || self.entries.len() > self.count_limit {
            match self.entries.pop_lru() {
                Some((_, evicted)) => self.total_cost -= evicted.cost(),
                None => break,
            }
        }
    }

    fn change(&mut self, url: &str, policy: CachePolicy) {
        if policy.is_expired() {
            self.remove(url);
            return;
        }
        if let Some(entry) = self.entries.peek_mut(url) {
            entry.meta.policy = policy;
        }
    }

    fn remove(&mut self, url: &str) {
        if let Some(entry) = self.entries.pop(url) {
            self.total_cost -= entry.cost();
        }
    }

    fn remove_expired(&mut self) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.meta.policy.is_expired())
            .map(|(url, _)| url.clone())
            .collect();
        for url in expired {
            self.remove(&url);
        }
    }
}

#[async_trait]
impl Source for MemoryStore {
    async fn fetch(
        &self,
        url: &str,
        range: ByteRange,
        _policy: CachePolicy,
        progress: Progress,
        receiver: Box<dyn Receiver>,
    ) {
        let command = Command::Fetch { url: url.to_string(), range, progress, receiver };
        let _ = self.tx.send(command);
    }

    fn as_store(&self) -> Option<&dyn Store> {
        Some(self)
    }

    fn as_mutable(&self) -> Option<&dyn MutableStore> {
        Some(self)
    }

    fn clone_store(self: Arc<Self>) -> Option<Arc<dyn Store>> {
        Some(self)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn peek(&self, url: &str) -> (Option<ResourceInfo>, Option<u64>) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Peek { url: url.to_string(), reply }).is_err() {
            return (None, None);
        }
        rx.await.unwrap_or((None, None))
    }
}

#[async_trait]
impl MutableStore for MemoryStore {
    async fn store_stream(&self, url: &str, policy: CachePolicy) -> Option<Box<dyn Receiver>> {
        let size_limit = (self.cost_limit / 4) as usize;
        let tx = self.tx.clone();
        let url = url.to_string();
        Some(Box::new(BufferSink::new(
            size_limit,
            false,
            Box::new(move |outcome: BufferOutcome| {
                Box::pin(async move {
                    if outcome.progress.as_ref().is_some_and(Progress::is_cancelled) {
                        return;
                    }
                    if let (Some(info), Some(data)) = (outcome.info, outcome.data) {
                        let _ = tx.send(Command::Insert { url, info, policy, data });
                    }
                })
            }),
        )))
    }

    async fn store(&self, url: &str, info: ResourceInfo, policy: CachePolicy, data: Bytes) {
        let _ = self.tx.send(Command::Insert { url: url.to_string(), info, policy, data });
    }

    async fn change(&self, url: &str, policy: CachePolicy) {
        let _ = self.tx.send(Command::Change { url: url.to_string(), policy });
    }

    async fn remove(&self, url: &str) {
        let _ = self.tx.send(Command::Remove { url: url.to_string() });
    }

    async fn remove_expired(&self) {
        let _ = self.tx.send(Command::RemoveExpired);
    }

    async fn remove_all(&self) {
        let _ = self.tx.send(Command::RemoveAll);
    }
}
