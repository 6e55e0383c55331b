//! The persistent file-backed store.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use etcetera::{choose_base_strategy, BaseStrategy};
use log::{debug, warn};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};

use crate::{
    error::Result,
    hash::url_hash,
    info::{ResourceInfo, StorageInfo},
    policy::CachePolicy,
    progress::Progress,
    receiver::Receiver,
    stores::{
        disk::{DiskAdapter, FileOutput, FileStoreAdapter},
        ByteRange, MutableStore, Source, Store,
    },
};

/// Default subdirectory of the platform user-cache directory.
pub(crate) const DEFAULT_STORE_NAME: &str = "WebCache";

/// Reserved group tag key supplying a default write policy for the prefix.
const GROUP_POLICY_KEY: &str = "policy";

/// Permits available to a single streaming store before the producer is
/// throttled.
const STORE_THROTTLE_PERMITS: usize = 4;

/// How long a throttled producer waits for a write permit before pressing on.
const STORE_THROTTLE_TIMEOUT: Duration = Duration::from_secs(1);

/// A persistent byte store with sidecar metadata and partial-content
/// semantics.
///
/// Entries live at `<root>/<md5(url)>`, or under `<root>/<md5(prefix)>/`
/// when a registered group prefix matches. All filesystem access runs on the
/// store's single worker, in submission order.
#[derive(Debug, Clone)]
pub struct FileStore {
    tx: mpsc::UnboundedSender<FileCommand>,
    root: PathBuf,
    next_output: Arc<AtomicU64>,
}

#[derive(Debug, Clone)]
struct Group {
    prefix: String,
    root: PathBuf,
    tag: HashMap<String, String>,
}

enum FileCommand {
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
    StoreData {
        url: String,
        info: ResourceInfo,
        policy: CachePolicy,
        data: Bytes,
    },
    OpenOutput {
        id: u64,
        url: String,
        info: ResourceInfo,
        policy: CachePolicy,
        offset: u64,
        reply: oneshot::Sender<bool>,
    },
    Write {
        id: u64,
        chunk: Bytes,
        permit: Option<OwnedSemaphorePermit>,
    },
    CloseOutput {
        id: u64,
        aborted: bool,
    },
    Change {
        url: String,
        policy: CachePolicy,
    },
    Remove {
        url: String,
    },
    AddGroup {
        prefix: String,
        tag: HashMap<String, String>,
    },
    RemoveGroup {
        prefix: String,
    },
    RemoveExpired,
    RemoveAll,
}

impl FileStore {
    /// A store under the platform user-cache directory, subdirectory
    /// `WebCache`.
    ///
    /// Must be created within a tokio runtime: the store spawns its worker
    /// task on construction.
    pub fn new() -> Result<Self> {
        Self::with_name(DEFAULT_STORE_NAME)
    }

    /// A store under the platform user-cache directory with the given
    /// subdirectory name.
    pub fn with_name(name: &str) -> Result<Self> {
        let strategy = choose_base_strategy().map_err(anyhow::Error::new)?;
        Ok(Self::with_root(strategy.cache_dir().join(name)))
    }

    /// A store rooted at an explicit directory.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self::with_adapter(root, Box::new(DiskAdapter::new()))
    }

    /// A store driving a custom adapter.
    pub fn with_adapter(root: impl Into<PathBuf>, adapter: Box<dyn FileStoreAdapter>) -> Self {
        let root = root.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = FileWorker {
            root: root.clone(),
            adapter,
            groups: Vec::new(),
            outputs: HashMap::new(),
        };
        tokio::spawn(worker.run(rx));
        Self { tx, root, next_output: Arc::new(AtomicU64::new(0)) }
    }

    /// The directory this store keeps its entries under.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Routes all URLs under `prefix` to a dedicated subdirectory.
    ///
    /// The tag is free-form; the reserved key `"policy"` supplies a default
    /// [`CachePolicy`] for writes under the prefix. Re-adding a prefix
    /// replaces its tag.
    pub async fn add_group(&self, prefix: &str, tag: HashMap<String, String>) {
        let _ = self.tx.send(FileCommand::AddGroup { prefix: prefix.to_string(), tag });
    }

    /// Unregisters a group and deletes its subtree.
    pub async fn remove_group(&self, prefix: &str) {
        let _ = self.tx.send(FileCommand::RemoveGroup { prefix: prefix.to_string() });
    }
}

struct FileWorker {
    root: PathBuf,
    adapter: Box<dyn FileStoreAdapter>,
    groups: Vec<Group>,
    outputs: HashMap<u64, (PathBuf, FileOutput)>,
}

fn resolve_policy(policy: CachePolicy, tag: Option<&HashMap<String, String>>) -> CachePolicy {
    match (policy, tag.and_then(|t| t.get(GROUP_POLICY_KEY))) {
        (CachePolicy::Default, Some(value)) => value.parse().unwrap_or(CachePolicy::Keep),
        _ => policy,
    }
}

impl FileWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<FileCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                FileCommand::Fetch { url, range, progress, receiver } => {
                    self.fetch(&url, range, progress, receiver).await;
                }
                FileCommand::Peek { url, reply } => {
                    let _ = reply.send(self.peek(&url).await);
                }
                FileCommand::StoreData { url, info, policy, data } => {
                    self.store_data(&url, info, policy, data).await;
                }
                FileCommand::OpenOutput { id, url, info, policy, offset, reply } => {
                    let _ = reply.send(self.open_output(id, &url, info, policy, offset).await);
                }
                FileCommand::Write { id, chunk, permit } => {
                    self.write(id, chunk).await;
                    drop(permit);
                }
                FileCommand::CloseOutput { id, aborted } => {
                    self.close_output(id, aborted).await;
                }
                FileCommand::Change { url, policy } => {
                    let (path, _) = self.resolve(&url);
                    self.adapter.change_policy(&path, policy).await;
                }
                FileCommand::Remove { url } => {
                    let (path, _) = self.resolve(&url);
                    self.adapter.remove(&path).await;
                }
                FileCommand::AddGroup { prefix, tag } => self.add_group(prefix, tag),
                FileCommand::RemoveGroup { prefix } => {
                    self.groups.retain(|g| g.prefix != prefix);
                    let subtree = self.root.join(url_hash(&prefix));
                    self.adapter.remove_subtree(&subtree).await;
                }
                FileCommand::RemoveExpired => {
                    self.adapter.remove_expired(&self.root).await;
                }
                FileCommand::RemoveAll => {
                    self.adapter.remove_subtree(&self.root).await;
                }
            }
        }
    }

    fn resolve(&self, url: &str) -> (PathBuf, Option<usize>) {
        for (index, group) in self.groups.iter().enumerate() {
            if url.starts_with(&group.prefix) {
                return (group.root.join(url_hash(url)), Some(index));
            }
        }
        (self.root.join(url_hash(url)), None)
    }

    fn group_tag(&self, index: Option<usize>) -> Option<&HashMap<String, String>> {
        index.map(|i| &self.groups[i].tag)
    }

    fn add_group(&mut self, prefix: String, tag: HashMap<String, String>) {
        let root = self.root.join(url_hash(&prefix));
        match self.groups.iter_mut().find(|g| g.prefix == prefix) {
            Some(group) => group.tag = tag,
            None => self.groups.push(Group { prefix, root, tag }),
        }
    }

    async fn fetch(
        &mut self,
        url: &str,
        range: ByteRange,
        progress: Progress,
        mut receiver: Box<dyn Receiver>,
    ) {
        receiver.on_inited(None, &progress).await;
        let (path, _) = self.resolve(url);
        let opened = match self.adapter.open_input(&path, range.offset, range.length).await {
            Ok(Some(opened)) => opened,
            Ok(None) => {
                receiver.on_aborted(None).await;
                return;
            }
            Err(e) => {
                receiver.on_aborted(Some(e)).await;
                return;
            }
        };
        let (meta, mut input) = opened;
        let length = input.limit();
        if progress.total() < 0 {
            match meta.info.total_length {
                // The slice reaches the end of a known-length resource:
                // report progress against the whole resource.
                Some(total) if range.offset + length == total => {
                    progress.set_total(total as i64);
                    progress.set_completed(range.offset as i64);
                }
                _ => progress.set_total(length as i64),
            }
        }
        receiver.on_started(&meta.info, range.offset, Some(length)).await;
        loop {
            if progress.is_cancelled() {
                receiver.on_aborted(None).await;
                return;
            }
            match input.read_chunk().await {
                Ok(Some(chunk)) => {
                    progress.add_completed(chunk.len() as u64);
                    receiver.on_data(chunk).await;
                }
                Ok(None) => break,
                Err(e) => {
                    receiver.on_aborted(Some(e.into())).await;
                    return;
                }
            }
        }
        receiver.on_finished().await;
    }

    async fn peek(&mut self, url: &str) -> (Option<ResourceInfo>, Option<u64>) {
        let (path, _) = self.resolve(url);
        match self.adapter.read_meta(&path).await {
            Some(meta) => {
                let size = self.adapter.file_size(&path).await.unwrap_or(0);
                (Some(meta.info), Some(size))
            }
            None => (None, None),
        }
    }

    async fn store_data(&mut self, url: &str, info: ResourceInfo, policy: CachePolicy, data: Bytes) {
        let (path, group) = self.resolve(url);
        let policy = resolve_policy(policy, self.group_tag(group));
        if policy.is_expired() {
            self.adapter.remove(&path).await;
            return;
        }
        let meta = StorageInfo::new(info, policy);
        match self.adapter.open_output(&path, &meta, 0).await {
            Ok(Some(mut output)) => {
                let failed = output.write(&data).await.is_err();
                if failed || output.close().await.is_err() {
                    warn!("failed to persist {url}");
                    self.adapter.remove(&path).await;
                }
            }
            Ok(None) => {}
            Err(e) => warn!("failed to open {url} for writing: {e}"),
        }
    }

    async fn open_output(
        &mut self,
        id: u64,
        url: &str,
        info: ResourceInfo,
        policy: CachePolicy,
        offset: u64,
    ) -> bool {
        let (path, group) = self.resolve(url);
        let policy = resolve_policy(policy, self.group_tag(group));
        if policy.is_expired() {
            debug!("suppressing write of {url}: policy already expired");
            return false;
        }
        let meta = StorageInfo::new(info, policy);
        match self.adapter.open_output(&path, &meta, offset).await {
            Ok(Some(output)) => {
                self.outputs.insert(id, (path, output));
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("failed to open {url} for writing: {e}");
                false
            }
        }
    }

    async fn write(&mut self, id: u64, chunk: Bytes) {
        let failed = match self.outputs.get_mut(&id) {
            Some((_, output)) => output.write(&chunk).await.is_err(),
            None => false,
        };
        if failed {
            if let Some((path, _)) = self.outputs.remove(&id) {
                warn!("write failed, dropping entry at {}", path.display());
                self.adapter.remove(&path).await;
            }
        }
    }

    async fn close_output(&mut self, id: u64, aborted: bool) {
        if let Some((path, output)) = self.outputs.remove(&id) {
            if let Err(e) = output.close().await {
                warn!("failed to close {}: {e}", path.display());
            }
            if aborted {
                // Partial content stays on disk; a later fetch resumes it.
                debug!("store of {} ended early", path.display());
            }
        }
    }
}

/// The streaming receiver handed out by [`FileStore::store_stream`].
struct StoreReceiver {
    tx: mpsc::UnboundedSender<FileCommand>,
    id: u64,
    url: String,
    policy: CachePolicy,
    throttle: Arc<Semaphore>,
    open: bool,
}

impl fmt::Debug for StoreReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreReceiver")
            .field("url", &self.url)
            .field("open", &self.open)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Receiver for StoreReceiver {
    async fn on_inited(&mut self, _response: Option<&http::response::Parts>, _progress: &Progress) {}

    async fn on_started(&mut self, info: &ResourceInfo, offset: u64, _length: Option<u64>) {
        let (reply, rx) = oneshot::channel();
        let command = FileCommand::OpenOutput {
            id: self.id,
            url: self.url.clone(),
            info: info.clone(),
            policy: self.policy,
            offset,
            reply,
        };
        if self.tx.send(command).is_err() {
            return;
        }
        self.open = rx.await.unwrap_or(false);
    }

    async fn on_data(&mut self, chunk: Bytes) {
        if !self.open {
            return;
        }
        // Bound the bytes in flight when the producer outpaces disk. If the
        // disk cannot keep up within the timeout, press on rather than stall
        // the delivery path indefinitely.
        let permit =
            match tokio::time::timeout(STORE_THROTTLE_TIMEOUT, Arc::clone(&self.throttle).acquire_owned())
                .await
            {
                Ok(Ok(permit)) => Some(permit),
                Ok(Err(_)) => None,
                Err(_) => {
                    debug!("store of {} is outpacing disk", self.url);
                    None
                }
            };
        let _ = self.tx.send(FileCommand::Write { id: self.id, chunk, permit });
    }

    async fn on_finished(&mut self) {
        if self.open {
            let _ = self.tx.send(FileCommand::CloseOutput { id: self.id, aborted: false });
        }
    }

    async fn on_aborted(&mut self, error: Option<crate::error::CacheError>) {
        if self.open {
            if let Some(error) = &error {
                debug!("store of {} aborted: {error}", self.url);
            }
            let _ = self.tx.send(FileCommand::CloseOutput { id: self.id, aborted: true });
        }
    }
}

#[async_trait]
impl Source for FileStore {
    async fn fetch(
        &self,
        url: &str,
        range: ByteRange,
        _policy: CachePolicy,
        progress: Progress,
        receiver: Box<dyn Receiver>,
    ) {
        let command =
            FileCommand::Fetch { url: url.to_string(), range, progress, receiver };
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
impl Store for FileStore {
    async fn peek(&self, url: &str) -> (Option<ResourceInfo>, Option<u64>) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(FileCommand::Peek { url: url.to_string(), reply }).is_err() {
            return (None, None);
        }
        rx.await.unwrap_or((None, None))
    }
}

#[async_trait]
impl MutableStore for FileStore {
    async fn store_stream(&self, url: &str, policy: CachePolicy) -> Option<Box<dyn Receiver>> {
        let id = self.next_output.fetch_add(1, Ordering::Relaxed);
        Some(Box::new(StoreReceiver {
            tx: self.tx.clone(),
            id,
            url: url.to_string(),
            policy,
            throttle: Arc::new(Semaphore::new(STORE_THROTTLE_PERMITS)),
            open: false,
        }))
    }

    async fn store(&self, url: &str, info: ResourceInfo, policy: CachePolicy, data: Bytes) {
        let command = FileCommand::StoreData { url: url.to_string(), info, policy, data };
        let _ = self.tx.send(command);
    }

    async fn change(&self, url: &str, policy: CachePolicy) {
        let _ = self.tx.send(FileCommand::Change { url: url.to_string(), policy });
    }

    async fn remove(&self, url: &str) {
        let _ = self.tx.send(FileCommand::Remove { url: url.to_string() });
    }

    async fn remove_expired(&self) {
        let _ = self.tx.send(FileCommand::RemoveExpired);
    }

    async fn remove_all(&self) {
        let _ = self.tx.send(FileCommand::RemoveAll);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn text_info(total: Option<u64>) -> ResourceInfo {
        let mut info = ResourceInfo::with_mime("text/plain");
        info.total_length = total;
        info
    }

    #[tokio::test]
    async fn store_then_peek() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::with_root(dir.path());
        store
            .store("https://example.com/a", text_info(Some(5)), CachePolicy::Keep, Bytes::from_static(b"hello"))
            .await;

        let (info, length) = store.peek("https://example.com/a").await;
        assert_eq!(info, Some(text_info(Some(5))));
        assert_eq!(length, Some(5));
        assert!(dir.path().join(url_hash("https://example.com/a")).exists());
    }

    #[tokio::test]
    async fn expired_store_removes() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::with_root(dir.path());
        let url = "https://example.com/a";
        store.store(url, text_info(None), CachePolicy::Keep, Bytes::from_static(b"x")).await;
        store.store(url, text_info(None), CachePolicy::ExpiredAt(1), Bytes::from_static(b"y")).await;
        assert_eq!(store.peek(url).await, (None, None));
        assert!(!dir.path().join(url_hash(url)).exists());
    }

    #[tokio::test]
    async fn change_to_expired_deletes_artifact() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::with_root(dir.path());
        let url = "https://example.com/a";
        store.store(url, text_info(None), CachePolicy::Keep, Bytes::from_static(b"x")).await;
        store.change(url, CachePolicy::ExpiredAt(1)).await;
        assert_eq!(store.peek(url).await, (None, None));
        assert!(!dir.path().join(url_hash(url)).exists());
    }

    #[tokio::test]
    async fn group_routing_and_removal() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::with_root(dir.path());
        let prefix = "https://a.example/";
        let url = "https://a.example/x.png";
        store
            .add_group(prefix, HashMap::from([("policy".to_string(), "keep".to_string())]))
            .await;
        store.store(url, text_info(None), CachePolicy::Default, Bytes::from_static(b"png")).await;

        let grouped = dir.path().join(url_hash(prefix)).join(url_hash(url));
        let (info, _) = store.peek(url).await;
        assert!(info.is_some());
        assert!(grouped.exists());

        store.remove_group(prefix).await;
        assert_eq!(store.peek(url).await, (None, None));
        assert!(!dir.path().join(url_hash(prefix)).exists());
    }

    #[tokio::test]
    async fn group_expired_default_policy_suppresses_writes() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::with_root(dir.path());
        let prefix = "https://stale.example/";
        let url = "https://stale.example/x";
        store
            .add_group(prefix, HashMap::from([("policy".to_string(), "1".to_string())]))
            .await;
        store.store(url, text_info(None), CachePolicy::Default, Bytes::from_static(b"x")).await;
        assert_eq!(store.peek(url).await, (None, None));

        // An explicit policy overrides the group default.
        store.store(url, text_info(None), CachePolicy::Keep, Bytes::from_static(b"x")).await;
        assert!(store.peek(url).await.0.is_some());
    }

    #[tokio::test]
    async fn remove_expired_sweeps_root_and_groups() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::with_root(dir.path());
        store
            .store("https://live.example/a", text_info(None), CachePolicy::Keep, Bytes::from_static(b"y"))
            .await;

        // Plant an expired entry inside a group directory, as a writer that
        // never came back would leave behind.
        let dead = dir
            .path()
            .join(url_hash("https://g.example/"))
            .join(url_hash("https://g.example/dead"));
        let mut adapter = DiskAdapter::new();
        let meta = StorageInfo::new(text_info(None), CachePolicy::ExpiredAt(1));
        let mut output = adapter.open_output(&dead, &meta, 0).await.unwrap().unwrap();
        output.write(b"x").await.unwrap();
        output.close().await.unwrap();

        store.remove_expired().await;
        // The peek flushes the sweep off the store's queue.
        assert!(store.peek("https://live.example/a").await.0.is_some());
        assert!(!dead.exists());
    }

    #[tokio::test]
    async fn remove_all_clears_root() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::with_root(dir.path());
        store.store("u1", text_info(None), CachePolicy::Keep, Bytes::from_static(b"a")).await;
        store.store("u2", text_info(None), CachePolicy::Keep, Bytes::from_static(b"b")).await;
        store.remove_all().await;
        assert_eq!(store.peek("u1").await, (None, None));
        assert_eq!(store.peek("u2").await, (None, None));
    }
}
