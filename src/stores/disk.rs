//! Filesystem access for the file store: payload files, sidecar metadata,
//! and the streaming input/output primitives.

use std::{
    ffi::OsString,
    fmt, io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use log::{debug, warn};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom},
};

use crate::{
    error::{CacheError, Result},
    info::StorageInfo,
    policy::CachePolicy,
};

/// Name of the per-entry metadata record.
///
/// With the extended-attribute backend this is the attribute name (under the
/// `user` namespace on Linux); with the meta-file backend it becomes the
/// `.meta` sibling of the payload. The JSON schema inside is the
/// interoperability contract either way.
pub const SIDECAR_NAME: &str = "WebCache";

/// Buffer size for streaming reads from disk.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// File extension of the sibling metadata record.
const META_EXTENSION: &str = ".meta";

/// Where sidecar metadata lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidecarBackend {
    /// A sibling `<payload>.meta` file. Works on every filesystem.
    MetaFile,
    /// The `user.WebCache` extended attribute on the payload file itself.
    /// Requires a filesystem with user xattr support.
    #[cfg(unix)]
    Xattr,
}

impl Default for SidecarBackend {
    fn default() -> Self {
        Self::MetaFile
    }
}

fn meta_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(META_EXTENSION);
    PathBuf::from(name)
}

#[cfg(unix)]
fn xattr_name() -> String {
    format!("user.{SIDECAR_NAME}")
}

impl SidecarBackend {
    async fn read(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
        match self {
            Self::MetaFile => match tokio::fs::read(meta_path(path)).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e),
            },
            #[cfg(unix)]
            Self::Xattr => match xattr::get(path, xattr_name()) {
                Ok(value) => Ok(value),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e),
            },
        }
    }

    async fn write(&self, path: &Path, record: &[u8]) -> io::Result<()> {
        match self {
            Self::MetaFile => tokio::fs::write(meta_path(path), record).await,
            #[cfg(unix)]
            Self::Xattr => xattr::set(path, xattr_name(), record),
        }
    }

    async fn remove(&self, path: &Path) {
        match self {
            Self::MetaFile => {
                let _ = tokio::fs::remove_file(meta_path(path)).await;
            }
            // The xattr record dies with the payload file.
            #[cfg(unix)]
            Self::Xattr => {}
        }
    }

    fn is_meta_file(&self, path: &Path) -> bool {
        matches!(self, Self::MetaFile)
            && path.to_string_lossy().ends_with(META_EXTENSION)
    }
}

/// A bounded read stream over a payload file.
#[derive(Debug)]
pub struct FileInput {
    file: File,
    length: u64,
    remaining: u64,
}

impl FileInput {
    /// The number of bytes this stream will deliver in total.
    pub fn limit(&self) -> u64 {
        self.length
    }

    /// Reads the next chunk, up to 64 KiB, or `None` at end of stream.
    pub async fn read_chunk(&mut self) -> io::Result<Option<Bytes>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let want = READ_CHUNK_SIZE.min(self.remaining as usize);
        let mut buffer = BytesMut::with_capacity(want);
        buffer.resize(want, 0);
        let read = self.file.read(&mut buffer[..]).await?;
        if read == 0 {
            self.remaining = 0;
            return Ok(None);
        }
        buffer.truncate(read);
        self.remaining -= read as u64;
        Ok(Some(buffer.freeze()))
    }
}

/// A positioned write stream over a payload file.
///
/// Bytes are appended from `base`; [`close`](Self::close) truncates the file
/// to exactly what was written so a shorter rewrite leaves no stale tail.
#[derive(Debug)]
pub struct FileOutput {
    file: File,
    base: u64,
    written: u64,
}

impl FileOutput {
    /// Appends a chunk.
    pub async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.file.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Flushes and truncates to the written length.
    pub async fn close(mut self) -> io::Result<()> {
        self.file.flush().await?;
        self.file.set_len(self.base + self.written).await
    }
}

/// Filesystem operations the file store is built on.
///
/// The store owns exactly one adapter and drives it from its serialized
/// worker, so implementations are free to keep mutable state.
#[async_trait]
pub trait FileStoreAdapter: fmt::Debug + Send + 'static {
    /// Loads the sidecar for `path`. Any metadata failure (missing record,
    /// bad JSON, expired policy) deletes the payload and reports absence.
    async fn read_meta(&mut self, path: &Path) -> Option<StorageInfo>;

    /// The payload size in bytes, when the payload exists.
    async fn file_size(&mut self, path: &Path) -> Option<u64>;

    /// Opens `path` for reading the given range. `Ok(None)` means the entry
    /// (or the requested range) is not available.
    async fn open_input(
        &mut self,
        path: &Path,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Option<(StorageInfo, FileInput)>>;

    /// Opens `path` for writing at `offset`. `Ok(None)` means the write
    /// cannot be accepted.
    async fn open_output(
        &mut self,
        path: &Path,
        meta: &StorageInfo,
        offset: u64,
    ) -> Result<Option<FileOutput>>;

    /// Rewrites the stored policy. An expired policy removes the entry.
    async fn change_policy(&mut self, path: &Path, policy: CachePolicy);

    /// Removes the payload and its sidecar.
    async fn remove(&mut self, path: &Path);

    /// Removes a directory subtree.
    async fn remove_subtree(&mut self, path: &Path);

    /// Deletes every entry under `root` whose policy has expired.
    async fn remove_expired(&mut self, root: &Path);
}

/// The default adapter: plain files under a root directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskAdapter {
    sidecar: SidecarBackend,
}

impl DiskAdapter {
    /// An adapter using the portable meta-file sidecar backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// An adapter using the given sidecar backend.
    pub fn with_sidecar(sidecar: SidecarBackend) -> Self {
        Self { sidecar }
    }

    async fn write_meta(&self, path: &Path, meta: &StorageInfo) -> Result<()> {
        let record = meta.to_sidecar_json().map_err(|source| CacheError::Sidecar {
            path: path.display().to_string(),
            source,
        })?;
        self.sidecar.write(path, &record).await?;
        Ok(())
    }

    /// Reads the sidecar without the delete-on-failure sweep.
    async fn peek_meta(&self, path: &Path) -> Option<StorageInfo> {
        let bytes = self.sidecar.read(path).await.ok().flatten()?;
        StorageInfo::from_sidecar_json(&bytes).ok()
    }
}

#[async_trait]
impl FileStoreAdapter for DiskAdapter {
    async fn read_meta(&mut self, path: &Path) -> Option<StorageInfo> {
        let bytes = match self.sidecar.read(path).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.remove(path).await;
                return None;
            }
            Err(e) => {
                debug!("sidecar read failed for {}: {e}", path.display());
                self.remove(path).await;
                return None;
            }
        };
        match StorageInfo::from_sidecar_json(&bytes) {
            Ok(meta) if !meta.policy.is_expired() => Some(meta),
            Ok(_) => {
                self.remove(path).await;
                None
            }
            Err(e) => {
                warn!("discarding entry with bad sidecar at {}: {e}", path.display());
                self.remove(path).await;
                None
            }
        }
    }

    async fn file_size(&mut self, path: &Path) -> Option<u64> {
        tokio::fs::metadata(path).await.ok().map(|m| m.len())
    }

    async fn open_input(
        &mut self,
        path: &Path,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Option<(StorageInfo, FileInput)>> {
        let meta = match self.read_meta(path).await {
            Some(meta) => meta,
            None => return Ok(None),
        };
        let mut file = match File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // A sidecar without its payload is not an entry.
                self.remove(path).await;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let file_size = file.metadata().await?.len();
        let total = meta.info.total_length.unwrap_or(file_size);
        let mut length = length.unwrap_or_else(|| total.saturating_sub(offset));

        if length == 0 {
            // Zero-length slice: an immediate end-of-stream with metadata.
            return Ok(Some((meta, FileInput { file, length: 0, remaining: 0 })));
        }
        if offset + length > file_size {
            if total <= file_size && offset < total {
                // Fully materialized; clamp the tail.
                length = total - offset;
            } else if offset >= total {
                return Ok(Some((meta, FileInput { file, length: 0, remaining: 0 })));
            } else {
                // Partially materialized and the range is not here yet.
                return Ok(None);
            }
        }
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(Some((meta, FileInput { file, length, remaining: length })))
    }

    async fn open_output(
        &mut self,
        path: &Path,
        meta: &StorageInfo,
        offset: u64,
    ) -> Result<Option<FileOutput>> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if offset == 0 {
            let file = OpenOptions::new().write(true).create(true).open(path).await?;
            self.write_meta(path, meta).await?;
            return Ok(Some(FileOutput { file, base: 0, written: 0 }));
        }
        // Resuming mid-resource: the bytes on disk must belong to the same
        // resource, and the write must continue the materialized prefix.
        let stored = match self.peek_meta(path).await {
            Some(stored) => stored,
            None => {
                self.remove(path).await;
                return Ok(None);
            }
        };
        if !stored.same_resource(meta) {
            self.remove(path).await;
            return Ok(None);
        }
        let mut file = OpenOptions::new().write(true).open(path).await?;
        let file_size = file.metadata().await?.len();
        if offset > file_size {
            return Ok(None);
        }
        file.set_len(offset).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        self.write_meta(path, meta).await?;
        Ok(Some(FileOutput { file, base: offset, written: 0 }))
    }

    async fn change_policy(&mut self, path: &Path, policy: CachePolicy) {
        if policy.is_expired() {
            self.remove(path).await;
            return;
        }
        if let Some(mut meta) = self.read_meta(path).await {
            meta.policy = policy;
            if let Err(e) = self.write_meta(path, &meta).await {
                warn!("failed to rewrite sidecar for {}: {e}", path.display());
            }
        }
    }

    async fn remove(&mut self, path: &Path) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => debug!("failed to remove {}: {e}", path.display()),
        }
        self.sidecar.remove(path).await;
    }

    async fn remove_subtree(&mut self, path: &Path) {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove subtree {}: {e}", path.display()),
        }
    }

    async fn remove_expired(&mut self, root: &Path) {
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                match entry.file_type().await {
                    Ok(kind) if kind.is_dir() => pending.push(path),
                    Ok(_) => {
                        if self.sidecar.is_meta_file(&path) {
                            continue;
                        }
                        // read_meta sweeps expired and undecodable entries.
                        let _ = self.read_meta(&path).await;
                    }
                    Err(_) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::ResourceInfo;
    use tempfile::TempDir;

    fn meta(total: Option<u64>) -> StorageInfo {
        let mut info = ResourceInfo::with_mime("text/plain");
        info.total_length = total;
        StorageInfo::new(info, CachePolicy::Keep)
    }

    async fn write_entry(adapter: &mut DiskAdapter, path: &Path, meta: &StorageInfo, data: &[u8]) {
        let mut output = adapter.open_output(path, meta, 0).await.unwrap().unwrap();
        output.write(data).await.unwrap();
        output.close().await.unwrap();
    }

    #[tokio::test]
    async fn round_trip_with_sidecar() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry");
        let mut adapter = DiskAdapter::new();
        let meta = meta(Some(10));
        write_entry(&mut adapter, &path, &meta, b"0123456789").await;

        let (stored, mut input) = adapter.open_input(&path, 0, None).await.unwrap().unwrap();
        assert_eq!(stored, meta);
        assert_eq!(input.limit(), 10);
        let chunk = input.read_chunk().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"0123456789");
        assert!(input.read_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn range_read_is_clamped_and_positioned() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry");
        let mut adapter = DiskAdapter::new();
        write_entry(&mut adapter, &path, &meta(Some(10)), b"0123456789").await;

        let (_, mut input) = adapter.open_input(&path, 4, Some(3)).await.unwrap().unwrap();
        assert_eq!(input.limit(), 3);
        assert_eq!(&input.read_chunk().await.unwrap().unwrap()[..], b"456");

        // Tail request beyond the end clamps to what exists.
        let (_, input) = adapter.open_input(&path, 8, Some(100)).await.unwrap().unwrap();
        assert_eq!(input.limit(), 2);

        // At or past the total: a zero-length stream, not an error.
        let (_, input) = adapter.open_input(&path, 10, None).await.unwrap().unwrap();
        assert_eq!(input.limit(), 0);
    }

    #[tokio::test]
    async fn unmaterialized_range_is_absent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry");
        let mut adapter = DiskAdapter::new();
        // 10 of 100 bytes materialized.
        write_entry(&mut adapter, &path, &meta(Some(100)), b"0123456789").await;

        assert!(adapter.open_input(&path, 50, Some(10)).await.unwrap().is_none());
        // The materialized prefix still serves.
        let (_, input) = adapter.open_input(&path, 0, Some(10)).await.unwrap().unwrap();
        assert_eq!(input.limit(), 10);
    }

    #[tokio::test]
    async fn expired_sidecar_sweeps_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry");
        let mut adapter = DiskAdapter::new();
        let expired = StorageInfo::new(ResourceInfo::new(), CachePolicy::ExpiredAt(1));
        write_entry(&mut adapter, &path, &expired, b"stale").await;

        assert!(adapter.read_meta(&path).await.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn resume_requires_matching_resource() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry");
        let mut adapter = DiskAdapter::new();
        write_entry(&mut adapter, &path, &meta(Some(20)), b"0123456789").await;

        // Same resource, appending at the materialized prefix: accepted.
        let mut output = adapter.open_output(&path, &meta(Some(20)), 10).await.unwrap().unwrap();
        output.write(b"abcdefghij").await.unwrap();
        output.close().await.unwrap();
        let (_, input) = adapter.open_input(&path, 0, None).await.unwrap().unwrap();
        assert_eq!(input.limit(), 20);

        // A different resource at offset > 0 drops the entry.
        let other = meta(Some(999));
        assert!(adapter.open_output(&path, &other, 10).await.unwrap().is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn fresh_write_beyond_prefix_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry");
        let mut adapter = DiskAdapter::new();
        assert!(adapter.open_output(&path, &meta(Some(1000)), 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rewrite_truncates_stale_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry");
        let mut adapter = DiskAdapter::new();
        write_entry(&mut adapter, &path, &meta(Some(10)), b"0123456789").await;
        write_entry(&mut adapter, &path, &meta(Some(2)), b"ab").await;

        let (_, mut input) = adapter.open_input(&path, 0, None).await.unwrap().unwrap();
        assert_eq!(input.limit(), 2);
        assert_eq!(&input.read_chunk().await.unwrap().unwrap()[..], b"ab");
    }

    #[tokio::test]
    async fn sweep_removes_only_expired() {
        let dir = TempDir::new().unwrap();
        let mut adapter = DiskAdapter::new();
        let live = dir.path().join("live");
        let dead = dir.path().join("dead");
        write_entry(&mut adapter, &live, &meta(None), b"live").await;
        write_entry(
            &mut adapter,
            &dead,
            &StorageInfo::new(ResourceInfo::new(), CachePolicy::ExpiredAt(1)),
            b"dead",
        )
        .await;

        adapter.remove_expired(dir.path()).await;
        assert!(live.exists());
        assert!(!dead.exists());
    }
}
