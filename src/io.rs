//! Blob storage backends behind the [`BlobStore`] trait

use crate::error::{Result, VoxError};
use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Key-value blob storage. Implementations transparently gzip on `put` when
/// asked and sniff the gzip magic number on `get`, so callers always see
/// uncompressed payloads.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Returns `None` when no blob exists at `key`.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    async fn put(&self, key: &str, data: Bytes, compress: bool) -> Result<()>;

    /// Deleting a missing key is a no-op.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// All keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn maybe_gunzip(data: Vec<u8>) -> Result<Bytes> {
    if data.len() >= 2 && data[..2] == GZIP_MAGIC {
        let mut out = Vec::new();
        GzDecoder::new(&data[..]).read_to_end(&mut out)?;
        Ok(Bytes::from(out))
    } else {
        Ok(Bytes::from(data))
    }
}

/// Local filesystem backend. Keys map to paths under a root directory.
pub struct FileSystemStore {
    root: PathBuf,
}

impl FileSystemStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl BlobStore for FileSystemStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(data) => Ok(Some(maybe_gunzip(data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, data: Bytes, compress: bool) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = if compress {
            gzip(&data)?
        } else {
            data.to_vec()
        };
        tokio::fs::write(path, payload).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path_for(key)).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                    continue;
                }
                let key = path
                    .strip_prefix(&self.root)
                    .map_err(|e| VoxError::Storage(e.to_string()))?
                    .to_string_lossy()
                    .into_owned();
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// In-memory backend for tests and single-process pipelines
#[derive(Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let data = self.blobs.read().get(key).cloned();
        match data {
            Some(data) => Ok(Some(maybe_gunzip(data)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, data: Bytes, compress: bool) -> Result<()> {
        let payload = if compress {
            gzip(&data)?
        } else {
            data.to_vec()
        };
        self.blobs.write().insert(key.to_string(), payload);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.blobs.write().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.blobs.read().contains_key(key))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .blobs
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Creates a storage backend from a URL.
///
/// Supported schemes:
/// - `file:///path/to/dir`
/// - `mem://`
pub fn create_store(url: &str) -> Result<Arc<dyn BlobStore>> {
    if let Some(path) = url.strip_prefix("file://") {
        if path.is_empty() {
            return Err(VoxError::InvalidUrl(format!(
                "file URL has no path: {}",
                url
            )));
        }
        Ok(Arc::new(FileSystemStore::new(path)))
    } else if url.strip_prefix("mem://").is_some() {
        Ok(Arc::new(MemoryStore::new()))
    } else {
        Err(VoxError::InvalidUrl(format!(
            "unsupported storage URL: {}",
            url
        )))
    }
}
