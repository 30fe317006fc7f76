//! Directory-backed shard store.
//!
//! Shards live as flat files named `shard_00000.bin`, `shard_00001.bin`, ...
//! under a single root directory. Reads use tokio's async file I/O.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tracing::debug;

use super::{FetchError, ShardFetcher, ShardMeta, ShardSource};

/// Reads shards from local storage.
pub struct LocalShardStore {
    root: PathBuf,

    reads: AtomicU64,
    bytes_read: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalStoreStats {
    pub total_reads: u64,
    pub total_bytes_read: u64,
}

impl LocalShardStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, FetchError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            reads: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn shard_path(&self, index: u32) -> PathBuf {
        self.root.join(format!("shard_{index:05}.bin"))
    }

    /// Write a shard file. Used when staging a model directory.
    pub async fn write_shard(&self, index: u32, data: &[u8]) -> Result<PathBuf, FetchError> {
        let path = self.shard_path(index);
        fs::write(&path, data).await?;
        debug!(shard = index, path = %path.display(), size = data.len(), "Wrote shard file");
        Ok(path)
    }

    pub async fn remove_shard(&self, index: u32) -> Result<(), FetchError> {
        let path = self.shard_path(index);
        if fs::try_exists(&path).await? {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }

    pub fn stats(&self) -> LocalStoreStats {
        LocalStoreStats {
            total_reads: self.reads.load(Ordering::Relaxed),
            total_bytes_read: self.bytes_read.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl ShardFetcher for LocalShardStore {
    fn source(&self) -> ShardSource {
        ShardSource::Local
    }

    async fn fetch(&self, meta: &ShardMeta) -> Result<Bytes, FetchError> {
        let path = self.shard_path(meta.index);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FetchError::NotFound(meta.index));
            }
            Err(e) => return Err(e.into()),
        };

        debug!(shard = meta.index, path = %path.display(), size = data.len(), "Read shard file");

        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(data.len() as u64, Ordering::Relaxed);

        Ok(Bytes::from(data))
    }
}
