//! Shard byte sources.
//!
//! - [`manifest`]: declared shard layout (tensor spans, size, hash)
//! - [`local`]: directory-backed shard store
//! - [`retry`]: exponential-backoff wrapper and download concurrency cap

pub mod local;
pub mod manifest;
pub mod retry;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use local::LocalShardStore;
pub use manifest::{ShardMeta, TensorSpan};
pub use retry::{RetryPolicy, RetryingFetcher};

/// Where shard bytes come from. Decides how many shards are worth caching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardSource {
    /// Local storage; re-fetching is cheap.
    Local,
    /// Remote storage; re-fetching is expensive.
    Network,
}

impl std::fmt::Display for ShardSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardSource::Local => write!(f, "local"),
            ShardSource::Network => write!(f, "network"),
        }
    }
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Shard {0} not found")]
    NotFound(u32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("Network error: {0}")]
    Network(String),
}

impl FetchError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, FetchError::NotFound(_))
    }
}

/// Produces raw shard bytes. Validation happens in the shard cache.
#[async_trait]
pub trait ShardFetcher: Send + Sync {
    fn source(&self) -> ShardSource;

    async fn fetch(&self, meta: &ShardMeta) -> Result<Bytes, FetchError>;
}
