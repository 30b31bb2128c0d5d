//! Persistent store interface
//!
//! The management channel only needs a small slice of the metadata backend:
//! bucket creation, a `get`/`put` on JSON values, and a feed of change
//! notifications. [`MetadataStore`] captures that slice so the agent can run
//! against any backend.
//!
//! Two implementations ship with the crate:
//! - [`MemoryStore`]: process-local, used by tests and throwaway deployments
//! - [`FileStore`]: one JSON file per key under a root directory

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the change notification feed
const CHANGE_FEED_CAPACITY: usize = 64;

/// Errors returned by a [`MetadataStore`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No value stored under this key
    #[error("no such key {key} in bucket {bucket}")]
    NotFound {
        /// Bucket that was searched
        bucket: String,
        /// Key that was requested
        key: String,
    },

    /// The bucket does not exist
    #[error("no such bucket {bucket}")]
    NoSuchBucket {
        /// Bucket that was requested
        bucket: String,
    },

    /// Bucket creation found an existing bucket
    #[error("bucket {bucket} already exists")]
    BucketAlreadyExists {
        /// Bucket that was requested
        bucket: String,
    },

    /// Backend I/O failure
    #[error("store backend error: {message}")]
    Backend {
        /// Description of what failed
        message: String,
    },

    /// A stored value could not be (de)serialized
    #[error("store serialization error for {key}: {message}")]
    Serialization {
        /// Key of the offending value
        key: String,
        /// Description of what failed
        message: String,
    },
}

impl StoreError {
    /// Create a not-found error
    pub fn not_found(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Create a backend error
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend {
            message: msg.into(),
        }
    }
}

/// Notification that a stored value changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    /// Bucket of the changed value
    pub bucket: String,
    /// Key of the changed value (empty for bucket creation)
    pub key: String,
}

/// Versioned key/value store consumed by the management channel
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Create a bucket; fails with [`StoreError::BucketAlreadyExists`] if present
    async fn create_bucket(&self, bucket: &str) -> Result<(), StoreError>;

    /// Read the value stored under `key`
    async fn get(&self, bucket: &str, key: &str) -> Result<Value, StoreError>;

    /// Store `value` under `key`, replacing any previous value
    async fn put(&self, bucket: &str, key: &str, value: Value) -> Result<(), StoreError>;

    /// Subscribe to change notifications. Dropping the receiver unsubscribes.
    fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange>;
}

/// Shared store handle used across tasks
pub type SharedStore = Arc<dyn MetadataStore>;

/// Read and deserialize a typed value
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn MetadataStore,
    bucket: &str,
    key: &str,
) -> Result<T, StoreError> {
    let value = store.get(bucket, key).await?;
    serde_json::from_value(value).map_err(|e| StoreError::Serialization {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Serialize and store a typed value
pub async fn put_json<T: Serialize>(
    store: &dyn MetadataStore,
    bucket: &str,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let value = serde_json::to_value(value).map_err(|e| StoreError::Serialization {
        key: key.to_string(),
        message: e.to_string(),
    })?;
    store.put(bucket, key, value).await
}

// =============================================================================
// In-memory store
// =============================================================================

/// Process-local store backed by a concurrent map
pub struct MemoryStore {
    buckets: DashSet<String>,
    values: DashMap<(String, String), Value>,
    changes: broadcast::Sender<StoreChange>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store with no buckets
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            buckets: DashSet::new(),
            values: DashMap::new(),
            changes,
        }
    }

    /// Number of values stored across all buckets
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the store holds no values
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn notify(&self, bucket: &str, key: &str) {
        // No subscribers is fine
        let _ = self.changes.send(StoreChange {
            bucket: bucket.to_string(),
            key: key.to_string(),
        });
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn create_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        if !self.buckets.insert(bucket.to_string()) {
            return Err(StoreError::BucketAlreadyExists {
                bucket: bucket.to_string(),
            });
        }
        self.notify(bucket, "");
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Value, StoreError> {
        if !self.buckets.contains(bucket) {
            return Err(StoreError::NoSuchBucket {
                bucket: bucket.to_string(),
            });
        }
        self.values
            .get(&(bucket.to_string(), key.to_string()))
            .map(|v| v.value().clone())
            .ok_or_else(|| StoreError::not_found(bucket, key))
    }

    async fn put(&self, bucket: &str, key: &str, value: Value) -> Result<(), StoreError> {
        if !self.buckets.contains(bucket) {
            return Err(StoreError::NoSuchBucket {
                bucket: bucket.to_string(),
            });
        }
        self.values
            .insert((bucket.to_string(), key.to_string()), value);
        self.notify(bucket, key);
        Ok(())
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

// =============================================================================
// File store
// =============================================================================

/// Store keeping one JSON file per key: `<root>/<bucket>/<key>.json`
///
/// Bucket and key names are percent-encoded so keys containing `/` map to a
/// single file. Writes go through a temporary file and a rename.
pub struct FileStore {
    root: PathBuf,
    changes: broadcast::Sender<StoreChange>,
}

impl FileStore {
    /// Create a store rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            root: root.into(),
            changes,
        }
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.root.join(encode_component(bucket))
    }

    fn value_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.bucket_dir(bucket)
            .join(format!("{}.json", encode_component(key)))
    }

    fn notify(&self, bucket: &str, key: &str) {
        let _ = self.changes.send(StoreChange {
            bucket: bucket.to_string(),
            key: key.to_string(),
        });
    }

    async fn require_bucket(&self, bucket: &str) -> Result<PathBuf, StoreError> {
        let dir = self.bucket_dir(bucket);
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Ok(dir),
            Ok(_) | Err(_) => Err(StoreError::NoSuchBucket {
                bucket: bucket.to_string(),
            }),
        }
    }
}

/// Percent-encode a bucket or key so it is a single safe path component
fn encode_component(name: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(name.as_bytes()).collect();
    // form encoding leaves dots alone; "." and ".." must not become path components
    encoded.replace('.', "%2E")
}

#[async_trait]
impl MetadataStore for FileStore {
    async fn create_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        let dir = self.bucket_dir(bucket);
        if tokio::fs::metadata(&dir).await.is_ok() {
            return Err(StoreError::BucketAlreadyExists {
                bucket: bucket.to_string(),
            });
        }
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::backend(format!("create {}: {}", dir.display(), e)))?;
        debug!(bucket = %bucket, path = %dir.display(), "Created bucket directory");
        self.notify(bucket, "");
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Value, StoreError> {
        self.require_bucket(bucket).await?;
        let path = self.value_path(bucket, key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::not_found(bucket, key));
            }
            Err(e) => {
                return Err(StoreError::backend(format!(
                    "read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Serialization {
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    async fn put(&self, bucket: &str, key: &str, value: Value) -> Result<(), StoreError> {
        let dir = self.require_bucket(bucket).await?;
        let path = self.value_path(bucket, key);
        let bytes = serde_json::to_vec(&value).map_err(|e| StoreError::Serialization {
            key: key.to_string(),
            message: e.to_string(),
        })?;

        let tmp = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| StoreError::backend(format!("write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::backend(format!("rename {}: {}", path.display(), e)))?;

        self.notify(bucket, key);
        Ok(())
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}
