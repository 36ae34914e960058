//! Binary attachment store boundary.

use crate::error::RemoteError;
use async_trait::async_trait;
use medsync_core::BlobId;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Remote store for record attachments, addressed by [`BlobId`].
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    async fn upload(&self, blob: &BlobId, data: &str) -> Result<(), RemoteError>;

    async fn download(&self, blob: &BlobId) -> Result<Option<String>, RemoteError>;

    async fn delete(&self, blob: &BlobId) -> Result<(), RemoteError>;
}

/// In-memory blob store.
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<String, String>>,
    reachable: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            blobs: RwLock::new(BTreeMap::new()),
            reachable: AtomicBool::new(true),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn contains(&self, blob: &BlobId) -> bool {
        self.blobs.read().contains_key(blob.as_str())
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    fn check(&self) -> Result<(), RemoteError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::unavailable("storage/retry-limit-exceeded: network unreachable"))
        }
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, blob: &BlobId, data: &str) -> Result<(), RemoteError> {
        self.check()?;
        self.blobs
            .write()
            .insert(blob.as_str().to_string(), data.to_string());
        Ok(())
    }

    async fn download(&self, blob: &BlobId) -> Result<Option<String>, RemoteError> {
        self.check()?;
        Ok(self.blobs.read().get(blob.as_str()).cloned())
    }

    async fn delete(&self, blob: &BlobId) -> Result<(), RemoteError> {
        self.check()?;
        self.blobs.write().remove(blob.as_str());
        Ok(())
    }
}
