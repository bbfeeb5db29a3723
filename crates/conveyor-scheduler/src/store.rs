//! In-memory artifact store.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use conveyor_core::artifact::{ArtifactKey, ArtifactRef, ArtifactStore, PruneStats, checksum};
use conveyor_core::{Error, ExecutionId, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Content-addressed blobs behind a per-execution key index.
///
/// Identical content written by different actions or executions is stored
/// once. Writing a key again overwrites it; doing so after the key has been
/// read is logged as a producer bug and readers get the last write.
#[derive(Default)]
pub struct MemoryArtifactStore {
    inner: Mutex<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    /// Checksum -> (content, reference count).
    blobs: HashMap<String, (Bytes, usize)>,
    index: BTreeMap<ArtifactKey, ArtifactRef>,
    read: HashSet<ArtifactKey>,
}

impl StoreInner {
    fn release(&mut self, checksum: &str) -> u64 {
        let Some((data, refs)) = self.blobs.get_mut(checksum) else {
            return 0;
        };
        *refs -= 1;
        if *refs > 0 {
            return 0;
        }
        let freed = data.len() as u64;
        self.blobs.remove(checksum);
        freed
    }
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct blobs held.
    pub async fn blob_count(&self) -> usize {
        self.inner.lock().await.blobs.len()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, key: ArtifactKey, data: Bytes) -> Result<ArtifactRef> {
        let digest = checksum(&data);
        let reference = ArtifactRef {
            key: key.clone(),
            checksum: digest.clone(),
            size: data.len() as u64,
            created_at: Utc::now(),
        };

        let mut inner = self.inner.lock().await;
        if let Some(previous) = inner.index.get(&key).map(|r| r.checksum.clone()) {
            if inner.read.contains(&key) {
                warn!(
                    artifact = %key,
                    "Artifact overwritten after it was read; readers now see the last write"
                );
            }
            inner.release(&previous);
        }
        inner
            .blobs
            .entry(digest)
            .and_modify(|(_, refs)| *refs += 1)
            .or_insert((data, 1));
        inner.index.insert(key, reference.clone());

        debug!(artifact = %reference.key, size = reference.size, "Stored artifact");
        Ok(reference)
    }

    async fn get(&self, reference: &ArtifactRef) -> Result<Bytes> {
        let mut inner = self.inner.lock().await;
        let current = inner
            .index
            .get(&reference.key)
            .map(|r| r.checksum.clone())
            .ok_or_else(|| Error::NotFound(format!("artifact {}", reference.key)))?;
        let data = inner
            .blobs
            .get(&current)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| Error::Internal(format!("blob missing for artifact {}", reference.key)))?;
        inner.read.insert(reference.key.clone());
        Ok(data)
    }

    async fn list(&self, execution_id: &ExecutionId) -> Result<Vec<ArtifactRef>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .index
            .values()
            .filter(|r| r.key.execution_id == *execution_id)
            .cloned()
            .collect())
    }

    async fn evict(&self, execution_id: &ExecutionId) -> Result<PruneStats> {
        let mut inner = self.inner.lock().await;
        let keys: Vec<ArtifactKey> = inner
            .index
            .keys()
            .filter(|k| k.execution_id == *execution_id)
            .cloned()
            .collect();

        let mut stats = PruneStats::default();
        for key in keys {
            if let Some(reference) = inner.index.remove(&key) {
                stats.artifacts_deleted += 1;
                stats.bytes_freed += inner.release(&reference.checksum);
            }
            inner.read.remove(&key);
        }
        debug!(
            execution = %execution_id,
            deleted = stats.artifacts_deleted,
            bytes = stats.bytes_freed,
            "Evicted artifacts"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(execution: ExecutionId, name: &str) -> ArtifactKey {
        ArtifactKey::new(execution, "Build", "compile", name)
    }

    #[tokio::test]
    async fn test_put_get() {
        let store = MemoryArtifactStore::new();
        let exec = ExecutionId::new();
        let reference = store
            .put(key(exec, "Binary"), Bytes::from_static(b"elf"))
            .await
            .unwrap();
        assert_eq!(reference.size, 3);
        assert_eq!(store.get(&reference).await.unwrap(), Bytes::from_static(b"elf"));
    }

    #[tokio::test]
    async fn test_get_unknown_is_not_found() {
        let store = MemoryArtifactStore::new();
        let other = MemoryArtifactStore::new();
        let reference = other
            .put(key(ExecutionId::new(), "Binary"), Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(matches!(store.get(&reference).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_overwrite_serves_last_write() {
        let store = MemoryArtifactStore::new();
        let exec = ExecutionId::new();
        let first = store.put(key(exec, "Out"), Bytes::from_static(b"v1")).await.unwrap();
        store.get(&first).await.unwrap();
        let second = store.put(key(exec, "Out"), Bytes::from_static(b"v2")).await.unwrap();

        assert_ne!(first.checksum, second.checksum);
        assert_eq!(store.get(&first).await.unwrap(), Bytes::from_static(b"v2"));
        assert_eq!(store.list(&exec).await.unwrap().len(), 1);
        assert_eq!(store.blob_count().await, 1);
    }

    #[tokio::test]
    async fn test_identical_content_is_deduplicated() {
        let store = MemoryArtifactStore::new();
        let a = store
            .put(key(ExecutionId::new(), "Out"), Bytes::from_static(b"same"))
            .await
            .unwrap();
        let b = store
            .put(key(ExecutionId::new(), "Out"), Bytes::from_static(b"same"))
            .await
            .unwrap();
        assert_eq!(a.checksum, b.checksum);
        assert_eq!(store.blob_count().await, 1);
    }

    #[tokio::test]
    async fn test_evict_scopes_to_execution() {
        let store = MemoryArtifactStore::new();
        let gone = ExecutionId::new();
        let kept = ExecutionId::new();
        let evicted = store.put(key(gone, "Out"), Bytes::from_static(b"shared")).await.unwrap();
        let survivor = store.put(key(kept, "Out"), Bytes::from_static(b"shared")).await.unwrap();
        store.put(key(gone, "Log"), Bytes::from_static(b"log")).await.unwrap();

        let stats = store.evict(&gone).await.unwrap();
        assert_eq!(stats.artifacts_deleted, 2);
        assert_eq!(stats.bytes_freed, 3);

        assert!(matches!(store.get(&evicted).await, Err(Error::NotFound(_))));
        assert_eq!(store.get(&survivor).await.unwrap(), Bytes::from_static(b"shared"));
        assert!(store.list(&gone).await.unwrap().is_empty());
    }
}
