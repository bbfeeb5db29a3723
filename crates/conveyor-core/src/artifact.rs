//! Artifact storage abstraction.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::Result;
use crate::id::ExecutionId;

/// Key for storing/retrieving an artifact.
///
/// Scoped to one execution so concurrent or successive runs never see each
/// other's outputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactKey {
    /// Execution that produced the artifact.
    pub execution_id: ExecutionId,
    /// Producing stage.
    pub stage: String,
    /// Producing action.
    pub action: String,
    /// Logical artifact name.
    pub name: String,
}

impl ArtifactKey {
    pub fn new(
        execution_id: ExecutionId,
        stage: impl Into<String>,
        action: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            execution_id,
            stage: stage.into(),
            action: action.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.execution_id.short(),
            self.stage,
            self.action,
            self.name
        )
    }
}

/// Reference to a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Storage key.
    pub key: ArtifactKey,
    /// SHA-256 of the content, hex encoded.
    pub checksum: String,
    /// Size in bytes.
    pub size: u64,
    /// When the artifact was stored.
    pub created_at: DateTime<Utc>,
}

/// Statistics from an eviction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneStats {
    pub artifacts_deleted: u64,
    pub bytes_freed: u64,
}

/// Hex-encoded SHA-256 of a blob.
pub fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Trait for artifact storage backends.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store an artifact. A second put for the same key overwrites it.
    async fn put(&self, key: ArtifactKey, data: Bytes) -> Result<ArtifactRef>;

    /// Retrieve an artifact; `NotFound` if it was never produced or was evicted.
    async fn get(&self, reference: &ArtifactRef) -> Result<Bytes>;

    /// List artifacts produced by an execution.
    async fn list(&self, execution_id: &ExecutionId) -> Result<Vec<ArtifactRef>>;

    /// Drop every artifact produced by an execution.
    async fn evict(&self, execution_id: &ExecutionId) -> Result<PruneStats>;
}
