//! Source control collaborator.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Notification that a watched repository changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceChanged {
    pub repository: String,
    pub branch: String,
    /// Commit identifier the change points at.
    pub commit: String,
}

/// Fetches a snapshot of a repository branch as an opaque blob.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    async fn fetch(&self, repository: &str, branch: &str) -> Result<Bytes>;
}
