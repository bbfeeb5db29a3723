//! Cloud provisioning collaborator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::Result;

/// Structured outputs of an applied stack (endpoint addresses and the like).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProvisionOutput {
    pub values: BTreeMap<String, serde_json::Value>,
}

/// Applies declared topology (network, cluster, database) as one opaque,
/// possibly long-running operation.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn apply(
        &self,
        stack: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<ProvisionOutput>;
}
