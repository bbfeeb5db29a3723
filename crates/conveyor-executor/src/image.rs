//! Image builds and the local image registry.

use async_trait::async_trait;
use bytes::Bytes;
use conveyor_core::artifact::checksum;
use conveyor_core::executor::{ActionEnv, ActionOutput, ActionRunner, Blobs};
use conveyor_core::pipeline::{Action, Operation};
use conveyor_core::registry::{ImageManifest, ImageRegistry};
use conveyor_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::runner::action_failure;

/// In-process registry. References are `repository:tag@sha256:<digest>`.
#[derive(Default)]
pub struct LocalRegistry {
    images: RwLock<HashMap<String, Bytes>>,
    /// Tag -> latest reference pushed under it.
    tags: RwLock<HashMap<String, String>>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ImageRegistry for LocalRegistry {
    async fn push(&self, tag: &str, image: Bytes) -> Result<String> {
        if tag.is_empty() {
            return Err(Error::InvalidInput("image tag must not be empty".to_string()));
        }
        let tag = if tag.rsplit('/').next().is_some_and(|last| last.contains(':')) {
            tag.to_string()
        } else {
            format!("{}:latest", tag)
        };
        let reference = format!("{}@sha256:{}", tag, checksum(&image));

        self.images.write().await.insert(reference.clone(), image);
        self.tags.write().await.insert(tag, reference.clone());
        debug!(reference = %reference, "Pushed image");
        Ok(reference)
    }

    async fn pull(&self, reference: &str) -> Result<Bytes> {
        let reference = match self.tags.read().await.get(reference) {
            Some(resolved) => resolved.clone(),
            None => reference.to_string(),
        };
        self.images
            .read()
            .await
            .get(&reference)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("image '{}'", reference)))
    }
}

/// Serves `image-build` actions: pushes the build context and emits a
/// manifest naming the pushed image.
pub struct ImageBuildRunner {
    registry: Arc<dyn ImageRegistry>,
}

impl ImageBuildRunner {
    pub fn new(registry: Arc<dyn ImageRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ActionRunner for ImageBuildRunner {
    fn name(&self) -> &'static str {
        "image-build"
    }

    fn supports(&self, operation: &Operation) -> bool {
        matches!(operation, Operation::ImageBuild { .. })
    }

    async fn run(&self, action: &Action, inputs: &Blobs, _env: &ActionEnv) -> Result<ActionOutput> {
        let Operation::ImageBuild {
            repository,
            tag,
            container,
        } = &action.operation
        else {
            return Err(Error::InvalidInput(format!(
                "image runner cannot execute {} operations",
                action.operation.kind()
            )));
        };
        let (Some(context), Some(output_name)) = (
            action.inputs.first().and_then(|name| inputs.get(name)),
            action.outputs.first(),
        ) else {
            return Err(Error::InvalidInput(format!(
                "image build '{}' needs one input and one output",
                action.name
            )));
        };

        let image_ref = format!("{}:{}", repository, tag);
        info!(image = %image_ref, container = %container, "Building image");
        let reference = self
            .registry
            .push(&image_ref, context.clone())
            .await
            .map_err(|e| action_failure(action, e))?;

        let manifest = ImageManifest::single(container.clone(), reference.clone());
        Ok(ActionOutput::default()
            .with_diagnostics(format!("pushed {}", reference))
            .with_output(output_name.clone(), manifest.to_bytes()?))
    }
}
