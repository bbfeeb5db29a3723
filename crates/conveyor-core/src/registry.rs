//! Image registry collaborator and the image manifest artifact.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Container image storage.
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Push an image under `tag` (`repository:tag`), returning its immutable reference.
    async fn push(&self, tag: &str, image: Bytes) -> Result<String>;

    /// Pull an image by reference.
    async fn pull(&self, reference: &str) -> Result<Bytes>;
}

/// One entry of an image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDefinition {
    /// Container name within the service.
    pub name: String,
    #[serde(rename = "imageUri")]
    pub image_uri: String,
}

/// The structured artifact an image build hands to the deploy stage:
/// a JSON list of `{"name", "imageUri"}` entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageManifest {
    pub images: Vec<ImageDefinition>,
}

impl ImageManifest {
    pub fn single(name: impl Into<String>, image_uri: impl Into<String>) -> Self {
        Self {
            images: vec![ImageDefinition {
                name: name.into(),
                image_uri: image_uri.into(),
            }],
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| Error::InvalidInput(format!("malformed image manifest: {}", e)))
    }

    /// Image for a container, or the only image when no container is named.
    pub fn image_for(&self, container: Option<&str>) -> Result<&str> {
        match container {
            Some(name) => self
                .images
                .iter()
                .find(|i| i.name == name)
                .map(|i| i.image_uri.as_str())
                .ok_or_else(|| {
                    Error::NotFound(format!("no image for container '{}' in manifest", name))
                }),
            None => match self.images.as_slice() {
                [only] => Ok(only.image_uri.as_str()),
                [] => Err(Error::InvalidInput("image manifest is empty".to_string())),
                _ => Err(Error::InvalidInput(
                    "image manifest lists several containers; name one".to_string(),
                )),
            },
        }
    }
}
