//! Deploy actions.

use async_trait::async_trait;
use conveyor_core::executor::{ActionEnv, ActionOutput, ActionRunner, Blobs};
use conveyor_core::pipeline::{Action, Operation};
use conveyor_core::registry::ImageManifest;
use conveyor_core::{Error, Result};
use std::sync::Arc;
use tracing::info;

use crate::rollout::RolloutController;

/// Rolls a service onto the image named by the action's input manifest.
pub struct DeployRunner {
    controller: Arc<RolloutController>,
}

impl DeployRunner {
    pub fn new(controller: Arc<RolloutController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl ActionRunner for DeployRunner {
    fn name(&self) -> &'static str {
        "deploy"
    }

    fn supports(&self, operation: &Operation) -> bool {
        matches!(operation, Operation::Deploy { .. })
    }

    async fn run(&self, action: &Action, inputs: &Blobs, env: &ActionEnv) -> Result<ActionOutput> {
        let Operation::Deploy { service, container } = &action.operation else {
            return Err(Error::InvalidInput(format!(
                "deploy runner cannot execute {} operations",
                action.operation.kind()
            )));
        };
        let manifest_name = action.inputs.first().ok_or_else(|| {
            Error::InvalidInput(format!("deploy action '{}' declares no input", action.name))
        })?;
        let manifest_data = inputs.get(manifest_name).ok_or_else(|| Error::MissingInput {
            action: action.name.clone(),
            input: manifest_name.clone(),
        })?;

        let manifest = ImageManifest::from_bytes(manifest_data)?;
        let image = manifest.image_for(container.as_deref())?;

        info!(
            service = %service,
            image = %image,
            execution = ?env.execution_id,
            "Deploying"
        );
        let report = self.controller.rollout(service, image).await?;
        Ok(ActionOutput::default().with_diagnostics(report.summary()))
    }
}
