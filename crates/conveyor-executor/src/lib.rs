//! Action runners for Conveyor pipelines.
//!
//! Provides runner implementations for each operation kind:
//! - Shell commands (`run`)
//! - Source snapshots (`source`)
//! - Image builds against a registry (`image-build`)
//! - Infrastructure provisioning (`provision`)
//!
//! Deploy actions are served by `conveyor-deployer`.

pub mod image;
pub mod provision;
pub mod runner;
pub mod secrets;
pub mod shell;
pub mod source;

pub use image::{ImageBuildRunner, LocalRegistry};
pub use provision::{CommandProvisioner, ProvisionRunner, StaticProvisioner};
pub use runner::{RunnerSet, execute};
pub use secrets::{EnvSecretStore, MemorySecretStore};
pub use shell::ShellRunner;
pub use source::{GitSource, MemorySource, SourceRunner};

pub use conveyor_core::executor::{ActionEnv, ActionOutput, ActionRunner, Blobs};
