//! CLI command implementations.

pub mod history;
pub mod run;
pub mod validate;

use anyhow::{Context, Result};
use conveyor_config::ProjectConfig;
use std::path::{Path, PathBuf};

/// Load a project file.
fn load(path: &str) -> Result<ProjectConfig> {
    conveyor_config::load_project(path)
        .with_context(|| format!("Failed to load pipeline config: {}", path))
}

/// Directory containing the config file, or the current directory.
fn project_dir(path: &str) -> Result<PathBuf> {
    Path::new(path)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .canonicalize()
        .context("Failed to resolve project directory")
}

/// Resolve a configured path against the project directory.
fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn history_dir(path: &str, project: &ProjectConfig) -> Result<PathBuf> {
    Ok(resolve(&project_dir(path)?, &project.system.history_dir))
}
