//! Secret storage abstraction.
//!
//! Actions reference secrets by name only; values are resolved right before
//! the action runs and never logged.

use async_trait::async_trait;

use crate::Result;

/// A resolved secret. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw value, for injecting into an action's environment.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretValue(***)")
    }
}

/// Trait for secret storage backends.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Resolve a secret by name.
    async fn resolve(&self, name: &str) -> Result<SecretValue>;
}
