//! Secret store backends.

use async_trait::async_trait;
use conveyor_core::secret::{SecretStore, SecretValue};
use conveyor_core::{Error, Result};
use std::collections::HashMap;

/// Reads secrets from the process environment.
///
/// `registry-token` resolves from `CONVEYOR_SECRET_REGISTRY_TOKEN`.
#[derive(Debug, Clone)]
pub struct EnvSecretStore {
    prefix: String,
}

impl Default for EnvSecretStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvSecretStore {
    pub fn new() -> Self {
        Self {
            prefix: "CONVEYOR_SECRET_".to_string(),
        }
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn var_name(&self, name: &str) -> String {
        let suffix: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", self.prefix, suffix)
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn resolve(&self, name: &str) -> Result<SecretValue> {
        let var = self.var_name(name);
        std::env::var(&var)
            .map(SecretValue::new)
            .map_err(|_| Error::NotFound(format!("secret '{}' (expected in ${})", name, var)))
    }
}

/// Secrets held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySecretStore {
    secrets: HashMap<String, SecretValue>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), SecretValue::new(value));
        self
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn resolve(&self, name: &str) -> Result<SecretValue> {
        self.secrets
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("secret '{}'", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_name() {
        let store = EnvSecretStore::new();
        assert_eq!(store.var_name("registry-token"), "CONVEYOR_SECRET_REGISTRY_TOKEN");
        assert_eq!(store.var_name("db/password"), "CONVEYOR_SECRET_DB_PASSWORD");
    }

    #[tokio::test]
    async fn test_env_store_missing_secret() {
        let store = EnvSecretStore::with_prefix("CONVEYOR_TEST_UNSET_PREFIX_");
        let err = store.resolve("nothing-here").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemorySecretStore::new().with_secret("npm-token", "abc");
        assert_eq!(store.resolve("npm-token").await.unwrap().expose(), "abc");
        assert!(store.resolve("other").await.is_err());
    }
}
