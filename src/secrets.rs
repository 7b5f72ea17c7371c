// src/secrets.rs

use std::{collections::HashMap, env, fmt};
use tracing::debug;

use crate::error::{PipelineError, Result};

/// Read access to a secret store, addressed by scope and key.
pub trait SecretStore: Send + Sync {
    fn get_secret(&self, scope: &str, key: &str) -> Result<String>;
}

/// Reads `<SCOPE>_<KEY>` from the process environment, upper-cased with
/// every non-alphanumeric character turned into `_`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSecretStore;

impl EnvSecretStore {
    pub fn var_name(scope: &str, key: &str) -> String {
        format!("{}_{}", scope, key)
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl SecretStore for EnvSecretStore {
    fn get_secret(&self, scope: &str, key: &str) -> Result<String> {
        let name = Self::var_name(scope, key);
        match env::var(&name) {
            Ok(v) if !v.is_empty() => Ok(v),
            _ => Err(PipelineError::Secret {
                scope: scope.to_string(),
                key: key.to_string(),
            }),
        }
    }
}

/// Fixed secrets, for tests and local runs.
#[derive(Debug, Default, Clone)]
pub struct StaticSecretStore {
    values: HashMap<(String, String), String>,
}

impl StaticSecretStore {
    pub fn with(mut self, scope: &str, key: &str, value: &str) -> Self {
        self.values
            .insert((scope.to_string(), key.to_string()), value.to_string());
        self
    }
}

impl SecretStore for StaticSecretStore {
    fn get_secret(&self, scope: &str, key: &str) -> Result<String> {
        self.values
            .get(&(scope.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| PipelineError::Secret {
                scope: scope.to_string(),
                key: key.to_string(),
            })
    }
}

/// OAuth client credentials for the storage account. Never printed.
#[derive(Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub tenant_id: String,
}

impl Credentials {
    pub const CLIENT_ID: &'static str = "client-id";
    pub const CLIENT_SECRET: &'static str = "client-secret";
    pub const TENANT_ID: &'static str = "tenant-id";

    /// Fetch all three values from `scope` at run start.
    pub fn fetch(store: &dyn SecretStore, scope: &str) -> Result<Self> {
        let creds = Self {
            client_id: store.get_secret(scope, Self::CLIENT_ID)?,
            client_secret: store.get_secret(scope, Self::CLIENT_SECRET)?,
            tenant_id: store.get_secret(scope, Self::TENANT_ID)?,
        };
        debug!(scope, "credentials loaded");
        Ok(creds)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &"<redacted>")
            .field("client_secret", &"<redacted>")
            .field("tenant_id", &"<redacted>")
            .finish()
    }
}
