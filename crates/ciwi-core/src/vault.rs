//! Vault connection records.
//!
//! Only the name of the environment variable holding the secret id is
//! stored. The secret itself is read when a connection is used.

use crate::ids::VaultConnectionId;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultConnection {
    pub id: VaultConnectionId,
    pub name: String,
    pub url: String,
    pub auth_method: String,
    pub mount: String,
    pub role_id: String,
    pub secret_id_env: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultConnectionInput {
    pub name: String,
    pub url: String,
    #[serde(default = "default_auth_method")]
    pub auth_method: String,
    #[serde(default)]
    pub mount: String,
    #[serde(default)]
    pub role_id: String,
    #[serde(default)]
    pub secret_id_env: String,
}

fn default_auth_method() -> String {
    "approle".to_string()
}

impl VaultConnectionInput {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("name is required"));
        }
        if self.url.trim().is_empty() {
            return Err(Error::validation("url is required"));
        }
        if self.auth_method == "approle" && self.secret_id_env.trim().is_empty() {
            return Err(Error::validation(
                "secret_id_env is required for approle auth",
            ));
        }
        Ok(())
    }
}

impl VaultConnection {
    /// Resolve the secret id from the configured environment variable.
    pub fn resolve_secret_id(&self) -> Result<String> {
        let name = self.secret_id_env.trim();
        if name.is_empty() {
            return Err(Error::validation(format!(
                "vault connection {} has no secret_id_env",
                self.name
            )));
        }
        match std::env::var(name) {
            Ok(value) if !value.is_empty() => Ok(value),
            _ => Err(Error::validation(format!(
                "environment variable {name} is not set"
            ))),
        }
    }
}
