//! Credential resolution for the OpenSearch client.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

pub const USERNAME_ENV: &str = "OPENSEARCH_USERNAME";
pub const PASSWORD_ENV: &str = "OPENSEARCH_PASSWORD";
const CREDENTIALS_FILE: &str = "opensearch_credentials.toml";

/// HTTP basic-auth credentials.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Source of credentials, consulted once per request.
pub trait CredentialProvider: Send + Sync {
    /// `Ok(None)` means the cluster is reached without authentication.
    fn credentials(&self) -> Result<Option<Credentials>>;
}

/// Credentials fixed in the configuration.
#[derive(Debug, Clone)]
pub struct StaticCredentials(Option<Credentials>);

impl StaticCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self(Some(Credentials {
            username: username.into(),
            password: password.into(),
        }))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }
}

impl CredentialProvider for StaticCredentials {
    fn credentials(&self) -> Result<Option<Credentials>> {
        Ok(self.0.clone())
    }
}

/// Environment variables first, then a credentials file.
#[derive(Debug, Clone)]
pub struct ProviderChain {
    file: Option<PathBuf>,
}

impl ProviderChain {
    pub fn new(file: Option<PathBuf>) -> Self {
        Self { file }
    }

    /// `<config dir>/polyquery/opensearch_credentials.toml`.
    pub fn default_file() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("polyquery").join(CREDENTIALS_FILE))
    }

    fn from_env(&self) -> Option<Credentials> {
        let username = std::env::var(USERNAME_ENV).ok()?;
        let password = std::env::var(PASSWORD_ENV).unwrap_or_default();
        Some(Credentials { username, password })
    }

    fn from_file(&self) -> Result<Option<Credentials>> {
        let Some(path) = &self.file else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        let credentials: Credentials = toml::from_str(&content).map_err(|e| {
            Error::Config(format!("invalid credentials file {}: {}", path.display(), e))
        })?;
        Ok(Some(credentials))
    }
}

impl Default for ProviderChain {
    fn default() -> Self {
        Self::new(Self::default_file())
    }
}

impl CredentialProvider for ProviderChain {
    fn credentials(&self) -> Result<Option<Credentials>> {
        if let Some(credentials) = self.from_env() {
            debug!(source = "env", "resolved OpenSearch credentials");
            return Ok(Some(credentials));
        }
        let from_file = self.from_file()?;
        if from_file.is_some() {
            debug!(source = "file", "resolved OpenSearch credentials");
        }
        Ok(from_file)
    }
}

/// `[opensearch.credentials]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum CredentialsConfig {
    /// No authentication.
    #[default]
    None,
    Static {
        username: String,
        #[serde(skip_serializing, default)]
        password: String,
    },
    Chain {
        /// Overrides the default credentials file location.
        #[serde(default)]
        file: Option<PathBuf>,
    },
}

impl CredentialsConfig {
    pub fn provider(&self) -> Box<dyn CredentialProvider> {
        match self {
            CredentialsConfig::None => Box::new(StaticCredentials::anonymous()),
            CredentialsConfig::Static { username, password } => {
                Box::new(StaticCredentials::new(username, password))
            }
            CredentialsConfig::Chain { file } => Box::new(ProviderChain::new(
                file.clone().or_else(ProviderChain::default_file),
            )),
        }
    }
}
