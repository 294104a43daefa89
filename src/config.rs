//! `config.toml`: backend connections, the embedding service and collection
//! definitions.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::adapter::AdapterRegistry;
use crate::collection::{Collection, CollectionRegistry};
use crate::embedding::{EmbeddingGenerator, EmbeddingServiceConfig, HttpEmbeddingGenerator, NoEmbeddings};
use crate::error::{Error, Result};
use crate::opensearch::{OpenSearchAdapter, OpenSearchConfig};
use crate::postgres::{ConnectionConfig, PostgresAdapter};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub postgres: Option<ConnectionConfig>,
    #[serde(default)]
    pub opensearch: Option<OpenSearchConfig>,
    #[serde(default)]
    pub embedding: Option<EmbeddingServiceConfig>,
    #[serde(default)]
    pub collections: Vec<Collection>,
}

impl Config {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("polyquery")
            .join("config.toml")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::parse(&content)?;
        debug!(path = %path.display(), collections = config.collections.len(), "loaded config");
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        if let Some(pg) = config.postgres.as_mut() {
            if pg.password.is_empty() {
                if let Ok(pw) = std::env::var("PGPASSWORD") {
                    pg.password = pw;
                }
            }
        }
        Ok(config)
    }

    pub fn collection_registry(&self) -> Result<CollectionRegistry> {
        CollectionRegistry::try_from(self.collections.clone())
    }

    pub fn embedding_generator(&self) -> Arc<dyn EmbeddingGenerator> {
        match &self.embedding {
            Some(service) => Arc::new(HttpEmbeddingGenerator::from_config(service)),
            None => Arc::new(NoEmbeddings),
        }
    }

    /// One adapter per configured backend.
    ///
    /// Pools and HTTP clients are created here; no connection is opened until
    /// the first request.
    pub fn adapters(&self) -> Result<AdapterRegistry> {
        let collections = self.collection_registry()?;
        let embeddings = self.embedding_generator();

        let mut registry = AdapterRegistry::new();
        if let Some(pg) = &self.postgres {
            registry.register(Box::new(PostgresAdapter::from_config(
                pg,
                embeddings.clone(),
                collections.clone(),
            )?));
            info!(target = %pg.display_string(), "configured postgres backend");
        }
        if let Some(os) = &self.opensearch {
            registry.register(Box::new(OpenSearchAdapter::from_config(
                os,
                embeddings,
                collections,
            )?));
            info!(url = %os.url, "configured opensearch backend");
        }
        if registry.is_empty() {
            return Err(Error::Config(
                "no backend configured: add a [postgres] or [opensearch] section".into(),
            ));
        }
        Ok(registry)
    }
}
