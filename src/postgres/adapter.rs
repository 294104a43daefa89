use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::client::Client;
use super::connection::{create_pool, ConnectionConfig};
use super::executor::Executor;
use super::processor::Processor;
use crate::adapter::{Adapter, Capabilities};
use crate::ast::Query;
use crate::collection::{Collection, CollectionRegistry};
use crate::embedding::{resolve_embeddings, EmbeddingGenerator, User};
use crate::error::Result;
use crate::operation::Operation;
use crate::result::QueryResult;

/// PostgreSQL + pgvector backend.
pub struct PostgresAdapter {
    client: Client,
    executor: Executor,
    embeddings: Arc<dyn EmbeddingGenerator>,
    collections: CollectionRegistry,
}

impl PostgresAdapter {
    pub fn new(
        client: Client,
        embeddings: Arc<dyn EmbeddingGenerator>,
        collections: CollectionRegistry,
    ) -> Self {
        let executor = Executor::new(client.pool().clone());
        Self {
            client,
            executor,
            embeddings,
            collections,
        }
    }

    pub fn from_config(
        config: &ConnectionConfig,
        embeddings: Arc<dyn EmbeddingGenerator>,
        collections: CollectionRegistry,
    ) -> Result<Self> {
        let client = Client::new(create_pool(config)?);
        Ok(Self::new(client, embeddings, collections))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl Adapter for PostgresAdapter {
    fn name(&self) -> &str {
        "postgres"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            partitioned_collections: true,
            vector_index: true,
            native_outer_limit: false,
        }
    }

    fn collections(&self) -> &CollectionRegistry {
        &self.collections
    }

    async fn compile(&self, collection: &Collection, query: &Query, user: &User) -> Result<String> {
        let resolved = resolve_embeddings(query, collection, self.embeddings.as_ref(), user).await?;
        Processor::new(collection).to_sql(&resolved)
    }

    async fn collection_exists(&self, collection: &Collection) -> Result<bool> {
        self.executor.collection_exists(collection).await
    }

    async fn create_collection(&self, collection: &Collection) -> Result<()> {
        self.executor.create_collection(collection).await
    }

    async fn drop_collection(&self, collection: &Collection) -> Result<()> {
        self.executor.drop_collection(collection).await
    }

    async fn search(
        &self,
        collection: &Collection,
        query: &Query,
        user: &User,
    ) -> Result<QueryResult> {
        let resolved = resolve_embeddings(query, collection, self.embeddings.as_ref(), user).await?;
        self.client.search(collection, &resolved).await
    }

    async fn bulk_process(&self, operations: &[Operation]) -> Result<Vec<Value>> {
        self.client
            .bulk_process(&self.collections, operations)
            .await
    }
}
