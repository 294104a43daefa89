/// Backend adapters.
///
/// An adapter bundles one backend's processor, executor and client behind a
/// single interface, so callers can build a query once and run it against
/// PostgreSQL or OpenSearch.
use async_trait::async_trait;
use serde_json::Value;

use crate::ast::Query;
use crate::collection::{Collection, CollectionRegistry};
use crate::embedding::User;
use crate::error::{Error, Result};
use crate::operation::Operation;
use crate::result::QueryResult;

/// What a backend supports natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Collections are split into partition tables.
    pub partitioned_collections: bool,
    /// Vector fields can carry an approximate nearest-neighbor index.
    pub vector_index: bool,
    /// An outer limit over knn maps onto a native size parameter instead of
    /// a wrapping subquery.
    pub native_outer_limit: bool,
}

/// One storage backend.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Short backend name (`postgres`, `opensearch`).
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Collections bulk operations are routed against.
    fn collections(&self) -> &CollectionRegistry;

    /// Native form of `query` (SQL text or a JSON document), for inspection.
    async fn compile(&self, collection: &Collection, query: &Query, user: &User)
        -> Result<String>;

    async fn collection_exists(&self, collection: &Collection) -> Result<bool>;

    /// Create the collection if absent. Idempotent.
    async fn create_collection(&self, collection: &Collection) -> Result<()>;

    async fn drop_collection(&self, collection: &Collection) -> Result<()>;

    async fn search(&self, collection: &Collection, query: &Query, user: &User)
        -> Result<QueryResult>;

    /// Apply a batch and return the refs of failed operations.
    async fn bulk_process(&self, operations: &[Operation]) -> Result<Vec<Value>>;
}

/// Registry of configured adapters by name.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: Vec<Box<dyn Adapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Box<dyn Adapter>) {
        self.adapters.retain(|a| a.name() != adapter.name());
        self.adapters.push(adapter);
    }

    pub fn get(&self, name: &str) -> Result<&dyn Adapter> {
        self.adapters
            .iter()
            .find(|a| a.name() == name)
            .map(|a| a.as_ref())
            .ok_or_else(|| {
                Error::Config(format!(
                    "backend `{}` is not configured (available: {})",
                    name,
                    self.adapter_names().join(", ")
                ))
            })
    }

    /// List all registered adapter names.
    pub fn adapter_names(&self) -> Vec<&str> {
        self.adapters.iter().map(|a| a.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
