//! Embedding generation for content-based knn.
//!
//! Content-based knn nodes carry text instead of a vector. Before a query is
//! compiled, [`resolve_embeddings`] asks an [`EmbeddingGenerator`] for one
//! vector per distinct content string and returns a new tree in which those
//! nodes carry the vector instead. Sub-trees without content-based knn are
//! shared with the input, not copied.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ast::{KnnNode, LimitNode, Query, QueryNode};
use crate::collection::Collection;
use crate::error::{Error, Result};

/// The acting user, passed through to the embedding service for
/// authorization and quota attribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
}

impl User {
    pub fn new(id: i64, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
        }
    }
}

/// Turns text into a vector with a given model on behalf of a user.
#[async_trait]
pub trait EmbeddingGenerator: Send + Sync {
    async fn generate(&self, text: &str, model: &str, user: &User) -> Result<Vec<f32>>;
}

/// Generator for deployments that only run literal-vector queries.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEmbeddings;

#[async_trait]
impl EmbeddingGenerator for NoEmbeddings {
    async fn generate(&self, _text: &str, model: &str, _user: &User) -> Result<Vec<f32>> {
        Err(Error::Embedding(format!(
            "no embedding service configured (model `{}`)",
            model
        )))
    }
}

/// Settings for [`HttpEmbeddingGenerator`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingServiceConfig {
    /// Base URL of an OpenAI-compatible API, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    /// Name of the environment variable holding the bearer token.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
    user: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Generator backed by an OpenAI-compatible `/embeddings` endpoint.
pub struct HttpEmbeddingGenerator {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl std::fmt::Debug for HttpEmbeddingGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEmbeddingGenerator")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl HttpEmbeddingGenerator {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    pub fn from_config(config: &EmbeddingServiceConfig) -> Self {
        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok());
        Self::new(&config.base_url, api_key)
    }
}

#[async_trait]
impl EmbeddingGenerator for HttpEmbeddingGenerator {
    async fn generate(&self, text: &str, model: &str, user: &User) -> Result<Vec<f32>> {
        let request = EmbeddingRequest {
            model,
            input: vec![text],
            user: user.id.to_string(),
        };

        let mut builder = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Embedding(format!(
                "embedding request for model `{}` failed with {}: {}",
                model, status, body
            )));
        }

        let parsed: EmbeddingResponse = response.json().await?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| Error::Embedding("embedding response contained no data".into()))
    }
}

/// Replace every content-based knn in `query` with a vector-based one.
///
/// Vectors are generated with the collection's embedding preset; the target
/// of a resolved node defaults to the preset field. Queries without
/// content-based knn are returned as-is.
pub async fn resolve_embeddings(
    query: &Query,
    collection: &Collection,
    generator: &dyn EmbeddingGenerator,
    user: &User,
) -> Result<Query> {
    let mut contents = Vec::new();
    collect_contents(query, &mut contents);
    if contents.is_empty() {
        return Ok(query.clone());
    }

    let preset = collection.embedding.as_ref().ok_or_else(|| {
        Error::Unsupported(format!(
            "content-based knn on collection `{}`, which has no embedding preset",
            collection.name
        ))
    })?;

    let mut vectors = HashMap::with_capacity(contents.len());
    for content in contents {
        if vectors.contains_key(content) {
            continue;
        }
        debug!(
            collection = %collection.name,
            model = %preset.model,
            user = user.id,
            "generating query embedding"
        );
        let vector = generator.generate(content, &preset.model, user).await?;
        vectors.insert(content.to_string(), vector);
    }

    Ok(substitute(query, &vectors, &preset.field).unwrap_or_else(|| query.clone()))
}

fn collect_contents<'a>(query: &'a Query, out: &mut Vec<&'a str>) {
    match query.node() {
        QueryNode::All | QueryNode::Filter(_) | QueryNode::Prefix(_) => {}
        QueryNode::And(children) | QueryNode::Or(children) => {
            for child in children {
                collect_contents(child, out);
            }
        }
        QueryNode::Knn(knn) => {
            if knn.spec.vector.is_none() {
                if let Some(content) = knn.spec.content.as_deref() {
                    out.push(content);
                }
            }
            if let Some(child) = &knn.child {
                collect_contents(child, out);
            }
        }
        QueryNode::Limit(limit) => collect_contents(&limit.child, out),
    }
}

/// Rewritten tree, or `None` when nothing under `query` carries content.
/// Unchanged sub-trees are shared with the input.
fn substitute(query: &Query, vectors: &HashMap<String, Vec<f32>>, field: &str) -> Option<Query> {
    match query.node() {
        QueryNode::All | QueryNode::Filter(_) | QueryNode::Prefix(_) => None,
        QueryNode::And(children) => {
            substitute_children(children, vectors, field).map(|c| Query::rebuild(QueryNode::And(c)))
        }
        QueryNode::Or(children) => {
            substitute_children(children, vectors, field).map(|c| Query::rebuild(QueryNode::Or(c)))
        }
        QueryNode::Knn(knn) => {
            let child = knn.child.as_ref().and_then(|c| substitute(c, vectors, field));
            let vector = match (&knn.spec.vector, &knn.spec.content) {
                (None, Some(content)) => vectors.get(content),
                _ => None,
            };
            if child.is_none() && vector.is_none() {
                return None;
            }

            let mut spec = knn.spec.clone();
            if let Some(vector) = vector {
                spec.vector = Some(vector.clone());
                if spec.target.is_none() {
                    spec.target = Some(field.to_string());
                }
            }
            Some(Query::rebuild(QueryNode::Knn(KnnNode {
                spec,
                child: child.or_else(|| knn.child.clone()),
            })))
        }
        QueryNode::Limit(limit) => substitute(&limit.child, vectors, field).map(|child| {
            Query::rebuild(QueryNode::Limit(LimitNode {
                limit: limit.limit,
                child,
            }))
        }),
    }
}

fn substitute_children(
    children: &[Query],
    vectors: &HashMap<String, Vec<f32>>,
    field: &str,
) -> Option<Vec<Query>> {
    let rewritten: Vec<Option<Query>> = children
        .iter()
        .map(|c| substitute(c, vectors, field))
        .collect();
    if rewritten.iter().all(Option::is_none) {
        return None;
    }
    Some(
        rewritten
            .into_iter()
            .zip(children)
            .map(|(new, old)| new.unwrap_or_else(|| old.clone()))
            .collect(),
    )
}
