//! Index lifecycle for collections.

use reqwest::{Method, StatusCode};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::client::Client;
use crate::collection::Collection;
use crate::error::{Error, Result};
use crate::field::Field;

/// Source id of the record a document was indexed from.
pub const REF_ID_FIELD: &str = "ref_id";
/// External version the document was indexed with.
pub const REF_VERSION_FIELD: &str = "ref_version";

const EF_SEARCH: u32 = 100;
const EF_CONSTRUCTION: u32 = 100;
const HNSW_M: u32 = 16;

/// Creates, inspects and drops collection indices.
#[derive(Debug, Clone)]
pub struct Executor {
    client: Client,
    number_of_shards: Option<u32>,
    number_of_replicas: Option<u32>,
}

impl Executor {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            number_of_shards: None,
            number_of_replicas: None,
        }
    }

    pub fn with_shards(mut self, shards: Option<u32>, replicas: Option<u32>) -> Self {
        self.number_of_shards = shards;
        self.number_of_replicas = replicas;
        self
    }

    pub async fn collection_exists(&self, collection: &Collection) -> Result<bool> {
        let response = self
            .client
            .request(Method::HEAD, &collection.name)?
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            status if status == StatusCode::NOT_FOUND => Ok(false),
            status => Err(Error::Backend {
                status: status.as_u16(),
                body: format!("HEAD /{}", collection.name),
            }),
        }
    }

    /// Create the index if absent. Idempotent.
    pub async fn create_collection(&self, collection: &Collection) -> Result<()> {
        collection.validate()?;
        if self.collection_exists(collection).await? {
            debug!(collection = %collection.name, "index already present");
            return Ok(());
        }

        let body = index_body(collection, self.number_of_shards, self.number_of_replicas);
        let request = self
            .client
            .request(Method::PUT, &collection.name)?
            .json(&body);
        match self.client.send_json(request).await {
            Ok(_) => {
                info!(collection = %collection.name, "created index");
                Ok(())
            }
            // created concurrently since the existence check
            Err(Error::Backend { status: 400, body })
                if body.contains("resource_already_exists_exception") =>
            {
                debug!(collection = %collection.name, "index already present");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn drop_collection(&self, collection: &Collection) -> Result<()> {
        let request = self.client.request(Method::DELETE, &collection.name)?;
        match self.client.send_json(request).await {
            Ok(_) => {
                info!(collection = %collection.name, "dropped index");
                Ok(())
            }
            Err(Error::Backend { status: 404, .. }) => {
                debug!(collection = %collection.name, "index already absent");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Settings and mappings for a collection's index.
pub fn index_body(
    collection: &Collection,
    number_of_shards: Option<u32>,
    number_of_replicas: Option<u32>,
) -> Value {
    let mut index = Map::new();
    if collection.has_vector_fields() {
        index.insert("knn".to_string(), json!(true));
        index.insert(
            "knn.algo_param.ef_search".to_string(),
            json!(EF_SEARCH),
        );
    }
    if let Some(shards) = number_of_shards {
        index.insert("number_of_shards".to_string(), json!(shards));
    }
    if let Some(replicas) = number_of_replicas {
        index.insert("number_of_replicas".to_string(), json!(replicas));
    }

    let mut properties = Map::new();
    for field in &collection.fields {
        properties.insert(field.name().to_string(), field_mapping(field));
    }
    properties.insert(REF_ID_FIELD.to_string(), json!({"type": "keyword"}));
    properties.insert(REF_VERSION_FIELD.to_string(), json!({"type": "long"}));

    json!({
        "settings": {"index": index},
        "mappings": {"properties": properties}
    })
}

fn field_mapping(field: &Field) -> Value {
    let mut mapping = match field {
        Field::Vector { dimensions, .. } => json!({
            "type": "knn_vector",
            "dimension": dimensions,
            "method": {
                "name": "hnsw",
                "engine": "lucene",
                "space_type": "cosinesimil",
                "parameters": {"ef_construction": EF_CONSTRUCTION, "m": HNSW_M}
            }
        }),
        Field::Bigint { .. } => json!({"type": "long"}),
        Field::Prefix { .. } | Field::Keyword { .. } => json!({"type": "keyword"}),
        Field::Text { .. } => json!({"type": "text"}),
    };
    if !field.indexed() {
        mapping["index"] = json!(false);
    }
    mapping
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opensearch::credentials::StaticCredentials;
    use std::sync::Arc;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn collection() -> Collection {
        Collection::new(
            "code",
            vec![
                Field::vector("embedding", 768, true),
                Field::bigint("project_id", true),
                Field::prefix("path", true),
                Field::text("content", false),
            ],
        )
    }

    fn executor(server: &MockServer) -> Executor {
        Executor::new(Client::new(
            server.uri(),
            Arc::new(StaticCredentials::anonymous()),
        ))
    }

    #[test]
    fn test_index_body() {
        let body = index_body(&collection(), Some(2), Some(1));
        assert_eq!(
            body["settings"]["index"],
            json!({
                "knn": true,
                "knn.algo_param.ef_search": 100,
                "number_of_shards": 2,
                "number_of_replicas": 1
            })
        );
        let props = &body["mappings"]["properties"];
        assert_eq!(
            props["embedding"],
            json!({
                "type": "knn_vector",
                "dimension": 768,
                "method": {
                    "name": "hnsw",
                    "engine": "lucene",
                    "space_type": "cosinesimil",
                    "parameters": {"ef_construction": 100, "m": 16}
                }
            })
        );
        assert_eq!(props["project_id"], json!({"type": "long"}));
        assert_eq!(props["path"], json!({"type": "keyword"}));
        assert_eq!(props["content"], json!({"type": "text", "index": false}));
        assert_eq!(props["ref_id"], json!({"type": "keyword"}));
        assert_eq!(props["ref_version"], json!({"type": "long"}));
    }

    #[test]
    fn test_index_body_without_vectors() {
        let c = Collection::new("issues", vec![Field::keyword("state", true)]);
        let body = index_body(&c, None, None);
        assert_eq!(body["settings"]["index"], json!({}));
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/code"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        executor(&server)
            .create_collection(&collection())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_missing_index() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/code"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/code"))
            .and(body_partial_json(json!({"settings": {"index": {"knn": true}}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"acknowledged": true})))
            .expect(1)
            .mount(&server)
            .await;

        let executor = executor(&server);
        assert!(!executor.collection_exists(&collection()).await.unwrap());
        executor.create_collection(&collection()).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_race_is_tolerated() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_string(r#"{"error":{"type":"resource_already_exists_exception"}}"#),
            )
            .mount(&server)
            .await;

        executor(&server)
            .create_collection(&collection())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_drop_missing_index_is_ok() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/code"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        executor(&server)
            .drop_collection(&collection())
            .await
            .unwrap();
    }
}
