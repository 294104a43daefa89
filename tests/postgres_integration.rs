//! Runs against a live PostgreSQL with pgvector available.
//!
//! Set `POLYQUERY_TEST_DATABASE_URL` (e.g.
//! `host=localhost user=postgres password=postgres dbname=polyquery_test`)
//! to enable; every test returns early otherwise.

use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use polyquery::postgres::{Client, Executor};
use polyquery::{Collection, CollectionRegistry, Field, KnnSpec, Operation, Query, QueryResult};
use serde_json::{json, Value};

fn pool() -> Option<Pool> {
    let url = std::env::var("POLYQUERY_TEST_DATABASE_URL").ok()?;
    let config: tokio_postgres::Config = url.parse().expect("invalid POLYQUERY_TEST_DATABASE_URL");
    let manager = Manager::from_config(
        config,
        tokio_postgres::NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    Some(Pool::builder(manager).max_size(4).build().unwrap())
}

fn collection(name: &str) -> Collection {
    Collection::new(
        name,
        vec![
            Field::vector("embedding", 2, true),
            Field::bigint("project_id", true),
            Field::keyword("status", true),
            Field::prefix("path", true),
        ],
    )
    .with_partitions(2)
    .with_partition_key("project_id")
}

fn upsert(name: &str, record: Value) -> Operation {
    Operation::upsert(name, record.as_object().cloned().unwrap())
}

/// Fresh collection holding three records.
async fn seeded(pool: &Pool, name: &str) -> (Executor, Client, Collection) {
    let executor = Executor::new(pool.clone());
    let client = Client::new(pool.clone());
    let collection = collection(name);
    executor.drop_collection(&collection).await.unwrap();
    executor.create_collection(&collection).await.unwrap();

    let registry = CollectionRegistry::try_from(vec![collection.clone()]).unwrap();
    let ops = vec![
        upsert(name, json!({"id": "1", "project_id": 1, "status": "active", "path": "app/a.rb", "embedding": [1.0, 0.0]})),
        upsert(name, json!({"id": "2", "project_id": 1, "status": "inactive", "path": "lib/b.rb", "embedding": [0.0, 1.0]})),
        upsert(name, json!({"id": "3", "project_id": 2, "status": "active", "path": "app/c.rb", "embedding": [0.7, 0.7]})),
    ];
    let failed = client.bulk_process(&registry, &ops).await.unwrap();
    assert!(failed.is_empty(), "seed failed: {:?}", failed);
    (executor, client, collection)
}

fn ids(result: QueryResult) -> Vec<String> {
    let mut ids: Vec<String> = result
        .into_iter()
        .map(|row| row["id"].as_str().unwrap_or_default().to_string())
        .collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn test_filters_and_boolean_nodes() {
    let Some(pool) = pool() else { return };
    let (executor, client, c) = seeded(&pool, "pq_it_filters").await;

    let active = client
        .search(&c, &Query::filter([("status", "active")]))
        .await
        .unwrap();
    assert_eq!(active.count(), 2);
    assert_eq!(ids(active), vec!["1", "3"]);

    let both = Query::and([
        Query::filter([("status", "active")]),
        Query::prefix([("path", "app/")]),
        Query::filter([("project_id", 1)]),
    ]);
    assert_eq!(ids(client.search(&c, &both).await.unwrap()), vec!["1"]);

    let either = Query::or([
        Query::filter([("status", "inactive")]),
        Query::filter([("project_id", 2)]),
    ]);
    assert_eq!(ids(client.search(&c, &either).await.unwrap()), vec!["2", "3"]);

    let listed = Query::filter([("project_id", json!([1, 2]))]);
    assert_eq!(client.search(&c, &listed).await.unwrap().count(), 3);

    executor.drop_collection(&c).await.unwrap();
}

#[tokio::test]
async fn test_keyword_filter_matches_single_and_listed_values() {
    let Some(pool) = pool() else { return };
    let executor = Executor::new(pool.clone());
    let client = Client::new(pool.clone());
    let name = "pq_it_status";
    let c = collection(name);
    executor.drop_collection(&c).await.unwrap();
    executor.create_collection(&c).await.unwrap();

    let registry = CollectionRegistry::try_from(vec![c.clone()]).unwrap();
    let ops = vec![
        upsert(name, json!({"id": "1", "project_id": 1, "status": "active", "embedding": [1.0, 0.0]})),
        upsert(name, json!({"id": "2", "project_id": 1, "status": "pending", "embedding": [0.0, 1.0]})),
        upsert(name, json!({"id": "3", "project_id": 2, "status": "closed", "embedding": [0.7, 0.7]})),
    ];
    assert!(client.bulk_process(&registry, &ops).await.unwrap().is_empty());

    let active = client
        .search(&c, &Query::filter([("status", "active")]))
        .await
        .unwrap();
    assert_eq!(active.count(), 1);
    assert_eq!(ids(active), vec!["1"]);

    let open = Query::filter([("status", json!(["active", "pending"]))]);
    let open = client.search(&c, &open).await.unwrap();
    assert_eq!(open.count(), 2);
    assert_eq!(ids(open), vec!["1", "2"]);

    executor.drop_collection(&c).await.unwrap();
}

#[tokio::test]
async fn test_knn_ranks_and_limits() {
    let Some(pool) = pool() else { return };
    let (executor, client, c) = seeded(&pool, "pq_it_knn").await;

    let nearest = Query::nearest(KnnSpec::vector("embedding", vec![1.0, 0.1], 2));
    let rows: Vec<Value> = client.search(&c, &nearest).await.unwrap().into_iter().collect();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["id"], json!("1"));
    assert!(rows[0]["distance"].as_f64().unwrap() <= rows[1]["distance"].as_f64().unwrap());

    let capped = Query::filter([("status", "active")])
        .knn(KnnSpec::vector("embedding", vec![0.0, 1.0], 3))
        .limit(1);
    let rows: Vec<Value> = client.search(&c, &capped).await.unwrap().into_iter().collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"], json!("3"));

    let relaxed = Query::nearest(KnnSpec::vector("embedding", vec![1.0, 0.0], 2)).limit(10);
    assert_eq!(client.search(&c, &relaxed).await.unwrap().count(), 2);

    executor.drop_collection(&c).await.unwrap();
}

#[tokio::test]
async fn test_create_is_idempotent() {
    let Some(pool) = pool() else { return };
    let (executor, _client, c) = seeded(&pool, "pq_it_idempotent").await;

    assert!(executor.collection_exists(&c).await.unwrap());
    executor.create_collection(&c).await.unwrap();
    executor.drop_collection(&c).await.unwrap();
    assert!(!executor.collection_exists(&c).await.unwrap());
    executor.drop_collection(&c).await.unwrap();
}

#[tokio::test]
async fn test_bulk_partial_failure_and_deletes() {
    let Some(pool) = pool() else { return };
    let (executor, client, c) = seeded(&pool, "pq_it_bulk").await;
    let registry = CollectionRegistry::try_from(vec![c.clone()]).unwrap();

    let ops = vec![
        upsert(&c.name, json!({"id": "1", "project_id": 1, "status": "archived"})).with_ref("r1"),
        upsert(&c.name, json!({"id": "4", "project_id": 1, "no_such_column": 1})).with_ref("r4"),
        Operation::delete(&c.name, "2").with_ref("r2"),
        Operation::delete("missing_collection", "9").with_ref("r9"),
    ];
    let mut failed = client.bulk_process(&registry, &ops).await.unwrap();
    failed.sort_by_key(|v| v.to_string());
    assert_eq!(failed, vec![json!("r4"), json!("r9")]);

    let archived = client
        .search(&c, &Query::filter([("status", "archived")]))
        .await
        .unwrap();
    assert_eq!(ids(archived), vec!["1"]);
    assert_eq!(client.search(&c, &Query::all()).await.unwrap().count(), 2);

    // upserts run first, so a delete of the same id in one batch wins
    let ops = vec![
        Operation::delete(&c.name, "3"),
        upsert(&c.name, json!({"id": "3", "project_id": 2, "status": "active"})),
    ];
    assert!(client.bulk_process(&registry, &ops).await.unwrap().is_empty());
    assert_eq!(ids(client.search(&c, &Query::all()).await.unwrap()), vec!["1"]);

    executor.drop_collection(&c).await.unwrap();
}
