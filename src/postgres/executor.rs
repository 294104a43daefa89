//! Physical schema for collections: a list-partitioned parent table, one
//! child table per partition and per-partition indexes.

use std::collections::HashSet;

use deadpool_postgres::Pool;
use tracing::{debug, info};

use crate::collection::Collection;
use crate::error::Result;
use crate::field::Field;
use crate::sql::quote_ident;

/// Column holding the partition a row belongs to.
pub const PARTITION_COLUMN: &str = "partition_id";
pub const ID_COLUMN: &str = "id";

/// An index to create on one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDefinition {
    pub name: String,
    pub sql: String,
}

/// Creates, inspects and drops collection tables.
#[derive(Clone)]
pub struct Executor {
    pool: Pool,
}

impl Executor {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// True only when the parent table and every partition exist.
    pub async fn collection_exists(&self, collection: &Collection) -> Result<bool> {
        let client = self.pool.get().await?;
        let mut expected = collection.partition_names();
        expected.push(collection.name.clone());

        let rows = client
            .query(
                r#"
                SELECT c.relname
                FROM pg_catalog.pg_class c
                JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
                WHERE n.nspname = current_schema()
                  AND c.relkind IN ('r', 'p')
                  AND c.relname = ANY($1)
                "#,
                &[&expected],
            )
            .await?;

        let found: HashSet<String> = rows.iter().map(|row| row.get(0)).collect();
        Ok(expected.iter().all(|name| found.contains(name)))
    }

    /// Bring the collection to the present state. Running it again is a no-op;
    /// a partially created collection is completed.
    pub async fn create_collection(&self, collection: &Collection) -> Result<()> {
        collection.validate()?;

        if self.collection_exists(collection).await? {
            debug!(collection = %collection.name, "tables already present");
        } else {
            let mut client = self.pool.get().await?;
            if collection.has_vector_fields() {
                client
                    .execute("CREATE EXTENSION IF NOT EXISTS vector", &[])
                    .await?;
            }

            let tx = client.transaction().await?;
            tx.batch_execute(&create_table_sql(collection)).await?;
            for index in 0..collection.partitions {
                tx.batch_execute(&create_partition_sql(collection, index))
                    .await?;
            }
            tx.commit().await?;
            info!(
                collection = %collection.name,
                partitions = collection.partitions,
                "created collection tables"
            );
        }

        self.create_indexes(collection).await
    }

    async fn create_indexes(&self, collection: &Collection) -> Result<()> {
        let client = self.pool.get().await?;
        let partitions = collection.partition_names();

        let rows = client
            .query(
                r#"
                SELECT indexname
                FROM pg_catalog.pg_indexes
                WHERE schemaname = current_schema()
                  AND tablename = ANY($1)
                "#,
                &[&partitions],
            )
            .await?;
        let existing: HashSet<String> = rows.iter().map(|row| row.get(0)).collect();

        let mut created = 0usize;
        for index in index_definitions(collection) {
            if existing.contains(&index.name) {
                continue;
            }
            client.batch_execute(&index.sql).await?;
            created += 1;
        }

        if created > 0 {
            info!(collection = %collection.name, count = created, "created indexes");
        } else {
            debug!(collection = %collection.name, "indexes already present");
        }
        Ok(())
    }

    pub async fn drop_collection(&self, collection: &Collection) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .batch_execute(&format!(
                "DROP TABLE IF EXISTS {} CASCADE",
                quote_ident(&collection.name)
            ))
            .await?;
        info!(collection = %collection.name, "dropped collection tables");
        Ok(())
    }
}

/// Fixed-width fields widest first, then variable-width fields, each group
/// keeping declaration order among equals. Keeps row padding low.
pub fn column_layout(fields: &[Field]) -> (Vec<&Field>, Vec<&Field>) {
    let (mut fixed, variable): (Vec<&Field>, Vec<&Field>) =
        fields.iter().partition(|f| f.fixed_width().is_some());
    fixed.sort_by(|a, b| b.fixed_width().cmp(&a.fixed_width()));
    (fixed, variable)
}

fn column_type(field: &Field) -> String {
    match field {
        Field::Vector { dimensions, .. } => format!("vector({})", dimensions),
        Field::Bigint { .. } => "bigint".to_string(),
        Field::Prefix { .. } | Field::Keyword { .. } | Field::Text { .. } => "text".to_string(),
    }
}

pub fn create_table_sql(collection: &Collection) -> String {
    let (fixed, variable) = column_layout(&collection.fields);

    let mut columns = vec![format!("{} bigint NOT NULL", quote_ident(PARTITION_COLUMN))];
    columns.extend(
        fixed
            .iter()
            .map(|f| format!("{} {}", quote_ident(f.name()), column_type(f))),
    );
    columns.push(format!("{} text NOT NULL", quote_ident(ID_COLUMN)));
    columns.extend(
        variable
            .iter()
            .map(|f| format!("{} {}", quote_ident(f.name()), column_type(f))),
    );
    columns.push(format!(
        "PRIMARY KEY ({}, {})",
        quote_ident(ID_COLUMN),
        quote_ident(PARTITION_COLUMN)
    ));

    format!(
        "CREATE TABLE IF NOT EXISTS {} ({}) PARTITION BY LIST ({})",
        quote_ident(&collection.name),
        columns.join(", "),
        quote_ident(PARTITION_COLUMN)
    )
}

pub fn create_partition_sql(collection: &Collection, index: u32) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} PARTITION OF {} FOR VALUES IN ({})",
        quote_ident(&collection.partition_name(index)),
        quote_ident(&collection.name),
        index
    )
}

/// Indexes for every indexed field on every partition.
pub fn index_definitions(collection: &Collection) -> Vec<IndexDefinition> {
    let mut definitions = Vec::new();
    for index in 0..collection.partitions {
        let partition = collection.partition_name(index);
        for field in collection.fields.iter().filter(|f| f.indexed()) {
            let name = collection.index_name(index, field.name());
            let column = quote_ident(field.name());
            let method = match field {
                Field::Vector { .. } => format!(
                    "USING hnsw ({} vector_cosine_ops) WITH (m = 16, ef_construction = 100)",
                    column
                ),
                // text_pattern_ops lets LIKE 'prefix%' use the index under any collation
                Field::Prefix { .. } => format!("({} text_pattern_ops)", column),
                _ => format!("({})", column),
            };
            let sql = format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} {}",
                quote_ident(&name),
                quote_ident(&partition),
                method
            );
            definitions.push(IndexDefinition { name, sql });
        }
    }
    definitions
}
