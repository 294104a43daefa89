use std::collections::BTreeMap;
use std::time::Instant;

use deadpool_postgres::Pool;
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use super::connection::{create_pool, ConnectionConfig};
use super::executor::{ID_COLUMN, PARTITION_COLUMN};
use super::processor::Processor;
use super::rows::row_to_json;
use super::sqlstate::categorize;
use crate::ast::Query;
use crate::collection::{Collection, CollectionRegistry};
use crate::error::{Error, Result};
use crate::operation::{
    failure_refs, group_by_collection, id_string, Action, Operation, OperationKind, ID_KEY,
};
use crate::result::QueryResult;
use crate::sql::{
    self, vector_literal, DeleteQuery, Expression, InsertQuery, Literal, OnConflict, Statement,
    TableHandle,
};

/// Runs searches and bulk writes over a shared connection pool.
#[derive(Clone)]
pub struct Client {
    pool: Pool,
}

impl Client {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn from_config(config: &ConnectionConfig) -> Result<Self> {
        Ok(Self::new(create_pool(config)?))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Compile and run `query`. Content-based knn must already be resolved.
    pub async fn search(&self, collection: &Collection, query: &Query) -> Result<QueryResult> {
        let sql = Processor::new(collection).to_sql(query)?;
        debug!(collection = %collection.name, sql = %sql, "running search");

        let start = Instant::now();
        let client = self.pool.get().await?;
        let rows = client.query(sql.as_str(), &[]).await?;
        let execution_time = start.elapsed();

        let count = rows.len();
        Ok(QueryResult::new(
            count,
            execution_time,
            rows.into_iter().map(|row| row_to_json(&row)),
        ))
    }

    /// Apply a batch and return the refs of operations that failed.
    ///
    /// Connectivity failures abort the batch with an error; anything else
    /// fails only the group it happened in.
    pub async fn bulk_process(
        &self,
        collections: &CollectionRegistry,
        operations: &[Operation],
    ) -> Result<Vec<Value>> {
        let mut failed = Vec::new();

        for (name, batch) in group_by_collection(operations) {
            let collection = match collections.get(name) {
                Ok(collection) => collection,
                Err(e) => {
                    warn!(collection = %name, error = %e, "skipping operations");
                    failed.extend(failure_refs(batch.upserts.iter().copied()));
                    failed.extend(failure_refs(batch.deletes.iter().copied()));
                    continue;
                }
            };

            for group in group_upserts(&batch.upserts) {
                let result = self.upsert_group(collection, &group).await;
                settle(collection, OperationKind::Upsert, &group, result, &mut failed)?;
            }

            if !batch.deletes.is_empty() {
                let result = self.delete_group(collection, &batch.deletes).await;
                settle(
                    collection,
                    OperationKind::Delete,
                    &batch.deletes,
                    result,
                    &mut failed,
                )?;
            }
        }

        Ok(failed)
    }

    async fn upsert_group(&self, collection: &Collection, group: &[&Operation]) -> Result<u64> {
        let statement = upsert_statement(collection, group)?;
        let sql = sql::compile(&statement);

        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let affected = tx.execute(sql.as_str(), &[]).await?;
        tx.commit().await?;
        Ok(affected)
    }

    async fn delete_group(&self, collection: &Collection, group: &[&Operation]) -> Result<u64> {
        let statement = delete_statement(collection, group)?;
        let sql = sql::compile(&statement);

        let client = self.pool.get().await?;
        Ok(client.execute(sql.as_str(), &[]).await?)
    }
}

/// Log a group's outcome; data-level failures become failed refs.
fn settle(
    collection: &Collection,
    kind: OperationKind,
    group: &[&Operation],
    result: Result<u64>,
    failed: &mut Vec<Value>,
) -> Result<()> {
    match result {
        Ok(affected) => {
            debug!(
                collection = %collection.name,
                kind = kind.as_str(),
                count = group.len(),
                affected,
                "bulk group applied"
            );
            Ok(())
        }
        Err(e) if e.is_connectivity() => {
            error!(
                collection = %collection.name,
                kind = kind.as_str(),
                error = %e,
                "bulk group aborted"
            );
            Err(e)
        }
        Err(e) => {
            warn!(
                collection = %collection.name,
                kind = kind.as_str(),
                category = %categorize(&e),
                count = group.len(),
                error = %e,
                "bulk group failed"
            );
            failed.extend(failure_refs(group.iter().copied()));
            Ok(())
        }
    }
}

/// Split upserts into groups sharing the exact same set of record keys.
fn group_upserts<'a>(upserts: &[&'a Operation]) -> Vec<Vec<&'a Operation>> {
    let mut groups: BTreeMap<Vec<&'a str>, Vec<&'a Operation>> = BTreeMap::new();
    for &op in upserts {
        if let Action::Upsert(record) = &op.action {
            let mut columns: Vec<&str> = record.keys().map(String::as_str).collect();
            columns.sort_unstable();
            groups.entry(columns).or_default().push(op);
        }
    }
    groups.into_values().collect()
}

fn upsert_statement(collection: &Collection, group: &[&Operation]) -> Result<Statement> {
    let records = group
        .iter()
        .map(|op| match &op.action {
            Action::Upsert(record) => Ok(record),
            Action::Delete(_) => Err(Error::InvalidOperation(
                "delete in an upsert group".into(),
            )),
        })
        .collect::<Result<Vec<&Map<String, Value>>>>()?;

    let Some(first) = records.first() else {
        return Err(Error::InvalidOperation("empty upsert group".into()));
    };
    let mut record_columns: Vec<&str> = first
        .keys()
        .map(String::as_str)
        .filter(|k| *k != ID_KEY && *k != PARTITION_COLUMN)
        .collect();
    record_columns.sort_unstable();

    let mut columns = vec![ID_COLUMN.to_string(), PARTITION_COLUMN.to_string()];
    columns.extend(record_columns.iter().map(|c| c.to_string()));

    let mut rows = Vec::with_capacity(records.len());
    for record in records {
        let id = record
            .get(ID_KEY)
            .filter(|v| !v.is_null())
            .ok_or_else(|| {
                Error::InvalidOperation(format!("record for `{}` has no id", collection.name))
            })?;
        let partition = collection.partition_for_record(record)?;

        let mut row = Vec::with_capacity(columns.len());
        row.push(Expression::Literal(Literal::String(id_string(id))));
        row.push(Expression::Literal(Literal::Integer(i64::from(partition))));
        for column in &record_columns {
            row.push(value_expression(
                column,
                record.get(*column).unwrap_or(&Value::Null),
            )?);
        }
        rows.push(row);
    }

    Ok(Statement::Insert(InsertQuery {
        table: TableHandle::new(&collection.name),
        on_conflict: Some(OnConflict {
            target: vec![ID_COLUMN.to_string(), PARTITION_COLUMN.to_string()],
            update: record_columns.iter().map(|c| c.to_string()).collect(),
        }),
        columns,
        rows,
    }))
}

fn delete_statement(collection: &Collection, group: &[&Operation]) -> Result<Statement> {
    let ids = group
        .iter()
        .map(|op| {
            op.id()
                .map(|id| Expression::Literal(Literal::String(id_string(id))))
                .ok_or_else(|| {
                    Error::InvalidOperation(format!("delete on `{}` has no id", collection.name))
                })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Statement::Delete(DeleteQuery {
        table: TableHandle::new(&collection.name),
        filter: Some(Expression::InList {
            expr: Box::new(Expression::column(ID_COLUMN)),
            list: ids,
            negated: false,
        }),
    }))
}

/// Literal for one record value. Numeric arrays become pgvector text, which
/// the server casts on insert into a vector column.
fn value_expression(column: &str, value: &Value) -> Result<Expression> {
    let literal = match value {
        Value::Null => Literal::Null,
        Value::Bool(b) => Literal::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Literal::Integer(i),
            None => Literal::Float(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => Literal::String(s.clone()),
        Value::Array(items) => {
            let vector = items
                .iter()
                .map(|v| v.as_f64().map(|f| f as f32))
                .collect::<Option<Vec<f32>>>()
                .ok_or_else(|| {
                    Error::InvalidOperation(format!(
                        "array value of `{}` must contain only numbers",
                        column
                    ))
                })?;
            Literal::String(vector_literal(&vector))
        }
        Value::Object(_) => {
            return Err(Error::InvalidOperation(format!(
                "object value of `{}` cannot be stored",
                column
            )))
        }
    };
    Ok(Expression::Literal(literal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::Field;
    use serde_json::json;

    fn collection() -> Collection {
        Collection::new(
            "code",
            vec![
                Field::bigint("project_id", true),
                Field::vector("embedding", 2, true),
                Field::prefix("path", true),
            ],
        )
        .with_partitions(4)
        .with_partition_key("project_id")
    }

    fn upsert(record: Value) -> Operation {
        Operation::upsert("code", record.as_object().cloned().unwrap())
    }

    #[test]
    fn test_group_upserts_by_column_set() {
        let ops = [
            upsert(json!({"id": "a", "project_id": 1, "path": "a.rb"})),
            upsert(json!({"id": "b", "project_id": 2})),
            upsert(json!({"path": "c.rb", "id": "c", "project_id": 3})),
        ];
        let refs: Vec<&Operation> = ops.iter().collect();
        let groups = group_upserts(&refs);
        assert_eq!(groups.len(), 2);
        let sizes: Vec<usize> = groups.iter().map(Vec::len).collect();
        assert!(sizes.contains(&2) && sizes.contains(&1));
    }

    #[test]
    fn test_upsert_statement() {
        let ops = [
            upsert(json!({"id": "a", "project_id": 5, "path": "a.rb", "embedding": [0.5, 1.0]})),
            upsert(json!({"id": 7, "project_id": 2, "path": "b.rb", "embedding": [1, 0]})),
        ];
        let refs: Vec<&Operation> = ops.iter().collect();
        let sql = sql::compile(&upsert_statement(&collection(), &refs).unwrap());
        assert_eq!(
            sql,
            "INSERT INTO \"code\" (\"id\", \"partition_id\", \"embedding\", \"path\", \"project_id\") \
             VALUES ('a', 1, '[0.5,1]', 'a.rb', 5), ('7', 2, '[1,0]', 'b.rb', 2) \
             ON CONFLICT (\"id\", \"partition_id\") DO UPDATE SET \
             \"embedding\" = EXCLUDED.\"embedding\", \"path\" = EXCLUDED.\"path\", \
             \"project_id\" = EXCLUDED.\"project_id\""
        );
    }

    #[test]
    fn test_upsert_without_partition_key_fails() {
        let ops = [upsert(json!({"id": "a", "path": "a.rb"}))];
        let refs: Vec<&Operation> = ops.iter().collect();
        assert!(matches!(
            upsert_statement(&collection(), &refs),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_upsert_rejects_objects_and_mixed_arrays() {
        assert!(value_expression("meta", &json!({"a": 1})).is_err());
        assert!(value_expression("embedding", &json!([1, "x"])).is_err());
    }

    #[test]
    fn test_delete_statement() {
        let ops = [Operation::delete("code", "a"), Operation::delete("code", 9)];
        let refs: Vec<&Operation> = ops.iter().collect();
        let sql = sql::compile(&delete_statement(&collection(), &refs).unwrap());
        assert_eq!(sql, "DELETE FROM \"code\" WHERE \"id\" IN ('a', '9')");
    }

    #[test]
    fn test_delete_without_id_fails() {
        let ops = [Operation::delete("code", Value::Null)];
        let refs: Vec<&Operation> = ops.iter().collect();
        assert!(delete_statement(&collection(), &refs).is_err());
    }
}
