//! Bulk operations and their grouping.
//!
//! Wire shape of one operation:
//!
//! ```json
//! {"code": {"upsert": {"id": "a", "path": "app/a.rb"}}, "ref": 17}
//! {"code": {"delete": "a"}, "ref": 18}
//! ```

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Key every record is identified by.
pub const ID_KEY: &str = "id";
const REF_KEY: &str = "ref";

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Upsert(Map<String, Value>),
    Delete(Value),
}

impl Action {
    pub fn kind(&self) -> OperationKind {
        match self {
            Action::Upsert(_) => OperationKind::Upsert,
            Action::Delete(_) => OperationKind::Delete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OperationKind {
    Upsert,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Upsert => "upsert",
            OperationKind::Delete => "delete",
        }
    }
}

/// One upsert or delete against a collection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Value")]
pub struct Operation {
    pub collection: String,
    pub action: Action,
    /// Caller-chosen value echoed back when the operation fails.
    pub reference: Option<Value>,
}

impl Operation {
    pub fn upsert(collection: impl Into<String>, record: Map<String, Value>) -> Self {
        Self {
            collection: collection.into(),
            action: Action::Upsert(record),
            reference: None,
        }
    }

    pub fn delete(collection: impl Into<String>, id: impl Into<Value>) -> Self {
        Self {
            collection: collection.into(),
            action: Action::Delete(id.into()),
            reference: None,
        }
    }

    pub fn with_ref(mut self, reference: impl Into<Value>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn kind(&self) -> OperationKind {
        self.action.kind()
    }

    /// Record id, `None` when an upsert record has none.
    pub fn id(&self) -> Option<&Value> {
        match &self.action {
            Action::Upsert(record) => record.get(ID_KEY).filter(|v| !v.is_null()),
            Action::Delete(id) => Some(id).filter(|v| !v.is_null()),
        }
    }

    /// What the failed list reports for this operation: its ref, or its
    /// record id when no ref was given.
    pub fn failure_ref(&self) -> Value {
        match &self.reference {
            Some(reference) => reference.clone(),
            None => self.id().cloned().unwrap_or(Value::Null),
        }
    }

    /// Parse a JSON list of operations.
    pub fn parse_batch(value: Value) -> Result<Vec<Operation>> {
        match value {
            Value::Array(items) => items.into_iter().map(Operation::try_from).collect(),
            other => Err(Error::InvalidOperation(format!(
                "expected a list of operations, got {}",
                other
            ))),
        }
    }
}

impl TryFrom<Value> for Operation {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        let mut object = match value {
            Value::Object(object) => object,
            other => {
                return Err(Error::InvalidOperation(format!(
                    "operation must be an object, got {}",
                    other
                )))
            }
        };
        let reference = object.remove(REF_KEY);

        if object.len() != 1 {
            return Err(Error::InvalidOperation(format!(
                "operation must name exactly one collection, got {} keys",
                object.len()
            )));
        }
        let Some((collection, body)) = object.into_iter().next() else {
            return Err(Error::InvalidOperation("operation is empty".into()));
        };

        let mut body = match body {
            Value::Object(body) => body,
            _ => {
                return Err(Error::InvalidOperation(format!(
                    "operation on `{}` must be an object",
                    collection
                )))
            }
        };
        if body.len() != 1 {
            return Err(Error::InvalidOperation(format!(
                "operation on `{}` must be exactly one of `upsert` or `delete`",
                collection
            )));
        }

        let action = if let Some(record) = body.remove("upsert") {
            match record {
                Value::Object(record) => Action::Upsert(record),
                other => {
                    return Err(Error::InvalidOperation(format!(
                        "upsert on `{}` expects an object, got {}",
                        collection, other
                    )))
                }
            }
        } else if let Some(id) = body.remove("delete") {
            Action::Delete(id)
        } else {
            return Err(Error::InvalidOperation(format!(
                "operation on `{}` must be exactly one of `upsert` or `delete`",
                collection
            )));
        };

        Ok(Operation {
            collection,
            action,
            reference,
        })
    }
}

/// Operations of one collection split by kind, in input order.
#[derive(Debug, Default)]
pub struct CollectionBatch<'a> {
    pub upserts: Vec<&'a Operation>,
    pub deletes: Vec<&'a Operation>,
}

/// Group operations by collection, then kind.
///
/// Upserts of a collection are applied before its deletes, so a record that
/// is both upserted and deleted in one batch ends up deleted.
pub fn group_by_collection(operations: &[Operation]) -> BTreeMap<&str, CollectionBatch<'_>> {
    let mut groups: BTreeMap<&str, CollectionBatch<'_>> = BTreeMap::new();
    for op in operations {
        let batch = groups.entry(op.collection.as_str()).or_default();
        match op.kind() {
            OperationKind::Upsert => batch.upserts.push(op),
            OperationKind::Delete => batch.deletes.push(op),
        }
    }
    groups
}

/// Failure refs for a group of operations.
pub fn failure_refs<'a>(operations: impl IntoIterator<Item = &'a Operation>) -> Vec<Value> {
    operations.into_iter().map(Operation::failure_ref).collect()
}

/// Textual id as stored by both backends.
pub fn id_string(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
