//! Backend-neutral query tree and its builder.
//!
//! A [`Query`] is a cheap, clonable handle to an immutable [`QueryNode`].
//! Every builder returns a new handle; composing `and`/`or`/`knn`/`limit`
//! wraps existing nodes without copying them, so sub-trees can be shared
//! freely between queries.
//!
//! Structural problems (an empty `and`, `limit(0)`, a knn without a vector or
//! content) are not rejected here. They surface when a processor compiles the
//! tree.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::collection::Collection;
use crate::error::{Error, Result};
use crate::field::Field;

/// Field name → scalar or list of scalars.
pub type Conditions = BTreeMap<String, Value>;

/// Handle to an immutable query tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Query(Arc<QueryNode>);

/// A single node of the query tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum QueryNode {
    /// Every record.
    All,
    /// Equality per field; a list value means set membership.
    Filter(Conditions),
    /// Case-sensitive starts-with per field.
    Prefix(Conditions),
    And(Vec<Query>),
    Or(Vec<Query>),
    /// Nearest neighbors, optionally restricted to the records matched by `child`.
    Knn(KnnNode),
    /// Row cap over exactly one child.
    Limit(LimitNode),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnnNode {
    #[serde(flatten)]
    pub spec: KnnSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child: Option<Query>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitNode {
    pub limit: usize,
    pub child: Query,
}

/// Parameters of a nearest-neighbor search.
///
/// A literal `vector` takes precedence over `content`. When `target` is absent
/// the collection's embedding field is used.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KnnSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub k: usize,
}

impl KnnSpec {
    /// Search `target` with a literal query vector.
    pub fn vector(target: impl Into<String>, vector: Vec<f32>, k: usize) -> Self {
        Self {
            target: Some(target.into()),
            vector: Some(vector),
            content: None,
            k,
        }
    }

    /// Search with a vector generated from `content` by the collection's
    /// embedding preset.
    pub fn content(content: impl Into<String>, k: usize) -> Self {
        Self {
            target: None,
            vector: None,
            content: Some(content.into()),
            k,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Field to search: the explicit target, else the collection's embedding field.
    pub fn target_field<'a>(&'a self, collection: &'a Collection) -> Result<&'a str> {
        if let Some(target) = self.target.as_deref() {
            return Ok(target);
        }
        collection
            .embedding
            .as_ref()
            .map(|preset| preset.field.as_str())
            .ok_or_else(|| {
                Error::Unsupported(format!(
                    "knn without target on collection `{}`, which has no embedding preset",
                    collection.name
                ))
            })
    }

    /// Target field and query vector, checked against the collection's
    /// definition of the target.
    pub fn resolve<'a>(&'a self, collection: &'a Collection) -> Result<(&'a str, &'a [f32])> {
        let vector = self.query_vector()?;
        let target = self.target_field(collection)?;
        match collection.field(target) {
            Some(Field::Vector { dimensions, .. }) if *dimensions as usize == vector.len() => {
                Ok((target, vector))
            }
            Some(Field::Vector { dimensions, .. }) => Err(Error::InvalidQuery(format!(
                "knn vector has {} dimensions but `{}` has {}",
                vector.len(),
                target,
                dimensions
            ))),
            Some(other) => Err(Error::InvalidQuery(format!(
                "knn target `{}` is a {} field, not a vector",
                target,
                other.kind_name()
            ))),
            None => Err(Error::InvalidQuery(format!(
                "knn target `{}` is not a field of `{}`",
                target, collection.name
            ))),
        }
    }

    /// The query vector, once literal or resolved from content.
    pub fn query_vector(&self) -> Result<&[f32]> {
        if self.k == 0 {
            return Err(Error::InvalidQuery("knn requires k > 0".into()));
        }
        match (&self.vector, &self.content) {
            (Some(v), _) if !v.is_empty() => Ok(v),
            (Some(_), _) => Err(Error::InvalidQuery("knn vector must not be empty".into())),
            (None, Some(_)) => Err(Error::InvalidQuery(
                "knn content has not been resolved into a vector".into(),
            )),
            (None, None) => Err(Error::InvalidQuery(
                "knn requires either a vector or content".into(),
            )),
        }
    }
}

impl Query {
    fn from_node(node: QueryNode) -> Self {
        Query(Arc::new(node))
    }

    pub fn node(&self) -> &QueryNode {
        &self.0
    }

    pub fn all() -> Self {
        Self::from_node(QueryNode::All)
    }

    pub fn filter<K, V>(conditions: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        Self::from_node(QueryNode::Filter(collect_conditions(conditions)))
    }

    pub fn prefix<K, V>(conditions: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        Self::from_node(QueryNode::Prefix(collect_conditions(conditions)))
    }

    pub fn and(children: impl IntoIterator<Item = Query>) -> Self {
        Self::from_node(QueryNode::And(children.into_iter().collect()))
    }

    pub fn or(children: impl IntoIterator<Item = Query>) -> Self {
        Self::from_node(QueryNode::Or(children.into_iter().collect()))
    }

    /// Nearest neighbors over the whole collection.
    pub fn nearest(spec: KnnSpec) -> Self {
        Self::from_node(QueryNode::Knn(KnnNode { spec, child: None }))
    }

    /// Nearest neighbors among the records this query matches.
    pub fn knn(self, spec: KnnSpec) -> Self {
        Self::from_node(QueryNode::Knn(KnnNode {
            spec,
            child: Some(self),
        }))
    }

    /// Cap the result at `limit` rows.
    ///
    /// Applying a limit to a limit replaces it: the last limit wins.
    pub fn limit(self, limit: usize) -> Self {
        let child = match self.node() {
            QueryNode::Limit(inner) => inner.child.clone(),
            _ => self,
        };
        Self::from_node(QueryNode::Limit(LimitNode { limit, child }))
    }

    pub fn is_knn(&self) -> bool {
        matches!(self.node(), QueryNode::Knn(_))
    }

    /// True when a knn node appears anywhere in the tree.
    pub fn contains_knn(&self) -> bool {
        match self.node() {
            QueryNode::All | QueryNode::Filter(_) | QueryNode::Prefix(_) => false,
            QueryNode::Knn(_) => true,
            QueryNode::And(children) | QueryNode::Or(children) => {
                children.iter().any(Query::contains_knn)
            }
            QueryNode::Limit(limit) => limit.child.contains_knn(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.node().type_name()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// True when both handles point at the same node.
    pub fn ptr_eq(&self, other: &Query) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn rebuild(node: QueryNode) -> Self {
        Self::from_node(node)
    }
}

impl QueryNode {
    pub fn type_name(&self) -> &'static str {
        match self {
            QueryNode::All => "all",
            QueryNode::Filter(_) => "filter",
            QueryNode::Prefix(_) => "prefix",
            QueryNode::And(_) => "and",
            QueryNode::Or(_) => "or",
            QueryNode::Knn(_) => "knn",
            QueryNode::Limit(_) => "limit",
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node() {
            QueryNode::All => write!(f, "all()"),
            QueryNode::Filter(c) => write!(f, "filter({})", conditions_json(c)),
            QueryNode::Prefix(c) => write!(f, "prefix({})", conditions_json(c)),
            QueryNode::And(children) => write_children(f, "and", children),
            QueryNode::Or(children) => write_children(f, "or", children),
            QueryNode::Knn(knn) => {
                let target = knn.spec.target.as_deref().unwrap_or("<preset>");
                match &knn.child {
                    Some(child) => write!(f, "{}.knn({}, k={})", child, target, knn.spec.k),
                    None => write!(f, "knn({}, k={})", target, knn.spec.k),
                }
            }
            QueryNode::Limit(limit) => write!(f, "{}.limit({})", limit.child, limit.limit),
        }
    }
}

fn conditions_json(conditions: &Conditions) -> Value {
    Value::Object(
        conditions
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    )
}

fn write_children(f: &mut fmt::Formatter<'_>, name: &str, children: &[Query]) -> fmt::Result {
    write!(f, "{}(", name)?;
    for (i, child) in children.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", child)?;
    }
    write!(f, ")")
}

fn collect_conditions<K, V>(conditions: impl IntoIterator<Item = (K, V)>) -> Conditions
where
    K: Into<String>,
    V: Into<Value>,
{
    conditions
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Children of an `and`/`or`, rejecting the empty case.
pub(crate) fn non_empty<'a>(kind: &str, children: &'a [Query]) -> Result<&'a [Query]> {
    if children.is_empty() {
        return Err(Error::InvalidQuery(format!(
            "`{}` requires at least one child",
            kind
        )));
    }
    Ok(children)
}

/// Positive limit value.
pub(crate) fn positive_limit(limit: &LimitNode) -> Result<usize> {
    if limit.limit == 0 {
        return Err(Error::InvalidQuery("limit must be positive".into()));
    }
    Ok(limit.limit)
}

/// Splits `or`/`and` children into the single knn child (if any) and the rest.
pub(crate) fn split_knn(children: &[Query]) -> Result<(Option<&KnnNode>, Vec<&Query>)> {
    let mut knn = None;
    let mut rest = Vec::with_capacity(children.len());
    for child in children {
        match child.node() {
            QueryNode::Knn(node) => {
                if knn.replace(node).is_some() {
                    return Err(Error::InvalidQuery(
                        "at most one knn child is allowed per boolean node".into(),
                    ));
                }
            }
            _ => rest.push(child),
        }
    }
    Ok((knn, rest))
}
