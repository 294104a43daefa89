//! Query tree → OpenSearch search document.
//!
//! The document is `{"query": clause, "size"?: n}`. Only the outermost node
//! may rank (knn) or cap (limit); everything below a knn filter or a boolean
//! clause must be a plain filter clause.

use serde_json::{json, Map, Value};

use crate::ast::{non_empty, positive_limit, split_knn, Conditions, KnnNode, Query, QueryNode};
use crate::collection::Collection;
use crate::error::{Error, Result};

/// A compiled clause and the `k` of the knn ranking it, if any.
struct Clause {
    body: Value,
    k: Option<usize>,
}

impl Clause {
    fn filter(body: Value) -> Self {
        Self { body, k: None }
    }
}

/// Compiles query trees against one collection's index.
#[derive(Debug)]
pub struct Processor<'a> {
    collection: &'a Collection,
}

impl<'a> Processor<'a> {
    pub fn new(collection: &'a Collection) -> Self {
        Self { collection }
    }

    pub fn compile(&self, query: &Query) -> Result<Value> {
        let (clause, size) = match query.node() {
            QueryNode::Limit(limit) => {
                let n = positive_limit(limit)?;
                let clause = self.ranked(&limit.child, "limit")?;
                // the outer limit can only tighten k
                let size = clause.k.map_or(n, |k| n.min(k));
                (clause.body, Some(size))
            }
            _ => {
                let clause = self.ranked(query, "query")?;
                (clause.body, clause.k)
            }
        };

        let mut document = Map::new();
        document.insert("query".to_string(), clause);
        if let Some(size) = size {
            document.insert("size".to_string(), json!(size));
        }
        Ok(Value::Object(document))
    }

    pub fn to_json(&self, query: &Query) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.compile(query)?)?)
    }

    /// Clause for a node that may carry a knn ranking.
    fn ranked(&self, query: &Query, parent: &str) -> Result<Clause> {
        match query.node() {
            QueryNode::Knn(knn) => Ok(Clause {
                body: self.knn_clause(knn)?,
                k: Some(knn.spec.k),
            }),
            QueryNode::And(children) => self.boolean("and", children),
            QueryNode::Or(children) => self.boolean("or", children),
            _ => Ok(Clause::filter(self.filter_clause(query, parent)?)),
        }
    }

    fn boolean(&self, kind: &str, children: &[Query]) -> Result<Clause> {
        let children = non_empty(kind, children)?;
        let (knn, rest) = split_knn(children)?;

        let rest = rest
            .into_iter()
            .map(|child| self.filter_clause(child, kind))
            .collect::<Result<Vec<_>>>()?;

        let Some(knn) = knn else {
            let body = if kind == "and" {
                json!({"bool": {"must": rest}})
            } else {
                json!({"bool": {"should": rest, "minimum_should_match": 1}})
            };
            return Ok(Clause::filter(body));
        };

        // a lone knn keeps the bool wrapper; otherwise knn sits beside the
        // filter clause, never inside it
        let body = if rest.is_empty() {
            json!({"bool": {"should": [self.knn_clause(knn)?]}})
        } else {
            let filter = if kind == "and" {
                json!({"must": rest})
            } else {
                json!({"should": rest, "minimum_should_match": 1})
            };
            json!({"knn": self.knn_field(knn)?, "bool": filter})
        };
        Ok(Clause {
            body,
            k: Some(knn.spec.k),
        })
    }

    /// Clause for a node that must only filter.
    fn filter_clause(&self, query: &Query, parent: &str) -> Result<Value> {
        match query.node() {
            QueryNode::All => Ok(json!({"match_all": {}})),
            QueryNode::Filter(conditions) => filter_conditions(conditions),
            QueryNode::Prefix(conditions) => prefix_conditions(conditions),
            QueryNode::And(children) => {
                let children = non_empty("and", children)?
                    .iter()
                    .map(|child| self.filter_clause(child, "and"))
                    .collect::<Result<Vec<_>>>()?;
                Ok(json!({"bool": {"must": children}}))
            }
            QueryNode::Or(children) => {
                let children = non_empty("or", children)?
                    .iter()
                    .map(|child| self.filter_clause(child, "or"))
                    .collect::<Result<Vec<_>>>()?;
                Ok(json!({"bool": {"should": children, "minimum_should_match": 1}}))
            }
            QueryNode::Knn(_) | QueryNode::Limit(_) => Err(Error::Unsupported(format!(
                "`{}` under `{}`: ranked or limited results must be the outermost node",
                query.type_name(),
                parent
            ))),
        }
    }

    fn knn_clause(&self, knn: &KnnNode) -> Result<Value> {
        Ok(json!({"knn": self.knn_field(knn)?}))
    }

    /// `{<field>: {vector, k, filter?}}`, the body of a knn clause.
    fn knn_field(&self, knn: &KnnNode) -> Result<Value> {
        let (target, vector) = knn.spec.resolve(self.collection)?;

        let mut params = Map::new();
        params.insert("vector".to_string(), json!(vector));
        params.insert("k".to_string(), json!(knn.spec.k));
        if let Some(child) = &knn.child {
            params.insert("filter".to_string(), self.filter_clause(child, "knn")?);
        }

        let mut field = Map::new();
        field.insert(target.to_string(), Value::Object(params));
        Ok(Value::Object(field))
    }
}

fn filter_conditions(conditions: &Conditions) -> Result<Value> {
    if conditions.is_empty() {
        return Ok(json!({"match_all": {}}));
    }
    let mut must = Vec::with_capacity(conditions.len());
    for (field, value) in conditions {
        let clause = match value {
            Value::Null => json!({"bool": {"must_not": [{"exists": {"field": field}}]}}),
            Value::Array(items) => {
                if let Some(bad) = items.iter().find(|v| v.is_array() || v.is_object()) {
                    return Err(scalar_error(field, bad));
                }
                json!({"terms": {field.as_str(): items}})
            }
            Value::Object(_) => return Err(scalar_error(field, value)),
            scalar => json!({"term": {field.as_str(): scalar}}),
        };
        must.push(clause);
    }
    Ok(json!({"bool": {"must": must}}))
}

fn prefix_conditions(conditions: &Conditions) -> Result<Value> {
    if conditions.is_empty() {
        return Ok(json!({"match_all": {}}));
    }
    let mut must = Vec::with_capacity(conditions.len());
    for (field, value) in conditions {
        if !value.is_string() {
            return Err(Error::InvalidQuery(format!(
                "prefix on `{}` requires a string, got {}",
                field, value
            )));
        }
        must.push(json!({"prefix": {field.as_str(): value}}));
    }
    Ok(json!({"bool": {"must": must}}))
}

fn scalar_error(field: &str, value: &Value) -> Error {
    Error::InvalidQuery(format!(
        "filter on `{}` accepts scalars or a list of scalars, got {}",
        field, value
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::KnnSpec;
    use crate::field::Field;

    fn collection() -> Collection {
        Collection::new(
            "code",
            vec![
                Field::bigint("project_id", true),
                Field::vector("embedding", 2, true),
                Field::prefix("path", true),
                Field::keyword("status", true),
            ],
        )
    }

    fn compile(query: &Query) -> Value {
        let c = collection();
        Processor::new(&c).compile(query).unwrap()
    }

    fn knn(k: usize) -> KnnSpec {
        KnnSpec::vector("embedding", vec![0.5, 0.25], k)
    }

    #[test]
    fn test_all() {
        assert_eq!(compile(&Query::all()), json!({"query": {"match_all": {}}}));
    }

    #[test]
    fn test_filter_terms() {
        let q = Query::filter([
            ("project_id", json!([1, 2])),
            ("status", json!("active")),
            ("path", Value::Null),
        ]);
        assert_eq!(
            compile(&q),
            json!({"query": {"bool": {"must": [
                {"bool": {"must_not": [{"exists": {"field": "path"}}]}},
                {"terms": {"project_id": [1, 2]}},
                {"term": {"status": "active"}}
            ]}}})
        );
    }

    #[test]
    fn test_prefix() {
        let q = Query::prefix([("path", "app/")]);
        assert_eq!(
            compile(&q),
            json!({"query": {"bool": {"must": [{"prefix": {"path": "app/"}}]}}})
        );
    }

    #[test]
    fn test_or_without_knn() {
        let q = Query::or([
            Query::filter([("status", "active")]),
            Query::prefix([("path", "lib/")]),
        ]);
        assert_eq!(
            compile(&q),
            json!({"query": {"bool": {
                "should": [
                    {"bool": {"must": [{"term": {"status": "active"}}]}},
                    {"bool": {"must": [{"prefix": {"path": "lib/"}}]}}
                ],
                "minimum_should_match": 1
            }}})
        );
    }

    #[test]
    fn test_knn_with_filter_sets_size_to_k() {
        let q = Query::filter([("project_id", 1)]).knn(knn(5));
        assert_eq!(
            compile(&q),
            json!({
                "query": {"knn": {"embedding": {
                    "vector": [0.5, 0.25],
                    "k": 5,
                    "filter": {"bool": {"must": [{"term": {"project_id": 1}}]}}
                }}},
                "size": 5
            })
        );
    }

    #[test]
    fn test_or_with_knn_keeps_knn_beside_filters() {
        let q = Query::or([
            Query::filter([("status", "active")]),
            Query::nearest(knn(4)),
        ]);
        assert_eq!(
            compile(&q),
            json!({
                "query": {
                    "knn": {"embedding": {"vector": [0.5, 0.25], "k": 4}},
                    "bool": {
                        "should": [{"bool": {"must": [{"term": {"status": "active"}}]}}],
                        "minimum_should_match": 1
                    }
                },
                "size": 4
            })
        );
    }

    #[test]
    fn test_knn_first_in_or_is_still_a_sibling() {
        let q = Query::or([Query::nearest(knn(5)), Query::filter([("status", "a")])]);
        let doc = compile(&q);
        assert_eq!(doc["query"]["knn"]["embedding"]["k"], json!(5));
        assert!(doc["query"]["bool"].get("knn").is_none());
        assert!(!doc["query"]["bool"].to_string().contains("\"knn\""));
        assert_eq!(doc["size"], json!(5));
    }

    #[test]
    fn test_lone_knn_child_of_or() {
        let q = Query::or([Query::nearest(knn(2))]);
        let doc = compile(&q);
        assert_eq!(
            doc["query"],
            json!({"bool": {"should": [{"knn": {"embedding": {"vector": [0.5, 0.25], "k": 2}}}]}})
        );
        assert!(doc["query"]["bool"].get("minimum_should_match").is_none());
    }

    #[test]
    fn test_outer_limit_never_relaxes_k() {
        assert_eq!(compile(&Query::nearest(knn(5)).limit(3))["size"], json!(3));
        assert_eq!(compile(&Query::nearest(knn(5)).limit(50))["size"], json!(5));
        assert_eq!(compile(&Query::all().limit(7))["size"], json!(7));
        assert!(compile(&Query::all()).get("size").is_none());
    }

    #[test]
    fn test_and_with_knn() {
        let q = Query::and([Query::nearest(knn(3)), Query::filter([("project_id", 9)])]);
        let doc = compile(&q);
        assert_eq!(doc["size"], json!(3));
        assert_eq!(
            doc["query"]["knn"],
            json!({"embedding": {"vector": [0.5, 0.25], "k": 3}})
        );
        assert_eq!(
            doc["query"]["bool"]["must"],
            json!([{"bool": {"must": [{"term": {"project_id": 9}}]}}])
        );
    }

    #[test]
    fn test_nested_ranking_is_unsupported() {
        let c = collection();
        let p = Processor::new(&c);
        let nested_limit = Query::and([Query::all().limit(2), Query::all()]);
        assert!(matches!(p.compile(&nested_limit), Err(Error::Unsupported(_))));

        let knn_in_filter = Query::nearest(knn(1)).knn(knn(2));
        assert!(matches!(p.compile(&knn_in_filter), Err(Error::Unsupported(_))));

        let deep = Query::and([Query::or([Query::nearest(knn(1)), Query::all()])]);
        assert!(matches!(p.compile(&deep), Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_invalid_nodes() {
        let c = collection();
        let p = Processor::new(&c);
        assert!(matches!(p.compile(&Query::or([])), Err(Error::InvalidQuery(_))));
        assert!(matches!(
            p.compile(&Query::all().limit(0)),
            Err(Error::InvalidQuery(_))
        ));
        assert!(matches!(
            p.compile(&Query::prefix([("path", 3)])),
            Err(Error::InvalidQuery(_))
        ));
        assert!(matches!(
            p.compile(&Query::filter([("status", json!([["a"]]))])),
            Err(Error::InvalidQuery(_))
        ));
    }
}
