//! Query tree → relational query object.
//!
//! Boolean nodes merge their children as predicates over one table. A knn
//! node turns its input into a ranked, capped select; after that point the
//! select can only be capped further by an enclosing `limit`.

use serde_json::Value;

use crate::ast::{non_empty, positive_limit, split_knn, Conditions, KnnNode, Query, QueryNode};
use crate::collection::Collection;
use crate::error::{Error, Result};
use crate::sql::{
    self, escape_like, BinaryOperator, Expression, Literal, OrderByExpr, SelectItem, SelectQuery,
    TableHandle,
};

/// Alias of the distance projection added by knn.
pub const DISTANCE_COLUMN: &str = "distance";
/// Alias of the subquery an outer limit wraps around a ranked select.
const LIMIT_ALIAS: &str = "limited";

/// Compiles query trees against one collection's parent table.
#[derive(Debug)]
pub struct Processor<'a> {
    collection: &'a Collection,
    table: TableHandle,
}

impl<'a> Processor<'a> {
    pub fn new(collection: &'a Collection) -> Self {
        Self {
            collection,
            table: TableHandle::new(&collection.name),
        }
    }

    pub fn compile(&self, query: &Query) -> Result<SelectQuery> {
        self.process(query)
    }

    pub fn to_sql(&self, query: &Query) -> Result<String> {
        Ok(sql::compile_select(&self.compile(query)?))
    }

    fn process(&self, query: &Query) -> Result<SelectQuery> {
        match query.node() {
            QueryNode::All => Ok(self.select(None)),
            QueryNode::Filter(conditions) => Ok(self.select(filter_predicate(conditions)?)),
            QueryNode::Prefix(conditions) => Ok(self.select(prefix_predicate(conditions)?)),
            QueryNode::And(children) => self.process_boolean("and", children, conjoin),
            QueryNode::Or(children) => self.process_boolean("or", children, disjoin),
            QueryNode::Knn(knn) => {
                let base = match &knn.child {
                    Some(child) => self.predicate("knn", child)?,
                    None => None,
                };
                self.process_knn(knn, base)
            }
            QueryNode::Limit(limit) => {
                let n = positive_limit(limit)?;
                let child = self.process(&limit.child)?;
                Ok(child.wrap_with_limit(n as u64, LIMIT_ALIAS))
            }
        }
    }

    /// `and`/`or`: combine the non-knn children's predicates, then apply the
    /// knn child (at most one) on top of the combined predicate.
    fn process_boolean(
        &self,
        kind: &str,
        children: &[Query],
        combine: fn(Vec<Option<Expression>>) -> Option<Expression>,
    ) -> Result<SelectQuery> {
        let children = non_empty(kind, children)?;
        let (knn, rest) = split_knn(children)?;

        let base = if rest.is_empty() {
            None
        } else {
            let predicates = rest
                .into_iter()
                .map(|child| self.predicate(kind, child))
                .collect::<Result<Vec<_>>>()?;
            combine(predicates)
        };

        match knn {
            Some(knn) => {
                let own = match &knn.child {
                    Some(child) => self.predicate("knn", child)?,
                    None => None,
                };
                self.process_knn(knn, conjoin(vec![own, base]))
            }
            None => Ok(self.select(base)),
        }
    }

    /// Predicate of a child that must stay a plain row filter. `None` means
    /// the child matches every row.
    fn predicate(&self, parent: &str, child: &Query) -> Result<Option<Expression>> {
        let select = self.process(child)?;
        if !select.is_plain_filter() {
            return Err(Error::Unsupported(format!(
                "`{}` under `{}`: ranked or limited results must be the outermost node",
                child.type_name(),
                parent
            )));
        }
        Ok(select.filter)
    }

    fn process_knn(&self, knn: &KnnNode, filter: Option<Expression>) -> Result<SelectQuery> {
        let (target, vector) = knn.spec.resolve(self.collection)?;

        let distance = Expression::binary(
            Expression::column(target),
            BinaryOperator::CosineDistance,
            Expression::vector(vector),
        );

        Ok(SelectQuery {
            projections: vec![
                SelectItem::Wildcard,
                SelectItem::Expression {
                    expr: distance,
                    alias: DISTANCE_COLUMN.to_string(),
                },
            ],
            order_by: vec![OrderByExpr {
                expr: Expression::column(DISTANCE_COLUMN),
                asc: true,
            }],
            limit: Some(knn.spec.k as u64),
            ..self.select(filter)
        })
    }

    fn select(&self, filter: Option<Expression>) -> SelectQuery {
        SelectQuery {
            filter,
            ..SelectQuery::from_table(&self.table)
        }
    }
}

fn conjoin(predicates: Vec<Option<Expression>>) -> Option<Expression> {
    predicates.into_iter().flatten().reduce(Expression::and)
}

/// A child without a predicate matches everything, and so does the union.
fn disjoin(predicates: Vec<Option<Expression>>) -> Option<Expression> {
    predicates
        .into_iter()
        .collect::<Option<Vec<_>>>()?
        .into_iter()
        .reduce(Expression::or)
}

fn filter_predicate(conditions: &Conditions) -> Result<Option<Expression>> {
    let mut predicates = Vec::with_capacity(conditions.len());
    for (field, value) in conditions {
        let column = Expression::column(field);
        let predicate = match value {
            Value::Null => Expression::IsNull {
                expr: Box::new(column),
                negated: false,
            },
            Value::Array(items) if items.is_empty() => {
                Expression::Literal(Literal::Boolean(false))
            }
            Value::Array(items) => Expression::InList {
                expr: Box::new(column),
                list: items
                    .iter()
                    .map(|item| literal(field, item))
                    .collect::<Result<_>>()?,
                negated: false,
            },
            scalar => Expression::binary(column, BinaryOperator::Eq, literal(field, scalar)?),
        };
        predicates.push(Some(predicate));
    }
    Ok(conjoin(predicates))
}

fn prefix_predicate(conditions: &Conditions) -> Result<Option<Expression>> {
    let mut predicates = Vec::with_capacity(conditions.len());
    for (field, value) in conditions {
        let Value::String(prefix) = value else {
            return Err(Error::InvalidQuery(format!(
                "prefix on `{}` requires a string, got {}",
                field, value
            )));
        };
        predicates.push(Some(Expression::binary(
            Expression::column(field),
            BinaryOperator::Like,
            Expression::Literal(Literal::String(format!("{}%", escape_like(prefix)))),
        )));
    }
    Ok(conjoin(predicates))
}

fn literal(field: &str, value: &Value) -> Result<Expression> {
    let literal = match value {
        Value::Null => Literal::Null,
        Value::Bool(b) => Literal::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Literal::Integer(i),
            None => Literal::Float(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => Literal::String(s.clone()),
        Value::Array(_) | Value::Object(_) => {
            return Err(Error::InvalidQuery(format!(
                "filter on `{}` accepts scalars or a list of scalars, got {}",
                field, value
            )))
        }
    };
    Ok(Expression::Literal(literal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::KnnSpec;
    use crate::field::Field;
    use serde_json::json;
    use sqlparser::dialect::PostgreSqlDialect;
    use sqlparser::parser::Parser;

    fn collection() -> Collection {
        Collection::new(
            "code",
            vec![
                Field::bigint("project_id", true),
                Field::vector("embedding", 3, true),
                Field::prefix("path", true),
                Field::keyword("status", true),
            ],
        )
        .with_embedding("text-embedding-3-small", "embedding")
    }

    fn sql(query: &Query) -> String {
        let c = collection();
        Processor::new(&c).to_sql(query).unwrap()
    }

    fn knn(k: usize) -> KnnSpec {
        KnnSpec::vector("embedding", vec![0.1, 0.2, 0.3], k)
    }

    fn assert_parses(sql: &str) {
        assert!(
            Parser::parse_sql(&PostgreSqlDialect {}, sql).is_ok(),
            "generated SQL did not parse: {}",
            sql
        );
    }

    #[test]
    fn test_all() {
        assert_eq!(sql(&Query::all()), "SELECT * FROM \"code\"");
    }

    #[test]
    fn test_filter_scalars_and_lists() {
        let q = Query::filter([
            ("project_id", json!([1, 2])),
            ("status", json!("active")),
        ]);
        let out = sql(&q);
        assert_eq!(
            out,
            "SELECT * FROM \"code\" WHERE \"project_id\" IN (1, 2) AND \"status\" = 'active'"
        );
        assert_parses(&out);
    }

    #[test]
    fn test_filter_null_and_empty_list() {
        let q = Query::filter([("status", Value::Null)]);
        assert_eq!(sql(&q), "SELECT * FROM \"code\" WHERE \"status\" IS NULL");

        let q = Query::filter([("status", json!([]))]);
        assert_eq!(sql(&q), "SELECT * FROM \"code\" WHERE FALSE");
    }

    #[test]
    fn test_filter_rejects_objects() {
        let c = collection();
        let q = Query::filter([("status", json!({"a": 1}))]);
        assert!(matches!(
            Processor::new(&c).to_sql(&q),
            Err(Error::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_prefix_escapes_wildcards() {
        let q = Query::prefix([("path", "app/100%_")]);
        let out = sql(&q);
        assert_eq!(
            out,
            "SELECT * FROM \"code\" WHERE \"path\" LIKE 'app/100\\%\\_%'"
        );
        assert_parses(&out);
    }

    #[test]
    fn test_and_or_nesting() {
        let q = Query::and([
            Query::filter([("project_id", 1)]),
            Query::or([
                Query::filter([("status", "active")]),
                Query::prefix([("path", "lib/")]),
            ]),
        ]);
        let out = sql(&q);
        assert_eq!(
            out,
            "SELECT * FROM \"code\" WHERE \"project_id\" = 1 AND \
             (\"status\" = 'active' OR \"path\" LIKE 'lib/%')"
        );
        assert_parses(&out);
    }

    #[test]
    fn test_or_with_all_matches_everything() {
        let q = Query::or([Query::filter([("status", "active")]), Query::all()]);
        assert_eq!(sql(&q), "SELECT * FROM \"code\"");
    }

    #[test]
    fn test_empty_boolean_is_invalid() {
        let c = collection();
        let err = Processor::new(&c).to_sql(&Query::and([])).unwrap_err();
        assert!(matches!(err, Error::InvalidQuery(_)));
        assert!(err.to_string().contains("and"));
    }

    #[test]
    fn test_knn_with_prefilter() {
        let q = Query::filter([("project_id", 1)]).knn(knn(5));
        assert_eq!(
            sql(&q),
            "SELECT *, \"embedding\" <=> '[0.1,0.2,0.3]'::vector AS \"distance\" \
             FROM \"code\" WHERE \"project_id\" = 1 ORDER BY \"distance\" ASC LIMIT 5"
        );
    }

    #[test]
    fn test_or_lifts_knn_over_remaining_children() {
        let q = Query::or([
            Query::filter([("status", "active")]),
            Query::nearest(knn(4)),
            Query::prefix([("path", "app/")]),
        ]);
        assert_eq!(
            sql(&q),
            "SELECT *, \"embedding\" <=> '[0.1,0.2,0.3]'::vector AS \"distance\" \
             FROM \"code\" WHERE \"status\" = 'active' OR \"path\" LIKE 'app/%' \
             ORDER BY \"distance\" ASC LIMIT 4"
        );
    }

    #[test]
    fn test_single_knn_child_of_or() {
        let q = Query::or([Query::nearest(knn(2))]);
        assert_eq!(
            sql(&q),
            "SELECT *, \"embedding\" <=> '[0.1,0.2,0.3]'::vector AS \"distance\" \
             FROM \"code\" ORDER BY \"distance\" ASC LIMIT 2"
        );
    }

    #[test]
    fn test_and_combines_knn_prefilter_with_siblings() {
        let q = Query::and([
            Query::filter([("status", "active")]).knn(knn(3)),
            Query::filter([("project_id", 9)]),
        ]);
        let out = sql(&q);
        assert!(out.contains("WHERE \"status\" = 'active' AND \"project_id\" = 9"));
        assert!(out.ends_with("ORDER BY \"distance\" ASC LIMIT 3"));
    }

    #[test]
    fn test_two_knn_children_rejected() {
        let c = collection();
        let q = Query::or([Query::nearest(knn(1)), Query::nearest(knn(2))]);
        assert!(matches!(
            Processor::new(&c).to_sql(&q),
            Err(Error::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_limit_over_knn_wraps_subquery() {
        let q = Query::nearest(knn(5)).limit(3);
        assert_eq!(
            sql(&q),
            "SELECT * FROM (SELECT *, \"embedding\" <=> '[0.1,0.2,0.3]'::vector AS \"distance\" \
             FROM \"code\" ORDER BY \"distance\" ASC LIMIT 5) AS \"limited\" \
             ORDER BY \"limited\".\"distance\" ASC LIMIT 3"
        );
    }

    #[test]
    fn test_limit_over_filter() {
        let q = Query::filter([("status", "active")]).limit(10);
        let out = sql(&q);
        assert_eq!(out, "SELECT * FROM \"code\" WHERE \"status\" = 'active' LIMIT 10");
        assert_parses(&out);
    }

    #[test]
    fn test_nested_limit_is_unsupported() {
        let c = collection();
        let q = Query::and([Query::all().limit(5), Query::filter([("project_id", 1)])]);
        let err = Processor::new(&c).to_sql(&q).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
        assert!(err.to_string().contains("limit"));
    }

    #[test]
    fn test_knn_inside_prefilter_is_unsupported() {
        let c = collection();
        let q = Query::nearest(knn(3)).knn(knn(2));
        assert!(matches!(
            Processor::new(&c).to_sql(&q),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_zero_limit_and_k_are_invalid() {
        let c = collection();
        let p = Processor::new(&c);
        assert!(matches!(
            p.to_sql(&Query::all().limit(0)),
            Err(Error::InvalidQuery(_))
        ));
        assert!(matches!(
            p.to_sql(&Query::nearest(knn(0))),
            Err(Error::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_unresolved_content_is_invalid() {
        let c = collection();
        let q = Query::nearest(KnnSpec::content("how do I deploy", 3));
        assert!(matches!(
            Processor::new(&c).to_sql(&q),
            Err(Error::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_knn_target_checks() {
        let c = collection();
        let p = Processor::new(&c);
        let wrong_dims = Query::nearest(KnnSpec::vector("embedding", vec![1.0], 1));
        assert!(p.to_sql(&wrong_dims).unwrap_err().to_string().contains("dimensions"));

        let not_vector = Query::nearest(KnnSpec::vector("path", vec![1.0, 2.0, 3.0], 1));
        assert!(p.to_sql(&not_vector).is_err());

        let untargeted = Query::nearest(KnnSpec {
            vector: Some(vec![1.0, 0.0, 0.0]),
            k: 1,
            ..Default::default()
        });
        assert!(p.to_sql(&untargeted).unwrap().contains("\"embedding\" <=>"));
    }
}
