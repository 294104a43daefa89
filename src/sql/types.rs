//! Relational query objects.
//!
//! The PostgreSQL processor lowers a query tree into these types and
//! `sql::compile` renders them as SQL text. They cover the statement shapes
//! this crate issues: filtered/ranked selects (optionally over a subquery),
//! conflict-aware multi-row inserts, and deletes by predicate.

/// Top-level statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(Box<SelectQuery>),
    Insert(InsertQuery),
    Delete(DeleteQuery),
}

/// A SELECT over one table or subquery.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectQuery {
    pub projections: Vec<SelectItem>,
    pub from: Option<TableRef>,
    pub filter: Option<Expression>,
    pub order_by: Vec<OrderByExpr>,
    pub limit: Option<u64>,
}

impl SelectQuery {
    /// `SELECT * FROM table`.
    pub fn from_table(table: &TableHandle) -> Self {
        Self {
            projections: vec![SelectItem::Wildcard],
            from: Some(TableRef::Table {
                name: table.name.clone(),
                alias: None,
            }),
            ..Default::default()
        }
    }

    /// True when the select only restricts rows: no ranking, no cap, no
    /// derived columns. Such selects can be merged by combining predicates.
    pub fn is_plain_filter(&self) -> bool {
        self.order_by.is_empty()
            && self.limit.is_none()
            && matches!(self.from, Some(TableRef::Table { .. }))
            && self.projections == [SelectItem::Wildcard]
    }

    /// Cap this select at `limit` rows.
    ///
    /// When the select is already capped, it becomes a subquery and the new
    /// cap applies on top, keeping the inner ordering by re-sorting on the
    /// projected sort columns.
    pub fn wrap_with_limit(self, limit: u64, alias: &str) -> Self {
        if self.limit.is_none() {
            return Self {
                limit: Some(limit),
                ..self
            };
        }

        let order_by = self
            .order_by
            .iter()
            .filter_map(|o| match &o.expr {
                Expression::Column { name, .. } => Some(OrderByExpr {
                    expr: Expression::Column {
                        table: Some(alias.to_string()),
                        name: name.clone(),
                    },
                    asc: o.asc,
                }),
                _ => None,
            })
            .collect();

        Self {
            projections: vec![SelectItem::Wildcard],
            from: Some(TableRef::Subquery {
                query: Box::new(self),
                alias: alias.to_string(),
            }),
            filter: None,
            order_by,
            limit: Some(limit),
        }
    }
}

/// Named table a query reads from or writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableHandle {
    pub name: String,
}

impl TableHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A single item in the SELECT projection list.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    /// `*`
    Wildcard,
    /// `expr AS alias`
    Expression { expr: Expression, alias: String },
}

/// Table reference in FROM clause.
#[derive(Debug, Clone, PartialEq)]
pub enum TableRef {
    Table { name: String, alias: Option<String> },
    Subquery { query: Box<SelectQuery>, alias: String },
}

/// Core expression type.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Column { table: Option<String>, name: String },
    Literal(Literal),
    BinaryOp {
        left: Box<Expression>,
        op: BinaryOperator,
        right: Box<Expression>,
    },
    /// `expr [NOT] IN (list)`
    InList {
        expr: Box<Expression>,
        list: Vec<Expression>,
        negated: bool,
    },
    /// `expr IS [NOT] NULL`
    IsNull { expr: Box<Expression>, negated: bool },
    /// `expr::type`
    TypeCast { expr: Box<Expression>, data_type: String },
    /// `EXCLUDED.column` in an upsert.
    Excluded(String),
    Nested(Box<Expression>),
}

impl Expression {
    pub fn column(name: impl Into<String>) -> Self {
        Expression::Column {
            table: None,
            name: name.into(),
        }
    }

    pub fn binary(left: Expression, op: BinaryOperator, right: Expression) -> Self {
        Expression::BinaryOp {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    /// `self AND other`, parenthesizing both sides.
    pub fn and(self, other: Expression) -> Self {
        Self::binary(self.nested(), BinaryOperator::And, other.nested())
    }

    /// `self OR other`, parenthesizing both sides.
    pub fn or(self, other: Expression) -> Self {
        Self::binary(self.nested(), BinaryOperator::Or, other.nested())
    }

    fn nested(self) -> Self {
        match self {
            Expression::BinaryOp {
                op: BinaryOperator::And | BinaryOperator::Or,
                ..
            } => Expression::Nested(Box::new(self)),
            other => other,
        }
    }

    /// pgvector literal: `'[1,2,3]'::vector`.
    pub fn vector(values: &[f32]) -> Self {
        Expression::TypeCast {
            expr: Box::new(Expression::Literal(Literal::String(vector_literal(values)))),
            data_type: "vector".to_string(),
        }
    }
}

/// Text form of a pgvector value.
pub fn vector_literal(values: &[f32]) -> String {
    let items: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    format!("[{}]", items.join(","))
}

/// Literal values in SQL.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinaryOperator {
    Eq,
    And,
    Or,
    Like,
    /// pgvector cosine distance, `<=>`.
    CosineDistance,
}

/// ORDER BY expression.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderByExpr {
    pub expr: Expression,
    pub asc: bool,
}

/// Multi-row INSERT with an optional ON CONFLICT update.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertQuery {
    pub table: TableHandle,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Expression>>,
    pub on_conflict: Option<OnConflict>,
}

/// `ON CONFLICT (target) DO UPDATE SET col = EXCLUDED.col, ...`
#[derive(Debug, Clone, PartialEq)]
pub struct OnConflict {
    pub target: Vec<String>,
    pub update: Vec<String>,
}

/// DELETE statement.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteQuery {
    pub table: TableHandle,
    pub filter: Option<Expression>,
}
