/// Relational query object → SQL compiler.
///
/// Renders the statement types in `types.rs` as PostgreSQL text. Identifiers
/// are always double-quoted and literals escaped, so field names and values
/// coming from a query tree or a record cannot change the statement's shape.
use super::types::*;

/// Compile a statement into a PostgreSQL SQL string.
pub fn compile(statement: &Statement) -> String {
    match statement {
        Statement::Select(s) => compile_select(s),
        Statement::Insert(i) => compile_insert(i),
        Statement::Delete(d) => compile_delete(d),
    }
}

pub fn compile_select(select: &SelectQuery) -> String {
    let mut parts = Vec::new();

    let mut select_clause = String::from("SELECT ");
    if select.projections.is_empty() {
        select_clause.push('*');
    } else {
        let items: Vec<String> = select.projections.iter().map(compile_select_item).collect();
        select_clause.push_str(&items.join(", "));
    }
    parts.push(select_clause);

    if let Some(ref from) = select.from {
        parts.push(format!("FROM {}", compile_table_ref(from)));
    }

    if let Some(ref filter) = select.filter {
        parts.push(format!("WHERE {}", compile_expr(filter)));
    }

    if !select.order_by.is_empty() {
        let orders: Vec<String> = select.order_by.iter().map(compile_order_by).collect();
        parts.push(format!("ORDER BY {}", orders.join(", ")));
    }

    if let Some(limit) = select.limit {
        parts.push(format!("LIMIT {}", limit));
    }

    parts.join(" ")
}

fn compile_select_item(item: &SelectItem) -> String {
    match item {
        SelectItem::Wildcard => "*".to_string(),
        SelectItem::Expression { expr, alias } => {
            format!("{} AS {}", compile_expr(expr), quote_ident(alias))
        }
    }
}

fn compile_table_ref(table: &TableRef) -> String {
    match table {
        TableRef::Table { name, alias } => {
            let mut s = quote_ident(name);
            if let Some(a) = alias {
                s.push_str(&format!(" AS {}", quote_ident(a)));
            }
            s
        }
        TableRef::Subquery { query, alias } => {
            format!("({}) AS {}", compile_select(query), quote_ident(alias))
        }
    }
}

fn compile_expr(expr: &Expression) -> String {
    match expr {
        Expression::Column { table, name } => match table {
            Some(t) => format!("{}.{}", quote_ident(t), quote_ident(name)),
            None => quote_ident(name),
        },
        Expression::Literal(lit) => compile_literal(lit),
        Expression::BinaryOp { left, op, right } => {
            let op_str = match op {
                BinaryOperator::Eq => "=",
                BinaryOperator::And => "AND",
                BinaryOperator::Or => "OR",
                BinaryOperator::Like => "LIKE",
                BinaryOperator::CosineDistance => "<=>",
            };
            format!("{} {} {}", compile_expr(left), op_str, compile_expr(right))
        }
        Expression::InList {
            expr,
            list,
            negated,
        } => {
            let not_str = if *negated { "NOT " } else { "" };
            let items: Vec<String> = list.iter().map(compile_expr).collect();
            format!(
                "{} {}IN ({})",
                compile_expr(expr),
                not_str,
                items.join(", ")
            )
        }
        Expression::IsNull { expr, negated } => {
            if *negated {
                format!("{} IS NOT NULL", compile_expr(expr))
            } else {
                format!("{} IS NULL", compile_expr(expr))
            }
        }
        Expression::TypeCast { expr, data_type } => {
            format!("{}::{}", compile_expr(expr), data_type)
        }
        Expression::Excluded(column) => format!("EXCLUDED.{}", quote_ident(column)),
        Expression::Nested(expr) => format!("({})", compile_expr(expr)),
    }
}

fn compile_literal(lit: &Literal) -> String {
    match lit {
        Literal::Null => "NULL".to_string(),
        Literal::Boolean(b) => {
            if *b {
                "TRUE".to_string()
            } else {
                "FALSE".to_string()
            }
        }
        Literal::Integer(i) => i.to_string(),
        Literal::Float(f) => format!("{}", f),
        Literal::String(s) => format!("'{}'", s.replace('\'', "''")),
    }
}

fn compile_order_by(order: &OrderByExpr) -> String {
    let mut s = compile_expr(&order.expr);
    s.push_str(if order.asc { " ASC" } else { " DESC" });
    s
}

fn compile_insert(insert: &InsertQuery) -> String {
    let columns: Vec<String> = insert.columns.iter().map(|c| quote_ident(c)).collect();

    let row_strs: Vec<String> = insert
        .rows
        .iter()
        .map(|row| {
            let vals: Vec<String> = row.iter().map(compile_expr).collect();
            format!("({})", vals.join(", "))
        })
        .collect();

    let on_conflict = match &insert.on_conflict {
        Some(conflict) => {
            let target: Vec<String> = conflict.target.iter().map(|c| quote_ident(c)).collect();
            if conflict.update.is_empty() {
                format!(" ON CONFLICT ({}) DO NOTHING", target.join(", "))
            } else {
                let sets: Vec<String> = conflict
                    .update
                    .iter()
                    .map(|c| {
                        format!(
                            "{} = {}",
                            quote_ident(c),
                            compile_expr(&Expression::Excluded(c.clone()))
                        )
                    })
                    .collect();
                format!(
                    " ON CONFLICT ({}) DO UPDATE SET {}",
                    target.join(", "),
                    sets.join(", ")
                )
            }
        }
        None => String::new(),
    };

    format!(
        "INSERT INTO {} ({}) VALUES {}{}",
        quote_ident(&insert.table.name),
        columns.join(", "),
        row_strs.join(", "),
        on_conflict
    )
}

fn compile_delete(delete: &DeleteQuery) -> String {
    let filter = match &delete.filter {
        Some(f) => format!(" WHERE {}", compile_expr(f)),
        None => String::new(),
    };

    format!("DELETE FROM {}{}", quote_ident(&delete.table.name), filter)
}

/// Double-quote an identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Escape `\`, `%` and `_` so `value` matches literally inside a LIKE pattern.
pub fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
