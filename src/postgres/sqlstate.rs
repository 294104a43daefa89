use std::fmt;

use crate::error::Error;

/// Categorized error types for SQL statement failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Syntax errors (SQLSTATE 42601 and 42000)
    Syntax,
    /// Semantic errors (missing table/column, ambiguous reference)
    Semantic,
    /// Execution/runtime errors (bad input, constraint violation)
    Execution,
    /// Transaction state errors (e.g., transaction aborted)
    Transaction,
    /// Connection/communication errors
    Connection,
    /// Unknown or unclassified errors
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Syntax => write!(f, "syntax"),
            ErrorCategory::Semantic => write!(f, "semantic"),
            ErrorCategory::Execution => write!(f, "execution"),
            ErrorCategory::Transaction => write!(f, "transaction"),
            ErrorCategory::Connection => write!(f, "connection"),
            ErrorCategory::Unknown => write!(f, "unknown"),
        }
    }
}

/// Category of a crate error raised while talking to PostgreSQL.
pub fn categorize(err: &Error) -> ErrorCategory {
    match err {
        Error::Postgres(e) => match e.as_db_error() {
            Some(db) => categorize_sqlstate(db.code().code()),
            None => ErrorCategory::Connection,
        },
        Error::Pool(_) | Error::Tls(_) | Error::Io(_) => ErrorCategory::Connection,
        Error::InvalidOperation(_) => ErrorCategory::Execution,
        _ => ErrorCategory::Unknown,
    }
}

/// Categorize a SQLSTATE code into an ErrorCategory.
pub fn categorize_sqlstate(code: &str) -> ErrorCategory {
    if code.len() < 2 {
        return ErrorCategory::Unknown;
    }
    let class = &code[..2];
    match class {
        // Class 42: Syntax Error or Access Rule Violation
        "42" => {
            if code == "42601" || code == "42000" {
                ErrorCategory::Syntax
            } else {
                // 42P01 = undefined_table, 42703 = undefined_column, etc.
                ErrorCategory::Semantic
            }
        }
        // Class 22: Data Exception (bad vector dimensions, invalid text, ...)
        "22" => ErrorCategory::Execution,
        // Class 23: Integrity Constraint Violation
        "23" => ErrorCategory::Execution,
        "25" | "40" => ErrorCategory::Transaction,
        // Class 08: Connection Exception
        "08" => ErrorCategory::Connection,
        // Classes 53-57: resources, limits, object state, operator intervention
        "53" | "54" | "55" | "57" => ErrorCategory::Execution,
        _ => ErrorCategory::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_sqlstate() {
        assert_eq!(categorize_sqlstate("42601"), ErrorCategory::Syntax);
        assert_eq!(categorize_sqlstate("42P01"), ErrorCategory::Semantic);
        assert_eq!(categorize_sqlstate("22000"), ErrorCategory::Execution);
        assert_eq!(categorize_sqlstate("23505"), ErrorCategory::Execution);
        assert_eq!(categorize_sqlstate("40001"), ErrorCategory::Transaction);
        assert_eq!(categorize_sqlstate("08006"), ErrorCategory::Connection);
        assert_eq!(categorize_sqlstate("X"), ErrorCategory::Unknown);
        assert_eq!(categorize_sqlstate("99999"), ErrorCategory::Unknown);
    }

    #[test]
    fn test_categorize_crate_errors() {
        assert_eq!(
            categorize(&Error::InvalidOperation("missing id".into())),
            ErrorCategory::Execution
        );
        assert_eq!(
            categorize(&Error::Io(std::io::Error::other("reset"))),
            ErrorCategory::Connection
        );
        assert_eq!(categorize(&Error::Config("x".into())), ErrorCategory::Unknown);
    }
}
