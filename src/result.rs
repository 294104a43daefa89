//! Search results.

use std::fmt;
use std::time::Duration;

use serde_json::Value;

/// Rows or hits returned by a search, converted to JSON lazily.
///
/// Rows are produced as they are consumed and cannot be replayed. `count`
/// reports how many rows the backend returned, independent of how many have
/// been read.
pub struct QueryResult {
    count: usize,
    execution_time: Duration,
    rows: Box<dyn Iterator<Item = Value> + Send>,
}

impl QueryResult {
    pub fn new<I>(count: usize, execution_time: Duration, rows: I) -> Self
    where
        I: Iterator<Item = Value> + Send + 'static,
    {
        Self {
            count,
            execution_time,
            rows: Box::new(rows),
        }
    }

    pub fn empty() -> Self {
        Self::new(0, Duration::ZERO, std::iter::empty())
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn execution_time(&self) -> Duration {
        self.execution_time
    }

    /// Next unread row.
    pub fn next_row(&mut self) -> Option<Value> {
        self.rows.next()
    }

    /// Unread rows, borrowed so the result stays usable afterwards.
    pub fn rows(&mut self) -> &mut (dyn Iterator<Item = Value> + Send) {
        self.rows.as_mut()
    }

    /// Release the underlying rows. The count is kept.
    pub fn clear(&mut self) {
        self.rows = Box::new(std::iter::empty());
    }
}

impl IntoIterator for QueryResult {
    type Item = Value;
    type IntoIter = Box<dyn Iterator<Item = Value> + Send>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows
    }
}

impl fmt::Debug for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryResult")
            .field("count", &self.count)
            .field("execution_time", &self.execution_time)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_pass() {
        let rows = vec![json!({"id": "a"}), json!({"id": "b"})];
        let mut result = QueryResult::new(2, Duration::from_millis(3), rows.into_iter());
        assert_eq!(result.count(), 2);
        assert_eq!(result.next_row(), Some(json!({"id": "a"})));
        assert_eq!(result.rows().count(), 1);
        assert_eq!(result.next_row(), None);
    }

    #[test]
    fn test_count_survives_partial_reads() {
        let rows = vec![json!(1), json!(2), json!(3)];
        let mut result = QueryResult::new(3, Duration::ZERO, rows.into_iter());
        assert_eq!(result.next_row(), Some(json!(1)));
        assert_eq!(result.count(), 3);
        let rest: Vec<Value> = result.rows().collect();
        assert_eq!(rest, vec![json!(2), json!(3)]);
        assert_eq!(result.count(), 3);
        result.clear();
        assert_eq!(result.count(), 3);
        assert_eq!(result.into_iter().count(), 0);
    }

    #[test]
    fn test_clear_keeps_count() {
        let rows = vec![json!(1), json!(2), json!(3)];
        let mut result = QueryResult::new(3, Duration::ZERO, rows.into_iter());
        result.clear();
        assert_eq!(result.count(), 3);
        assert!(result.next_row().is_none());
    }

    #[test]
    fn test_conversion_is_lazy() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let converted = Arc::new(AtomicUsize::new(0));
        let counter = converted.clone();
        let rows = (0..10).map(move |i| {
            counter.fetch_add(1, Ordering::SeqCst);
            json!(i)
        });
        let mut result = QueryResult::new(10, Duration::ZERO, rows);
        assert_eq!(converted.load(Ordering::SeqCst), 0);
        result.next_row();
        assert_eq!(converted.load(Ordering::SeqCst), 1);
    }
}
