/// Backend-neutral query tree.
///
/// ```text
/// Query builder (query.rs)
///       ↓
/// Embedding resolution     (crate::embedding)
///       ↓
/// Backend processor        (postgres::Processor / opensearch::Processor)
///       ↓
/// Client execution         (postgres::Client / opensearch::Client)
/// ```
pub mod query;

pub use query::{Conditions, KnnNode, KnnSpec, LimitNode, Query, QueryNode};
pub(crate) use query::{non_empty, positive_limit, split_knn};
