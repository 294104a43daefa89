pub mod adapter;
pub mod ast;
pub mod collection;
pub mod config;
pub mod embedding;
pub mod error;
pub mod field;
pub mod opensearch;
pub mod operation;
pub mod postgres;
pub mod result;
pub mod sql;

pub use adapter::{Adapter, AdapterRegistry, Capabilities};
pub use ast::{KnnSpec, Query, QueryNode};
pub use collection::{Collection, CollectionRegistry, EmbeddingPreset};
pub use config::Config;
pub use embedding::{EmbeddingGenerator, User};
pub use error::{Error, Result};
pub use field::Field;
pub use operation::{Operation, OperationKind};
pub use result::QueryResult;
