//! PostgreSQL + pgvector backend.

pub mod adapter;
pub mod client;
pub mod connection;
pub mod executor;
pub mod processor;
pub mod rows;
pub mod sqlstate;

pub use adapter::PostgresAdapter;
pub use client::Client;
pub use connection::{create_pool, ConnectionConfig, SslMode};
pub use executor::Executor;
pub use processor::Processor;
