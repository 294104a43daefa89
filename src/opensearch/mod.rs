//! OpenSearch k-NN backend over the REST API.

pub mod adapter;
pub mod client;
pub mod credentials;
pub mod executor;
pub mod processor;

pub use adapter::OpenSearchAdapter;
pub use client::{Client, OpenSearchConfig};
pub use credentials::{CredentialProvider, Credentials, CredentialsConfig, ProviderChain, StaticCredentials};
pub use executor::Executor;
pub use processor::Processor;
