use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use polyquery::{Adapter, Config, Operation, Query, User};
use serde_json::Value;

/// Compile and run backend-neutral queries against PostgreSQL/pgvector and OpenSearch
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Config file (defaults to <config dir>/polyquery/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Backend to use: postgres or opensearch
    #[arg(long, global = true, default_value = "postgres")]
    backend: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the native query (SQL or search JSON) without running it
    Compile {
        collection: String,
        /// JSON file holding the query tree
        query: PathBuf,
        #[command(flatten)]
        user: UserArgs,
    },
    /// Create the collection's tables or index if absent
    CreateCollection { collection: String },
    /// Drop the collection's tables or index
    DropCollection { collection: String },
    /// Run a query and print matching records as JSON lines
    Search {
        collection: String,
        query: PathBuf,
        #[command(flatten)]
        user: UserArgs,
    },
    /// Apply a JSON list of upserts and deletes; prints the refs that failed
    Bulk { operations: PathBuf },
    /// List configured collections and backends
    Collections,
}

#[derive(clap::Args)]
struct UserArgs {
    /// Id of the user the query runs for
    #[arg(long = "user-id", default_value_t = 0)]
    id: i64,
    #[arg(long, default_value = "polyquery")]
    username: String,
}

impl From<UserArgs> for User {
    fn from(args: UserArgs) -> Self {
        User::new(args.id, args.username)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    match cli.command {
        Command::Collections => list_collections(&config),
        command => run(&config, &cli.backend, command).await,
    }
}

async fn run(config: &Config, backend: &str, command: Command) -> Result<()> {
    let adapters = config.adapters().context("failed to configure backends")?;
    let adapter = adapters.get(backend)?;
    let collections = adapter.collections();

    match command {
        Command::Compile {
            collection,
            query,
            user,
        } => {
            let collection = collections.get(&collection)?;
            let query = read_query(&query)?;
            let native = adapter
                .compile(collection, &query, &user.into())
                .await
                .context("failed to compile query")?;
            println!("{}", native);
        }
        Command::CreateCollection { collection } => {
            let collection = collections.get(&collection)?;
            adapter
                .create_collection(collection)
                .await
                .with_context(|| format!("failed to create `{}`", collection.name))?;
            println!("{} ready on {}", collection.name, adapter.name());
        }
        Command::DropCollection { collection } => {
            let collection = collections.get(&collection)?;
            adapter
                .drop_collection(collection)
                .await
                .with_context(|| format!("failed to drop `{}`", collection.name))?;
            println!("{} dropped from {}", collection.name, adapter.name());
        }
        Command::Search {
            collection,
            query,
            user,
        } => {
            let collection = collections.get(&collection)?;
            let query = read_query(&query)?;
            let result = adapter
                .search(collection, &query, &user.into())
                .await
                .context("search failed")?;
            let count = result.count();
            let elapsed = result.execution_time();
            for row in result {
                println!("{}", row);
            }
            eprintln!("{} rows in {:.2?}", count, elapsed);
        }
        Command::Bulk { operations } => {
            let operations = read_operations(&operations)?;
            let failed = run_bulk(adapter, &operations).await?;
            println!("{}", serde_json::to_string_pretty(&failed)?);
            if !failed.is_empty() {
                bail!("{} of {} operations failed", failed.len(), operations.len());
            }
        }
        Command::Collections => list_collections(config)?,
    }

    Ok(())
}

async fn run_bulk(adapter: &dyn Adapter, operations: &[Operation]) -> Result<Vec<Value>> {
    adapter
        .bulk_process(operations)
        .await
        .with_context(|| format!("bulk write to {} failed", adapter.name()))
}

fn list_collections(config: &Config) -> Result<()> {
    let registry = config.collection_registry()?;
    let mut backends = Vec::new();
    if config.postgres.is_some() {
        backends.push("postgres");
    }
    if config.opensearch.is_some() {
        backends.push("opensearch");
    }
    println!("backends: {}", backends.join(", "));
    for name in registry.names() {
        let collection = registry.get(name)?;
        println!(
            "{} ({} fields, {} partitions)",
            collection.name,
            collection.fields.len(),
            collection.partitions
        );
    }
    Ok(())
}

fn read_json(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn read_query(path: &Path) -> Result<Query> {
    let value = read_json(path)?;
    serde_json::from_value(value).with_context(|| format!("invalid query in {}", path.display()))
}

fn read_operations(path: &Path) -> Result<Vec<Operation>> {
    let value = read_json(path)?;
    Operation::parse_batch(value)
        .with_context(|| format!("invalid operations in {}", path.display()))
}
