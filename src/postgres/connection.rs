use std::time::Duration;

use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use postgres_native_tls::MakeTlsConnector;
use serde::{Deserialize, Serialize};
use tokio_postgres::NoTls;
use tracing::info;

use crate::error::{Error, Result};

fn default_pool_size() -> usize {
    16
}

fn default_connect_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    #[serde(default)]
    pub ssl_mode: SslMode,
    /// Accept invalid/self-signed certificates. Use with caution.
    /// Only honored in `Prefer` and `Require` modes.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// Optional path to a custom CA certificate bundle (PEM format).
    /// If not set, the system CA store is used.
    #[serde(default)]
    pub ca_cert_path: Option<String>,
    /// Maximum number of pooled connections.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Seconds the driver waits for a new connection to be established.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Seconds a checkout waits for a free pooled connection. Unbounded when unset.
    #[serde(default)]
    pub pool_wait_timeout_secs: Option<u64>,
}

/// SSL/TLS connection modes for PostgreSQL.
///
/// These match the standard PostgreSQL sslmode parameter:
/// - `Disable`: No SSL (unencrypted)
/// - `Prefer`: Try SSL first, fall back to non-SSL (default)
/// - `Require`: Require SSL but don't verify certificate
/// - `VerifyCa`: Require SSL and verify the server certificate is signed by a trusted CA
/// - `VerifyFull`: Like VerifyCa, but also verify the server hostname matches the certificate
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl ConnectionConfig {
    pub fn connection_string(&self) -> String {
        let sslmode = match self.ssl_mode {
            SslMode::Disable => "disable",
            // tokio-postgres has no verify-* modes; verification is configured
            // on the TLS connector instead.
            SslMode::Prefer => "prefer",
            SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => "require",
        };
        format!(
            "host={} port={} dbname={} user={} password={} sslmode={} connect_timeout={}",
            quote_conn_value(&self.host),
            self.port,
            quote_conn_value(&self.database),
            quote_conn_value(&self.username),
            quote_conn_value(&self.password),
            sslmode,
            self.connect_timeout_secs
        )
    }

    pub fn display_string(&self) -> String {
        format!(
            "{}@{}:{}/{}",
            self.username, self.host, self.port, self.database
        )
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: String::from("localhost"),
            port: 5432,
            database: String::from("postgres"),
            username: String::from("postgres"),
            password: String::new(),
            ssl_mode: SslMode::default(),
            accept_invalid_certs: false,
            ca_cert_path: None,
            pool_size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout(),
            pool_wait_timeout_secs: None,
        }
    }
}

/// Build the process-wide connection pool for one PostgreSQL instance.
///
/// No connection is opened here; the first checkout connects.
pub fn create_pool(config: &ConnectionConfig) -> Result<Pool> {
    let pg_config: tokio_postgres::Config = config.connection_string().parse()?;
    let manager_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };

    let manager = match config.ssl_mode {
        SslMode::Disable => Manager::from_config(pg_config, NoTls, manager_config),
        SslMode::Prefer | SslMode::Require => {
            let tls = build_tls_connector(config, false)?;
            Manager::from_config(pg_config, tls, manager_config)
        }
        SslMode::VerifyCa | SslMode::VerifyFull => {
            let tls = build_tls_connector(config, true)?;
            Manager::from_config(pg_config, tls, manager_config)
        }
    };

    let pool = Pool::builder(manager)
        .max_size(config.pool_size)
        .wait_timeout(config.pool_wait_timeout_secs.map(Duration::from_secs))
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| Error::Config(format!("failed to build connection pool: {}", e)))?;

    info!(
        target = %config.display_string(),
        pool_size = config.pool_size,
        "created PostgreSQL connection pool"
    );
    Ok(pool)
}

/// Build a TLS connector with appropriate certificate configuration.
///
/// # Arguments
/// * `config` - Connection configuration
/// * `strict_verify` - If true, always verify certificates (for verify-ca/verify-full modes)
fn build_tls_connector(config: &ConnectionConfig, strict_verify: bool) -> Result<MakeTlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();

    if config.accept_invalid_certs && !strict_verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else {
        if let Some(ca_path) = &config.ca_cert_path {
            let ca_data = std::fs::read(ca_path).map_err(|e| {
                Error::Config(format!("failed to read CA certificate file {}: {}", ca_path, e))
            })?;
            for cert in split_pem_certificates(&ca_data)? {
                builder.add_root_certificate(native_tls::Certificate::from_pem(&cert)?);
            }
        }
        if config.ssl_mode == SslMode::VerifyCa {
            builder.danger_accept_invalid_hostnames(true);
        }
    }

    Ok(MakeTlsConnector::new(builder.build()?))
}

/// Split a PEM bundle into one PEM document per certificate.
fn split_pem_certificates(pem_data: &[u8]) -> Result<Vec<Vec<u8>>> {
    let pem_str = std::str::from_utf8(pem_data)
        .map_err(|_| Error::Config("CA certificate file is not valid UTF-8".into()))?;

    let mut certs = Vec::new();
    let mut current = String::new();
    let mut in_cert = false;

    for line in pem_str.lines() {
        if line.contains("-----BEGIN CERTIFICATE-----") {
            in_cert = true;
            current.clear();
        }
        if in_cert {
            current.push_str(line.trim());
            current.push('\n');
        }
        if line.contains("-----END CERTIFICATE-----") && in_cert {
            in_cert = false;
            certs.push(current.clone().into_bytes());
        }
    }

    if certs.is_empty() {
        return Err(Error::Config("no certificates found in PEM data".into()));
    }

    Ok(certs)
}

/// Quote a value for use in a libpq key=value connection string.
/// Wraps in single quotes and escapes backslashes and single quotes.
fn quote_conn_value(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}
