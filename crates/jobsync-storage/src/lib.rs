//! PostgreSQL/CockroachDB destination: natural-key lookups and inserts into `jobs`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use jobsync_core::{JobRow, NaturalKey};
use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "jobsync-storage";

const INSERT_JOB_SQL: &str = r#"
    INSERT INTO jobs (
        title, company, location, description, skills,
        salary, type, posted_date, deadline, status, email
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
"#;

const EXISTS_NULL_SAFE_SQL: &str = r#"
    SELECT 1
      FROM jobs
     WHERE title IS NOT DISTINCT FROM $1
       AND company IS NOT DISTINCT FROM $2
       AND posted_date IS NOT DISTINCT FROM $3
     LIMIT 1
"#;

const EXISTS_STRICT_SQL: &str = r#"
    SELECT 1
      FROM jobs
     WHERE title = $1
       AND company = $2
       AND posted_date = $3
     LIMIT 1
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    InvalidConfig(#[from] InvalidChoice),
    #[error("connecting to {host}:{port}/{database}: {source}")]
    Connect {
        host: String,
        port: u16,
        database: String,
        #[source]
        source: sqlx::Error,
    },
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
    #[error("no open transaction")]
    NoTransaction,
}

/// A configuration value outside its allowed set.
#[derive(Debug, Error)]
#[error("invalid {what} {value:?}, expected one of: {expected}")]
pub struct InvalidChoice {
    pub what: &'static str,
    pub value: String,
    pub expected: &'static str,
}

/// How null components of the natural key compare during the existence check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NullKeyPolicy {
    /// `IS NOT DISTINCT FROM`: a null matches a stored null.
    #[default]
    NullSafe,
    /// Plain `=`: a null never matches, so the posting is re-inserted every run.
    Strict,
}

impl NullKeyPolicy {
    pub fn exists_sql(self) -> &'static str {
        match self {
            Self::NullSafe => EXISTS_NULL_SAFE_SQL,
            Self::Strict => EXISTS_STRICT_SQL,
        }
    }
}

impl FromStr for NullKeyPolicy {
    type Err = InvalidChoice;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "null-safe" => Ok(Self::NullSafe),
            "strict" => Ok(Self::Strict),
            _ => Err(InvalidChoice {
                what: "null key policy",
                value: s.to_string(),
                expected: "null-safe, strict",
            }),
        }
    }
}

impl fmt::Display for NullKeyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NullSafe => "null-safe",
            Self::Strict => "strict",
        })
    }
}

/// Destination for novel rows. Lookups and inserts see rows queued in the
/// currently open transaction.
#[async_trait]
pub trait JobDestination: Send {
    async fn begin(&mut self) -> Result<(), StoreError>;
    async fn exists(&mut self, key: &NaturalKey) -> Result<bool, StoreError>;
    async fn insert(&mut self, row: &JobRow) -> Result<(), StoreError>;
    async fn commit(&mut self) -> Result<(), StoreError>;
    /// Discards the open transaction, if any.
    async fn rollback(&mut self) -> Result<(), StoreError>;
    /// Rolls back anything still open and releases the connection.
    async fn close(&mut self);
}

#[derive(Clone, Deserialize)]
pub struct PgDestinationConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,
    #[serde(default)]
    pub ssl_root_cert: Option<PathBuf>,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    26257
}

fn default_database() -> String {
    "defaultdb".to_string()
}

fn default_username() -> String {
    "root".to_string()
}

fn default_ssl_mode() -> String {
    "verify-full".to_string()
}

impl Default for PgDestinationConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database: default_database(),
            username: default_username(),
            password: None,
            ssl_mode: default_ssl_mode(),
            ssl_root_cert: None,
            connect_timeout_secs: None,
        }
    }
}

impl fmt::Debug for PgDestinationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgDestinationConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("ssl_mode", &self.ssl_mode)
            .field("ssl_root_cert", &self.ssl_root_cert)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

impl PgDestinationConfig {
    pub fn ssl_mode(&self) -> Result<PgSslMode, InvalidChoice> {
        PgSslMode::from_str(&self.ssl_mode).map_err(|_| InvalidChoice {
            what: "ssl mode",
            value: self.ssl_mode.clone(),
            expected: "disable, allow, prefer, require, verify-ca, verify-full",
        })
    }

    pub fn connect_options(&self) -> Result<PgConnectOptions, InvalidChoice> {
        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.username)
            .ssl_mode(self.ssl_mode()?)
            .application_name("jobsync");
        if let Some(password) = &self.password {
            options = options.password(password);
        }
        if let Some(root_cert) = &self.ssl_root_cert {
            options = options.ssl_root_cert(root_cert);
        }
        Ok(options)
    }
}

pub struct PgJobStore {
    pool: PgPool,
    tx: Option<Transaction<'static, Postgres>>,
    null_keys: NullKeyPolicy,
}

impl PgJobStore {
    /// Opens a single-connection pool. Connects eagerly so auth and TLS
    /// failures surface before the source is scanned.
    pub async fn connect(
        config: &PgDestinationConfig,
        null_keys: NullKeyPolicy,
    ) -> Result<Self, StoreError> {
        let options = config.connect_options()?;
        let mut pool_options = PgPoolOptions::new().max_connections(1);
        if let Some(secs) = config.connect_timeout_secs {
            pool_options = pool_options.acquire_timeout(Duration::from_secs(secs));
        }
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|source| StoreError::Connect {
                host: config.host.clone(),
                port: config.port,
                database: config.database.clone(),
                source,
            })?;
        info!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            %null_keys,
            "connected to destination store"
        );
        Ok(Self::from_pool(pool, null_keys))
    }

    pub fn from_pool(pool: PgPool, null_keys: NullKeyPolicy) -> Self {
        Self {
            pool,
            tx: None,
            null_keys,
        }
    }
}

#[async_trait]
impl JobDestination for PgJobStore {
    async fn begin(&mut self) -> Result<(), StoreError> {
        if self.tx.is_some() {
            warn!("transaction already open; reusing it");
            return Ok(());
        }
        self.tx = Some(self.pool.begin().await?);
        debug!("opened destination transaction");
        Ok(())
    }

    async fn exists(&mut self, key: &NaturalKey) -> Result<bool, StoreError> {
        let query = sqlx::query(self.null_keys.exists_sql())
            .bind(key.title.as_deref())
            .bind(key.company.as_deref())
            .bind(key.posted_date.as_deref());
        let found = match self.tx.as_mut() {
            Some(tx) => query.fetch_optional(&mut **tx).await?,
            None => query.fetch_optional(&self.pool).await?,
        };
        Ok(found.is_some())
    }

    async fn insert(&mut self, row: &JobRow) -> Result<(), StoreError> {
        let query = sqlx::query(INSERT_JOB_SQL)
            .bind(row.title.as_deref())
            .bind(row.company.as_deref())
            .bind(row.location.as_deref())
            .bind(row.description.as_deref())
            .bind(&row.skills)
            .bind(row.salary.as_deref())
            .bind(row.job_type.as_deref())
            .bind(row.posted_date.as_deref())
            .bind(row.deadline.as_deref())
            .bind(&row.status)
            .bind(row.email.as_deref());
        match self.tx.as_mut() {
            Some(tx) => query.execute(&mut **tx).await?,
            None => query.execute(&self.pool).await?,
        };
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::NoTransaction)?;
        tx.commit().await?;
        debug!("committed destination transaction");
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
            debug!("rolled back destination transaction");
        }
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(err) = self.rollback().await {
            warn!(error = %err, "rollback during close failed");
        }
        if !self.pool.is_closed() {
            self.pool.close().await;
            info!("closed destination connection");
        }
    }
}
