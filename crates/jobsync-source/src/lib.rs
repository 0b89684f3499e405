//! MongoDB source reader: a lazy, non-restartable scan over the job postings collection.

use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use jobsync_core::JobPosting;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection, Cursor};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "jobsync-source";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("connecting to {uri}: {source}")]
    Connect {
        uri: String,
        #[source]
        source: mongodb::error::Error,
    },
    #[error("scanning collection {collection}: {source}")]
    Scan {
        collection: String,
        #[source]
        source: mongodb::error::Error,
    },
}

/// Produces job postings one at a time until the source is exhausted.
#[async_trait]
pub trait JobSource: Send {
    /// Next posting, or `None` once the scan is exhausted. Never restarts.
    async fn next_posting(&mut self) -> Result<Option<JobPosting>, SourceError>;

    /// Releases the cursor and the connection. Safe to call more than once.
    async fn close(&mut self);
}

#[derive(Clone, Deserialize)]
pub struct MongoSourceConfig {
    #[serde(default = "default_uri")]
    pub uri: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
}

fn default_uri() -> String {
    "mongodb://localhost:27017".to_string()
}

fn default_database() -> String {
    "jobs".to_string()
}

fn default_collection() -> String {
    "jobs".to_string()
}

fn default_app_name() -> String {
    "jobsync".to_string()
}

impl Default for MongoSourceConfig {
    fn default() -> Self {
        Self {
            uri: default_uri(),
            database: default_database(),
            collection: default_collection(),
            app_name: default_app_name(),
            connect_timeout_secs: None,
        }
    }
}

impl std::fmt::Debug for MongoSourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoSourceConfig")
            .field("uri", &redact_uri(&self.uri))
            .field("database", &self.database)
            .field("collection", &self.collection)
            .field("app_name", &self.app_name)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

/// Replaces the userinfo part of a connection URI so it can be logged.
pub fn redact_uri(uri: &str) -> String {
    let Some(scheme_end) = uri.find("://") else {
        return uri.to_string();
    };
    let rest = &uri[scheme_end + 3..];
    // Passwords may hold unencoded '/', so only the query string bounds the userinfo.
    let query_start = rest.find('?').unwrap_or(rest.len());
    match rest[..query_start].rfind('@') {
        Some(at) => format!("{}://***@{}", &uri[..scheme_end], &rest[at + 1..]),
        None => uri.to_string(),
    }
}

enum ScanState {
    NotStarted,
    Open(Cursor<Document>),
    Exhausted,
}

pub struct MongoJobSource {
    client: Option<Client>,
    collection: Collection<Document>,
    scan: ScanState,
}

impl MongoJobSource {
    /// Connects and pings the server. The driver connects lazily, so without the
    /// ping an unreachable server would only surface mid-scan.
    pub async fn connect(config: &MongoSourceConfig) -> Result<Self, SourceError> {
        let connect_err = |source| SourceError::Connect {
            uri: redact_uri(&config.uri),
            source,
        };

        let mut options = ClientOptions::parse(&config.uri).await.map_err(connect_err)?;
        options.app_name = Some(config.app_name.clone());
        if let Some(secs) = config.connect_timeout_secs {
            options.connect_timeout = Some(Duration::from_secs(secs));
            options.server_selection_timeout = Some(Duration::from_secs(secs));
        }

        let client = Client::with_options(options).map_err(connect_err)?;
        let database = client.database(&config.database);
        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(connect_err)?;
        info!(
            uri = %redact_uri(&config.uri),
            database = %config.database,
            collection = %config.collection,
            "connected to source store"
        );

        Ok(Self {
            collection: database.collection::<Document>(&config.collection),
            client: Some(client),
            scan: ScanState::NotStarted,
        })
    }

    fn scan_err(&self, source: mongodb::error::Error) -> SourceError {
        SourceError::Scan {
            collection: self.collection.name().to_string(),
            source,
        }
    }
}

#[async_trait]
impl JobSource for MongoJobSource {
    async fn next_posting(&mut self) -> Result<Option<JobPosting>, SourceError> {
        if matches!(self.scan, ScanState::NotStarted) {
            // Full scan: empty filter, no projection, default order and batching.
            let cursor = self
                .collection
                .find(doc! {})
                .await
                .map_err(|e| self.scan_err(e))?;
            self.scan = ScanState::Open(cursor);
        }

        let ScanState::Open(cursor) = &mut self.scan else {
            return Ok(None);
        };

        match cursor.try_next().await {
            Ok(Some(document)) => {
                if let Ok(id) = document.get_object_id("_id") {
                    debug!(%id, "read source document");
                }
                Ok(Some(posting_from_document(&document)))
            }
            Ok(None) => {
                self.scan = ScanState::Exhausted;
                Ok(None)
            }
            Err(e) => {
                self.scan = ScanState::Exhausted;
                Err(self.scan_err(e))
            }
        }
    }

    async fn close(&mut self) {
        // Shutdown waits on live cursors, so the cursor goes first.
        self.scan = ScanState::Exhausted;
        if let Some(client) = self.client.take() {
            client.shutdown().await;
            info!("closed source connection");
        }
    }
}

/// Coerces a loosely-typed source document into a [`JobPosting`].
pub fn posting_from_document(document: &Document) -> JobPosting {
    JobPosting {
        title: text_field(document, "title"),
        company: text_field(document, "company"),
        location: text_field(document, "location"),
        description: text_field(document, "description"),
        skills: skills_field(document),
        salary: text_field(document, "salary"),
        job_type: text_field(document, "type"),
        posted_date: text_field(document, "posted_date"),
        deadline: text_field(document, "deadline"),
        status: text_field(document, "status"),
        email: text_field(document, "email"),
    }
}

fn text_field(document: &Document, key: &str) -> Option<String> {
    document.get(key).and_then(bson_to_text)
}

fn skills_field(document: &Document) -> Option<Vec<String>> {
    match document.get("skills")? {
        Bson::Array(items) => Some(items.iter().filter_map(bson_to_text).collect()),
        other => bson_to_text(other).map(|skill| vec![skill]),
    }
}

fn bson_to_text(value: &Bson) -> Option<String> {
    match value {
        Bson::Null | Bson::Undefined => None,
        Bson::String(s) => Some(s.clone()),
        Bson::Int32(v) => Some(v.to_string()),
        Bson::Int64(v) => Some(v.to_string()),
        Bson::Double(v) => Some(v.to_string()),
        Bson::Boolean(v) => Some(v.to_string()),
        Bson::DateTime(dt) => Some(
            dt.try_to_rfc3339_string()
                .unwrap_or_else(|_| dt.timestamp_millis().to_string()),
        ),
        other => Some(other.to_string()),
    }
}
