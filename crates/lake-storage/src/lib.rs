//! Relational store, raw-data staging, HTTP fetch and schema migration for the lake.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use lake_core::PipelineError;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::SqliteConnection;
use thiserror::Error;
use tracing::debug;

pub mod domain;
pub mod http;
pub mod migration;
pub mod raw;

pub use http::{
    ApiClient, ApiClientConfig, ApiResponse, BackoffPolicy, FetchError, SimpleTokenBucket,
    TokenBucketConfig,
};
pub use migration::{
    AppliedMigration, MigrationRegistry, MigrationScript, SchemaMigrator, SqlMigration,
    SqliteSchemaMigrator,
};
pub use raw::{params_signature, RawDataCursor, RawDataRecord, RawDataStore};

pub const CRATE_NAME: &str = "lake-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("invalid sql identifier {0:?}")]
    InvalidIdentifier(String),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Sqlx(sqlx::Error::PoolTimedOut) => {
                PipelineError::TransientIo("database pool timed out".to_string())
            }
            StoreError::Sqlx(sqlx::Error::Io(io)) => {
                PipelineError::TransientIo(format!("database i/o: {io}"))
            }
            StoreError::Sqlx(other) => PipelineError::Database(Box::new(other)),
            StoreError::InvalidIdentifier(_) => PipelineError::Configuration(err.to_string()),
            StoreError::Serialization(inner) => PipelineError::Conversion(inner.to_string()),
            StoreError::Message(message) => PipelineError::Database(message.into()),
        }
    }
}

/// Accept only `[a-z0-9_]` names starting with a letter or underscore.
///
/// Table and column names are interpolated into SQL, so every dynamic one goes through here.
pub fn validate_identifier(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let head_ok = chars
        .next()
        .map(|c| c.is_ascii_lowercase() || c == '_')
        .unwrap_or(false);
    if head_ok && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

/// Where a tool-layer or domain-layer row was derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOrigin {
    pub table: String,
    pub params: String,
    pub id: Option<i64>,
}

impl RawOrigin {
    pub fn new(table: impl Into<String>, params: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            params: params.into(),
            id: None,
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }
}

/// Provenance columns every tool and domain table carries.
pub const ORIGIN_COLUMNS_DDL: &str =
    "_raw_data_table TEXT NOT NULL DEFAULT '', _raw_data_params TEXT NOT NULL DEFAULT '', _raw_data_id INTEGER";

/// A row that knows how to upsert itself into its table.
///
/// Implementations must use `INSERT .. ON CONFLICT .. DO UPDATE` keyed by the table's primary key
/// so repeated writes converge.
#[async_trait]
pub trait Record: Send + Sync + fmt::Debug {
    fn table(&self) -> &'static str;

    /// Primary key rendered as text, used for collision detection and logs.
    fn key(&self) -> String;

    async fn upsert(&self, conn: &mut SqliteConnection, origin: &RawOrigin) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://lake.db".to_string(),
            max_connections: 5,
        }
    }
}

/// Shared handle to the relational store.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let in_memory = config.database_url.contains(":memory:");
        let mut options =
            SqliteConnectOptions::from_str(&config.database_url)?.create_if_missing(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        debug!(database_url = %config.database_url, in_memory, "connecting to store");

        // Every pooled connection to `:memory:` would be its own database.
        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(config.max_connections.max(1))
                .connect_with(options)
                .await?
        };

        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect(&StoreConfig {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 1,
        })
        .await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Upsert a batch as one transaction; either every row lands or none does.
    pub async fn upsert_all(
        &self,
        records: &[Box<dyn Record>],
        origin: &RawOrigin,
    ) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        for record in records {
            record.upsert(&mut *tx, origin).await?;
        }
        tx.commit().await?;
        Ok(records.len())
    }

    pub async fn count_rows(&self, table: &str) -> Result<i64, StoreError> {
        validate_identifier(table)?;
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_restricted() {
        assert!(validate_identifier("raw_github_api_pull_requests").is_ok());
        assert!(validate_identifier("_tool_jira_issues").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("raw; DROP TABLE x").is_err());
        assert!(validate_identifier("Raw").is_err());
    }

    #[test]
    fn store_errors_map_into_the_taxonomy() {
        let err: PipelineError = StoreError::InvalidIdentifier("x y".into()).into();
        assert_eq!(err.kind(), "configuration");
        let err: PipelineError = StoreError::Sqlx(sqlx::Error::PoolTimedOut).into();
        assert_eq!(err.kind(), "transient_io");
        let err: PipelineError = StoreError::Sqlx(sqlx::Error::RowNotFound).into();
        assert_eq!(err.kind(), "database");
    }

    #[tokio::test]
    async fn file_backed_store_survives_reconnect() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = StoreConfig {
            database_url: format!("sqlite://{}", dir.path().join("lake.db").display()),
            max_connections: 2,
        };

        let store = Store::connect(&config).await.expect("connect");
        sqlx::query("CREATE TABLE marker (id INTEGER PRIMARY KEY)")
            .execute(store.pool())
            .await
            .expect("create");
        sqlx::query("INSERT INTO marker (id) VALUES (1)")
            .execute(store.pool())
            .await
            .expect("insert");
        store.close().await;

        let reopened = Store::connect(&config).await.expect("reconnect");
        assert_eq!(reopened.count_rows("marker").await.expect("count"), 1);
    }
}
