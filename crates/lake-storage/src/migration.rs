//! Versioned schema evolution with a per-owner applied-version watermark.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::Utc;
use lake_core::PipelineError;
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::{info, warn};

use crate::{validate_identifier, Store, StoreError};

/// Schema operations available to migration scripts.
#[async_trait]
pub trait SchemaMigrator: Send {
    async fn execute(&mut self, sql: &str) -> Result<(), StoreError>;

    async fn has_table(&mut self, table: &str) -> Result<bool, StoreError>;

    async fn has_column(&mut self, table: &str, column: &str) -> Result<bool, StoreError>;

    /// Skipped when `from` is gone and `to` already exists.
    async fn rename_table(&mut self, from: &str, to: &str) -> Result<(), StoreError>;

    /// Skipped when `from` is gone and `to` already exists.
    async fn rename_column(&mut self, table: &str, from: &str, to: &str) -> Result<(), StoreError>;

    /// No-op when the column is already present.
    async fn add_column(&mut self, table: &str, column: &str, definition: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteSchemaMigrator {
    pool: SqlitePool,
}

impl SqliteSchemaMigrator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SchemaMigrator for SqliteSchemaMigrator {
    async fn execute(&mut self, sql: &str) -> Result<(), StoreError> {
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn has_table(&mut self, table: &str) -> Result<bool, StoreError> {
        let found = sqlx::query_scalar::<_, i64>(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ? LIMIT 1",
        )
        .bind(table)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    async fn has_column(&mut self, table: &str, column: &str) -> Result<bool, StoreError> {
        let found = sqlx::query_scalar::<_, i64>(
            "SELECT 1 FROM pragma_table_info(?) WHERE name = ? LIMIT 1",
        )
        .bind(table)
        .bind(column)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    async fn rename_table(&mut self, from: &str, to: &str) -> Result<(), StoreError> {
        validate_identifier(from)?;
        validate_identifier(to)?;
        if !self.has_table(from).await? && self.has_table(to).await? {
            warn!(from, to, "table already renamed, skipping");
            return Ok(());
        }
        self.execute(&format!("ALTER TABLE {from} RENAME TO {to}")).await
    }

    async fn rename_column(&mut self, table: &str, from: &str, to: &str) -> Result<(), StoreError> {
        validate_identifier(table)?;
        validate_identifier(from)?;
        validate_identifier(to)?;
        if !self.has_column(table, from).await? && self.has_column(table, to).await? {
            warn!(table, from, to, "column already renamed, skipping");
            return Ok(());
        }
        self.execute(&format!("ALTER TABLE {table} RENAME COLUMN {from} TO {to}"))
            .await
    }

    async fn add_column(&mut self, table: &str, column: &str, definition: &str) -> Result<(), StoreError> {
        validate_identifier(table)?;
        validate_identifier(column)?;
        if self.has_column(table, column).await? {
            return Ok(());
        }
        self.execute(&format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"))
            .await
    }
}

#[async_trait]
pub trait MigrationScript: Send + Sync {
    /// Usually a `YYYYMMDDhhmmss` timestamp.
    fn version(&self) -> u64;

    fn owner(&self) -> &'static str;

    fn name(&self) -> &'static str;

    async fn up(&self, schema: &mut dyn SchemaMigrator) -> Result<(), StoreError>;
}

impl fmt::Debug for dyn MigrationScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationScript")
            .field("owner", &self.owner())
            .field("version", &self.version())
            .field("name", &self.name())
            .finish()
    }
}

/// A script that is nothing more than a list of statements.
#[derive(Debug, Clone, Copy)]
pub struct SqlMigration {
    pub version: u64,
    pub owner: &'static str,
    pub name: &'static str,
    pub statements: &'static [&'static str],
}

#[async_trait]
impl MigrationScript for SqlMigration {
    fn version(&self) -> u64 {
        self.version
    }

    fn owner(&self) -> &'static str {
        self.owner
    }

    fn name(&self) -> &'static str {
        self.name
    }

    async fn up(&self, schema: &mut dyn SchemaMigrator) -> Result<(), StoreError> {
        for statement in self.statements {
            schema.execute(statement).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMigration {
    pub owner: String,
    pub version: u64,
    pub name: String,
}

#[derive(Debug, Default)]
pub struct MigrationRegistry {
    scripts: Vec<Box<dyn MigrationScript>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, script: Box<dyn MigrationScript>) -> Result<(), PipelineError> {
        if self
            .scripts
            .iter()
            .any(|s| s.owner() == script.owner() && s.version() == script.version())
        {
            return Err(PipelineError::config(format!(
                "duplicate migration {}/{}",
                script.owner(),
                script.version()
            )));
        }
        let at = self
            .scripts
            .partition_point(|s| (s.version(), s.owner()) <= (script.version(), script.owner()));
        self.scripts.insert(at, script);
        Ok(())
    }

    pub fn register_all(
        &mut self,
        scripts: impl IntoIterator<Item = Box<dyn MigrationScript>>,
    ) -> Result<(), PipelineError> {
        for script in scripts {
            self.register(script)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    /// Apply every script above its owner's watermark, in ascending version order.
    pub async fn execute(&self, store: &Store) -> Result<Vec<AppliedMigration>, PipelineError> {
        bootstrap(store).await?;
        let mut watermarks = load_watermarks(store).await?;
        let mut migrator = SqliteSchemaMigrator::new(store.pool().clone());
        let mut applied = Vec::new();

        for script in &self.scripts {
            let owner = script.owner();
            let version = script.version();
            if watermarks.get(owner).is_some_and(|mark| version <= *mark) {
                continue;
            }

            let stored_version = i64::try_from(version).map_err(|_| {
                PipelineError::config(format!("migration version {version} out of range"))
            })?;

            info!(owner, version, name = script.name(), "applying migration");
            script
                .up(&mut migrator)
                .await
                .map_err(|err| PipelineError::Schema {
                    owner: owner.to_string(),
                    version,
                    name: script.name().to_string(),
                    reason: err.to_string(),
                })?;

            record_applied(store, owner, stored_version, script.name()).await?;
            watermarks.insert(owner.to_string(), version);
            applied.push(AppliedMigration {
                owner: owner.to_string(),
                version,
                name: script.name().to_string(),
            });
        }

        Ok(applied)
    }
}

async fn bootstrap(store: &Store) -> Result<(), StoreError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS _lake_migration_watermarks (
            owner TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        )",
    )
    .execute(store.pool())
    .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS _lake_migration_history (
            version INTEGER NOT NULL,
            owner TEXT NOT NULL,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL,
            PRIMARY KEY (owner, version)
        )",
    )
    .execute(store.pool())
    .await?;
    Ok(())
}

async fn load_watermarks(store: &Store) -> Result<HashMap<String, u64>, StoreError> {
    let rows = sqlx::query("SELECT owner, version FROM _lake_migration_watermarks")
        .fetch_all(store.pool())
        .await?;
    let mut marks = HashMap::with_capacity(rows.len());
    for row in rows {
        let owner: String = row.try_get("owner")?;
        let version: i64 = row.try_get("version")?;
        marks.insert(owner, u64::try_from(version).unwrap_or(0));
    }
    Ok(marks)
}

async fn record_applied(store: &Store, owner: &str, version: i64, name: &str) -> Result<(), StoreError> {
    let now = Utc::now();
    let mut tx = store.pool().begin().await?;
    sqlx::query(
        "INSERT INTO _lake_migration_watermarks (owner, version, updated_at) VALUES (?, ?, ?)
         ON CONFLICT(owner) DO UPDATE SET version = excluded.version, updated_at = excluded.updated_at",
    )
    .bind(owner)
    .bind(version)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "INSERT OR REPLACE INTO _lake_migration_history (version, owner, name, applied_at)
         VALUES (?, ?, ?, ?)",
    )
    .bind(version)
    .bind(owner)
    .bind(name)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}
