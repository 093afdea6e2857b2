//! Append-only staging of raw API payloads, partitioned by a params signature.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};
use sqlx::Row;

use crate::{validate_identifier, Store, StoreError};

const COLLECTOR_STATE_TABLE: &str = "_lake_collector_state";
const DEFAULT_SCAN_BATCH: i64 = 500;

/// Canonical JSON for a partition: object keys sorted at every level.
pub fn params_signature<T: Serialize + ?Sized>(params: &T) -> Result<String, StoreError> {
    let value = serde_json::to_value(params)?;
    Ok(canonicalize(value).to_string())
}

fn canonicalize(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let mut entries: Vec<(String, JsonValue)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, canonicalize(value));
            }
            JsonValue::Object(sorted)
        }
        JsonValue::Array(items) => JsonValue::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// One staged fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDataRecord {
    pub table: String,
    pub id: i64,
    pub params: String,
    pub data: Vec<u8>,
    pub url: Option<String>,
    pub input: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RawDataRecord {
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }

    pub fn input_value(&self) -> Result<Option<JsonValue>, serde_json::Error> {
        self.input
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
    }
}

#[derive(Debug, Clone)]
pub struct RawDataStore {
    store: Store,
    known_tables: Arc<Mutex<HashSet<String>>>,
}

impl RawDataStore {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            known_tables: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn is_known(&self, table: &str) -> bool {
        self.known_tables
            .lock()
            .map(|known| known.contains(table))
            .unwrap_or(false)
    }

    fn mark_known(&self, table: &str) {
        if let Ok(mut known) = self.known_tables.lock() {
            known.insert(table.to_string());
        }
    }

    /// Create `table` on first use. Names must look like `raw_<plugin>_<table>`.
    pub async fn ensure_table(&self, table: &str) -> Result<(), StoreError> {
        if self.is_known(table) {
            return Ok(());
        }
        validate_identifier(table)?;
        if !table.starts_with("raw_") {
            return Err(StoreError::InvalidIdentifier(table.to_string()));
        }

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                params TEXT NOT NULL,
                data BLOB NOT NULL,
                url TEXT,
                input TEXT,
                content_hash TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"
        ))
        .execute(self.store.pool())
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_params ON {table}(params)"
        ))
        .execute(self.store.pool())
        .await?;

        self.mark_known(table);
        Ok(())
    }

    /// Persist one fragment and return its id. Duplicate content is accepted.
    pub async fn append(
        &self,
        table: &str,
        params: &str,
        data: &[u8],
        url: Option<&str>,
        input: Option<&str>,
    ) -> Result<i64, StoreError> {
        self.ensure_table(table).await?;
        let result = sqlx::query(&format!(
            "INSERT INTO {table} (params, data, url, input, content_hash, created_at)
             VALUES (?, ?, ?, ?, ?, ?)"
        ))
        .bind(params)
        .bind(data)
        .bind(url)
        .bind(input)
        .bind(Self::sha256_hex(data))
        .bind(Utc::now())
        .execute(self.store.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub fn scan(&self, table: &str, params: &str) -> RawDataCursor {
        self.scan_from(table, params, 0)
    }

    /// Resume a scan after `after_id` (exclusive).
    pub fn scan_from(&self, table: &str, params: &str, after_id: i64) -> RawDataCursor {
        RawDataCursor {
            raw: self.clone(),
            table: table.to_string(),
            params: params.to_string(),
            last_id: after_id,
            batch_size: DEFAULT_SCAN_BATCH,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub async fn count(&self, table: &str, params: &str) -> Result<i64, StoreError> {
        self.ensure_table(table).await?;
        let count: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table} WHERE params = ?"))
                .bind(params)
                .fetch_one(self.store.pool())
                .await?;
        Ok(count)
    }

    /// Content hashes of a partition in id order.
    pub async fn content_hashes(&self, table: &str, params: &str) -> Result<Vec<String>, StoreError> {
        self.ensure_table(table).await?;
        let hashes: Vec<String> = sqlx::query_scalar(&format!(
            "SELECT content_hash FROM {table} WHERE params = ? ORDER BY id ASC"
        ))
        .bind(params)
        .fetch_all(self.store.pool())
        .await?;
        Ok(hashes)
    }

    pub async fn delete_partition(&self, table: &str, params: &str) -> Result<u64, StoreError> {
        self.ensure_table(table).await?;
        let result = sqlx::query(&format!("DELETE FROM {table} WHERE params = ?"))
            .bind(params)
            .execute(self.store.pool())
            .await?;
        Ok(result.rows_affected())
    }

    async fn ensure_state_table(&self) -> Result<(), StoreError> {
        if self.is_known(COLLECTOR_STATE_TABLE) {
            return Ok(());
        }
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS _lake_collector_state (
                raw_table TEXT NOT NULL,
                params TEXT NOT NULL,
                latest_success_start TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (raw_table, params)
            )",
        )
        .execute(self.store.pool())
        .await?;
        self.mark_known(COLLECTOR_STATE_TABLE);
        Ok(())
    }

    /// Start time of the last fully successful collection of this partition.
    pub async fn collector_state(
        &self,
        raw_table: &str,
        params: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.ensure_state_table().await?;
        let since: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT latest_success_start FROM _lake_collector_state WHERE raw_table = ? AND params = ?",
        )
        .bind(raw_table)
        .bind(params)
        .fetch_optional(self.store.pool())
        .await?;
        Ok(since)
    }

    pub async fn save_collector_state(
        &self,
        raw_table: &str,
        params: &str,
        latest_success_start: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.ensure_state_table().await?;
        sqlx::query(
            "INSERT INTO _lake_collector_state (raw_table, params, latest_success_start, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(raw_table, params) DO UPDATE SET
                latest_success_start = excluded.latest_success_start,
                updated_at = excluded.updated_at",
        )
        .bind(raw_table)
        .bind(params)
        .bind(latest_success_start)
        .bind(Utc::now())
        .execute(self.store.pool())
        .await?;
        Ok(())
    }
}

/// Lazy, restartable scan of one partition in ascending id order.
///
/// Rows are fetched in keyset batches so no connection is held between calls.
#[derive(Debug)]
pub struct RawDataCursor {
    raw: RawDataStore,
    table: String,
    params: String,
    last_id: i64,
    batch_size: i64,
    buffer: VecDeque<RawDataRecord>,
    exhausted: bool,
}

impl RawDataCursor {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = i64::try_from(batch_size.max(1)).unwrap_or(DEFAULT_SCAN_BATCH);
        self
    }

    /// Id of the last record handed out; pass it to [`RawDataStore::scan_from`] to resume.
    pub fn position(&self) -> i64 {
        self.last_id
    }

    pub async fn next_record(&mut self) -> Result<Option<RawDataRecord>, StoreError> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fill().await?;
        }
        match self.buffer.pop_front() {
            Some(record) => {
                self.last_id = record.id;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn fill(&mut self) -> Result<(), StoreError> {
        self.raw.ensure_table(&self.table).await?;
        let after = self.buffer.back().map(|r| r.id).unwrap_or(self.last_id);
        let rows = sqlx::query(&format!(
            "SELECT id, params, data, url, input, created_at FROM {}
             WHERE params = ? AND id > ? ORDER BY id ASC LIMIT ?",
            self.table
        ))
        .bind(&self.params)
        .bind(after)
        .bind(self.batch_size)
        .fetch_all(self.raw.store.pool())
        .await?;

        if (rows.len() as i64) < self.batch_size {
            self.exhausted = true;
        }
        for row in rows {
            self.buffer.push_back(RawDataRecord {
                table: self.table.clone(),
                id: row.try_get("id")?,
                params: row.try_get("params")?,
                data: row.try_get("data")?,
                url: row.try_get("url")?,
                input: row.try_get("input")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(())
    }
}
