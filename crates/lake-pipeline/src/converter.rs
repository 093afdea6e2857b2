//! Tool-layer rows into domain-layer rows.

use std::collections::HashSet;

use lake_core::PipelineError;
use lake_storage::{RawOrigin, Record, Store, StoreError};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::FromRow;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Mapping from one input row shape to domain rows.
///
/// `flush` runs once, strictly after every input row has been converted.
pub trait Convertible: Send {
    type Input: for<'r> FromRow<'r, SqliteRow> + Send + Unpin;

    fn convert(&mut self, input: &Self::Input) -> Result<Vec<Box<dyn Record>>, PipelineError>;

    fn flush(&mut self) -> Result<Vec<Box<dyn Record>>, PipelineError> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindValue {
    Int(i64),
    Text(String),
}

impl From<i64> for BindValue {
    fn from(value: i64) -> Self {
        BindValue::Int(value)
    }
}

impl From<u64> for BindValue {
    fn from(value: u64) -> Self {
        BindValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<&str> for BindValue {
    fn from(value: &str) -> Self {
        BindValue::Text(value.to_string())
    }
}

impl From<String> for BindValue {
    fn from(value: String) -> Self {
        BindValue::Text(value)
    }
}

pub struct DataConverterArgs<C> {
    /// Must carry an `ORDER BY` so paging is stable; `LIMIT ? OFFSET ?` is appended.
    pub input_sql: String,
    pub binds: Vec<BindValue>,
    /// Provenance stamped on every emitted row.
    pub origin: RawOrigin,
    pub batch_size: usize,
    pub convertible: C,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConvertSummary {
    pub inputs: usize,
    pub rows: usize,
    pub flushed: usize,
}

pub struct DataConverter<C> {
    args: DataConverterArgs<C>,
    seen: HashSet<(&'static str, String)>,
}

impl<C: Convertible> DataConverter<C> {
    pub fn new(args: DataConverterArgs<C>) -> Self {
        Self {
            args,
            seen: HashSet::new(),
        }
    }

    pub fn into_inner(self) -> C {
        self.args.convertible
    }

    async fn fetch_batch(&self, store: &Store, offset: i64) -> Result<Vec<C::Input>, StoreError> {
        let sql = format!("{} LIMIT ? OFFSET ?", self.args.input_sql);
        let mut query = sqlx::query_as::<_, C::Input>(&sql);
        for value in &self.args.binds {
            query = match value {
                BindValue::Int(v) => query.bind(*v),
                BindValue::Text(v) => query.bind(v.clone()),
            };
        }
        let limit = i64::try_from(self.args.batch_size.max(1)).unwrap_or(i64::MAX);
        Ok(query.bind(limit).bind(offset).fetch_all(store.pool()).await?)
    }

    fn check_collisions(&mut self, rows: &[Box<dyn Record>]) -> Result<(), PipelineError> {
        for row in rows {
            if !self.seen.insert((row.table(), row.key())) {
                return Err(PipelineError::conversion(format!(
                    "identity collision in {}: key {} emitted twice",
                    row.table(),
                    row.key()
                )));
            }
        }
        Ok(())
    }

    pub async fn execute(
        &mut self,
        store: &Store,
        cancel: &CancellationToken,
    ) -> Result<ConvertSummary, PipelineError> {
        self.seen.clear();
        let mut summary = ConvertSummary::default();
        let mut offset = 0i64;

        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let batch = self.fetch_batch(store, offset).await?;
            if batch.is_empty() {
                break;
            }
            offset += i64::try_from(batch.len()).unwrap_or(i64::MAX);

            for input in &batch {
                if cancel.is_cancelled() {
                    return Err(PipelineError::Cancelled);
                }
                let rows = self.args.convertible.convert(input)?;
                self.check_collisions(&rows)?;
                summary.rows += store.upsert_all(&rows, &self.args.origin).await?;
                summary.inputs += 1;
            }

            if batch.len() < self.args.batch_size.max(1) {
                break;
            }
        }

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let flushed = self.args.convertible.flush()?;
        self.check_collisions(&flushed)?;
        summary.flushed = store.upsert_all(&flushed, &self.args.origin).await?;

        info!(
            inputs = summary.inputs,
            rows = summary.rows,
            flushed = summary.flushed,
            "conversion finished"
        );
        Ok(summary)
    }
}
