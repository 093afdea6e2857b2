//! Raw records into tool-layer rows.

use lake_core::PipelineError;
use lake_storage::{RawDataRecord, RawDataStore, RawOrigin, Record};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What to do with a raw record that cannot be parsed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractFailurePolicy {
    #[default]
    Abort,
    Skip,
}

pub trait Extractable: Send + Sync {
    /// Every record returned for one raw record is written in one transaction.
    fn extract(&self, record: &RawDataRecord) -> Result<Vec<Box<dyn Record>>, PipelineError>;
}

/// Decode a raw payload, reporting failures against the record.
pub fn parse_raw<T: DeserializeOwned>(record: &RawDataRecord) -> Result<T, PipelineError> {
    record.parse().map_err(|err| malformed(record, err))
}

pub fn malformed(record: &RawDataRecord, reason: impl ToString) -> PipelineError {
    PipelineError::MalformedData {
        table: record.table.clone(),
        record_id: record.id,
        reason: reason.to_string(),
    }
}

pub struct ApiExtractorArgs<E> {
    pub raw_table: String,
    pub params: String,
    pub batch_size: usize,
    pub failure_policy: ExtractFailurePolicy,
    pub extractable: E,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExtractSummary {
    pub records: usize,
    pub rows: usize,
    pub skipped: usize,
}

pub struct ApiExtractor<E> {
    args: ApiExtractorArgs<E>,
}

impl<E: Extractable> ApiExtractor<E> {
    pub fn new(args: ApiExtractorArgs<E>) -> Self {
        Self { args }
    }

    pub async fn execute(
        &self,
        raw: &RawDataStore,
        cancel: &CancellationToken,
    ) -> Result<ExtractSummary, PipelineError> {
        let args = &self.args;
        let mut cursor = raw
            .scan(&args.raw_table, &args.params)
            .with_batch_size(args.batch_size);
        let mut summary = ExtractSummary::default();

        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let Some(record) = cursor.next_record().await? else {
                break;
            };
            summary.records += 1;

            let rows = match args.extractable.extract(&record) {
                Ok(rows) => rows,
                // Only undecodable payloads are subject to the failure policy.
                Err(err @ PipelineError::MalformedData { .. }) => {
                    match args.failure_policy {
                        ExtractFailurePolicy::Abort => return Err(err),
                        ExtractFailurePolicy::Skip => {
                            warn!(error = %err, "skipping malformed raw record");
                            summary.skipped += 1;
                            continue;
                        }
                    }
                }
                Err(err) => return Err(err),
            };

            let origin = RawOrigin::new(&args.raw_table, &args.params).with_id(record.id);
            summary.rows += raw.store().upsert_all(&rows, &origin).await?;
        }

        info!(
            table = %args.raw_table,
            records = summary.records,
            rows = summary.rows,
            skipped = summary.skipped,
            "extraction finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lake_storage::{Store, StoreError};
    use sqlx::SqliteConnection;

    #[derive(Debug)]
    struct Item {
        id: i64,
        name: String,
    }

    #[async_trait]
    impl Record for Item {
        fn table(&self) -> &'static str {
            "_tool_test_items"
        }

        fn key(&self) -> String {
            self.id.to_string()
        }

        async fn upsert(&self, conn: &mut SqliteConnection, origin: &RawOrigin) -> Result<(), StoreError> {
            sqlx::query(
                "INSERT INTO _tool_test_items (id, name, _raw_data_id) VALUES (?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, _raw_data_id = excluded._raw_data_id",
            )
            .bind(self.id)
            .bind(&self.name)
            .bind(origin.id)
            .execute(conn)
            .await?;
            Ok(())
        }
    }

    #[derive(Deserialize)]
    struct ApiItem {
        id: i64,
        name: String,
    }

    struct Items;

    impl Extractable for Items {
        fn extract(&self, record: &RawDataRecord) -> Result<Vec<Box<dyn Record>>, PipelineError> {
            let item: ApiItem = parse_raw(record)?;
            Ok(vec![Box::new(Item {
                id: item.id,
                name: item.name,
            })])
        }
    }

    async fn seeded() -> RawDataStore {
        let store = Store::in_memory().await.expect("store");
        sqlx::query("CREATE TABLE _tool_test_items (id INTEGER PRIMARY KEY, name TEXT, _raw_data_id INTEGER)")
            .execute(store.pool())
            .await
            .expect("create");
        let raw = RawDataStore::new(store);
        for payload in [r#"{"id":1,"name":"a"}"#, r#"{"id":"oops"}"#, r#"{"id":2,"name":"b"}"#] {
            raw.append("raw_test_items", "p", payload.as_bytes(), None, None)
                .await
                .expect("append");
        }
        raw
    }

    fn extractor(policy: ExtractFailurePolicy) -> ApiExtractor<Items> {
        ApiExtractor::new(ApiExtractorArgs {
            raw_table: "raw_test_items".into(),
            params: "p".into(),
            batch_size: 2,
            failure_policy: policy,
            extractable: Items,
        })
    }

    #[tokio::test]
    async fn abort_policy_stops_on_first_malformed_record() {
        let raw = seeded().await;
        let err = extractor(ExtractFailurePolicy::Abort)
            .execute(&raw, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            PipelineError::MalformedData { table, record_id, .. } => {
                assert_eq!(table, "raw_test_items");
                assert_eq!(record_id, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(raw.store().count_rows("_tool_test_items").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn skip_policy_counts_and_continues() {
        let raw = seeded().await;
        let summary = extractor(ExtractFailurePolicy::Skip)
            .execute(&raw, &CancellationToken::new())
            .await
            .expect("extract");
        assert_eq!(
            summary,
            ExtractSummary {
                records: 3,
                rows: 2,
                skipped: 1
            }
        );
    }

    #[tokio::test]
    async fn rerunning_extraction_is_idempotent() {
        let raw = seeded().await;
        let policy = ExtractFailurePolicy::Skip;
        extractor(policy).execute(&raw, &CancellationToken::new()).await.unwrap();
        extractor(policy).execute(&raw, &CancellationToken::new()).await.unwrap();
        assert_eq!(raw.store().count_rows("_tool_test_items").await.unwrap(), 2);
    }

    struct RejectsSecond;

    impl Extractable for RejectsSecond {
        fn extract(&self, record: &RawDataRecord) -> Result<Vec<Box<dyn Record>>, PipelineError> {
            if record.id == 2 {
                return Err(PipelineError::conversion("no mapping for item"));
            }
            Items.extract(record)
        }
    }

    #[tokio::test]
    async fn skip_policy_does_not_swallow_other_failures() {
        let raw = seeded().await;
        let err = ApiExtractor::new(ApiExtractorArgs {
            raw_table: "raw_test_items".into(),
            params: "p".into(),
            batch_size: 2,
            failure_policy: ExtractFailurePolicy::Skip,
            extractable: RejectsSecond,
        })
        .execute(&raw, &CancellationToken::new())
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "conversion");
        assert_eq!(raw.store().count_rows("_tool_test_items").await.unwrap(), 1);
    }

    #[test]
    fn failure_policy_deserializes_lowercase() {
        let policy: ExtractFailurePolicy = serde_json::from_str("\"skip\"").unwrap();
        assert_eq!(policy, ExtractFailurePolicy::Skip);
    }
}
