//! Tapd workspaces: iterations and bug changelogs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use lake_core::PipelineError;
use lake_pipeline::{
    parse_json_field_array, parse_raw, ApiCollector, ApiCollectorArgs, ApiExtractor,
    ApiExtractorArgs, Collectible, Extractable, LakeConfig, Plugin, RequestData, SubTaskContext,
    SubTaskMeta, TaskInvocation,
};
use lake_storage::{
    params_signature, ApiClient, ApiResponse, MigrationScript, RawDataRecord, RawOrigin, Record,
    SqlMigration, StoreError,
};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use sqlx::SqliteConnection;
use tracing::debug;

use crate::common::{int_from_any, null_as_empty, timestamp};

pub const PLUGIN_NAME: &str = "tapd";
pub const RAW_ITERATION_TABLE: &str = "raw_tapd_api_iterations";
pub const RAW_BUG_CHANGELOG_TABLE: &str = "raw_tapd_api_bug_changelogs";

const PAGE_SIZE: u64 = 100;
const BATCH_SIZE: usize = 500;

/// Bug change fields whose values are iteration names.
const ITERATION_FIELDS: &[&str] = &["iteration_id", "iteration"];

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TapdOptions {
    pub connection_id: i64,
    pub workspace_id: i64,
}

pub struct TapdTaskData {
    pub options: TapdOptions,
    pub params: String,
    pub client: ApiClient,
}

pub struct TapdPlugin;

#[async_trait]
impl Plugin for TapdPlugin {
    type TaskData = TapdTaskData;

    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn subtask_metas(&self) -> Vec<SubTaskMeta<TapdTaskData>> {
        vec![
            SubTaskMeta {
                name: "collectIterations",
                entry_point: collect_iterations,
                enabled_by_default: true,
                description: "Collect workspace iterations",
                depends_on: &[],
            },
            SubTaskMeta {
                name: "extractIterations",
                entry_point: extract_iterations,
                enabled_by_default: true,
                description: "Extract iterations into _tool_tapd_iterations",
                depends_on: &["collectIterations"],
            },
            SubTaskMeta {
                name: "collectBugChangelogs",
                entry_point: collect_bug_changelogs,
                enabled_by_default: true,
                description: "Collect bug change history",
                depends_on: &[],
            },
            SubTaskMeta {
                name: "extractBugChangelogs",
                entry_point: extract_bug_changelogs,
                enabled_by_default: true,
                description: "Extract bug changelogs, resolving iteration names",
                depends_on: &["collectBugChangelogs", "extractIterations"],
            },
        ]
    }

    fn migration_scripts(&self) -> Vec<Box<dyn MigrationScript>> {
        vec![Box::new(SqlMigration {
            version: 20220425000001,
            owner: "Tapd",
            name: "Init tapd schemas",
            statements: &[
                "CREATE TABLE IF NOT EXISTS _tool_tapd_iterations (
                    connection_id INTEGER NOT NULL,
                    id INTEGER NOT NULL,
                    workspace_id INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT '',
                    startdate TEXT NOT NULL DEFAULT '',
                    enddate TEXT NOT NULL DEFAULT '',
                    _raw_data_table TEXT NOT NULL DEFAULT '',
                    _raw_data_params TEXT NOT NULL DEFAULT '',
                    _raw_data_id INTEGER,
                    PRIMARY KEY (connection_id, id)
                )",
                "CREATE TABLE IF NOT EXISTS _tool_tapd_bug_changelogs (
                    connection_id INTEGER NOT NULL,
                    id INTEGER NOT NULL,
                    workspace_id INTEGER NOT NULL,
                    bug_id INTEGER NOT NULL,
                    author TEXT NOT NULL DEFAULT '',
                    created TEXT NOT NULL,
                    _raw_data_table TEXT NOT NULL DEFAULT '',
                    _raw_data_params TEXT NOT NULL DEFAULT '',
                    _raw_data_id INTEGER,
                    PRIMARY KEY (connection_id, id)
                )",
                "CREATE TABLE IF NOT EXISTS _tool_tapd_bug_changelog_items (
                    connection_id INTEGER NOT NULL,
                    changelog_id INTEGER NOT NULL,
                    field TEXT NOT NULL,
                    value_before TEXT NOT NULL DEFAULT '',
                    value_after TEXT NOT NULL DEFAULT '',
                    iteration_id_from INTEGER,
                    iteration_id_to INTEGER,
                    _raw_data_table TEXT NOT NULL DEFAULT '',
                    _raw_data_params TEXT NOT NULL DEFAULT '',
                    _raw_data_id INTEGER,
                    PRIMARY KEY (connection_id, changelog_id, field)
                )",
            ],
        })]
    }

    async fn prepare_task_data(
        &self,
        invocation: &TaskInvocation,
        config: &LakeConfig,
    ) -> Result<TapdTaskData, PipelineError> {
        let options: TapdOptions = invocation.typed_options()?;
        if options.workspace_id <= 0 {
            return Err(PipelineError::config("tapd: workspace_id must be positive"));
        }
        Ok(TapdTaskData {
            params: params_signature(&options)?,
            client: invocation.connection.api_client(config)?,
            options,
        })
    }
}

struct WorkspacePages {
    workspace_id: i64,
}

impl Collectible for WorkspacePages {
    fn parse_response(&self, response: &ApiResponse) -> Result<Vec<Box<RawValue>>, PipelineError> {
        parse_json_field_array(response, "data")
    }

    fn query(&self, request: &RequestData<'_>) -> Vec<(String, String)> {
        vec![
            ("workspace_id".to_string(), self.workspace_id.to_string()),
            ("page".to_string(), request.page.to_string()),
            (
                "limit".to_string(),
                request.page_size.unwrap_or(PAGE_SIZE).to_string(),
            ),
        ]
    }

    fn is_last_page(&self, request: &RequestData<'_>, fragments: &[Box<RawValue>]) -> bool {
        request
            .page_size
            .is_some_and(|size| (fragments.len() as u64) < size)
    }
}

fn collector(
    ctx: &SubTaskContext<TapdTaskData>,
    raw_table: &str,
    path: &str,
) -> Result<ApiCollector<WorkspacePages>, PipelineError> {
    let data = ctx.data();
    ApiCollector::new(ApiCollectorArgs {
        raw_table: raw_table.to_string(),
        params: data.params.clone(),
        client: data.client.clone(),
        url_template: path.to_string(),
        page_size: Some(PAGE_SIZE),
        incremental: false,
        input: None,
        collectible: WorkspacePages {
            workspace_id: data.options.workspace_id,
        },
    })
}

fn collect_iterations(ctx: &SubTaskContext<TapdTaskData>) -> BoxFuture<'_, Result<(), PipelineError>> {
    Box::pin(async move {
        collector(ctx, RAW_ITERATION_TABLE, "iterations")?
            .execute(ctx.raw_store(), ctx.cancellation())
            .await?;
        Ok(())
    })
}

fn collect_bug_changelogs(ctx: &SubTaskContext<TapdTaskData>) -> BoxFuture<'_, Result<(), PipelineError>> {
    Box::pin(async move {
        collector(ctx, RAW_BUG_CHANGELOG_TABLE, "bug_changes")?
            .execute(ctx.raw_store(), ctx.cancellation())
            .await?;
        Ok(())
    })
}

#[derive(Debug, Deserialize)]
struct ApiIteration {
    #[serde(deserialize_with = "int_from_any")]
    id: i64,
    #[serde(deserialize_with = "int_from_any")]
    workspace_id: i64,
    name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    status: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    startdate: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    enddate: String,
}

#[derive(Debug, Deserialize)]
struct IterationEnvelope {
    #[serde(rename = "Iteration")]
    iteration: ApiIteration,
}

/// `_tool_tapd_iterations`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapdIteration {
    pub connection_id: i64,
    pub id: i64,
    pub workspace_id: i64,
    pub name: String,
    pub status: String,
    pub startdate: String,
    pub enddate: String,
}

#[async_trait]
impl Record for TapdIteration {
    fn table(&self) -> &'static str {
        "_tool_tapd_iterations"
    }

    fn key(&self) -> String {
        format!("{}|{}", self.connection_id, self.id)
    }

    async fn upsert(&self, conn: &mut SqliteConnection, origin: &RawOrigin) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO _tool_tapd_iterations (
                connection_id, id, workspace_id, name, status, startdate, enddate,
                _raw_data_table, _raw_data_params, _raw_data_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(connection_id, id) DO UPDATE SET
                workspace_id = excluded.workspace_id,
                name = excluded.name,
                status = excluded.status,
                startdate = excluded.startdate,
                enddate = excluded.enddate,
                _raw_data_table = excluded._raw_data_table,
                _raw_data_params = excluded._raw_data_params,
                _raw_data_id = excluded._raw_data_id",
        )
        .bind(self.connection_id)
        .bind(self.id)
        .bind(self.workspace_id)
        .bind(&self.name)
        .bind(&self.status)
        .bind(&self.startdate)
        .bind(&self.enddate)
        .bind(&origin.table)
        .bind(&origin.params)
        .bind(origin.id)
        .execute(conn)
        .await?;
        Ok(())
    }
}

pub struct IterationExtractor {
    pub connection_id: i64,
}

impl Extractable for IterationExtractor {
    fn extract(&self, record: &RawDataRecord) -> Result<Vec<Box<dyn Record>>, PipelineError> {
        let IterationEnvelope { iteration } = parse_raw(record)?;
        Ok(vec![Box::new(TapdIteration {
            connection_id: self.connection_id,
            id: iteration.id,
            workspace_id: iteration.workspace_id,
            name: iteration.name,
            status: iteration.status,
            startdate: iteration.startdate,
            enddate: iteration.enddate,
        })])
    }
}

fn extract_iterations(ctx: &SubTaskContext<TapdTaskData>) -> BoxFuture<'_, Result<(), PipelineError>> {
    Box::pin(async move {
        let data = ctx.data();
        ApiExtractor::new(ApiExtractorArgs {
            raw_table: RAW_ITERATION_TABLE.to_string(),
            params: data.params.clone(),
            batch_size: BATCH_SIZE,
            failure_policy: ctx.extract_failure_policy(),
            extractable: IterationExtractor {
                connection_id: data.options.connection_id,
            },
        })
        .execute(ctx.raw_store(), ctx.cancellation())
        .await?;
        Ok(())
    })
}

#[derive(Debug, Deserialize)]
struct ApiBugChange {
    #[serde(deserialize_with = "int_from_any")]
    id: i64,
    #[serde(deserialize_with = "int_from_any")]
    workspace_id: i64,
    #[serde(deserialize_with = "int_from_any")]
    bug_id: i64,
    #[serde(default, deserialize_with = "null_as_empty")]
    author: String,
    field: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    old_value: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    new_value: String,
    #[serde(deserialize_with = "timestamp")]
    created: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct BugChangeEnvelope {
    #[serde(rename = "BugChange")]
    change: ApiBugChange,
}

/// `_tool_tapd_bug_changelogs`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapdBugChangelog {
    pub connection_id: i64,
    pub id: i64,
    pub workspace_id: i64,
    pub bug_id: i64,
    pub author: String,
    pub created: DateTime<Utc>,
}

#[async_trait]
impl Record for TapdBugChangelog {
    fn table(&self) -> &'static str {
        "_tool_tapd_bug_changelogs"
    }

    fn key(&self) -> String {
        format!("{}|{}", self.connection_id, self.id)
    }

    async fn upsert(&self, conn: &mut SqliteConnection, origin: &RawOrigin) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO _tool_tapd_bug_changelogs (
                connection_id, id, workspace_id, bug_id, author, created,
                _raw_data_table, _raw_data_params, _raw_data_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(connection_id, id) DO UPDATE SET
                workspace_id = excluded.workspace_id,
                bug_id = excluded.bug_id,
                author = excluded.author,
                created = excluded.created,
                _raw_data_table = excluded._raw_data_table,
                _raw_data_params = excluded._raw_data_params,
                _raw_data_id = excluded._raw_data_id",
        )
        .bind(self.connection_id)
        .bind(self.id)
        .bind(self.workspace_id)
        .bind(self.bug_id)
        .bind(&self.author)
        .bind(self.created)
        .bind(&origin.table)
        .bind(&origin.params)
        .bind(origin.id)
        .execute(conn)
        .await?;
        Ok(())
    }
}

/// `_tool_tapd_bug_changelog_items`; iteration ids stay NULL when a name does not resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapdBugChangelogItem {
    pub connection_id: i64,
    pub changelog_id: i64,
    pub field: String,
    pub value_before: String,
    pub value_after: String,
    pub iteration_id_from: Option<i64>,
    pub iteration_id_to: Option<i64>,
}

#[async_trait]
impl Record for TapdBugChangelogItem {
    fn table(&self) -> &'static str {
        "_tool_tapd_bug_changelog_items"
    }

    fn key(&self) -> String {
        format!("{}|{}|{}", self.connection_id, self.changelog_id, self.field)
    }

    async fn upsert(&self, conn: &mut SqliteConnection, origin: &RawOrigin) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO _tool_tapd_bug_changelog_items (
                connection_id, changelog_id, field, value_before, value_after,
                iteration_id_from, iteration_id_to,
                _raw_data_table, _raw_data_params, _raw_data_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(connection_id, changelog_id, field) DO UPDATE SET
                value_before = excluded.value_before,
                value_after = excluded.value_after,
                iteration_id_from = excluded.iteration_id_from,
                iteration_id_to = excluded.iteration_id_to,
                _raw_data_table = excluded._raw_data_table,
                _raw_data_params = excluded._raw_data_params,
                _raw_data_id = excluded._raw_data_id",
        )
        .bind(self.connection_id)
        .bind(self.changelog_id)
        .bind(&self.field)
        .bind(&self.value_before)
        .bind(&self.value_after)
        .bind(self.iteration_id_from)
        .bind(self.iteration_id_to)
        .bind(&origin.table)
        .bind(&origin.params)
        .bind(origin.id)
        .execute(conn)
        .await?;
        Ok(())
    }
}

pub struct BugChangelogExtractor {
    pub connection_id: i64,
    /// Iteration name to id, loaded once before extraction starts.
    pub iterations: HashMap<String, i64>,
}

impl BugChangelogExtractor {
    fn resolve(&self, name: &str) -> Option<i64> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        self.iterations.get(name).copied()
    }
}

impl Extractable for BugChangelogExtractor {
    fn extract(&self, record: &RawDataRecord) -> Result<Vec<Box<dyn Record>>, PipelineError> {
        let BugChangeEnvelope { change } = parse_raw(record)?;
        let (iteration_id_from, iteration_id_to) = if ITERATION_FIELDS.contains(&change.field.as_str()) {
            (self.resolve(&change.old_value), self.resolve(&change.new_value))
        } else {
            (None, None)
        };
        Ok(vec![
            Box::new(TapdBugChangelog {
                connection_id: self.connection_id,
                id: change.id,
                workspace_id: change.workspace_id,
                bug_id: change.bug_id,
                author: change.author,
                created: change.created,
            }),
            Box::new(TapdBugChangelogItem {
                connection_id: self.connection_id,
                changelog_id: change.id,
                field: change.field,
                value_before: change.old_value,
                value_after: change.new_value,
                iteration_id_from,
                iteration_id_to,
            }),
        ])
    }
}

async fn load_iterations(ctx: &SubTaskContext<TapdTaskData>) -> Result<HashMap<String, i64>, PipelineError> {
    let options = &ctx.data().options;
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT name, id FROM _tool_tapd_iterations
         WHERE connection_id = ? AND workspace_id = ?
         ORDER BY id",
    )
    .bind(options.connection_id)
    .bind(options.workspace_id)
    .fetch_all(ctx.store().pool())
    .await
    .map_err(StoreError::from)?;
    Ok(rows.into_iter().collect())
}

fn extract_bug_changelogs(ctx: &SubTaskContext<TapdTaskData>) -> BoxFuture<'_, Result<(), PipelineError>> {
    Box::pin(async move {
        let data = ctx.data();
        let iterations = load_iterations(ctx).await?;
        debug!(iterations = iterations.len(), "iteration names loaded");
        ApiExtractor::new(ApiExtractorArgs {
            raw_table: RAW_BUG_CHANGELOG_TABLE.to_string(),
            params: data.params.clone(),
            batch_size: BATCH_SIZE,
            failure_policy: ctx.extract_failure_policy(),
            extractable: BugChangelogExtractor {
                connection_id: data.options.connection_id,
                iterations,
            },
        })
        .execute(ctx.raw_store(), ctx.cancellation())
        .await?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(data: &str) -> RawDataRecord {
        RawDataRecord {
            table: RAW_BUG_CHANGELOG_TABLE.to_string(),
            id: 1,
            params: "{}".to_string(),
            data: data.as_bytes().to_vec(),
            url: None,
            input: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn only_iteration_fields_are_resolved() {
        let extractor = BugChangelogExtractor {
            connection_id: 2,
            iterations: HashMap::from([("Sprint 1".to_string(), 1130001)]),
        };
        assert_eq!(extractor.resolve(" Sprint 1 "), Some(1130001));
        assert_eq!(extractor.resolve("Sprint 9"), None);
        assert_eq!(extractor.resolve(""), None);

        let rows = extractor
            .extract(&raw(
                r#"{"BugChange":{"id":"7","workspace_id":"55","bug_id":"900","author":"li",
                    "field":"title","old_value":"Sprint 1","new_value":"b",
                    "created":"2022-05-01 10:00:00"}}"#,
            ))
            .expect("extract");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].key(), "2|7|title");
    }
}
