//! Jira boards: issues, changelogs, sprint membership and assignee history.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use lake_core::{DomainIdGenerator, IssueAssigneeHistory, IssueChangelog, PipelineError, SprintIssue};
use lake_pipeline::{
    malformed, parse_json_field_array, parse_raw, ApiCollector, ApiCollectorArgs, ApiExtractor,
    ApiExtractorArgs, Collectible, Convertible, DataConverter, DataConverterArgs, Extractable,
    LakeConfig, Plugin, RequestData, SubTaskContext, SubTaskMeta, TaskInvocation,
};
use lake_storage::{
    params_signature, ApiClient, ApiResponse, MigrationScript, RawDataRecord, RawOrigin, Record,
    SchemaMigrator, SqlMigration, StoreError,
};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::{json, Value as JsonValue};
use sqlx::SqliteConnection;
use tracing::{debug, info};

use crate::common::{int_from_any, null_as_empty, opt_timestamp, timestamp};

pub const PLUGIN_NAME: &str = "jira";
pub const OWNER: &str = "Jira";
pub const RAW_ISSUE_TABLE: &str = "raw_jira_api_issues";
pub const RAW_CHANGELOG_TABLE: &str = "raw_jira_api_changelogs";

const PAGE_SIZE: u64 = 100;
const BATCH_SIZE: usize = 500;

pub const ISSUE_IDS: DomainIdGenerator = DomainIdGenerator::new("JiraIssue");
pub const SPRINT_IDS: DomainIdGenerator = DomainIdGenerator::new("JiraSprint");
pub const ACCOUNT_IDS: DomainIdGenerator = DomainIdGenerator::new("JiraAccount");
pub const CHANGELOG_IDS: DomainIdGenerator = DomainIdGenerator::new("JiraChangelogItem");

#[derive(Debug, Clone, Deserialize)]
pub struct JiraOptions {
    pub connection_id: i64,
    pub board_id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JiraApiParams {
    pub connection_id: i64,
    pub board_id: i64,
}

pub struct JiraTaskData {
    pub options: JiraOptions,
    pub params: String,
    pub client: ApiClient,
}

pub struct JiraPlugin;

#[async_trait]
impl Plugin for JiraPlugin {
    type TaskData = JiraTaskData;

    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn subtask_metas(&self) -> Vec<SubTaskMeta<JiraTaskData>> {
        vec![
            SubTaskMeta {
                name: "collectIssues",
                entry_point: collect_issues,
                enabled_by_default: true,
                description: "Collect the issues of a board",
                depends_on: &[],
            },
            SubTaskMeta {
                name: "extractIssues",
                entry_point: extract_issues,
                enabled_by_default: true,
                description: "Extract issues, board membership and assignees",
                depends_on: &["collectIssues"],
            },
            SubTaskMeta {
                name: "collectChangelogs",
                entry_point: collect_changelogs,
                enabled_by_default: true,
                description: "Collect the changelog of every board issue",
                depends_on: &["extractIssues"],
            },
            SubTaskMeta {
                name: "extractChangelogs",
                entry_point: extract_changelogs,
                enabled_by_default: true,
                description: "Extract changelogs and their items",
                depends_on: &["collectChangelogs"],
            },
            SubTaskMeta {
                name: "convertChangelogs",
                entry_point: convert_changelogs,
                enabled_by_default: true,
                description: "Convert changelogs, sprint membership and assignee history",
                depends_on: &["extractChangelogs"],
            },
        ]
    }

    fn migration_scripts(&self) -> Vec<Box<dyn MigrationScript>> {
        vec![Box::new(INIT_SCHEMAS), Box::new(RenameSourceToConnection)]
    }

    async fn prepare_task_data(
        &self,
        invocation: &TaskInvocation,
        config: &LakeConfig,
    ) -> Result<JiraTaskData, PipelineError> {
        let options: JiraOptions = invocation.typed_options()?;
        if options.board_id <= 0 {
            return Err(PipelineError::config("jira: board_id must be positive"));
        }
        let params = params_signature(&JiraApiParams {
            connection_id: options.connection_id,
            board_id: options.board_id,
        })?;
        Ok(JiraTaskData {
            client: invocation.connection.api_client(config)?,
            options,
            params,
        })
    }
}

/// First schema, still keyed by `source_id`.
pub const INIT_SCHEMAS: SqlMigration = SqlMigration {
    version: 20220407201138,
    owner: OWNER,
    name: "Init jira schemas",
    statements: &[
        "CREATE TABLE IF NOT EXISTS _tool_jira_sources (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL DEFAULT '',
            endpoint TEXT NOT NULL DEFAULT ''
        )",
        "CREATE TABLE IF NOT EXISTS _tool_jira_boards (
            source_id INTEGER NOT NULL,
            board_id INTEGER NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            PRIMARY KEY (source_id, board_id)
        )",
        "CREATE TABLE IF NOT EXISTS _tool_jira_issues (
            source_id INTEGER NOT NULL,
            issue_id INTEGER NOT NULL,
            issue_key TEXT NOT NULL,
            summary TEXT NOT NULL DEFAULT '',
            type TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT '',
            assignee_account_id TEXT NOT NULL DEFAULT '',
            assignee_name TEXT NOT NULL DEFAULT '',
            created TEXT NOT NULL,
            updated TEXT,
            _raw_data_table TEXT NOT NULL DEFAULT '',
            _raw_data_params TEXT NOT NULL DEFAULT '',
            _raw_data_id INTEGER,
            PRIMARY KEY (source_id, issue_id)
        )",
        "CREATE TABLE IF NOT EXISTS _tool_jira_board_issues (
            source_id INTEGER NOT NULL,
            board_id INTEGER NOT NULL,
            issue_id INTEGER NOT NULL,
            _raw_data_table TEXT NOT NULL DEFAULT '',
            _raw_data_params TEXT NOT NULL DEFAULT '',
            _raw_data_id INTEGER,
            PRIMARY KEY (source_id, board_id, issue_id)
        )",
        "CREATE TABLE IF NOT EXISTS _tool_jira_users (
            source_id INTEGER NOT NULL,
            account_id TEXT NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            _raw_data_table TEXT NOT NULL DEFAULT '',
            _raw_data_params TEXT NOT NULL DEFAULT '',
            _raw_data_id INTEGER,
            PRIMARY KEY (source_id, account_id)
        )",
        "CREATE TABLE IF NOT EXISTS _tool_jira_changelogs (
            source_id INTEGER NOT NULL,
            changelog_id INTEGER NOT NULL,
            issue_id INTEGER NOT NULL,
            author_account_id TEXT NOT NULL DEFAULT '',
            author_display_name TEXT NOT NULL DEFAULT '',
            created TEXT NOT NULL,
            _raw_data_table TEXT NOT NULL DEFAULT '',
            _raw_data_params TEXT NOT NULL DEFAULT '',
            _raw_data_id INTEGER,
            PRIMARY KEY (source_id, changelog_id)
        )",
        "CREATE TABLE IF NOT EXISTS _tool_jira_changelog_items (
            source_id INTEGER NOT NULL,
            changelog_id INTEGER NOT NULL,
            field TEXT NOT NULL,
            field_type TEXT NOT NULL DEFAULT '',
            field_id TEXT NOT NULL DEFAULT '',
            from_value TEXT NOT NULL DEFAULT '',
            from_string TEXT NOT NULL DEFAULT '',
            to_value TEXT NOT NULL DEFAULT '',
            to_string TEXT NOT NULL DEFAULT '',
            _raw_data_table TEXT NOT NULL DEFAULT '',
            _raw_data_params TEXT NOT NULL DEFAULT '',
            _raw_data_id INTEGER,
            PRIMARY KEY (source_id, changelog_id, field)
        )",
    ],
};

/// Tables that carried `source_id` before the rename.
pub const SOURCE_KEYED_TABLES: &[&str] = &[
    "_tool_jira_boards",
    "_tool_jira_issues",
    "_tool_jira_board_issues",
    "_tool_jira_users",
    "_tool_jira_changelogs",
    "_tool_jira_changelog_items",
];

#[derive(Debug, Clone, Copy)]
pub struct RenameSourceToConnection;

#[async_trait]
impl MigrationScript for RenameSourceToConnection {
    fn version(&self) -> u64 {
        20220505212344
    }

    fn owner(&self) -> &'static str {
        OWNER
    }

    fn name(&self) -> &'static str {
        "Rename source to connection"
    }

    async fn up(&self, schema: &mut dyn SchemaMigrator) -> Result<(), StoreError> {
        schema
            .rename_table("_tool_jira_sources", "_tool_jira_connections")
            .await?;
        for table in SOURCE_KEYED_TABLES {
            schema.rename_column(table, "source_id", "connection_id").await?;
        }
        Ok(())
    }
}

struct StartAtPages {
    field: &'static str,
    jql: Option<String>,
}

impl Collectible for StartAtPages {
    fn parse_response(&self, response: &ApiResponse) -> Result<Vec<Box<RawValue>>, PipelineError> {
        parse_json_field_array(response, self.field)
    }

    fn query(&self, request: &RequestData<'_>) -> Vec<(String, String)> {
        let size = request.page_size.unwrap_or(PAGE_SIZE);
        let mut query = vec![
            ("startAt".to_string(), ((request.page - 1) * size).to_string()),
            ("maxResults".to_string(), size.to_string()),
        ];
        if let Some(jql) = &self.jql {
            query.push(("jql".to_string(), jql.clone()));
        }
        query
    }

    fn is_last_page(&self, request: &RequestData<'_>, fragments: &[Box<RawValue>]) -> bool {
        request
            .page_size
            .is_some_and(|size| (fragments.len() as u64) < size)
    }
}

fn issues_jql(since: Option<DateTime<Utc>>) -> String {
    match since {
        Some(since) => format!(
            "updated >= '{}' ORDER BY created ASC",
            since.format("%Y/%m/%d %H:%M")
        ),
        None => "ORDER BY created ASC".to_string(),
    }
}

fn collect_issues(ctx: &SubTaskContext<JiraTaskData>) -> BoxFuture<'_, Result<(), PipelineError>> {
    Box::pin(async move {
        let data = ctx.data();
        let since = if ctx.incremental() {
            ctx.raw_store()
                .collector_state(RAW_ISSUE_TABLE, &data.params)
                .await?
        } else {
            None
        };
        let collector = ApiCollector::new(ApiCollectorArgs {
            raw_table: RAW_ISSUE_TABLE.to_string(),
            params: data.params.clone(),
            client: data.client.clone(),
            url_template: format!("agile/1.0/board/{}/issue", data.options.board_id),
            page_size: Some(PAGE_SIZE),
            incremental: ctx.incremental(),
            input: None,
            collectible: StartAtPages {
                field: "issues",
                jql: Some(issues_jql(since)),
            },
        })?;
        collector.execute(ctx.raw_store(), ctx.cancellation()).await?;
        Ok(())
    })
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    #[serde(rename = "accountId", default)]
    account_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "displayName", default, deserialize_with = "null_as_empty")]
    display_name: String,
}

impl ApiUser {
    /// Cloud sends `accountId`, Server only `name`.
    fn account(&self) -> Option<String> {
        self.account_id
            .clone()
            .or_else(|| self.name.clone())
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct ApiNamed {
    #[serde(default, deserialize_with = "null_as_empty")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct ApiIssueFields {
    #[serde(default, deserialize_with = "null_as_empty")]
    summary: String,
    #[serde(default)]
    issuetype: Option<ApiNamed>,
    #[serde(default)]
    status: Option<ApiNamed>,
    #[serde(default)]
    assignee: Option<ApiUser>,
    #[serde(deserialize_with = "timestamp")]
    created: DateTime<Utc>,
    #[serde(default, deserialize_with = "opt_timestamp")]
    updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ApiIssue {
    #[serde(deserialize_with = "int_from_any")]
    id: i64,
    key: String,
    fields: ApiIssueFields,
}

/// `_tool_jira_issues`
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct JiraIssue {
    pub connection_id: i64,
    pub issue_id: i64,
    pub issue_key: String,
    pub summary: String,
    #[sqlx(rename = "type")]
    pub issue_type: String,
    pub status: String,
    pub assignee_account_id: String,
    pub assignee_name: String,
    pub created: DateTime<Utc>,
    pub updated: Option<DateTime<Utc>>,
}

#[async_trait]
impl Record for JiraIssue {
    fn table(&self) -> &'static str {
        "_tool_jira_issues"
    }

    fn key(&self) -> String {
        format!("{}|{}", self.connection_id, self.issue_id)
    }

    async fn upsert(&self, conn: &mut SqliteConnection, origin: &RawOrigin) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO _tool_jira_issues (
                connection_id, issue_id, issue_key, summary, type, status,
                assignee_account_id, assignee_name, created, updated,
                _raw_data_table, _raw_data_params, _raw_data_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(connection_id, issue_id) DO UPDATE SET
                issue_key = excluded.issue_key,
                summary = excluded.summary,
                type = excluded.type,
                status = excluded.status,
                assignee_account_id = excluded.assignee_account_id,
                assignee_name = excluded.assignee_name,
                created = excluded.created,
                updated = excluded.updated,
                _raw_data_table = excluded._raw_data_table,
                _raw_data_params = excluded._raw_data_params,
                _raw_data_id = excluded._raw_data_id",
        )
        .bind(self.connection_id)
        .bind(self.issue_id)
        .bind(&self.issue_key)
        .bind(&self.summary)
        .bind(&self.issue_type)
        .bind(&self.status)
        .bind(&self.assignee_account_id)
        .bind(&self.assignee_name)
        .bind(self.created)
        .bind(self.updated)
        .bind(&origin.table)
        .bind(&origin.params)
        .bind(origin.id)
        .execute(conn)
        .await?;
        Ok(())
    }
}

/// `_tool_jira_board_issues`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JiraBoardIssue {
    pub connection_id: i64,
    pub board_id: i64,
    pub issue_id: i64,
}

#[async_trait]
impl Record for JiraBoardIssue {
    fn table(&self) -> &'static str {
        "_tool_jira_board_issues"
    }

    fn key(&self) -> String {
        format!("{}|{}|{}", self.connection_id, self.board_id, self.issue_id)
    }

    async fn upsert(&self, conn: &mut SqliteConnection, origin: &RawOrigin) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO _tool_jira_board_issues (
                connection_id, board_id, issue_id, _raw_data_table, _raw_data_params, _raw_data_id
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(connection_id, board_id, issue_id) DO UPDATE SET
                _raw_data_table = excluded._raw_data_table,
                _raw_data_params = excluded._raw_data_params,
                _raw_data_id = excluded._raw_data_id",
        )
        .bind(self.connection_id)
        .bind(self.board_id)
        .bind(self.issue_id)
        .bind(&origin.table)
        .bind(&origin.params)
        .bind(origin.id)
        .execute(conn)
        .await?;
        Ok(())
    }
}

/// `_tool_jira_users`; an empty name never overwrites a known one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JiraUser {
    pub connection_id: i64,
    pub account_id: String,
    pub name: String,
}

#[async_trait]
impl Record for JiraUser {
    fn table(&self) -> &'static str {
        "_tool_jira_users"
    }

    fn key(&self) -> String {
        format!("{}|{}", self.connection_id, self.account_id)
    }

    async fn upsert(&self, conn: &mut SqliteConnection, origin: &RawOrigin) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO _tool_jira_users (
                connection_id, account_id, name, _raw_data_table, _raw_data_params, _raw_data_id
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(connection_id, account_id) DO UPDATE SET
                name = CASE WHEN excluded.name != '' THEN excluded.name ELSE _tool_jira_users.name END,
                _raw_data_table = excluded._raw_data_table,
                _raw_data_params = excluded._raw_data_params,
                _raw_data_id = excluded._raw_data_id",
        )
        .bind(self.connection_id)
        .bind(&self.account_id)
        .bind(&self.name)
        .bind(&origin.table)
        .bind(&origin.params)
        .bind(origin.id)
        .execute(conn)
        .await?;
        Ok(())
    }
}

pub struct IssueExtractor {
    pub connection_id: i64,
    pub board_id: i64,
}

impl Extractable for IssueExtractor {
    fn extract(&self, record: &RawDataRecord) -> Result<Vec<Box<dyn Record>>, PipelineError> {
        let issue: ApiIssue = parse_raw(record)?;
        let fields = issue.fields;
        let assignee = fields.assignee.as_ref().and_then(|user| {
            user.account().map(|id| (id, user.display_name.clone()))
        });
        let (assignee_account_id, assignee_name) = assignee.clone().unwrap_or_default();

        let mut rows: Vec<Box<dyn Record>> = vec![
            Box::new(JiraIssue {
                connection_id: self.connection_id,
                issue_id: issue.id,
                issue_key: issue.key,
                summary: fields.summary,
                issue_type: fields.issuetype.map(|t| t.name).unwrap_or_default(),
                status: fields.status.map(|s| s.name).unwrap_or_default(),
                assignee_account_id,
                assignee_name,
                created: fields.created,
                updated: fields.updated,
            }),
            Box::new(JiraBoardIssue {
                connection_id: self.connection_id,
                board_id: self.board_id,
                issue_id: issue.id,
            }),
        ];
        if let Some((account_id, name)) = assignee {
            rows.push(Box::new(JiraUser {
                connection_id: self.connection_id,
                account_id,
                name,
            }));
        }
        Ok(rows)
    }
}

fn extract_issues(ctx: &SubTaskContext<JiraTaskData>) -> BoxFuture<'_, Result<(), PipelineError>> {
    Box::pin(async move {
        let data = ctx.data();
        let extractor = ApiExtractor::new(ApiExtractorArgs {
            raw_table: RAW_ISSUE_TABLE.to_string(),
            params: data.params.clone(),
            batch_size: BATCH_SIZE,
            failure_policy: ctx.extract_failure_policy(),
            extractable: IssueExtractor {
                connection_id: data.options.connection_id,
                board_id: data.options.board_id,
            },
        });
        extractor.execute(ctx.raw_store(), ctx.cancellation()).await?;
        Ok(())
    })
}

/// Board issues whose changelog should be fetched; with `since`, only those updated after it.
async fn changelog_inputs(
    ctx: &SubTaskContext<JiraTaskData>,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<JsonValue>, PipelineError> {
    let options = &ctx.data().options;
    let issue_ids: Vec<i64> = sqlx::query_scalar(
        "SELECT i.issue_id
         FROM _tool_jira_board_issues bi
         JOIN _tool_jira_issues i
           ON i.connection_id = bi.connection_id AND i.issue_id = bi.issue_id
         WHERE bi.connection_id = ? AND bi.board_id = ?
           AND (? IS NULL OR i.updated > ?)
         ORDER BY i.issue_id",
    )
    .bind(options.connection_id)
    .bind(options.board_id)
    .bind(since)
    .bind(since)
    .fetch_all(ctx.store().pool())
    .await
    .map_err(StoreError::from)?;
    Ok(issue_ids
        .into_iter()
        .map(|issue_id| json!({ "issue_id": issue_id }))
        .collect())
}

fn collect_changelogs(ctx: &SubTaskContext<JiraTaskData>) -> BoxFuture<'_, Result<(), PipelineError>> {
    Box::pin(async move {
        let data = ctx.data();
        let since = if ctx.incremental() {
            ctx.raw_store()
                .collector_state(RAW_CHANGELOG_TABLE, &data.params)
                .await?
        } else {
            None
        };
        let input = changelog_inputs(ctx, since).await?;
        debug!(issues = input.len(), "collecting changelogs");
        let collector = ApiCollector::new(ApiCollectorArgs {
            raw_table: RAW_CHANGELOG_TABLE.to_string(),
            params: data.params.clone(),
            client: data.client.clone(),
            url_template: "api/3/issue/{input.issue_id}/changelog".to_string(),
            page_size: Some(PAGE_SIZE),
            incremental: ctx.incremental(),
            input: Some(input),
            collectible: StartAtPages {
                field: "values",
                jql: None,
            },
        })?;
        collector.execute(ctx.raw_store(), ctx.cancellation()).await?;
        Ok(())
    })
}

#[derive(Debug, Deserialize)]
struct ApiChangelogItem {
    field: String,
    #[serde(rename = "fieldtype", default, deserialize_with = "null_as_empty")]
    field_type: String,
    #[serde(rename = "fieldId", default, deserialize_with = "null_as_empty")]
    field_id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    from: String,
    #[serde(rename = "fromString", default, deserialize_with = "null_as_empty")]
    from_string: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    to: String,
    #[serde(rename = "toString", default, deserialize_with = "null_as_empty")]
    to_string: String,
}

#[derive(Debug, Deserialize)]
struct ApiChangelog {
    #[serde(deserialize_with = "int_from_any")]
    id: i64,
    #[serde(default)]
    author: Option<ApiUser>,
    #[serde(deserialize_with = "timestamp")]
    created: DateTime<Utc>,
    #[serde(default)]
    items: Vec<ApiChangelogItem>,
}

#[derive(Debug, Deserialize)]
struct ChangelogInput {
    #[serde(deserialize_with = "int_from_any")]
    issue_id: i64,
}

/// `_tool_jira_changelogs`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JiraChangelog {
    pub connection_id: i64,
    pub changelog_id: i64,
    pub issue_id: i64,
    pub author_account_id: String,
    pub author_display_name: String,
    pub created: DateTime<Utc>,
}

#[async_trait]
impl Record for JiraChangelog {
    fn table(&self) -> &'static str {
        "_tool_jira_changelogs"
    }

    fn key(&self) -> String {
        format!("{}|{}", self.connection_id, self.changelog_id)
    }

    async fn upsert(&self, conn: &mut SqliteConnection, origin: &RawOrigin) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO _tool_jira_changelogs (
                connection_id, changelog_id, issue_id, author_account_id, author_display_name,
                created, _raw_data_table, _raw_data_params, _raw_data_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(connection_id, changelog_id) DO UPDATE SET
                issue_id = excluded.issue_id,
                author_account_id = excluded.author_account_id,
                author_display_name = excluded.author_display_name,
                created = excluded.created,
                _raw_data_table = excluded._raw_data_table,
                _raw_data_params = excluded._raw_data_params,
                _raw_data_id = excluded._raw_data_id",
        )
        .bind(self.connection_id)
        .bind(self.changelog_id)
        .bind(self.issue_id)
        .bind(&self.author_account_id)
        .bind(&self.author_display_name)
        .bind(self.created)
        .bind(&origin.table)
        .bind(&origin.params)
        .bind(origin.id)
        .execute(conn)
        .await?;
        Ok(())
    }
}

/// `_tool_jira_changelog_items`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JiraChangelogItem {
    pub connection_id: i64,
    pub changelog_id: i64,
    pub field: String,
    pub field_type: String,
    pub field_id: String,
    pub from_value: String,
    pub from_string: String,
    pub to_value: String,
    pub to_string: String,
}

#[async_trait]
impl Record for JiraChangelogItem {
    fn table(&self) -> &'static str {
        "_tool_jira_changelog_items"
    }

    fn key(&self) -> String {
        format!("{}|{}|{}", self.connection_id, self.changelog_id, self.field)
    }

    async fn upsert(&self, conn: &mut SqliteConnection, origin: &RawOrigin) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO _tool_jira_changelog_items (
                connection_id, changelog_id, field, field_type, field_id, from_value, from_string,
                to_value, to_string, _raw_data_table, _raw_data_params, _raw_data_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(connection_id, changelog_id, field) DO UPDATE SET
                field_type = excluded.field_type,
                field_id = excluded.field_id,
                from_value = excluded.from_value,
                from_string = excluded.from_string,
                to_value = excluded.to_value,
                to_string = excluded.to_string,
                _raw_data_table = excluded._raw_data_table,
                _raw_data_params = excluded._raw_data_params,
                _raw_data_id = excluded._raw_data_id",
        )
        .bind(self.connection_id)
        .bind(self.changelog_id)
        .bind(&self.field)
        .bind(&self.field_type)
        .bind(&self.field_id)
        .bind(&self.from_value)
        .bind(&self.from_string)
        .bind(&self.to_value)
        .bind(&self.to_string)
        .bind(&origin.table)
        .bind(&origin.params)
        .bind(origin.id)
        .execute(conn)
        .await?;
        Ok(())
    }
}

pub struct ChangelogExtractor {
    pub connection_id: i64,
}

impl Extractable for ChangelogExtractor {
    fn extract(&self, record: &RawDataRecord) -> Result<Vec<Box<dyn Record>>, PipelineError> {
        let input: ChangelogInput = match record.input_value() {
            Ok(Some(value)) => serde_json::from_value(value).map_err(|err| malformed(record, err))?,
            Ok(None) => return Err(malformed(record, "changelog record has no issue input")),
            Err(err) => return Err(malformed(record, err)),
        };
        let changelog: ApiChangelog = parse_raw(record)?;
        let conn = self.connection_id;

        let (author_account_id, author_display_name) = changelog
            .author
            .as_ref()
            .and_then(|user| user.account().map(|id| (id, user.display_name.clone())))
            .unwrap_or_default();

        let mut rows: Vec<Box<dyn Record>> = Vec::with_capacity(changelog.items.len() + 2);
        if !author_account_id.is_empty() {
            rows.push(Box::new(JiraUser {
                connection_id: conn,
                account_id: author_account_id.clone(),
                name: author_display_name.clone(),
            }));
        }
        rows.push(Box::new(JiraChangelog {
            connection_id: conn,
            changelog_id: changelog.id,
            issue_id: input.issue_id,
            author_account_id,
            author_display_name,
            created: changelog.created,
        }));

        let mut stubs = BTreeSet::new();
        for item in changelog.items {
            if item.field == "assignee" {
                for (account, name) in [(&item.from, &item.from_string), (&item.to, &item.to_string)] {
                    if !account.is_empty() && stubs.insert(account.clone()) {
                        rows.push(Box::new(JiraUser {
                            connection_id: conn,
                            account_id: account.clone(),
                            name: name.clone(),
                        }));
                    }
                }
            }
            rows.push(Box::new(JiraChangelogItem {
                connection_id: conn,
                changelog_id: changelog.id,
                field: item.field,
                field_type: item.field_type,
                field_id: item.field_id,
                from_value: item.from,
                from_string: item.from_string,
                to_value: item.to,
                to_string: item.to_string,
            }));
        }
        Ok(rows)
    }
}

fn extract_changelogs(ctx: &SubTaskContext<JiraTaskData>) -> BoxFuture<'_, Result<(), PipelineError>> {
    Box::pin(async move {
        let data = ctx.data();
        let extractor = ApiExtractor::new(ApiExtractorArgs {
            raw_table: RAW_CHANGELOG_TABLE.to_string(),
            params: data.params.clone(),
            batch_size: BATCH_SIZE,
            failure_policy: ctx.extract_failure_policy(),
            extractable: ChangelogExtractor {
                connection_id: data.options.connection_id,
            },
        });
        extractor.execute(ctx.raw_store(), ctx.cancellation()).await?;
        Ok(())
    })
}

/// One changelog item joined with its changelog, ordered by time.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ChangelogItemRow {
    pub changelog_id: i64,
    pub field: String,
    pub field_id: String,
    pub from_value: String,
    pub from_string: String,
    pub to_value: String,
    pub to_string: String,
    pub issue_id: i64,
    pub author_account_id: String,
    pub author_display_name: String,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct SprintMembership {
    added_date: Option<DateTime<Utc>>,
    removed_date: Option<DateTime<Utc>>,
    is_removed: bool,
    change_count: i64,
}

#[derive(Debug, Clone)]
struct OpenAssignment {
    assignee: String,
    start_date: DateTime<Utc>,
}

fn sprint_ids(value: &str) -> BTreeSet<&str> {
    value
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .collect()
}

/// Emits one `IssueChangelog` per item and accumulates sprint membership and
/// assignee intervals, which are emitted on flush.
#[derive(Debug, Default)]
pub struct ChangelogConverter {
    pub connection_id: i64,
    sprints: BTreeMap<(String, String), SprintMembership>,
    open_assignments: BTreeMap<String, OpenAssignment>,
    closed_assignments: Vec<IssueAssigneeHistory>,
}

impl ChangelogConverter {
    pub fn new(connection_id: i64) -> Self {
        Self {
            connection_id,
            ..Self::default()
        }
    }

    fn track_sprints(&mut self, issue_id: &str, row: &ChangelogItemRow) {
        let from = sprint_ids(&row.from_value);
        let to = sprint_ids(&row.to_value);
        for sprint in to.difference(&from) {
            let key = (SPRINT_IDS.generate(&[self.connection_id.into(), (*sprint).into()]), issue_id.to_string());
            let entry = self.sprints.entry(key).or_default();
            entry.added_date = Some(match entry.added_date {
                Some(existing) => existing.min(row.created),
                None => row.created,
            });
            entry.is_removed = false;
            entry.change_count += 1;
        }
        for sprint in from.difference(&to) {
            let key = (SPRINT_IDS.generate(&[self.connection_id.into(), (*sprint).into()]), issue_id.to_string());
            let entry = self.sprints.entry(key).or_default();
            entry.removed_date = Some(row.created);
            entry.is_removed = true;
            entry.change_count += 1;
        }
    }

    fn track_assignee(&mut self, issue_id: &str, row: &ChangelogItemRow) {
        let next = (!row.to_value.is_empty())
            .then(|| ACCOUNT_IDS.generate(&[self.connection_id.into(), row.to_value.as_str().into()]));
        if let (Some(open), Some(next)) = (self.open_assignments.get(issue_id), next.as_ref()) {
            if &open.assignee == next {
                return;
            }
        }
        if let Some(open) = self.open_assignments.remove(issue_id) {
            self.closed_assignments.push(IssueAssigneeHistory {
                issue_id: issue_id.to_string(),
                assignee: open.assignee,
                start_date: open.start_date,
                end_date: Some(row.created),
            });
        }
        if let Some(assignee) = next {
            self.open_assignments.insert(
                issue_id.to_string(),
                OpenAssignment {
                    assignee,
                    start_date: row.created,
                },
            );
        }
    }
}

impl Convertible for ChangelogConverter {
    type Input = ChangelogItemRow;

    fn convert(&mut self, row: &ChangelogItemRow) -> Result<Vec<Box<dyn Record>>, PipelineError> {
        let conn = self.connection_id;
        let issue_id = ISSUE_IDS.generate(&[conn.into(), row.issue_id.into()]);
        match row.field.as_str() {
            "Sprint" => self.track_sprints(&issue_id, row),
            "assignee" => self.track_assignee(&issue_id, row),
            _ => {}
        }
        let author_id = if row.author_account_id.is_empty() {
            String::new()
        } else {
            ACCOUNT_IDS.generate(&[conn.into(), row.author_account_id.as_str().into()])
        };
        Ok(vec![Box::new(IssueChangelog {
            id: CHANGELOG_IDS.generate(&[conn.into(), row.changelog_id.into(), row.field.as_str().into()]),
            issue_id,
            author_id,
            author_name: row.author_display_name.clone(),
            field_id: row.field_id.clone(),
            field_name: row.field.clone(),
            original_from_value: row.from_string.clone(),
            original_to_value: row.to_string.clone(),
            created_date: row.created,
        })])
    }

    fn flush(&mut self) -> Result<Vec<Box<dyn Record>>, PipelineError> {
        let mut rows: Vec<Box<dyn Record>> = Vec::new();
        for ((sprint_id, issue_id), membership) in std::mem::take(&mut self.sprints) {
            rows.push(Box::new(SprintIssue {
                sprint_id,
                issue_id,
                added_date: membership.added_date,
                removed_date: membership.removed_date,
                is_removed: membership.is_removed,
                change_count: membership.change_count,
            }));
        }
        for history in std::mem::take(&mut self.closed_assignments) {
            rows.push(Box::new(history));
        }
        for (issue_id, open) in std::mem::take(&mut self.open_assignments) {
            rows.push(Box::new(IssueAssigneeHistory {
                issue_id,
                assignee: open.assignee,
                start_date: open.start_date,
                end_date: None,
            }));
        }
        Ok(rows)
    }
}

fn convert_changelogs(ctx: &SubTaskContext<JiraTaskData>) -> BoxFuture<'_, Result<(), PipelineError>> {
    Box::pin(async move {
        let data = ctx.data();
        let mut converter = DataConverter::new(DataConverterArgs {
            input_sql: "SELECT ci.changelog_id, ci.field, ci.field_id, ci.from_value, ci.from_string,
                               ci.to_value, ci.to_string, c.issue_id, c.author_account_id,
                               c.author_display_name, c.created
                        FROM _tool_jira_changelog_items ci
                        JOIN _tool_jira_changelogs c
                          ON c.connection_id = ci.connection_id AND c.changelog_id = ci.changelog_id
                        JOIN _tool_jira_board_issues bi
                          ON bi.connection_id = c.connection_id AND bi.issue_id = c.issue_id
                        WHERE ci.connection_id = ? AND bi.board_id = ?
                        ORDER BY c.created, ci.changelog_id, ci.field"
                .to_string(),
            binds: vec![data.options.connection_id.into(), data.options.board_id.into()],
            origin: RawOrigin::new(RAW_CHANGELOG_TABLE, data.params.clone()),
            batch_size: BATCH_SIZE,
            convertible: ChangelogConverter::new(data.options.connection_id),
        });
        let summary = converter.execute(ctx.store(), ctx.cancellation()).await?;
        info!(changelogs = summary.rows, derived = summary.flushed, "jira changelogs converted");
        Ok(())
    })
}
