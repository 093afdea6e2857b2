//! GitHub pull requests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use lake_core::{DomainIdGenerator, PipelineError, PullRequest};
use lake_pipeline::{
    parse_json_array, parse_raw, ApiCollector, ApiCollectorArgs, ApiExtractor, ApiExtractorArgs,
    Collectible, Convertible, DataConverter, DataConverterArgs, Extractable, LakeConfig, Plugin,
    RequestData, SubTaskContext, SubTaskMeta, TaskInvocation,
};
use lake_storage::{
    params_signature, ApiClient, ApiResponse, MigrationScript, RawDataRecord, RawOrigin, Record,
    SqlMigration, StoreError,
};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use sqlx::SqliteConnection;

use crate::common::{null_as_empty, opt_timestamp, timestamp};

pub const PLUGIN_NAME: &str = "github";
pub const RAW_PULL_REQUEST_TABLE: &str = "raw_github_api_pull_requests";

const PAGE_SIZE: u64 = 100;
const BATCH_SIZE: usize = 500;

pub const PR_IDS: DomainIdGenerator = DomainIdGenerator::new("GithubPullRequest");
pub const REPO_IDS: DomainIdGenerator = DomainIdGenerator::new("GithubRepo");
pub const USER_IDS: DomainIdGenerator = DomainIdGenerator::new("GithubUser");

#[derive(Debug, Clone, Deserialize)]
pub struct GithubOptions {
    pub connection_id: i64,
    pub owner: String,
    pub repo: String,
    pub repo_id: i64,
}

/// Raw partition key.
#[derive(Debug, Clone, Serialize)]
pub struct GithubApiParams<'a> {
    pub connection_id: i64,
    pub owner: &'a str,
    pub repo: &'a str,
}

pub struct GithubTaskData {
    pub options: GithubOptions,
    pub params: String,
    pub client: ApiClient,
}

pub struct GithubPlugin;

#[async_trait]
impl Plugin for GithubPlugin {
    type TaskData = GithubTaskData;

    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn subtask_metas(&self) -> Vec<SubTaskMeta<GithubTaskData>> {
        vec![
            SubTaskMeta {
                name: "collectPullRequests",
                entry_point: collect_pull_requests,
                enabled_by_default: true,
                description: "Collect pull requests from the GitHub api",
                depends_on: &[],
            },
            SubTaskMeta {
                name: "extractPullRequests",
                entry_point: extract_pull_requests,
                enabled_by_default: true,
                description: "Extract raw pull requests into _tool_github_pull_requests",
                depends_on: &["collectPullRequests"],
            },
            SubTaskMeta {
                name: "convertPullRequests",
                entry_point: convert_pull_requests,
                enabled_by_default: true,
                description: "Convert tool pull requests into domain_pull_requests",
                depends_on: &["extractPullRequests"],
            },
        ]
    }

    fn migration_scripts(&self) -> Vec<Box<dyn MigrationScript>> {
        vec![Box::new(SqlMigration {
            version: 20220415000001,
            owner: "GitHub",
            name: "Init github schemas",
            statements: &[
                "CREATE TABLE IF NOT EXISTS _tool_github_pull_requests (
                    connection_id INTEGER NOT NULL,
                    github_id INTEGER NOT NULL,
                    repo_id INTEGER NOT NULL,
                    head_repo_id INTEGER NOT NULL DEFAULT 0,
                    number INTEGER NOT NULL,
                    state TEXT NOT NULL,
                    title TEXT NOT NULL,
                    body TEXT NOT NULL DEFAULT '',
                    url TEXT NOT NULL DEFAULT '',
                    author_id INTEGER NOT NULL DEFAULT 0,
                    author_name TEXT NOT NULL DEFAULT '',
                    github_created_at TEXT NOT NULL,
                    merged_at TEXT,
                    closed_at TEXT,
                    merge_commit_sha TEXT NOT NULL DEFAULT '',
                    base_ref TEXT NOT NULL DEFAULT '',
                    base_commit_sha TEXT NOT NULL DEFAULT '',
                    head_ref TEXT NOT NULL DEFAULT '',
                    head_commit_sha TEXT NOT NULL DEFAULT '',
                    type TEXT NOT NULL DEFAULT '',
                    component TEXT NOT NULL DEFAULT '',
                    _raw_data_table TEXT NOT NULL DEFAULT '',
                    _raw_data_params TEXT NOT NULL DEFAULT '',
                    _raw_data_id INTEGER,
                    PRIMARY KEY (connection_id, github_id)
                )",
                "CREATE INDEX IF NOT EXISTS idx_tool_github_pull_requests_repo
                    ON _tool_github_pull_requests(connection_id, repo_id)",
            ],
        })]
    }

    async fn prepare_task_data(
        &self,
        invocation: &TaskInvocation,
        config: &LakeConfig,
    ) -> Result<GithubTaskData, PipelineError> {
        let options: GithubOptions = invocation.typed_options()?;
        if options.owner.trim().is_empty() || options.repo.trim().is_empty() {
            return Err(PipelineError::config("github: owner and repo are required"));
        }
        let params = params_signature(&GithubApiParams {
            connection_id: options.connection_id,
            owner: &options.owner,
            repo: &options.repo,
        })?;
        Ok(GithubTaskData {
            client: invocation.connection.api_client(config)?,
            options,
            params,
        })
    }
}

struct PullRequestPages;

impl Collectible for PullRequestPages {
    fn parse_response(&self, response: &ApiResponse) -> Result<Vec<Box<RawValue>>, PipelineError> {
        parse_json_array(response)
    }

    // `/pulls` has no `since` filter; newest updates come first and paging stops at the watermark.
    fn query(&self, request: &RequestData<'_>) -> Vec<(String, String)> {
        let mut query = vec![
            ("state".to_string(), "all".to_string()),
            ("sort".to_string(), "updated".to_string()),
            ("direction".to_string(), "desc".to_string()),
            ("page".to_string(), request.page.to_string()),
        ];
        if let Some(size) = request.page_size {
            query.push(("per_page".to_string(), size.to_string()));
        }
        query
    }

    fn is_last_page(&self, request: &RequestData<'_>, fragments: &[Box<RawValue>]) -> bool {
        let short = request
            .page_size
            .is_some_and(|size| (fragments.len() as u64) < size);
        short
            || request
                .since
                .is_some_and(|since| fragments.iter().any(|f| updated_before(f, since)))
    }
}

#[derive(Deserialize)]
struct UpdateStamp {
    #[serde(deserialize_with = "timestamp")]
    updated_at: DateTime<Utc>,
}

fn updated_before(fragment: &RawValue, since: DateTime<Utc>) -> bool {
    serde_json::from_str::<UpdateStamp>(fragment.get()).is_ok_and(|stamp| stamp.updated_at < since)
}

fn collect_pull_requests(ctx: &SubTaskContext<GithubTaskData>) -> BoxFuture<'_, Result<(), PipelineError>> {
    Box::pin(async move {
        let data = ctx.data();
        let collector = ApiCollector::new(ApiCollectorArgs {
            raw_table: RAW_PULL_REQUEST_TABLE.to_string(),
            params: data.params.clone(),
            client: data.client.clone(),
            url_template: format!("repos/{}/{}/pulls", data.options.owner, data.options.repo),
            page_size: Some(PAGE_SIZE),
            incremental: ctx.incremental(),
            input: None,
            collectible: PullRequestPages,
        })?;
        collector.execute(ctx.raw_store(), ctx.cancellation()).await?;
        Ok(())
    })
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    id: i64,
    login: String,
}

#[derive(Debug, Deserialize)]
struct ApiRepoRef {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct ApiBranch {
    #[serde(rename = "ref")]
    git_ref: String,
    sha: String,
    #[serde(default)]
    repo: Option<ApiRepoRef>,
}

#[derive(Debug, Deserialize)]
struct ApiLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ApiPullRequest {
    id: i64,
    number: i64,
    state: String,
    title: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    body: String,
    #[serde(default)]
    html_url: String,
    user: Option<ApiUser>,
    #[serde(deserialize_with = "timestamp")]
    created_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "opt_timestamp")]
    merged_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "opt_timestamp")]
    closed_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "null_as_empty")]
    merge_commit_sha: String,
    base: ApiBranch,
    head: ApiBranch,
    #[serde(default)]
    labels: Vec<ApiLabel>,
}

/// `_tool_github_pull_requests`
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct GithubPullRequest {
    pub connection_id: i64,
    pub github_id: i64,
    pub repo_id: i64,
    pub head_repo_id: i64,
    pub number: i64,
    pub state: String,
    pub title: String,
    pub body: String,
    pub url: String,
    pub author_id: i64,
    pub author_name: String,
    pub github_created_at: DateTime<Utc>,
    pub merged_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub merge_commit_sha: String,
    pub base_ref: String,
    pub base_commit_sha: String,
    pub head_ref: String,
    pub head_commit_sha: String,
    #[sqlx(rename = "type")]
    pub pr_type: String,
    pub component: String,
}

fn label_value(labels: &[ApiLabel], prefix: &str) -> String {
    labels
        .iter()
        .find_map(|label| label.name.strip_prefix(prefix))
        .map(|value| value.trim().to_string())
        .unwrap_or_default()
}

#[async_trait]
impl Record for GithubPullRequest {
    fn table(&self) -> &'static str {
        "_tool_github_pull_requests"
    }

    fn key(&self) -> String {
        format!("{}|{}", self.connection_id, self.github_id)
    }

    async fn upsert(&self, conn: &mut SqliteConnection, origin: &RawOrigin) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO _tool_github_pull_requests (
                connection_id, github_id, repo_id, head_repo_id, number, state, title, body, url,
                author_id, author_name, github_created_at, merged_at, closed_at, merge_commit_sha,
                base_ref, base_commit_sha, head_ref, head_commit_sha, type, component,
                _raw_data_table, _raw_data_params, _raw_data_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(connection_id, github_id) DO UPDATE SET
                repo_id = excluded.repo_id,
                head_repo_id = excluded.head_repo_id,
                number = excluded.number,
                state = excluded.state,
                title = excluded.title,
                body = excluded.body,
                url = excluded.url,
                author_id = excluded.author_id,
                author_name = excluded.author_name,
                github_created_at = excluded.github_created_at,
                merged_at = excluded.merged_at,
                closed_at = excluded.closed_at,
                merge_commit_sha = excluded.merge_commit_sha,
                base_ref = excluded.base_ref,
                base_commit_sha = excluded.base_commit_sha,
                head_ref = excluded.head_ref,
                head_commit_sha = excluded.head_commit_sha,
                type = excluded.type,
                component = excluded.component,
                _raw_data_table = excluded._raw_data_table,
                _raw_data_params = excluded._raw_data_params,
                _raw_data_id = excluded._raw_data_id",
        )
        .bind(self.connection_id)
        .bind(self.github_id)
        .bind(self.repo_id)
        .bind(self.head_repo_id)
        .bind(self.number)
        .bind(&self.state)
        .bind(&self.title)
        .bind(&self.body)
        .bind(&self.url)
        .bind(self.author_id)
        .bind(&self.author_name)
        .bind(self.github_created_at)
        .bind(self.merged_at)
        .bind(self.closed_at)
        .bind(&self.merge_commit_sha)
        .bind(&self.base_ref)
        .bind(&self.base_commit_sha)
        .bind(&self.head_ref)
        .bind(&self.head_commit_sha)
        .bind(&self.pr_type)
        .bind(&self.component)
        .bind(&origin.table)
        .bind(&origin.params)
        .bind(origin.id)
        .execute(conn)
        .await?;
        Ok(())
    }
}

pub struct PullRequestExtractor {
    pub connection_id: i64,
    pub repo_id: i64,
}

impl Extractable for PullRequestExtractor {
    fn extract(&self, record: &RawDataRecord) -> Result<Vec<Box<dyn Record>>, PipelineError> {
        let pr: ApiPullRequest = parse_raw(record)?;
        let (author_id, author_name) = pr
            .user
            .map(|user| (user.id, user.login))
            .unwrap_or_default();
        Ok(vec![Box::new(GithubPullRequest {
            connection_id: self.connection_id,
            github_id: pr.id,
            repo_id: self.repo_id,
            head_repo_id: pr.head.repo.map(|repo| repo.id).unwrap_or_default(),
            number: pr.number,
            state: pr.state,
            title: pr.title,
            body: pr.body,
            url: pr.html_url,
            author_id,
            author_name,
            github_created_at: pr.created_at,
            merged_at: pr.merged_at,
            closed_at: pr.closed_at,
            merge_commit_sha: pr.merge_commit_sha,
            base_ref: pr.base.git_ref,
            base_commit_sha: pr.base.sha,
            head_ref: pr.head.git_ref,
            head_commit_sha: pr.head.sha,
            pr_type: label_value(&pr.labels, "type/"),
            component: label_value(&pr.labels, "component/"),
        })])
    }
}

fn extract_pull_requests(ctx: &SubTaskContext<GithubTaskData>) -> BoxFuture<'_, Result<(), PipelineError>> {
    Box::pin(async move {
        let data = ctx.data();
        let extractor = ApiExtractor::new(ApiExtractorArgs {
            raw_table: RAW_PULL_REQUEST_TABLE.to_string(),
            params: data.params.clone(),
            batch_size: BATCH_SIZE,
            failure_policy: ctx.extract_failure_policy(),
            extractable: PullRequestExtractor {
                connection_id: data.options.connection_id,
                repo_id: data.options.repo_id,
            },
        });
        extractor.execute(ctx.raw_store(), ctx.cancellation()).await?;
        Ok(())
    })
}

pub struct PullRequestConverter {
    pub connection_id: i64,
}

impl PullRequestConverter {
    /// Tool rows store 0 for a reference GitHub left null; those stay empty in the domain layer.
    fn reference(&self, generator: &DomainIdGenerator, id: i64) -> String {
        if id == 0 {
            return String::new();
        }
        generator.generate(&[self.connection_id.into(), id.into()])
    }

    pub fn domain_pull_request(&self, pr: &GithubPullRequest) -> PullRequest {
        PullRequest {
            id: PR_IDS.generate(&[self.connection_id.into(), pr.github_id.into()]),
            base_repo_id: self.reference(&REPO_IDS, pr.repo_id),
            head_repo_id: self.reference(&REPO_IDS, pr.head_repo_id),
            status: pr.state.clone(),
            title: pr.title.clone(),
            description: pr.body.clone(),
            url: pr.url.clone(),
            author_id: self.reference(&USER_IDS, pr.author_id),
            author_name: pr.author_name.clone(),
            pull_request_key: pr.number,
            pr_type: pr.pr_type.clone(),
            component: pr.component.clone(),
            created_date: pr.github_created_at,
            merged_date: pr.merged_at,
            closed_date: pr.closed_at,
            merge_commit_sha: pr.merge_commit_sha.clone(),
            base_ref: pr.base_ref.clone(),
            base_commit_sha: pr.base_commit_sha.clone(),
            head_ref: pr.head_ref.clone(),
            head_commit_sha: pr.head_commit_sha.clone(),
        }
    }
}

impl Convertible for PullRequestConverter {
    type Input = GithubPullRequest;

    fn convert(&mut self, pr: &GithubPullRequest) -> Result<Vec<Box<dyn Record>>, PipelineError> {
        Ok(vec![Box::new(self.domain_pull_request(pr))])
    }
}

fn convert_pull_requests(ctx: &SubTaskContext<GithubTaskData>) -> BoxFuture<'_, Result<(), PipelineError>> {
    Box::pin(async move {
        let data = ctx.data();
        let mut converter = DataConverter::new(DataConverterArgs {
            input_sql: "SELECT * FROM _tool_github_pull_requests
                        WHERE connection_id = ? AND repo_id = ?
                        ORDER BY github_id"
                .to_string(),
            binds: vec![data.options.connection_id.into(), data.options.repo_id.into()],
            origin: RawOrigin::new(RAW_PULL_REQUEST_TABLE, data.params.clone()),
            batch_size: BATCH_SIZE,
            convertible: PullRequestConverter {
                connection_id: data.options.connection_id,
            },
        });
        converter.execute(ctx.store(), ctx.cancellation()).await?;
        Ok(())
    })
}
