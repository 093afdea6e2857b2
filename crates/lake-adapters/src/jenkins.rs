use async_trait::async_trait;
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

use crate::common::null_as_empty;

pub const PLUGIN_NAME: &str = "jenkins";
pub const RAW_JOB_TABLE: &str = "raw_jenkins_api_jobs";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JenkinsOptions {
    pub connection_id: i64,
}

pub struct JenkinsTaskData {
    pub options: JenkinsOptions,
    pub params: String,
    pub client: ApiClient,
}

pub struct JenkinsPlugin;

#[async_trait]
impl Plugin for JenkinsPlugin {
    type TaskData = JenkinsTaskData;

    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn subtask_metas(&self) -> Vec<SubTaskMeta<JenkinsTaskData>> {
        vec![
            SubTaskMeta {
                name: "collectApiJobs",
                entry_point: collect_api_jobs,
                enabled_by_default: true,
                description: "Collect the job list",
                depends_on: &[],
            },
            SubTaskMeta {
                name: "extractApiJobs",
                entry_point: extract_api_jobs,
                enabled_by_default: true,
                description: "Extract jobs into _tool_jenkins_jobs",
                depends_on: &["collectApiJobs"],
            },
        ]
    }

    fn migration_scripts(&self) -> Vec<Box<dyn MigrationScript>> {
        vec![Box::new(SqlMigration {
            version: 20220420000001,
            owner: "Jenkins",
            name: "Init jenkins schemas",
            statements: &["CREATE TABLE IF NOT EXISTS _tool_jenkins_jobs (
                connection_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                url TEXT NOT NULL DEFAULT '',
                class TEXT NOT NULL DEFAULT '',
                color TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                _raw_data_table TEXT NOT NULL DEFAULT '',
                _raw_data_params TEXT NOT NULL DEFAULT '',
                _raw_data_id INTEGER,
                PRIMARY KEY (connection_id, name)
            )"],
        })]
    }

    async fn prepare_task_data(
        &self,
        invocation: &TaskInvocation,
        config: &LakeConfig,
    ) -> Result<JenkinsTaskData, PipelineError> {
        let options: JenkinsOptions = invocation.typed_options()?;
        Ok(JenkinsTaskData {
            params: params_signature(&options)?,
            client: invocation.connection.api_client(config)?,
            options,
        })
    }
}

struct JobList;

impl Collectible for JobList {
    fn parse_response(&self, response: &ApiResponse) -> Result<Vec<Box<RawValue>>, PipelineError> {
        parse_json_field_array(response, "jobs")
    }

    fn query(&self, _request: &RequestData<'_>) -> Vec<(String, String)> {
        vec![(
            "tree".to_string(),
            "jobs[name,url,description,color,_class]".to_string(),
        )]
    }
}

fn collect_api_jobs(ctx: &SubTaskContext<JenkinsTaskData>) -> BoxFuture<'_, Result<(), PipelineError>> {
    Box::pin(async move {
        let data = ctx.data();
        // The job list is one document; there is nothing to page through.
        let collector = ApiCollector::new(ApiCollectorArgs {
            raw_table: RAW_JOB_TABLE.to_string(),
            params: data.params.clone(),
            client: data.client.clone(),
            url_template: "api/json".to_string(),
            page_size: None,
            incremental: false,
            input: None,
            collectible: JobList,
        })?;
        collector.execute(ctx.raw_store(), ctx.cancellation()).await?;
        Ok(())
    })
}

#[derive(Debug, Deserialize)]
struct ApiJob {
    name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    url: String,
    #[serde(rename = "_class", default, deserialize_with = "null_as_empty")]
    class: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    color: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    description: String,
}

/// `_tool_jenkins_jobs`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JenkinsJob {
    pub connection_id: i64,
    pub name: String,
    pub url: String,
    pub class: String,
    pub color: String,
    pub description: String,
}

#[async_trait]
impl Record for JenkinsJob {
    fn table(&self) -> &'static str {
        "_tool_jenkins_jobs"
    }

    fn key(&self) -> String {
        format!("{}|{}", self.connection_id, self.name)
    }

    async fn upsert(&self, conn: &mut SqliteConnection, origin: &RawOrigin) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO _tool_jenkins_jobs (
                connection_id, name, url, class, color, description,
                _raw_data_table, _raw_data_params, _raw_data_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(connection_id, name) DO UPDATE SET
                url = excluded.url,
                class = excluded.class,
                color = excluded.color,
                description = excluded.description,
                _raw_data_table = excluded._raw_data_table,
                _raw_data_params = excluded._raw_data_params,
                _raw_data_id = excluded._raw_data_id",
        )
        .bind(self.connection_id)
        .bind(&self.name)
        .bind(&self.url)
        .bind(&self.class)
        .bind(&self.color)
        .bind(&self.description)
        .bind(&origin.table)
        .bind(&origin.params)
        .bind(origin.id)
        .execute(conn)
        .await?;
        Ok(())
    }
}

pub struct JobExtractor {
    pub connection_id: i64,
}

impl Extractable for JobExtractor {
    fn extract(&self, record: &RawDataRecord) -> Result<Vec<Box<dyn Record>>, PipelineError> {
        let job: ApiJob = parse_raw(record)?;
        Ok(vec![Box::new(JenkinsJob {
            connection_id: self.connection_id,
            name: job.name,
            url: job.url,
            class: job.class,
            color: job.color,
            description: job.description,
        })])
    }
}

fn extract_api_jobs(ctx: &SubTaskContext<JenkinsTaskData>) -> BoxFuture<'_, Result<(), PipelineError>> {
    Box::pin(async move {
        let data = ctx.data();
        let extractor = ApiExtractor::new(ApiExtractorArgs {
            raw_table: RAW_JOB_TABLE.to_string(),
            params: data.params.clone(),
            batch_size: 500,
            failure_policy: ctx.extract_failure_policy(),
            extractable: JobExtractor {
                connection_id: data.options.connection_id,
            },
        });
        extractor.execute(ctx.raw_store(), ctx.cancellation()).await?;
        Ok(())
    })
}
