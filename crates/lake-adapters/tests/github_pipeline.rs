mod support;

use lake_adapters::github::{PR_IDS, RAW_PULL_REQUEST_TABLE, REPO_IDS, USER_IDS};
use lake_adapters::run_plugin;
use lake_pipeline::{RunStatus, SubTaskStatus};
use serde_json::json;
use sqlx::FromRow;
use support::{invocation, migrated_orchestrator, mount_page};
use tokio_util::sync::CancellationToken;
use wiremock::MockServer;

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
struct DomainPr {
    id: String,
    base_repo_id: String,
    head_repo_id: String,
    author_id: String,
    status: String,
    description: String,
    #[sqlx(rename = "type")]
    pr_type: String,
    component: String,
    merge_commit_sha: String,
    _raw_data_table: String,
}

async fn domain_rows(store: &lake_storage::Store) -> Vec<DomainPr> {
    sqlx::query_as(
        "SELECT id, base_repo_id, head_repo_id, author_id, status, description, type, component,
                merge_commit_sha, _raw_data_table
         FROM domain_pull_requests ORDER BY pull_request_key",
    )
    .fetch_all(store.pool())
    .await
    .expect("domain rows")
}

#[tokio::test]
async fn pull_requests_flow_from_api_to_domain_layer() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_page(&server, "/repos/apache/lake/pulls", "page", "1", "github/pull_requests_page1.json").await;
    let orchestrator = migrated_orchestrator().await?;
    let options = json!({"connection_id": 7, "owner": "apache", "repo": "lake", "repo_id": 5});

    let report = run_plugin(
        orchestrator.clone(),
        invocation("github", options.clone(), &server),
        CancellationToken::new(),
    )
    .await?;
    assert_eq!(report.status, RunStatus::Completed, "{report:?}");
    assert!(report
        .subtasks
        .iter()
        .all(|s| s.status == SubTaskStatus::Completed));

    let store = orchestrator.store();
    let raw: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {RAW_PULL_REQUEST_TABLE}"))
        .fetch_one(store.pool())
        .await?;
    assert_eq!(raw, 2);

    let tool: Vec<(i64, i64)> = sqlx::query_as(
        "SELECT connection_id, github_id FROM _tool_github_pull_requests ORDER BY github_id",
    )
    .fetch_all(store.pool())
    .await?;
    assert_eq!(tool, vec![(7, 880011), (7, 880012)]);

    let domain = domain_rows(store).await;
    assert_eq!(domain.len(), 2);
    assert_eq!(domain[0].id, PR_IDS.generate(&[7i64.into(), 880011i64.into()]));
    assert_eq!(domain[1].id, PR_IDS.generate(&[7i64.into(), 880012i64.into()]));
    assert_eq!(domain[0].base_repo_id, REPO_IDS.generate(&[7i64.into(), 5i64.into()]));
    assert_eq!(domain[1].head_repo_id, REPO_IDS.generate(&[7i64.into(), 912i64.into()]));
    assert_eq!(domain[0].author_id, USER_IDS.generate(&[7i64.into(), 3001i64.into()]));
    assert_eq!(domain[0].pr_type, "improvement");
    assert_eq!(domain[0].component, "storage");
    assert_eq!(domain[1].description, "");
    assert_eq!(domain[1].merge_commit_sha, "");
    assert_eq!(domain[0]._raw_data_table, RAW_PULL_REQUEST_TABLE);
    Ok(())
}

#[tokio::test]
async fn rerunning_a_full_sync_converges_to_the_same_rows() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_page(&server, "/repos/apache/lake/pulls", "page", "1", "github/pull_requests_page1.json").await;
    let orchestrator = migrated_orchestrator().await?;
    let options = json!({"connection_id": 7, "owner": "apache", "repo": "lake", "repo_id": 5});

    run_plugin(orchestrator.clone(), invocation("github", options.clone(), &server), CancellationToken::new()).await?;
    let first = domain_rows(orchestrator.store()).await;

    let report = run_plugin(orchestrator.clone(), invocation("github", options, &server), CancellationToken::new()).await?;
    assert_eq!(report.status, RunStatus::Completed);
    let store = orchestrator.store();
    assert_eq!(store.count_rows(RAW_PULL_REQUEST_TABLE).await?, 2);
    assert_eq!(store.count_rows("_tool_github_pull_requests").await?, 2);
    assert_eq!(domain_rows(store).await, first);
    Ok(())
}

#[tokio::test]
async fn missing_owner_fails_before_any_request() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let orchestrator = migrated_orchestrator().await?;
    let err = run_plugin(
        orchestrator,
        invocation("github", json!({"connection_id": 7, "owner": "", "repo": "lake", "repo_id": 5}), &server),
        CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), "configuration");
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
    Ok(())
}

#[tokio::test]
async fn remote_errors_block_later_stages() -> anyhow::Result<()> {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/apache/lake/pulls"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    let orchestrator = migrated_orchestrator().await?;
    let report = run_plugin(
        orchestrator,
        invocation("github", json!({"connection_id": 7, "owner": "apache", "repo": "lake", "repo_id": 5}), &server),
        CancellationToken::new(),
    )
    .await?;
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.subtask("collectPullRequests").map(|s| s.status), Some(SubTaskStatus::Failed));
    assert_eq!(report.subtask("extractPullRequests").map(|s| s.status), Some(SubTaskStatus::Skipped));
    assert_eq!(report.subtask("convertPullRequests").map(|s| s.status), Some(SubTaskStatus::Skipped));
    Ok(())
}
