mod support;

use lake_adapters::run_plugin;
use lake_pipeline::{RunStatus, SubTaskStatus};
use serde_json::json;
use support::{invocation, migrated_orchestrator, mount_page};
use tokio_util::sync::CancellationToken;
use wiremock::MockServer;

#[tokio::test]
async fn iteration_names_resolve_to_ids_and_unknown_names_stay_null() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_page(&server, "/iterations", "page", "1", "tapd/iterations.json").await;
    mount_page(&server, "/bug_changes", "page", "1", "tapd/bug_changes.json").await;
    let orchestrator = migrated_orchestrator().await?;

    let report = run_plugin(
        orchestrator.clone(),
        invocation("tapd", json!({"connection_id": 2, "workspace_id": 5501}), &server),
        CancellationToken::new(),
    )
    .await?;
    assert_eq!(report.status, RunStatus::Completed, "{report:?}");

    let store = orchestrator.store();
    assert_eq!(store.count_rows("_tool_tapd_iterations").await?, 2);
    assert_eq!(store.count_rows("_tool_tapd_bug_changelogs").await?, 3);

    let items: Vec<(i64, String, Option<i64>, Option<i64>)> = sqlx::query_as(
        "SELECT changelog_id, field, iteration_id_from, iteration_id_to
         FROM _tool_tapd_bug_changelog_items ORDER BY changelog_id",
    )
    .fetch_all(store.pool())
    .await?;
    assert_eq!(
        items,
        vec![
            (7701, "iteration_id".to_string(), Some(1155001), Some(1155002)),
            (7702, "iteration_id".to_string(), Some(1155002), None),
            (7703, "status".to_string(), None, None),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn failed_iteration_collection_skips_changelog_extraction() -> anyhow::Result<()> {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/iterations"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;
    mount_page(&server, "/bug_changes", "page", "1", "tapd/bug_changes.json").await;
    let orchestrator = migrated_orchestrator().await?;

    let report = run_plugin(
        orchestrator.clone(),
        invocation("tapd", json!({"connection_id": 2, "workspace_id": 5501}), &server),
        CancellationToken::new(),
    )
    .await?;
    assert_eq!(report.status, RunStatus::Failed);
    let status = |name: &str| report.subtask(name).map(|s| s.status);
    assert_eq!(status("collectIterations"), Some(SubTaskStatus::Failed));
    assert_eq!(status("extractIterations"), Some(SubTaskStatus::Skipped));
    // Independent chain still runs.
    assert_eq!(status("collectBugChangelogs"), Some(SubTaskStatus::Completed));
    assert_eq!(status("extractBugChangelogs"), Some(SubTaskStatus::Skipped));
    assert_eq!(orchestrator.store().count_rows("raw_tapd_api_bug_changelogs").await?, 3);
    Ok(())
}
