//! Persistence for the shared domain layer.

use async_trait::async_trait;
use lake_core::{IssueAssigneeHistory, IssueChangelog, PullRequest, SprintIssue};
use sqlx::SqliteConnection;

use crate::migration::{MigrationScript, SqlMigration};
use crate::{RawOrigin, Record, StoreError};

pub const FRAMEWORK_OWNER: &str = "Framework";

const DOMAIN_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS domain_pull_requests (
        id TEXT PRIMARY KEY,
        base_repo_id TEXT NOT NULL,
        head_repo_id TEXT NOT NULL,
        status TEXT NOT NULL,
        title TEXT NOT NULL,
        description TEXT NOT NULL,
        url TEXT NOT NULL,
        author_id TEXT NOT NULL,
        author_name TEXT NOT NULL,
        pull_request_key INTEGER NOT NULL,
        type TEXT NOT NULL,
        component TEXT NOT NULL,
        created_date TEXT NOT NULL,
        merged_date TEXT,
        closed_date TEXT,
        merge_commit_sha TEXT NOT NULL,
        base_ref TEXT NOT NULL,
        base_commit_sha TEXT NOT NULL,
        head_ref TEXT NOT NULL,
        head_commit_sha TEXT NOT NULL,
        _raw_data_table TEXT NOT NULL DEFAULT '',
        _raw_data_params TEXT NOT NULL DEFAULT '',
        _raw_data_id INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_domain_pull_requests_base_repo ON domain_pull_requests(base_repo_id)",
    "CREATE TABLE IF NOT EXISTS domain_issue_changelogs (
        id TEXT PRIMARY KEY,
        issue_id TEXT NOT NULL,
        author_id TEXT NOT NULL,
        author_name TEXT NOT NULL,
        field_id TEXT NOT NULL,
        field_name TEXT NOT NULL,
        original_from_value TEXT NOT NULL,
        original_to_value TEXT NOT NULL,
        created_date TEXT NOT NULL,
        _raw_data_table TEXT NOT NULL DEFAULT '',
        _raw_data_params TEXT NOT NULL DEFAULT '',
        _raw_data_id INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_domain_issue_changelogs_issue ON domain_issue_changelogs(issue_id)",
    "CREATE TABLE IF NOT EXISTS domain_sprint_issues (
        sprint_id TEXT NOT NULL,
        issue_id TEXT NOT NULL,
        added_date TEXT,
        removed_date TEXT,
        is_removed INTEGER NOT NULL DEFAULT 0,
        change_count INTEGER NOT NULL DEFAULT 0,
        _raw_data_table TEXT NOT NULL DEFAULT '',
        _raw_data_params TEXT NOT NULL DEFAULT '',
        _raw_data_id INTEGER,
        PRIMARY KEY (sprint_id, issue_id)
    )",
    "CREATE TABLE IF NOT EXISTS domain_issue_assignee_history (
        issue_id TEXT NOT NULL,
        assignee TEXT NOT NULL,
        start_date TEXT NOT NULL,
        end_date TEXT,
        _raw_data_table TEXT NOT NULL DEFAULT '',
        _raw_data_params TEXT NOT NULL DEFAULT '',
        _raw_data_id INTEGER,
        PRIMARY KEY (issue_id, assignee, start_date)
    )",
];

/// Creates the shared domain tables.
pub fn framework_migrations() -> Vec<Box<dyn MigrationScript>> {
    vec![Box::new(SqlMigration {
        version: 20220401000001,
        owner: FRAMEWORK_OWNER,
        name: "Create domain layer tables",
        statements: DOMAIN_TABLES,
    })]
}

#[async_trait]
impl Record for PullRequest {
    fn table(&self) -> &'static str {
        "domain_pull_requests"
    }

    fn key(&self) -> String {
        self.id.clone()
    }

    async fn upsert(&self, conn: &mut SqliteConnection, origin: &RawOrigin) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO domain_pull_requests (
                id, base_repo_id, head_repo_id, status, title, description, url, author_id,
                author_name, pull_request_key, type, component, created_date, merged_date,
                closed_date, merge_commit_sha, base_ref, base_commit_sha, head_ref, head_commit_sha,
                _raw_data_table, _raw_data_params, _raw_data_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                base_repo_id = excluded.base_repo_id,
                head_repo_id = excluded.head_repo_id,
                status = excluded.status,
                title = excluded.title,
                description = excluded.description,
                url = excluded.url,
                author_id = excluded.author_id,
                author_name = excluded.author_name,
                pull_request_key = excluded.pull_request_key,
                type = excluded.type,
                component = excluded.component,
                created_date = excluded.created_date,
                merged_date = excluded.merged_date,
                closed_date = excluded.closed_date,
                merge_commit_sha = excluded.merge_commit_sha,
                base_ref = excluded.base_ref,
                base_commit_sha = excluded.base_commit_sha,
                head_ref = excluded.head_ref,
                head_commit_sha = excluded.head_commit_sha,
                _raw_data_table = excluded._raw_data_table,
                _raw_data_params = excluded._raw_data_params,
                _raw_data_id = excluded._raw_data_id",
        )
        .bind(&self.id)
        .bind(&self.base_repo_id)
        .bind(&self.head_repo_id)
        .bind(&self.status)
        .bind(&self.title)
        .bind(&self.description)
        .bind(&self.url)
        .bind(&self.author_id)
        .bind(&self.author_name)
        .bind(self.pull_request_key)
        .bind(&self.pr_type)
        .bind(&self.component)
        .bind(self.created_date)
        .bind(self.merged_date)
        .bind(self.closed_date)
        .bind(&self.merge_commit_sha)
        .bind(&self.base_ref)
        .bind(&self.base_commit_sha)
        .bind(&self.head_ref)
        .bind(&self.head_commit_sha)
        .bind(&origin.table)
        .bind(&origin.params)
        .bind(origin.id)
        .execute(conn)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Record for IssueChangelog {
    fn table(&self) -> &'static str {
        "domain_issue_changelogs"
    }

    fn key(&self) -> String {
        self.id.clone()
    }

    async fn upsert(&self, conn: &mut SqliteConnection, origin: &RawOrigin) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO domain_issue_changelogs (
                id, issue_id, author_id, author_name, field_id, field_name,
                original_from_value, original_to_value, created_date,
                _raw_data_table, _raw_data_params, _raw_data_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                issue_id = excluded.issue_id,
                author_id = excluded.author_id,
                author_name = excluded.author_name,
                field_id = excluded.field_id,
                field_name = excluded.field_name,
                original_from_value = excluded.original_from_value,
                original_to_value = excluded.original_to_value,
                created_date = excluded.created_date,
                _raw_data_table = excluded._raw_data_table,
                _raw_data_params = excluded._raw_data_params,
                _raw_data_id = excluded._raw_data_id",
        )
        .bind(&self.id)
        .bind(&self.issue_id)
        .bind(&self.author_id)
        .bind(&self.author_name)
        .bind(&self.field_id)
        .bind(&self.field_name)
        .bind(&self.original_from_value)
        .bind(&self.original_to_value)
        .bind(self.created_date)
        .bind(&origin.table)
        .bind(&origin.params)
        .bind(origin.id)
        .execute(conn)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Record for SprintIssue {
    fn table(&self) -> &'static str {
        "domain_sprint_issues"
    }

    fn key(&self) -> String {
        format!("{}|{}", self.sprint_id, self.issue_id)
    }

    async fn upsert(&self, conn: &mut SqliteConnection, origin: &RawOrigin) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO domain_sprint_issues (
                sprint_id, issue_id, added_date, removed_date, is_removed, change_count,
                _raw_data_table, _raw_data_params, _raw_data_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(sprint_id, issue_id) DO UPDATE SET
                added_date = excluded.added_date,
                removed_date = excluded.removed_date,
                is_removed = excluded.is_removed,
                change_count = excluded.change_count,
                _raw_data_table = excluded._raw_data_table,
                _raw_data_params = excluded._raw_data_params,
                _raw_data_id = excluded._raw_data_id",
        )
        .bind(&self.sprint_id)
        .bind(&self.issue_id)
        .bind(self.added_date)
        .bind(self.removed_date)
        .bind(self.is_removed)
        .bind(self.change_count)
        .bind(&origin.table)
        .bind(&origin.params)
        .bind(origin.id)
        .execute(conn)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Record for IssueAssigneeHistory {
    fn table(&self) -> &'static str {
        "domain_issue_assignee_history"
    }

    fn key(&self) -> String {
        format!("{}|{}|{}", self.issue_id, self.assignee, self.start_date.to_rfc3339())
    }

    async fn upsert(&self, conn: &mut SqliteConnection, origin: &RawOrigin) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO domain_issue_assignee_history (
                issue_id, assignee, start_date, end_date,
                _raw_data_table, _raw_data_params, _raw_data_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(issue_id, assignee, start_date) DO UPDATE SET
                end_date = excluded.end_date,
                _raw_data_table = excluded._raw_data_table,
                _raw_data_params = excluded._raw_data_params,
                _raw_data_id = excluded._raw_data_id",
        )
        .bind(&self.issue_id)
        .bind(&self.assignee)
        .bind(self.start_date)
        .bind(self.end_date)
        .bind(&origin.table)
        .bind(&origin.params)
        .bind(origin.id)
        .execute(conn)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MigrationRegistry, Store};
    use chrono::{TimeZone, Utc};

    async fn migrated_store() -> Store {
        let store = Store::in_memory().await.expect("store");
        let mut registry = MigrationRegistry::new();
        registry
            .register_all(framework_migrations())
            .expect("register");
        registry.execute(&store).await.expect("migrate");
        store
    }

    #[tokio::test]
    async fn sprint_issue_upsert_converges_on_primary_key() {
        let store = migrated_store().await;
        let origin = RawOrigin::new("raw_jira_api_changelogs", "{\"board_id\":8}");
        let added = Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).single().unwrap();

        let mut row = SprintIssue {
            sprint_id: "JiraSprint:1:1:2:10".into(),
            issue_id: "JiraIssue:1:1:4:1001".into(),
            added_date: Some(added),
            removed_date: None,
            is_removed: false,
            change_count: 1,
        };
        let batch: Vec<Box<dyn Record>> = vec![Box::new(row.clone())];
        store.upsert_all(&batch, &origin).await.expect("first");

        row.change_count = 3;
        row.is_removed = true;
        let batch: Vec<Box<dyn Record>> = vec![Box::new(row)];
        store.upsert_all(&batch, &origin).await.expect("second");

        assert_eq!(store.count_rows("domain_sprint_issues").await.unwrap(), 1);
        let (count, removed): (i64, bool) =
            sqlx::query_as("SELECT change_count, is_removed FROM domain_sprint_issues")
                .fetch_one(store.pool())
                .await
                .expect("row");
        assert_eq!((count, removed), (3, true));
    }

    #[tokio::test]
    async fn provenance_columns_are_written() {
        let store = migrated_store().await;
        let origin = RawOrigin::new("raw_jira_api_changelogs", "P").with_id(12);
        let at = Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).single().unwrap();
        let batch: Vec<Box<dyn Record>> = vec![Box::new(IssueAssigneeHistory {
            issue_id: "JiraIssue:1:1:1:5".into(),
            assignee: "JiraAccount:1:1:3:bob".into(),
            start_date: at,
            end_date: None,
        })];
        store.upsert_all(&batch, &origin).await.expect("upsert");

        let (table, params, id): (String, String, Option<i64>) = sqlx::query_as(
            "SELECT _raw_data_table, _raw_data_params, _raw_data_id FROM domain_issue_assignee_history",
        )
        .fetch_one(store.pool())
        .await
        .expect("row");
        assert_eq!(table, "raw_jira_api_changelogs");
        assert_eq!(params, "P");
        assert_eq!(id, Some(12));
    }
}
