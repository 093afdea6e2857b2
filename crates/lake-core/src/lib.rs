//! Core domain model, identity generation and error taxonomy for the lake pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod didgen;

pub use didgen::{generate, DomainIdGenerator, KeyPart, ParsedDomainId};

pub const CRATE_NAME: &str = "lake-core";

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure taxonomy shared by every pipeline stage.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("transient i/o failure: {0}")]
    TransientIo(String),
    #[error("remote returned http {status} for {url}")]
    Remote { status: u16, url: String },
    #[error("malformed data in {table} record {record_id}: {reason}")]
    MalformedData {
        table: String,
        record_id: i64,
        reason: String,
    },
    #[error("migration {owner}/{version} ({name}) failed: {reason}")]
    Schema {
        owner: String,
        version: u64,
        name: String,
        reason: String,
    },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("conversion failed: {0}")]
    Conversion(String),
    #[error("database error: {0}")]
    Database(#[source] BoxError),
    #[error("task cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn conversion(message: impl Into<String>) -> Self {
        Self::Conversion(message.into())
    }

    /// Short stable label used in run reports and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientIo(_) => "transient_io",
            Self::Remote { .. } => "remote",
            Self::MalformedData { .. } => "malformed_data",
            Self::Schema { .. } => "schema",
            Self::Configuration(_) => "configuration",
            Self::Conversion(_) => "conversion",
            Self::Database(_) => "database",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Unified pull request, source agnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: String,
    pub base_repo_id: String,
    pub head_repo_id: String,
    pub status: String,
    pub title: String,
    pub description: String,
    pub url: String,
    pub author_id: String,
    pub author_name: String,
    pub pull_request_key: i64,
    pub pr_type: String,
    pub component: String,
    pub created_date: DateTime<Utc>,
    pub merged_date: Option<DateTime<Utc>>,
    pub closed_date: Option<DateTime<Utc>>,
    pub merge_commit_sha: String,
    pub base_ref: String,
    pub base_commit_sha: String,
    pub head_ref: String,
    pub head_commit_sha: String,
}

/// One field change on an issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueChangelog {
    pub id: String,
    pub issue_id: String,
    pub author_id: String,
    pub author_name: String,
    pub field_id: String,
    pub field_name: String,
    pub original_from_value: String,
    pub original_to_value: String,
    pub created_date: DateTime<Utc>,
}

/// Aggregated membership of an issue in a sprint, derived from its whole changelog stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SprintIssue {
    pub sprint_id: String,
    pub issue_id: String,
    pub added_date: Option<DateTime<Utc>>,
    pub removed_date: Option<DateTime<Utc>>,
    pub is_removed: bool,
    pub change_count: i64,
}

/// One interval during which an issue was assigned to someone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueAssigneeHistory {
    pub issue_id: String,
    pub assignee: String,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
}
