//! Reference plugins and the dispatch that maps a pipeline entry onto one of them.

use lake_core::PipelineError;
use lake_pipeline::{Orchestrator, Plugin, RunPlan, RunReport, TaskInvocation};
use lake_storage::domain::framework_migrations;
use lake_storage::{MigrationRegistry, MigrationScript};
use tokio_util::sync::CancellationToken;

pub mod common;
pub mod github;
pub mod jenkins;
pub mod jira;
pub mod tapd;

pub use github::GithubPlugin;
pub use jenkins::JenkinsPlugin;
pub use jira::JiraPlugin;
pub use tapd::TapdPlugin;

pub const CRATE_NAME: &str = "lake-adapters";

pub const PLUGIN_NAMES: &[&str] = &[
    github::PLUGIN_NAME,
    jira::PLUGIN_NAME,
    jenkins::PLUGIN_NAME,
    tapd::PLUGIN_NAME,
];

fn unknown_plugin(name: &str) -> PipelineError {
    PipelineError::config(format!(
        "unknown plugin {name:?}; expected one of {}",
        PLUGIN_NAMES.join(", ")
    ))
}

/// Framework scripts followed by every plugin's scripts.
pub fn all_migration_scripts() -> Vec<Box<dyn MigrationScript>> {
    let mut scripts = framework_migrations();
    scripts.extend(GithubPlugin.migration_scripts());
    scripts.extend(JiraPlugin.migration_scripts());
    scripts.extend(JenkinsPlugin.migration_scripts());
    scripts.extend(TapdPlugin.migration_scripts());
    scripts
}

pub fn migration_registry() -> Result<MigrationRegistry, PipelineError> {
    let mut registry = MigrationRegistry::new();
    registry.register_all(all_migration_scripts())?;
    Ok(registry)
}

/// Resolved subtask order for an invocation, without running anything.
pub fn plan_for(invocation: &TaskInvocation) -> Result<RunPlan, PipelineError> {
    match invocation.plugin.as_str() {
        github::PLUGIN_NAME => RunPlan::build(&GithubPlugin.subtask_metas(), &invocation.subtasks),
        jira::PLUGIN_NAME => RunPlan::build(&JiraPlugin.subtask_metas(), &invocation.subtasks),
        jenkins::PLUGIN_NAME => RunPlan::build(&JenkinsPlugin.subtask_metas(), &invocation.subtasks),
        tapd::PLUGIN_NAME => RunPlan::build(&TapdPlugin.subtask_metas(), &invocation.subtasks),
        other => Err(unknown_plugin(other)),
    }
}

pub async fn run_plugin(
    orchestrator: Orchestrator,
    invocation: TaskInvocation,
    cancel: CancellationToken,
) -> Result<RunReport, PipelineError> {
    match invocation.plugin.as_str() {
        github::PLUGIN_NAME => orchestrator.run(&GithubPlugin, invocation, cancel).await,
        jira::PLUGIN_NAME => orchestrator.run(&JiraPlugin, invocation, cancel).await,
        jenkins::PLUGIN_NAME => orchestrator.run(&JenkinsPlugin, invocation, cancel).await,
        tapd::PLUGIN_NAME => orchestrator.run(&TapdPlugin, invocation, cancel).await,
        other => Err(unknown_plugin(other)),
    }
}
