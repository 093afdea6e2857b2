#![allow(dead_code)]

use std::path::{Path, PathBuf};

use lake_adapters::migration_registry;
use lake_pipeline::{LakeConfig, Orchestrator, TaskInvocation};
use lake_storage::Store;
use serde_json::Value;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub fn fixture_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(name)
}

pub fn fixture(name: &str) -> String {
    std::fs::read_to_string(fixture_path(name))
        .unwrap_or_else(|err| panic!("reading fixture {name}: {err}"))
}

/// In-memory store with every migration applied.
pub async fn migrated_orchestrator() -> anyhow::Result<Orchestrator> {
    let store = Store::in_memory().await?;
    migration_registry()?.execute(&store).await?;
    Ok(Orchestrator::new(LakeConfig::default(), store))
}

pub fn invocation(plugin: &str, options: Value, server: &MockServer) -> TaskInvocation {
    let mut invocation = TaskInvocation::new(plugin, options);
    invocation.connection.endpoint = server.uri();
    invocation.connection.max_retries = Some(0);
    invocation
}

/// Serve `fixture` for one query value of a paged endpoint; other pages fall through to 404.
pub async fn mount_page(server: &MockServer, route: &str, key: &str, value: &str, fixture_name: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .and(query_param(key, value))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/json")
                .set_body_string(fixture(fixture_name)),
        )
        .mount(server)
        .await;
}
