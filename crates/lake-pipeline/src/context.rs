use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use lake_core::PipelineError;
use lake_storage::{RawDataStore, Store};
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Span};
use uuid::Uuid;

use crate::extractor::ExtractFailurePolicy;

pub type SubTaskEntryPoint<D> =
    for<'a> fn(&'a SubTaskContext<D>) -> BoxFuture<'a, Result<(), PipelineError>>;

/// Static definition of one pipeline stage.
pub struct SubTaskMeta<D> {
    pub name: &'static str,
    pub entry_point: SubTaskEntryPoint<D>,
    pub enabled_by_default: bool,
    pub description: &'static str,
    pub depends_on: &'static [&'static str],
}

impl<D> Clone for SubTaskMeta<D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D> Copy for SubTaskMeta<D> {}

impl<D> fmt::Debug for SubTaskMeta<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubTaskMeta")
            .field("name", &self.name)
            .field("enabled_by_default", &self.enabled_by_default)
            .field("depends_on", &self.depends_on)
            .finish()
    }
}

/// State shared by every subtask of one plugin invocation.
pub struct TaskContext<D> {
    plugin: String,
    run_id: Uuid,
    options: serde_json::Value,
    params: String,
    store: Store,
    raw: RawDataStore,
    incremental: bool,
    extract_failure_policy: ExtractFailurePolicy,
    cancel: CancellationToken,
    data: D,
}

impl<D> TaskContext<D> {
    pub fn new(plugin: impl Into<String>, raw: RawDataStore, data: D) -> Self {
        Self {
            plugin: plugin.into(),
            run_id: Uuid::new_v4(),
            options: serde_json::Value::Null,
            params: String::new(),
            store: raw.store().clone(),
            raw,
            incremental: false,
            extract_failure_policy: ExtractFailurePolicy::default(),
            cancel: CancellationToken::new(),
            data,
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn with_options(mut self, options: serde_json::Value, params: String) -> Self {
        self.options = options;
        self.params = params;
        self
    }

    pub fn with_incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    pub fn with_failure_policy(mut self, policy: ExtractFailurePolicy) -> Self {
        self.extract_failure_policy = policy;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// What a subtask entry point sees.
pub struct SubTaskContext<D> {
    task: Arc<TaskContext<D>>,
    name: &'static str,
    span: Span,
}

impl<D> SubTaskContext<D> {
    pub fn new(task: Arc<TaskContext<D>>, name: &'static str) -> Self {
        let span = info_span!(
            "subtask",
            run_id = %task.run_id,
            plugin = %task.plugin,
            subtask = name
        );
        Self { task, name, span }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn plugin(&self) -> &str {
        &self.task.plugin
    }

    pub fn run_id(&self) -> Uuid {
        self.task.run_id
    }

    pub fn options(&self) -> &serde_json::Value {
        &self.task.options
    }

    /// Canonical signature of the invocation options.
    pub fn params(&self) -> &str {
        &self.task.params
    }

    pub fn store(&self) -> &Store {
        &self.task.store
    }

    pub fn raw_store(&self) -> &RawDataStore {
        &self.task.raw
    }

    pub fn data(&self) -> &D {
        &self.task.data
    }

    pub fn incremental(&self) -> bool {
        self.task.incremental
    }

    pub fn extract_failure_policy(&self) -> ExtractFailurePolicy {
        self.task.extract_failure_policy
    }

    pub fn logger(&self) -> &Span {
        &self.span
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.task.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.task.cancel.is_cancelled()
    }

    pub fn checkpoint(&self) -> Result<(), PipelineError> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}
