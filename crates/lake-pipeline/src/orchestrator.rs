//! Subtask planning and execution for plugin invocations.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lake_core::PipelineError;
use lake_storage::{params_signature, MigrationScript, RawDataStore, Store};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{LakeConfig, TaskInvocation};
use crate::context::{SubTaskContext, SubTaskMeta, TaskContext};

/// A statically registered data source.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    type TaskData: Send + Sync + 'static;

    fn name(&self) -> &'static str;

    fn subtask_metas(&self) -> Vec<SubTaskMeta<Self::TaskData>>;

    fn migration_scripts(&self) -> Vec<Box<dyn MigrationScript>>;

    /// Validate options and build whatever the subtasks share, typically an `ApiClient`.
    async fn prepare_task_data(
        &self,
        invocation: &TaskInvocation,
        config: &LakeConfig,
    ) -> Result<Self::TaskData, PipelineError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubTaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Disabled,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedSubTask {
    pub name: &'static str,
    pub enabled: bool,
    pub depends_on: Vec<&'static str>,
    #[serde(skip)]
    meta_index: usize,
}

/// Validated execution order for one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunPlan {
    pub steps: Vec<PlannedSubTask>,
}

impl RunPlan {
    /// Topological order, stable with respect to registration order.
    pub fn build<D>(
        metas: &[SubTaskMeta<D>],
        overrides: &BTreeMap<String, bool>,
    ) -> Result<Self, PipelineError> {
        let mut index_of = HashMap::with_capacity(metas.len());
        for (index, meta) in metas.iter().enumerate() {
            if index_of.insert(meta.name, index).is_some() {
                return Err(PipelineError::config(format!(
                    "subtask {} registered twice",
                    meta.name
                )));
            }
        }
        for name in overrides.keys() {
            if !index_of.contains_key(name.as_str()) {
                return Err(PipelineError::config(format!("unknown subtask {name} in selection")));
            }
        }
        for meta in metas {
            for dep in meta.depends_on {
                if !index_of.contains_key(dep) {
                    return Err(PipelineError::config(format!(
                        "subtask {} depends on unknown subtask {dep}",
                        meta.name
                    )));
                }
            }
        }

        let mut placed = vec![false; metas.len()];
        let mut steps = Vec::with_capacity(metas.len());
        while steps.len() < metas.len() {
            let next = metas.iter().enumerate().position(|(index, meta)| {
                !placed[index]
                    && meta
                        .depends_on
                        .iter()
                        .all(|dep| index_of.get(dep).is_some_and(|&d| placed[d]))
            });
            let Some(index) = next else {
                let stuck: Vec<&str> = metas
                    .iter()
                    .enumerate()
                    .filter(|(index, _)| !placed[*index])
                    .map(|(_, meta)| meta.name)
                    .collect();
                return Err(PipelineError::config(format!(
                    "subtask dependency cycle among {}",
                    stuck.join(", ")
                )));
            };
            placed[index] = true;
            let meta = &metas[index];
            steps.push(PlannedSubTask {
                name: meta.name,
                enabled: overrides
                    .get(meta.name)
                    .copied()
                    .unwrap_or(meta.enabled_by_default),
                depends_on: meta.depends_on.to_vec(),
                meta_index: index,
            });
        }

        Ok(Self { steps })
    }

    pub fn enabled(&self) -> impl Iterator<Item = &PlannedSubTask> {
        self.steps.iter().filter(|step| step.enabled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubTaskReport {
    pub name: String,
    pub status: SubTaskStatus,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub plugin: String,
    pub run_id: Uuid,
    pub partition: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub subtasks: Vec<SubTaskReport>,
}

impl RunReport {
    pub fn subtask(&self, name: &str) -> Option<&SubTaskReport> {
        self.subtasks.iter().find(|s| s.name == name)
    }
}

/// Runs invocations with per-partition serialization and a global cap.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    config: Arc<LakeConfig>,
    raw: RawDataStore,
    global_limit: Arc<Semaphore>,
    partitions: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
}

impl Orchestrator {
    pub fn new(config: LakeConfig, store: Store) -> Self {
        let global_limit = Arc::new(Semaphore::new(config.max_concurrent_runs.max(1)));
        Self {
            config: Arc::new(config),
            raw: RawDataStore::new(store),
            global_limit,
            partitions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &LakeConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        self.raw.store()
    }

    async fn partition_semaphore(&self, partition: &str) -> Arc<Semaphore> {
        let mut map = self.partitions.lock().await;
        map.entry(partition.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    /// Forget a partition once no run holds or waits on its semaphore.
    async fn release_partition(&self, partition: &str) {
        let mut map = self.partitions.lock().await;
        if map
            .get(partition)
            .is_some_and(|semaphore| Arc::strong_count(semaphore) == 1)
        {
            map.remove(partition);
        }
    }

    async fn acquire(
        semaphore: Arc<Semaphore>,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, PipelineError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
            permit = semaphore.acquire_owned() => {
                permit.map_err(|_| PipelineError::TransientIo("orchestrator shut down".to_string()))
            }
        }
    }

    /// Plan and run one invocation.
    ///
    /// Configuration problems are returned as errors before any subtask runs; subtask failures
    /// are reported in the returned [`RunReport`].
    pub async fn run<P: Plugin>(
        &self,
        plugin: &P,
        invocation: TaskInvocation,
        cancel: CancellationToken,
    ) -> Result<RunReport, PipelineError> {
        let metas = plugin.subtask_metas();
        let plan = RunPlan::build(&metas, &invocation.subtasks)?;
        let params = params_signature(&invocation.options)?;
        let partition = format!("{}:{}", plugin.name(), params);
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id, plugin = plugin.name());

        async move {
            let partition_lock = self.partition_semaphore(&partition).await;
            let result = async {
                // A run queued behind its own partition must not hold a global slot.
                let _partition = Self::acquire(partition_lock, &cancel).await?;
                let _global = Self::acquire(self.global_limit.clone(), &cancel).await?;

                let data = plugin.prepare_task_data(&invocation, &self.config).await?;
                let task = TaskContext::new(plugin.name(), self.raw.clone(), data)
                    .with_run_id(run_id)
                    .with_options(invocation.options.clone(), params)
                    .with_incremental(invocation.incremental)
                    .with_failure_policy(invocation.extract_failure_policy)
                    .with_cancellation(cancel.clone());

                Ok::<_, PipelineError>(
                    execute_plan(Arc::new(task), &metas, &plan, partition.clone()).await,
                )
            }
            .await;
            self.release_partition(&partition).await;
            result
        }
        .instrument(span)
        .await
    }

    /// Run every invocation concurrently, each as its own task with a child token.
    ///
    /// `launch` maps an invocation onto its plugin; results come back in input order.
    pub async fn run_all<F, Fut>(
        &self,
        invocations: Vec<TaskInvocation>,
        cancel: &CancellationToken,
        launch: F,
    ) -> Vec<Result<RunReport, PipelineError>>
    where
        F: Fn(Orchestrator, TaskInvocation, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RunReport, PipelineError>> + Send + 'static,
    {
        let launch = Arc::new(launch);
        let handles: Vec<_> = invocations
            .into_iter()
            .map(|invocation| {
                let launch = launch.clone();
                let orchestrator = self.clone();
                let child = cancel.child_token();
                tokio::spawn(async move { launch(orchestrator, invocation, child).await })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle.await {
                Ok(result) => result,
                Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                Err(_) => Err(PipelineError::Cancelled),
            });
        }
        results
    }
}

async fn execute_plan<D: Send + Sync + 'static>(
    task: Arc<TaskContext<D>>,
    metas: &[SubTaskMeta<D>],
    plan: &RunPlan,
    partition: String,
) -> RunReport {
    let started_at = Utc::now();
    let cancel = task.cancellation().clone();
    let mut statuses: HashMap<&'static str, SubTaskStatus> = HashMap::new();
    let mut failed_any = false;
    let mut reports = Vec::with_capacity(plan.steps.len());

    for step in &plan.steps {
        let mut report = SubTaskReport {
            name: step.name.to_string(),
            status: SubTaskStatus::Pending,
            error: None,
            duration_ms: 0,
        };

        let blocked_by = step.depends_on.iter().copied().find(|dep| {
            matches!(
                statuses.get(dep),
                Some(SubTaskStatus::Failed | SubTaskStatus::Skipped)
            )
        });

        if !step.enabled {
            report.status = SubTaskStatus::Disabled;
        } else if cancel.is_cancelled() {
            report.status = SubTaskStatus::Skipped;
            report.error = Some(PipelineError::Cancelled.to_string());
        } else if let Some(dep) = blocked_by {
            report.status = SubTaskStatus::Skipped;
            report.error = Some(format!("blocked by {dep}"));
            failed_any = true;
            warn!(subtask = step.name, dependency = dep, "subtask blocked");
        } else {
            let meta = &metas[step.meta_index];
            let ctx = SubTaskContext::new(task.clone(), meta.name);
            let span = ctx.logger().clone();
            report.status = SubTaskStatus::Running;
            info!(subtask = meta.name, "subtask started");

            let clock = Instant::now();
            let result = (meta.entry_point)(&ctx).instrument(span).await;
            report.duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);

            match result {
                Ok(()) => {
                    report.status = SubTaskStatus::Completed;
                    info!(subtask = meta.name, duration_ms = report.duration_ms, "subtask completed");
                }
                Err(err) => {
                    report.status = SubTaskStatus::Failed;
                    failed_any = true;
                    error!(subtask = meta.name, kind = err.kind(), error = %err, "subtask failed");
                    report.error = Some(err.to_string());
                }
            }
        }

        statuses.insert(step.name, report.status);
        reports.push(report);
    }

    let status = if cancel.is_cancelled() {
        RunStatus::Cancelled
    } else if failed_any {
        RunStatus::Failed
    } else {
        RunStatus::Completed
    };

    RunReport {
        plugin: task.plugin().to_string(),
        run_id: task.run_id(),
        partition,
        status,
        started_at,
        finished_at: Utc::now(),
        subtasks: reports,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        calls: std::sync::Mutex<Vec<&'static str>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl Recorder {
        fn record(&self, name: &'static str) {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(name);
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }
    }

    type Data = Arc<Recorder>;

    fn ok_step(ctx: &SubTaskContext<Data>) -> BoxFuture<'_, Result<(), PipelineError>> {
        async move {
            ctx.data().record(ctx.name());
            Ok(())
        }
        .boxed()
    }

    fn failing_step(ctx: &SubTaskContext<Data>) -> BoxFuture<'_, Result<(), PipelineError>> {
        async move {
            ctx.data().record(ctx.name());
            Err(PipelineError::Remote {
                status: 401,
                url: "http://example.test".into(),
            })
        }
        .boxed()
    }

    fn slow_step(ctx: &SubTaskContext<Data>) -> BoxFuture<'_, Result<(), PipelineError>> {
        async move {
            let recorder = ctx.data();
            let now = recorder.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            recorder.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            recorder.in_flight.fetch_sub(1, Ordering::SeqCst);
            ctx.checkpoint()
        }
        .boxed()
    }

    fn cancelling_step(ctx: &SubTaskContext<Data>) -> BoxFuture<'_, Result<(), PipelineError>> {
        async move {
            ctx.cancellation().cancel();
            ctx.checkpoint()
        }
        .boxed()
    }

    fn meta(
        name: &'static str,
        entry_point: crate::context::SubTaskEntryPoint<Data>,
        depends_on: &'static [&'static str],
    ) -> SubTaskMeta<Data> {
        SubTaskMeta {
            name,
            entry_point,
            enabled_by_default: true,
            description: "",
            depends_on,
        }
    }

    struct TestPlugin {
        recorder: Arc<Recorder>,
        metas: Vec<SubTaskMeta<Data>>,
    }

    #[async_trait]
    impl Plugin for TestPlugin {
        type TaskData = Data;

        fn name(&self) -> &'static str {
            "test"
        }

        fn subtask_metas(&self) -> Vec<SubTaskMeta<Data>> {
            self.metas.clone()
        }

        fn migration_scripts(&self) -> Vec<Box<dyn MigrationScript>> {
            Vec::new()
        }

        async fn prepare_task_data(
            &self,
            _invocation: &TaskInvocation,
            _config: &LakeConfig,
        ) -> Result<Data, PipelineError> {
            Ok(self.recorder.clone())
        }
    }

    async fn orchestrator() -> Orchestrator {
        Orchestrator::new(LakeConfig::default(), Store::in_memory().await.expect("store"))
    }

    #[test]
    fn plan_orders_dependencies_stably() {
        let metas = vec![
            meta("convert", ok_step, &["extract"]),
            meta("collect", ok_step, &[]),
            meta("extract", ok_step, &["collect"]),
            meta("other", ok_step, &[]),
        ];
        let plan = RunPlan::build(&metas, &BTreeMap::new()).expect("plan");
        let names: Vec<_> = plan.steps.iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["collect", "extract", "convert", "other"]);
    }

    #[test]
    fn plan_rejects_bad_graphs_and_selections() {
        let cyclic = vec![meta("a", ok_step, &["b"]), meta("b", ok_step, &["a"])];
        assert!(RunPlan::build(&cyclic, &BTreeMap::new()).is_err());

        let dangling = vec![meta("a", ok_step, &["missing"])];
        assert!(RunPlan::build(&dangling, &BTreeMap::new()).is_err());

        let duplicate = vec![meta("a", ok_step, &[]), meta("a", ok_step, &[])];
        assert!(RunPlan::build(&duplicate, &BTreeMap::new()).is_err());

        let fine = vec![meta("a", ok_step, &[])];
        let selection = BTreeMap::from([("nope".to_string(), false)]);
        let err = RunPlan::build(&fine, &selection).unwrap_err();
        assert_eq!(err.kind(), "configuration");
    }

    #[tokio::test]
    async fn failure_blocks_dependents_but_not_independent_chains() {
        let recorder = Arc::new(Recorder::default());
        let plugin = TestPlugin {
            recorder: recorder.clone(),
            metas: vec![
                meta("collect", failing_step, &[]),
                meta("extract", ok_step, &["collect"]),
                meta("convert", ok_step, &["extract"]),
                meta("collectJobs", ok_step, &[]),
            ],
        };
        let report = orchestrator()
            .await
            .run(&plugin, TaskInvocation::new("test", serde_json::json!({})), CancellationToken::new())
            .await
            .expect("run");

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.subtask("collect").unwrap().status, SubTaskStatus::Failed);
        assert_eq!(report.subtask("extract").unwrap().status, SubTaskStatus::Skipped);
        assert_eq!(report.subtask("convert").unwrap().status, SubTaskStatus::Skipped);
        assert_eq!(report.subtask("collectJobs").unwrap().status, SubTaskStatus::Completed);
        assert_eq!(recorder.calls(), vec!["collect", "collectJobs"]);
        assert!(report
            .subtask("collect")
            .and_then(|s| s.error.as_deref())
            .is_some_and(|e| e.contains("401")));

        let json = serde_json::to_value(&report).expect("json");
        assert_eq!(json["subtasks"][1]["status"], "skipped");
    }

    #[tokio::test]
    async fn disabled_dependency_counts_as_satisfied() {
        let recorder = Arc::new(Recorder::default());
        let plugin = TestPlugin {
            recorder: recorder.clone(),
            metas: vec![
                meta("collect", failing_step, &[]),
                meta("extract", ok_step, &["collect"]),
            ],
        };
        let mut invocation = TaskInvocation::new("test", serde_json::json!({}));
        invocation.subtasks.insert("collect".into(), false);

        let report = orchestrator()
            .await
            .run(&plugin, invocation, CancellationToken::new())
            .await
            .expect("run");
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.subtask("collect").unwrap().status, SubTaskStatus::Disabled);
        assert_eq!(recorder.calls(), vec!["extract"]);
    }

    #[tokio::test]
    async fn cancellation_skips_remaining_subtasks() {
        let recorder = Arc::new(Recorder::default());
        let plugin = TestPlugin {
            recorder: recorder.clone(),
            metas: vec![
                meta("interrupted", cancelling_step, &[]),
                meta("after", ok_step, &[]),
            ],
        };
        let cancel = CancellationToken::new();

        let report = orchestrator()
            .await
            .run(&plugin, TaskInvocation::new("test", serde_json::json!({})), cancel.clone())
            .await
            .expect("run");
        assert!(cancel.is_cancelled());
        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.subtask("interrupted").unwrap().status, SubTaskStatus::Failed);
        assert_eq!(report.subtask("after").unwrap().status, SubTaskStatus::Skipped);
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn same_partition_runs_are_serialized() {
        let recorder = Arc::new(Recorder::default());
        let plugin = Arc::new(TestPlugin {
            recorder: recorder.clone(),
            metas: vec![meta("slow", slow_step, &[])],
        });
        let orchestrator = orchestrator().await;
        let options = serde_json::json!({"connection_id": 1});
        let invocations = vec![
            TaskInvocation::new("test", options.clone()),
            TaskInvocation::new("test", options),
        ];

        let results = orchestrator
            .run_all(invocations, &CancellationToken::new(), move |orch, invocation, cancel| {
                let plugin = plugin.clone();
                async move { orch.run(plugin.as_ref(), invocation, cancel).await }
            })
            .await;

        assert_eq!(results.len(), 2);
        for result in results {
            assert_eq!(result.expect("run").status, RunStatus::Completed);
        }
        assert_eq!(recorder.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_partitions_run_concurrently() {
        let recorder = Arc::new(Recorder::default());
        let plugin = Arc::new(TestPlugin {
            recorder: recorder.clone(),
            metas: vec![meta("slow", slow_step, &[])],
        });
        let orchestrator = orchestrator().await;
        let invocations = vec![
            TaskInvocation::new("test", serde_json::json!({"connection_id": 1})),
            TaskInvocation::new("test", serde_json::json!({"connection_id": 2})),
        ];

        let results = orchestrator
            .run_all(invocations, &CancellationToken::new(), move |orch, invocation, cancel| {
                let plugin = plugin.clone();
                async move { orch.run(plugin.as_ref(), invocation, cancel).await }
            })
            .await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(recorder.max_in_flight.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn queued_partition_runs_leave_global_slots_free() {
        let recorder = Arc::new(Recorder::default());
        let plugin = Arc::new(TestPlugin {
            recorder: recorder.clone(),
            metas: vec![meta("slow", slow_step, &[])],
        });
        let config = LakeConfig {
            max_concurrent_runs: 2,
            ..LakeConfig::default()
        };
        let orchestrator = Orchestrator::new(config, Store::in_memory().await.expect("store"));
        let invocations = vec![
            TaskInvocation::new("test", serde_json::json!({"connection_id": 1})),
            TaskInvocation::new("test", serde_json::json!({"connection_id": 1})),
            TaskInvocation::new("test", serde_json::json!({"connection_id": 2})),
        ];

        let results = orchestrator
            .run_all(invocations, &CancellationToken::new(), move |orch, invocation, cancel| {
                let plugin = plugin.clone();
                async move { orch.run(plugin.as_ref(), invocation, cancel).await }
            })
            .await;
        assert!(results.iter().all(|r| r.is_ok()));
        // connection 2 ran alongside the first connection 1 run.
        assert_eq!(recorder.max_in_flight.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn idle_partitions_are_forgotten() {
        let recorder = Arc::new(Recorder::default());
        let plugin = Arc::new(TestPlugin {
            recorder: recorder.clone(),
            metas: vec![meta("slow", slow_step, &[])],
        });
        let orchestrator = orchestrator().await;
        let invocations = (0..3)
            .map(|id| TaskInvocation::new("test", serde_json::json!({"connection_id": id % 2})))
            .collect();

        let results = orchestrator
            .run_all(invocations, &CancellationToken::new(), move |orch, invocation, cancel| {
                let plugin = plugin.clone();
                async move { orch.run(plugin.as_ref(), invocation, cancel).await }
            })
            .await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert!(orchestrator.partitions.lock().await.is_empty());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let plugin = TestPlugin {
            recorder,
            metas: vec![meta("slow", slow_step, &[])],
        };
        let err = orchestrator
            .run(&plugin, TaskInvocation::new("test", serde_json::json!({})), cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "cancelled");
        assert!(orchestrator.partitions.lock().await.is_empty());
    }
}
