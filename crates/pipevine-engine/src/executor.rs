//! Pipeline executor: dependency-aware task runner with bounded
//! concurrency, per-task deadlines, retries, and a persisted run ledger.
//!
//! Tasks are released level by level: every pending task whose
//! dependencies are satisfied is dispatched concurrently through a FIFO
//! semaphore sized to `pipeline.concurrency`, and the next level is not
//! computed until all dispatched tasks reach a terminal state. Task-level
//! failures never escape; they are recorded on the task's execution record
//! and drive the run status.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use pipevine_state::StateStore;
use pipevine_types::{
    Pipeline, PipelineRun, PluginResult, RunStatus, Task, TaskExecution, TaskStatus, Trigger,
};

use crate::errors::EngineError;
use crate::graph::DependencyGraph;
use crate::notifier::{NotificationConfig, NotificationContext, Notifier};
use crate::plugin::ExecutionContext;
use crate::registry::PluginRegistry;

/// Executor tuning knobs.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Concurrency applied when the pipeline declares none.
    pub default_concurrency: usize,
    /// Per-task deadline in milliseconds applied when the task declares
    /// none; 0 means unbounded.
    pub default_task_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 5,
            default_task_timeout_ms: 0,
        }
    }
}

/// Bounded-concurrency pipeline runner.
pub struct Executor {
    registry: Arc<PluginRegistry>,
    state: Arc<dyn StateStore>,
    notifier: Arc<Notifier>,
    notifications: Vec<NotificationConfig>,
    config: ExecutorConfig,
    cancellations: Mutex<HashMap<String, CancellationToken>>,
}

/// Everything one dispatched task needs, cloned into its worker.
struct TaskDispatch {
    task: Task,
    pipeline: Arc<Pipeline>,
    execution_id: String,
    registry: Arc<PluginRegistry>,
    state: Arc<dyn StateStore>,
    semaphore: Arc<Semaphore>,
    previous_results: HashMap<String, PluginResult>,
    default_timeout_ms: u64,
    run_cancel: CancellationToken,
}

impl Executor {
    /// Build an executor over its collaborators.
    #[must_use]
    pub fn new(
        registry: Arc<PluginRegistry>,
        state: Arc<dyn StateStore>,
        notifier: Arc<Notifier>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            state,
            notifier,
            notifications: Vec::new(),
            config,
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    /// Attach notification targets for lifecycle events.
    #[must_use]
    pub fn with_notifications(mut self, notifications: Vec<NotificationConfig>) -> Self {
        self.notifications = notifications;
        self
    }

    /// Request cancellation of an in-flight run by execution id.
    ///
    /// No further ready tasks are dispatched; currently-running tasks are
    /// awaited to a terminal state and the run is marked `cancelled`.
    /// Returns whether a matching run was found.
    pub fn cancel(&self, execution_id: &str) -> bool {
        let cancellations = match self.cancellations.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match cancellations.get(execution_id) {
            Some(token) => {
                tracing::info!(execution_id, "cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Run `pipeline` to completion and return its run record.
    ///
    /// Task-level failures are recorded on the run, never raised.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Execution`] only for programmer errors
    /// (a task worker panicking).
    pub async fn execute_pipeline(
        &self,
        pipeline: Arc<Pipeline>,
        execution_id: &str,
        trigger: Trigger,
    ) -> Result<PipelineRun, EngineError> {
        let run_cancel = CancellationToken::new();
        {
            let mut cancellations = match self.cancellations.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            cancellations.insert(execution_id.to_string(), run_cancel.clone());
        }

        let outcome = self
            .run_to_completion(pipeline, execution_id, trigger, run_cancel)
            .await;

        let mut cancellations = match self.cancellations.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cancellations.remove(execution_id);
        outcome
    }

    async fn run_to_completion(
        &self,
        pipeline: Arc<Pipeline>,
        execution_id: &str,
        trigger: Trigger,
        run_cancel: CancellationToken,
    ) -> Result<PipelineRun, EngineError> {
        let started = std::time::Instant::now();
        let graph = DependencyGraph::new(&pipeline.tasks);
        let concurrency = if pipeline.concurrency > 0 {
            pipeline.concurrency
        } else {
            self.config.default_concurrency
        };
        let semaphore = Arc::new(Semaphore::new(concurrency));

        let mut run = PipelineRun::new(execution_id, &pipeline.name, trigger);
        for task in &pipeline.tasks {
            let mut exec = TaskExecution::new(task);
            if !task.enabled {
                // Disabled tasks satisfy their dependents without a result.
                exec.status = TaskStatus::Skipped;
            }
            run.tasks.push(exec);
        }

        tracing::info!(
            pipeline = pipeline.name,
            execution_id,
            tasks = pipeline.tasks.len(),
            concurrency,
            "starting pipeline run"
        );
        self.persist(&run).await;
        self.notify(NotificationContext::new(
            "pipeline.started",
            &pipeline.name,
            execution_id,
        ));

        let mut previous_results: HashMap<String, PluginResult> = HashMap::new();

        loop {
            if run_cancel.is_cancelled() {
                break;
            }
            if pipeline.timeout_ms > 0 && started.elapsed().as_millis() as u64 > pipeline.timeout_ms
            {
                run.error = Some(format!(
                    "pipeline timed out after {} ms",
                    pipeline.timeout_ms
                ));
                mark_pending(&mut run, "pipeline timed out");
                break;
            }

            let ready: Vec<String> = ready_tasks(&run, &graph);
            if ready.is_empty() {
                let stuck: Vec<String> = run
                    .tasks
                    .iter()
                    .filter(|t| !t.status.is_terminal())
                    .map(|t| t.task_id.clone())
                    .collect();
                if stuck.is_empty() {
                    break;
                }
                // The validator forbids cycles; reaching here means it was
                // bypassed.
                for id in &stuck {
                    if let Some(exec) = run.task_mut(id) {
                        exec.status = TaskStatus::Cancelled;
                        exec.result =
                            Some(PluginResult::fail("dependencies can never be satisfied"));
                    }
                }
                run.error = Some(format!(
                    "execution deadlocked; stuck tasks: {}",
                    stuck.join(", ")
                ));
                tracing::error!(
                    pipeline = pipeline.name,
                    execution_id,
                    stuck = stuck.join(", "),
                    "execution deadlocked"
                );
                break;
            }

            let mut workers: JoinSet<TaskExecution> = JoinSet::new();
            for task_id in &ready {
                let Some(task) = pipeline.task(task_id) else {
                    continue;
                };
                if let Some(exec) = run.task_mut(task_id) {
                    exec.status = TaskStatus::Running;
                }
                let dispatch = TaskDispatch {
                    task: task.clone(),
                    pipeline: Arc::clone(&pipeline),
                    execution_id: execution_id.to_string(),
                    registry: Arc::clone(&self.registry),
                    state: Arc::clone(&self.state),
                    semaphore: Arc::clone(&semaphore),
                    previous_results: previous_results.clone(),
                    default_timeout_ms: self.config.default_task_timeout_ms,
                    run_cancel: run_cancel.clone(),
                };
                workers.spawn(run_task(dispatch));
            }

            while let Some(joined) = workers.join_next().await {
                let exec = joined
                    .map_err(|e| EngineError::Execution(format!("task worker panicked: {e}")))?;
                self.apply_outcome(&mut run, exec, &mut previous_results);
            }

            propagate_failures(&mut run, &graph);
            self.persist(&run).await;
        }

        if run_cancel.is_cancelled() {
            mark_pending(&mut run, "pipeline cancelled");
        }

        run.status = final_status(&run, run_cancel.is_cancelled());
        run.completed_at = Some(Utc::now());
        if run.status == RunStatus::Failed && run.error.is_none() {
            let failed: Vec<&str> = run
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Failed)
                .map(|t| t.task_id.as_str())
                .collect();
            run.error = Some(format!("{} task(s) failed: {}", failed.len(), failed.join(", ")));
        }
        self.persist(&run).await;

        let event = match run.status {
            RunStatus::Failed => "pipeline.failed",
            RunStatus::Cancelled => "pipeline.cancelled",
            _ => "pipeline.completed",
        };
        let mut ctx = NotificationContext::new(event, &pipeline.name, execution_id);
        ctx.status = Some(run.status);
        ctx.error = run.error.clone();
        self.notify(ctx);

        tracing::info!(
            pipeline = pipeline.name,
            execution_id,
            status = run.status.as_str(),
            duration_ms = started.elapsed().as_millis() as u64,
            "pipeline run finished"
        );
        Ok(run)
    }

    fn apply_outcome(
        &self,
        run: &mut PipelineRun,
        exec: TaskExecution,
        previous_results: &mut HashMap<String, PluginResult>,
    ) {
        if exec.status == TaskStatus::Success {
            if let Some(result) = &exec.result {
                previous_results.insert(exec.task_id.clone(), result.clone());
            }
        }
        if exec.status == TaskStatus::Failed {
            let error = exec
                .result
                .as_ref()
                .and_then(|r| r.error.as_deref())
                .unwrap_or("unknown error");
            tracing::error!(task = exec.task_id, error, "task failed");
            let mut ctx =
                NotificationContext::new("task.failed", &run.pipeline_name, run.id.clone());
            ctx.task_id = Some(exec.task_id.clone());
            ctx.error = Some(error.to_string());
            self.notify(ctx);
        } else if exec.status == TaskStatus::Success {
            let mut ctx =
                NotificationContext::new("task.completed", &run.pipeline_name, run.id.clone());
            ctx.task_id = Some(exec.task_id.clone());
            self.notify(ctx);
        }
        if let Some(slot) = run.task_mut(&exec.task_id) {
            *slot = exec;
        }
    }

    fn notify(&self, ctx: NotificationContext) {
        for config in &self.notifications {
            let _ = self.notifier.send(config, &ctx);
        }
    }

    /// Write the run to the store; a failed write is logged and retried
    /// once, never failing the run.
    async fn persist(&self, run: &PipelineRun) {
        let state = Arc::clone(&self.state);
        let snapshot = run.clone();
        let run_id = run.id.clone();
        let joined = tokio::task::spawn_blocking(move || {
            state.save_pipeline_run(&snapshot).or_else(|first| {
                tracing::warn!("state save failed, retrying once: {first}");
                state.save_pipeline_run(&snapshot)
            })
        })
        .await;
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(run = run_id, "failed to persist run: {e}"),
            Err(e) => tracing::error!(run = run_id, "persist worker panicked: {e}"),
        }
    }
}

/// Pending tasks whose dependencies are all satisfied.
fn ready_tasks(run: &PipelineRun, graph: &DependencyGraph) -> Vec<String> {
    run.tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .filter(|t| {
            graph.deps_of(&t.task_id).iter().all(|dep| {
                run.task(dep)
                    .is_some_and(|d| d.status.satisfies_dependents())
            })
        })
        .map(|t| t.task_id.clone())
        .collect()
}

/// Mark every not-yet-started descendant of a failed task as skipped.
fn propagate_failures(run: &mut PipelineRun, graph: &DependencyGraph) {
    let failed: Vec<String> = run
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Failed)
        .map(|t| t.task_id.clone())
        .collect();
    for failed_id in failed {
        for descendant in graph.descendants(&failed_id) {
            if let Some(exec) = run.task_mut(&descendant) {
                if exec.status == TaskStatus::Pending {
                    exec.status = TaskStatus::Skipped;
                    exec.result = Some(PluginResult::fail(format!(
                        "skipped: upstream task '{failed_id}' failed"
                    )));
                }
            }
        }
    }
}

/// Finalize tasks that never started, recording `reason`.
fn mark_pending(run: &mut PipelineRun, reason: &str) {
    for exec in &mut run.tasks {
        if !exec.status.is_terminal() {
            exec.status = TaskStatus::Skipped;
            exec.result = Some(PluginResult::fail(reason));
        }
    }
}

fn final_status(run: &PipelineRun, cancelled: bool) -> RunStatus {
    if cancelled {
        return RunStatus::Cancelled;
    }
    if run.error.is_some()
        || run
            .tasks
            .iter()
            .any(|t| t.status == TaskStatus::Failed || t.status == TaskStatus::Cancelled)
    {
        return RunStatus::Failed;
    }
    if run.tasks.iter().any(|t| !t.status.is_terminal()) {
        return RunStatus::Running;
    }
    if !run.tasks.is_empty()
        && run.tasks.iter().all(|t| t.status == TaskStatus::Skipped)
    {
        return RunStatus::Cancelled;
    }
    RunStatus::Success
}

/// One task's lifetime within a run: permit, attempt loop, deadline,
/// retries. Returns the finished execution record.
async fn run_task(dispatch: TaskDispatch) -> TaskExecution {
    let mut exec = TaskExecution::new(&dispatch.task);
    let max_attempts = dispatch.task.retry.map_or(1, |r| r.attempts.max(1));
    let retry_delay = dispatch.task.retry.map_or(0, |r| r.delay_ms);
    let timeout_ms = dispatch
        .task
        .timeout_ms
        .unwrap_or(dispatch.default_timeout_ms);

    loop {
        // Each attempt holds a permit only for the duration of the plugin
        // call; retries re-enter the gate.
        let permit = tokio::select! {
            permit = dispatch.semaphore.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    exec.status = TaskStatus::Failed;
                    exec.completed_at = Some(Utc::now());
                    exec.result = Some(PluginResult::fail("concurrency gate closed"));
                    return exec;
                }
            },
            () = dispatch.run_cancel.cancelled() => {
                exec.status = TaskStatus::Skipped;
                exec.result = Some(PluginResult::fail("pipeline cancelled"));
                return exec;
            }
        };

        exec.status = TaskStatus::Running;
        exec.started_at = Some(Utc::now());
        exec.attempts += 1;
        tracing::debug!(
            task = dispatch.task.id,
            attempt = exec.attempts,
            "task attempt started"
        );

        let result = match dispatch.registry.resolve(&dispatch.task.plugin) {
            None => PluginResult::fail(format!(
                "plugin '{}' is not registered",
                dispatch.task.plugin
            )),
            Some(plugin) => {
                let attempt_cancel = CancellationToken::new();
                let ctx = ExecutionContext {
                    pipeline: Arc::clone(&dispatch.pipeline),
                    task: dispatch.task.clone(),
                    execution_id: dispatch.execution_id.clone(),
                    state: Arc::clone(&dispatch.state),
                    previous_results: dispatch.previous_results.clone(),
                    variables: dispatch.pipeline.env.clone(),
                    cancel: attempt_cancel.clone(),
                };
                let invocation = plugin.execute(&dispatch.task.config, &ctx);
                if timeout_ms > 0 {
                    match tokio::time::timeout(Duration::from_millis(timeout_ms), invocation).await
                    {
                        Ok(result) => result,
                        Err(_) => {
                            // Signal the in-flight call; its late result is
                            // discarded regardless.
                            attempt_cancel.cancel();
                            PluginResult::fail(format!(
                                "task timed out after {timeout_ms} ms"
                            ))
                        }
                    }
                } else {
                    invocation.await
                }
            }
        };
        drop(permit);

        if result.success {
            exec.status = TaskStatus::Success;
            exec.completed_at = Some(Utc::now());
            exec.result = Some(result);
            return exec;
        }

        if exec.attempts < max_attempts {
            tracing::warn!(
                task = dispatch.task.id,
                attempt = exec.attempts,
                max_attempts,
                delay_ms = retry_delay,
                error = result.error.as_deref().unwrap_or("unknown error"),
                "task attempt failed, retrying"
            );
            // Back to pending for the retry window; attempts accumulate.
            exec.status = TaskStatus::Pending;
            exec.started_at = None;
            exec.completed_at = None;
            exec.result = None;
            tokio::select! {
                () = tokio::time::sleep(Duration::from_millis(retry_delay)) => {}
                () = dispatch.run_cancel.cancelled() => {
                    exec.status = TaskStatus::Failed;
                    exec.completed_at = Some(Utc::now());
                    exec.result = Some(result);
                    return exec;
                }
            }
            continue;
        }

        exec.status = TaskStatus::Failed;
        exec.completed_at = Some(Utc::now());
        exec.result = Some(result);
        return exec;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{Plugin, PluginCheck};
    use async_trait::async_trait;
    use pipevine_state::SqliteStateStore;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Plugin that records concurrent invocations and completion order.
    struct TrackingPlugin {
        current: AtomicUsize,
        peak: AtomicUsize,
        order: Mutex<Vec<String>>,
        sleep_ms: u64,
    }

    impl TrackingPlugin {
        fn new(sleep_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                order: Mutex::new(Vec::new()),
                sleep_ms,
            })
        }
    }

    #[async_trait]
    impl Plugin for TrackingPlugin {
        fn name(&self) -> &str {
            "tracking"
        }

        fn version(&self) -> &str {
            "0.0.0"
        }

        async fn execute(&self, _config: &Value, ctx: &ExecutionContext) -> PluginResult {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(self.sleep_ms)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            self.order.lock().unwrap().push(ctx.task.id.clone());
            PluginResult::ok(json!({"ok": true}))
        }
    }

    /// Plugin that fails until it has been called `succeed_after` times.
    struct FlakyPlugin {
        calls: AtomicUsize,
        succeed_after: usize,
    }

    #[async_trait]
    impl Plugin for FlakyPlugin {
        fn name(&self) -> &str {
            "flaky"
        }

        fn version(&self) -> &str {
            "0.0.0"
        }

        async fn execute(&self, _config: &Value, _ctx: &ExecutionContext) -> PluginResult {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.succeed_after {
                PluginResult::ok(json!({"call": call}))
            } else {
                PluginResult::fail("boom")
            }
        }

        fn validate(&self, _config: &Value) -> PluginCheck {
            PluginCheck::ok()
        }
    }

    /// Plugin that captures the previous-result keys it observed.
    struct CapturePlugin {
        seen: Mutex<HashMap<String, Vec<String>>>,
    }

    #[async_trait]
    impl Plugin for CapturePlugin {
        fn name(&self) -> &str {
            "capture"
        }

        fn version(&self) -> &str {
            "0.0.0"
        }

        async fn execute(&self, _config: &Value, ctx: &ExecutionContext) -> PluginResult {
            let mut keys: Vec<String> = ctx.previous_results.keys().cloned().collect();
            keys.sort();
            self.seen
                .lock()
                .unwrap()
                .insert(ctx.task.id.clone(), keys);
            PluginResult::ok(json!({"ok": true}))
        }
    }

    fn task(id: &str, plugin: &str, deps: &[&str]) -> Task {
        Task {
            id: id.into(),
            name: id.into(),
            plugin: plugin.into(),
            config: json!({}),
            depends_on: deps.iter().map(|&d| d.into()).collect(),
            retry: None,
            timeout_ms: None,
            enabled: true,
        }
    }

    fn pipeline(name: &str, concurrency: usize, tasks: Vec<Task>) -> Arc<Pipeline> {
        Arc::new(Pipeline {
            name: name.into(),
            version: "1.0".into(),
            description: None,
            tasks,
            triggers: Vec::new(),
            concurrency,
            timeout_ms: 0,
            env: HashMap::new(),
        })
    }

    fn executor_with(plugins: Vec<Arc<dyn Plugin>>) -> (Executor, Arc<SqliteStateStore>) {
        let mut registry = PluginRegistry::with_builtins();
        registry.register_all(plugins);
        let state = Arc::new(SqliteStateStore::in_memory().unwrap());
        let executor = Executor::new(
            Arc::new(registry),
            state.clone(),
            Arc::new(Notifier::with_builtins()),
            ExecutorConfig::default(),
        );
        (executor, state)
    }

    fn statuses(run: &PipelineRun) -> HashMap<&str, TaskStatus> {
        run.tasks
            .iter()
            .map(|t| (t.task_id.as_str(), t.status))
            .collect()
    }

    #[tokio::test]
    async fn linear_three_step_succeeds_in_order() {
        let capture = Arc::new(CapturePlugin {
            seen: Mutex::new(HashMap::new()),
        });
        let (executor, state) = executor_with(vec![capture.clone()]);
        let pipeline = pipeline(
            "linear",
            5,
            vec![
                task("fetch", "capture", &[]),
                task("transform", "capture", &["fetch"]),
                task("load", "capture", &["transform"]),
            ],
        );

        let run = executor
            .execute_pipeline(pipeline, "run-linear", Trigger::Manual)
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Success);
        assert!(run.tasks.iter().all(|t| t.status == TaskStatus::Success));

        let seen = capture.seen.lock().unwrap();
        assert_eq!(seen["fetch"], Vec::<String>::new());
        assert_eq!(seen["transform"], vec!["fetch"]);
        assert_eq!(seen["load"], vec!["fetch", "transform"]);

        // Run was persisted with its terminal status.
        let stored = state.get_pipeline_run("run-linear").unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Success);
        assert_eq!(stored.tasks.len(), 3);
    }

    #[tokio::test]
    async fn fan_out_respects_concurrency_gate() {
        let tracking = TrackingPlugin::new(30);
        let (executor, _state) = executor_with(vec![tracking.clone()]);
        let pipeline = pipeline(
            "fan",
            2,
            vec![
                task("root", "tracking", &[]),
                task("a", "tracking", &["root"]),
                task("b", "tracking", &["root"]),
                task("c", "tracking", &["root"]),
                task("sink", "tracking", &["a", "b", "c"]),
            ],
        );

        let run = executor
            .execute_pipeline(pipeline, "run-fan", Trigger::Manual)
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Success);
        assert!(tracking.peak.load(Ordering::SeqCst) <= 2);

        let order = tracking.order.lock().unwrap();
        let sink_pos = order.iter().position(|t| t == "sink").unwrap();
        for mid in ["a", "b", "c"] {
            assert!(order.iter().position(|t| t == mid).unwrap() < sink_pos);
        }
    }

    #[tokio::test]
    async fn failure_skips_descendants_and_fails_run() {
        struct FailPlugin;
        #[async_trait]
        impl Plugin for FailPlugin {
            fn name(&self) -> &str {
                "failer"
            }
            fn version(&self) -> &str {
                "0.0.0"
            }
            async fn execute(&self, _config: &Value, _ctx: &ExecutionContext) -> PluginResult {
                PluginResult::fail("boom")
            }
        }

        let (executor, _state) = executor_with(vec![Arc::new(FailPlugin)]);
        let pipeline = pipeline(
            "failing",
            5,
            vec![
                task("a", "echo", &[]),
                task("b", "failer", &["a"]),
                task("c", "echo", &["b"]),
            ],
        );

        let run = executor
            .execute_pipeline(pipeline, "run-fail", Trigger::Manual)
            .await
            .unwrap();

        let by_id = statuses(&run);
        assert_eq!(by_id["a"], TaskStatus::Success);
        assert_eq!(by_id["b"], TaskStatus::Failed);
        assert_eq!(by_id["c"], TaskStatus::Skipped);
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.as_deref().unwrap().contains("b"));

        let skipped = run.task("c").unwrap();
        assert!(skipped
            .result
            .as_ref()
            .unwrap()
            .error
            .as_deref()
            .unwrap()
            .contains("'b'"));
    }

    #[tokio::test]
    async fn retry_then_succeed_accumulates_attempts() {
        let flaky = Arc::new(FlakyPlugin {
            calls: AtomicUsize::new(0),
            succeed_after: 3,
        });
        let (executor, _state) = executor_with(vec![flaky]);
        let mut retried = task("x", "flaky", &[]);
        retried.retry = Some(pipevine_types::RetryPolicy {
            attempts: 3,
            delay_ms: 10,
        });
        let pipeline = pipeline("retry", 5, vec![retried]);

        let started = std::time::Instant::now();
        let run = executor
            .execute_pipeline(pipeline, "run-retry", Trigger::Manual)
            .await
            .unwrap();

        let x = run.task("x").unwrap();
        assert_eq!(x.status, TaskStatus::Success);
        assert_eq!(x.attempts, 3);
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(run.status, RunStatus::Success);
    }

    #[tokio::test]
    async fn retries_exhausted_finalizes_failed() {
        let flaky = Arc::new(FlakyPlugin {
            calls: AtomicUsize::new(0),
            succeed_after: usize::MAX,
        });
        let (executor, _state) = executor_with(vec![flaky]);
        let mut retried = task("x", "flaky", &[]);
        retried.retry = Some(pipevine_types::RetryPolicy {
            attempts: 3,
            delay_ms: 5,
        });
        let pipeline = pipeline("retry-fail", 5, vec![retried]);

        let run = executor
            .execute_pipeline(pipeline, "run-retry-fail", Trigger::Manual)
            .await
            .unwrap();

        let x = run.task("x").unwrap();
        assert_eq!(x.status, TaskStatus::Failed);
        assert_eq!(x.attempts, 3);
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn disabled_task_satisfies_dependents_without_result() {
        let capture = Arc::new(CapturePlugin {
            seen: Mutex::new(HashMap::new()),
        });
        let (executor, _state) = executor_with(vec![capture.clone()]);
        let mut disabled = task("prep", "capture", &[]);
        disabled.enabled = false;
        let pipeline = pipeline(
            "disabled",
            5,
            vec![disabled, task("work", "capture", &["prep"])],
        );

        let run = executor
            .execute_pipeline(pipeline, "run-disabled", Trigger::Manual)
            .await
            .unwrap();

        let by_id = statuses(&run);
        assert_eq!(by_id["prep"], TaskStatus::Skipped);
        assert_eq!(by_id["work"], TaskStatus::Success);
        assert_eq!(run.status, RunStatus::Success);
        // Disabled task contributes no previous result.
        assert_eq!(capture.seen.lock().unwrap()["work"], Vec::<String>::new());
        assert!(run.task("prep").unwrap().result.is_none());
    }

    #[tokio::test]
    async fn all_tasks_skipped_marks_run_cancelled() {
        let (executor, _state) = executor_with(Vec::new());
        let mut only = task("solo", "echo", &[]);
        only.enabled = false;
        let pipeline = pipeline("all-disabled", 5, vec![only]);

        let run = executor
            .execute_pipeline(pipeline, "run-all-disabled", Trigger::Manual)
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn empty_pipeline_yields_success_with_no_tasks() {
        let (executor, state) = executor_with(Vec::new());
        let pipeline = pipeline("empty", 5, Vec::new());

        let run = executor
            .execute_pipeline(pipeline, "run-empty", Trigger::Manual)
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert!(run.tasks.is_empty());
        assert!(state.get_pipeline_run("run-empty").unwrap().is_some());
    }

    #[tokio::test]
    async fn timeout_fails_task_without_hanging() {
        let (executor, _state) = executor_with(Vec::new());
        let mut slow = task("slow", "delay", &[]);
        slow.config = json!({"ms": 5_000});
        slow.timeout_ms = Some(30);
        let pipeline = pipeline("timeout", 5, vec![slow]);

        let started = std::time::Instant::now();
        let run = executor
            .execute_pipeline(pipeline, "run-timeout", Trigger::Manual)
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        let slow = run.task("slow").unwrap();
        assert_eq!(slow.status, TaskStatus::Failed);
        assert!(slow
            .result
            .as_ref()
            .unwrap()
            .error
            .as_deref()
            .unwrap()
            .contains("timed out"));
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn unresolved_plugin_fails_task_not_run_call() {
        let (executor, _state) = executor_with(Vec::new());
        let pipeline = pipeline("ghost", 5, vec![task("a", "no-such-plugin", &[])]);

        let run = executor
            .execute_pipeline(pipeline, "run-ghost", Trigger::Manual)
            .await
            .unwrap();
        let a = run.task("a").unwrap();
        assert_eq!(a.status, TaskStatus::Failed);
        assert!(a
            .result
            .as_ref()
            .unwrap()
            .error
            .as_deref()
            .unwrap()
            .contains("not registered"));
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn cancellation_awaits_running_and_skips_pending() {
        let (executor, _state) = executor_with(Vec::new());
        let executor = Arc::new(executor);
        let mut first = task("first", "delay", &[]);
        first.config = json!({"ms": 150});
        let pipeline = pipeline(
            "cancellable",
            5,
            vec![first, task("second", "echo", &["first"])],
        );

        let runner = {
            let executor = Arc::clone(&executor);
            tokio::spawn(async move {
                executor
                    .execute_pipeline(pipeline, "run-cancel", Trigger::Manual)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(executor.cancel("run-cancel"));

        let run = runner.await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        // The in-flight task finished naturally; the pending one never ran.
        assert_eq!(run.task("first").unwrap().status, TaskStatus::Success);
        assert_eq!(run.task("second").unwrap().status, TaskStatus::Skipped);
        // The id is released once the run completes.
        assert!(!executor.cancel("run-cancel"));
    }

    #[tokio::test]
    async fn bypassed_validator_cycle_reports_deadlock() {
        let (executor, _state) = executor_with(Vec::new());
        let pipeline = pipeline(
            "cycle",
            5,
            vec![task("a", "echo", &["b"]), task("b", "echo", &["a"])],
        );

        let run = executor
            .execute_pipeline(pipeline, "run-cycle", Trigger::Manual)
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        let error = run.error.unwrap();
        assert!(error.contains("deadlocked"));
        assert!(error.contains('a') && error.contains('b'));
        assert!(run
            .tasks
            .iter()
            .all(|t| t.status == TaskStatus::Cancelled));
    }

    #[tokio::test]
    async fn pipeline_timeout_abandons_remaining_levels() {
        let (executor, _state) = executor_with(Vec::new());
        let mut slow = task("slow", "delay", &[]);
        slow.config = json!({"ms": 120});
        let pl = Pipeline {
            name: "deadline".into(),
            version: "1.0".into(),
            description: None,
            tasks: vec![slow, task("after", "echo", &["slow"])],
            triggers: Vec::new(),
            concurrency: 5,
            timeout_ms: 60,
            env: HashMap::new(),
        };

        let run = executor
            .execute_pipeline(Arc::new(pl), "run-deadline", Trigger::Manual)
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.as_ref().unwrap().contains("timed out"));
        assert_eq!(run.task("after").unwrap().status, TaskStatus::Skipped);
    }
}
