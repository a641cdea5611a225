use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use uuid::Uuid;

use pipevine_engine::executor::{Executor, ExecutorConfig};
use pipevine_engine::notifier::Notifier;
use pipevine_engine::registry::PluginRegistry;
use pipevine_state::StateStore;
use pipevine_types::{PipelineRun, RunStatus, TaskStatus, Trigger};

/// Execute the `run` command: parse, validate, and run a pipeline.
pub async fn execute(
    config_path: &Path,
    force: bool,
    json: bool,
    output: Option<&Path>,
    store: Arc<dyn StateStore>,
) -> Result<()> {
    let started = Instant::now();
    match run_pipeline(config_path, force, store).await {
        Ok(run) => {
            if let Some(path) = output {
                std::fs::write(path, serde_json::to_string_pretty(&run)?)
                    .with_context(|| format!("Failed to write run record to {}", path.display()))?;
            }
            if run.status == RunStatus::Success {
                if json {
                    println!("{}", serde_json::to_string_pretty(&run)?);
                } else {
                    print_summary(&run, started.elapsed().as_secs_f64());
                }
                Ok(())
            } else {
                if json {
                    print_failure_json(
                        &format!("run finished with status {}", run.status),
                        started,
                    );
                } else {
                    print_summary(&run, started.elapsed().as_secs_f64());
                }
                anyhow::bail!("pipeline run finished with status {}", run.status)
            }
        }
        Err(e) => {
            if json {
                print_failure_json(&format!("{e:#}"), started);
            }
            Err(e)
        }
    }
}

async fn run_pipeline(
    config_path: &Path,
    force: bool,
    store: Arc<dyn StateStore>,
) -> Result<PipelineRun> {
    let pipeline = super::load_pipeline(config_path, false, force)?;

    let registry = Arc::new(PluginRegistry::with_builtins());
    let mut preflight_errors = Vec::new();
    for task in &pipeline.tasks {
        let check = registry.validate(&task.plugin, &task.config);
        if !check.valid {
            for error in check.errors {
                preflight_errors.push(format!("task '{}': {error}", task.id));
            }
        }
    }
    if !preflight_errors.is_empty() {
        for error in &preflight_errors {
            tracing::error!("{error}");
        }
        if !force {
            anyhow::bail!(
                "plugin pre-flight failed with {} error(s)",
                preflight_errors.len()
            );
        }
    }

    tracing::info!(
        pipeline = pipeline.name,
        tasks = pipeline.tasks.len(),
        "pipeline validated"
    );

    let executor = Executor::new(
        registry,
        store,
        Arc::new(Notifier::with_builtins()),
        ExecutorConfig::default(),
    );
    let execution_id = Uuid::new_v4().to_string();
    let run = executor
        .execute_pipeline(Arc::new(pipeline), &execution_id, Trigger::Manual)
        .await?;
    Ok(run)
}

fn print_summary(run: &PipelineRun, duration_secs: f64) {
    let count = |status: TaskStatus| run.tasks.iter().filter(|t| t.status == status).count();
    println!(
        "Pipeline '{}' finished with status {}.",
        run.pipeline_name, run.status
    );
    println!("  Run id:   {}", run.id);
    println!(
        "  Tasks:    {} total, {} success, {} failed, {} skipped",
        run.tasks.len(),
        count(TaskStatus::Success),
        count(TaskStatus::Failed),
        count(TaskStatus::Skipped),
    );
    println!("  Duration: {duration_secs:.2}s");
    for task in &run.tasks {
        let detail = match (&task.started_at, &task.completed_at) {
            (Some(started), Some(completed)) => format!(
                "{} attempt(s), {} ms",
                task.attempts,
                (*completed - *started).num_milliseconds()
            ),
            _ => String::from("not started"),
        };
        println!("    {:<20} {:<9} ({detail})", task.task_id, task.status);
    }
    if let Some(error) = &run.error {
        println!("  Error:    {error}");
    }
}

fn print_failure_json(message: &str, started: Instant) {
    let failure = serde_json::json!({
        "error": true,
        "message": message,
        "duration_ms": started.elapsed().as_millis() as u64,
        "timestamp": Utc::now().to_rfc3339(),
    });
    println!("{failure}");
}
