use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use pipevine_engine::executor::{Executor, ExecutorConfig};
use pipevine_engine::notifier::Notifier;
use pipevine_engine::registry::PluginRegistry;
use pipevine_engine::scheduler::{Scheduler, SchedulerConfig};
use pipevine_state::StateStore;
use pipevine_types::Trigger;

/// Execute the `schedule` command: register the pipeline's cron triggers
/// and, with `--daemon`, keep firing until interrupted.
pub async fn execute(config_path: &Path, daemon: bool, store: Arc<dyn StateStore>) -> Result<()> {
    let pipeline = super::load_pipeline(config_path, false, false)?;

    let cron_triggers: Vec<Trigger> = pipeline
        .triggers
        .iter()
        .filter(|t| matches!(t, Trigger::Cron { .. }))
        .cloned()
        .collect();
    if cron_triggers.is_empty() {
        anyhow::bail!(
            "pipeline '{}' declares no cron triggers to schedule",
            pipeline.name
        );
    }

    let executor = Arc::new(Executor::new(
        Arc::new(PluginRegistry::with_builtins()),
        store.clone(),
        Arc::new(Notifier::with_builtins()),
        ExecutorConfig::default(),
    ));
    let scheduler = Scheduler::new(store, executor, SchedulerConfig::default());

    for trigger in cron_triggers {
        let entry_id = scheduler
            .schedule_pipeline(pipeline.clone(), trigger.clone())
            .await?;
        println!("Scheduled '{}' ({trigger}) as entry {entry_id}", pipeline.name);
    }

    if !daemon {
        println!("Entries persisted; run with --daemon to keep firing.");
        return Ok(());
    }

    scheduler.start().await?;
    let status = scheduler.status();
    if let Some(next) = status.next_runs.first() {
        println!(
            "Scheduler running with {} entr{}; next fire at {}",
            status.entry_count,
            if status.entry_count == 1 { "y" } else { "ies" },
            next.at.to_rfc3339()
        );
    }
    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, stopping scheduler");
    scheduler.stop();
    Ok(())
}
