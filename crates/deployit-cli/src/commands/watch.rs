//! Continuous mode: poll the source and run on every change.

use anyhow::{Context, Result};
use deployit_config::SystemConfig;
use deployit_scheduler::{CancelToken, RunHistory, RunQueue, SourceTrigger, Worker, runtime};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use super::{fetcher, load_pipeline_file};

pub async fn watch(config: &SystemConfig, path: &Path, source_dir: Option<PathBuf>) -> Result<()> {
    let pipeline = load_pipeline_file(path)?;
    let fetcher = fetcher(source_dir)?;
    let orchestrator = runtime::orchestrator(config, fetcher.clone())?;

    let queue = Arc::new(RunQueue::new(config.trigger.queue));
    let history = RunHistory::with_retention(config.history.keep_runs);
    let shutdown = CancelToken::new();

    let worker = tokio::spawn(
        Worker::new(queue.clone(), orchestrator, history.clone(), [pipeline.clone()])
            .run(shutdown.clone()),
    );
    let trigger = tokio::spawn(
        SourceTrigger::new(pipeline.clone(), fetcher, queue, &config.trigger).run(shutdown.clone()),
    );

    println!(
        "Watching {} for pipeline '{}' every {}s (Ctrl-C to stop)",
        pipeline.source(),
        pipeline.name(),
        config.trigger.poll_interval.as_secs()
    );
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Stopping; in-flight runs finish their current stage");
    for id in history.active().await {
        // cancellation is only refused for runs that already finished
        let _ = history.cancel(id).await;
    }
    shutdown.cancel();
    trigger.await.context("Trigger task failed")?;
    worker.await.context("Worker task failed")?;

    for run in history.list(Some(pipeline.name()), usize::MAX).await.iter().rev() {
        println!("  #{} {}", run.number, run.status);
    }
    Ok(())
}
