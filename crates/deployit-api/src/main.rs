//! DeployIt server: webhook listener, source triggers and run worker.

use anyhow::Context;
use deployit_api::{AppState, routes};
use deployit_config::{SystemConfig, load_pipeline, load_system_config};
use deployit_core::pipeline::Pipeline;
use deployit_core::source::SourceFetcher;
use deployit_scheduler::{CancelToken, GitSource, RunHistory, RunQueue, SourceTrigger, Worker, runtime};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("DEPLOYIT_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut config = match std::env::var_os("DEPLOYIT_CONFIG") {
        Some(path) => {
            let path = PathBuf::from(path);
            load_system_config(&path)
                .with_context(|| format!("loading system config {}", path.display()))?
        }
        None => SystemConfig::default(),
    };
    config.apply_env().context("applying DEPLOYIT_* overrides")?;

    let pipelines_dir = std::env::var_os("DEPLOYIT_PIPELINES_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("pipelines"));
    let pipelines = load_pipelines(&pipelines_dir)?;
    if pipelines.is_empty() {
        warn!(dir = %pipelines_dir.display(), "No pipeline definitions found");
    }

    let fetcher: Arc<dyn SourceFetcher> = Arc::new(GitSource::new());
    let orchestrator = runtime::orchestrator(&config, fetcher.clone())?;
    let queue = Arc::new(RunQueue::new(config.trigger.queue));
    let history = RunHistory::with_retention(config.history.keep_runs);
    let shutdown = CancelToken::new();

    let worker = tokio::spawn(
        Worker::new(queue.clone(), orchestrator, history.clone(), pipelines.clone())
            .run(shutdown.clone()),
    );
    for pipeline in &pipelines {
        let trigger =
            SourceTrigger::new(pipeline.clone(), fetcher.clone(), queue.clone(), &config.trigger);
        tokio::spawn(trigger.run(shutdown.clone()));
    }

    let secret = config.webhook_secret();
    if secret.is_none() {
        warn!("No webhook secret configured, push webhooks are not verified");
    }
    let state = AppState::new(pipelines, queue, history).with_webhook_secret(secret);
    let app = routes::router(state).layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("binding {}", config.api.listen))?;
    info!("Starting server on {}", config.api.listen);

    let stop = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("Shutting down");
            stop.cancel();
        })
        .await?;

    shutdown.cancel();
    worker.await.context("worker task")?;
    Ok(())
}

/// Load every `*.kdl` pipeline definition in `dir`, sorted by file name.
fn load_pipelines(dir: &Path) -> anyhow::Result<Vec<Arc<Pipeline>>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "kdl"))
        .collect();
    paths.sort();

    let mut pipelines: Vec<Arc<Pipeline>> = Vec::with_capacity(paths.len());
    for path in paths {
        let pipeline =
            load_pipeline(&path).with_context(|| format!("loading pipeline {}", path.display()))?;
        if pipelines.iter().any(|p| p.name() == pipeline.name()) {
            anyhow::bail!("duplicate pipeline name '{}' in {}", pipeline.name(), path.display());
        }
        info!(pipeline = %pipeline.name(), path = %path.display(), "Loaded pipeline");
        pipelines.push(Arc::new(pipeline));
    }
    Ok(pipelines)
}
