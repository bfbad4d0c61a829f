//! In-memory run history and the registry of cancellable runs.

use deployit_core::pipeline::{PipelineRun, StageStatus};
use deployit_core::{Error, Result, RunId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::cancel::CancelToken;

#[derive(Debug, Default)]
struct Inner {
    /// Run ids are time-ordered, so iteration order is creation order.
    runs: BTreeMap<RunId, PipelineRun>,
    numbers: HashMap<String, u64>,
    active: HashMap<RunId, CancelToken>,
}

const DEFAULT_KEEP_RUNS: usize = 100;

impl Inner {
    fn prune(&mut self, pipeline: &str, keep: usize) {
        let finished: Vec<RunId> = self
            .runs
            .values()
            .filter(|r| r.pipeline == pipeline && r.status.is_terminal())
            .filter(|r| !self.active.contains_key(&r.id))
            .map(|r| r.id)
            .collect();
        let excess = finished.len().saturating_sub(keep);
        for id in &finished[..excess] {
            self.runs.remove(id);
        }
        if excess > 0 {
            debug!(pipeline, dropped = excess, "Pruned run history");
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunHistory {
    inner: Arc<RwLock<Inner>>,
    keep_runs: usize,
}

impl Default for RunHistory {
    fn default() -> Self {
        Self::with_retention(DEFAULT_KEEP_RUNS)
    }
}

impl RunHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `keep_runs` finished runs per pipeline. Runs that are
    /// pending or in progress are never dropped.
    pub fn with_retention(keep_runs: usize) -> Self {
        Self {
            inner: Arc::default(),
            keep_runs: keep_runs.max(1),
        }
    }

    /// Next run number for a pipeline, starting at 1.
    pub async fn next_number(&self, pipeline: &str) -> u64 {
        let mut inner = self.inner.write().await;
        let number = inner.numbers.entry(pipeline.to_string()).or_insert(0);
        *number += 1;
        *number
    }

    /// Insert or replace a run.
    pub async fn record(&self, run: &PipelineRun) {
        self.inner.write().await.runs.insert(run.id, run.clone());
    }

    /// Mirror the run's move to `Running`.
    pub async fn mark_started(&self, run_id: RunId) {
        let mut inner = self.inner.write().await;
        if let Some(run) = inner.runs.get_mut(&run_id) {
            if let Err(e) = run.start() {
                debug!(run_id = %run_id, error = %e, "Run already started");
            }
        }
    }

    pub async fn update_stage(&self, run_id: RunId, stage: &str, status: StageStatus) {
        let mut inner = self.inner.write().await;
        if let Some(result) = inner.runs.get_mut(&run_id).and_then(|r| r.stage_mut(stage)) {
            result.status = status;
        }
    }

    pub async fn get(&self, run_id: RunId) -> Option<PipelineRun> {
        self.inner.read().await.runs.get(&run_id).cloned()
    }

    /// Newest first, optionally for one pipeline.
    pub async fn list(&self, pipeline: Option<&str>, limit: usize) -> Vec<PipelineRun> {
        self.inner
            .read()
            .await
            .runs
            .values()
            .rev()
            .filter(|r| pipeline.is_none_or(|p| r.pipeline == p))
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn latest(&self, pipeline: &str) -> Option<PipelineRun> {
        self.list(Some(pipeline), 1).await.into_iter().next()
    }

    /// Make a run cancellable until `finish` is called for it.
    pub async fn track(&self, run_id: RunId, token: CancelToken) {
        self.inner.write().await.active.insert(run_id, token);
    }

    pub async fn finish(&self, run: &PipelineRun) {
        let mut inner = self.inner.write().await;
        inner.active.remove(&run.id);
        inner.runs.insert(run.id, run.clone());
        inner.prune(&run.pipeline, self.keep_runs);
    }

    /// Request cancellation; the run stops before its next stage.
    pub async fn cancel(&self, run_id: RunId) -> Result<()> {
        let inner = self.inner.read().await;
        match inner.active.get(&run_id) {
            Some(token) => {
                token.cancel();
                info!(run_id = %run_id, "Cancellation requested");
                Ok(())
            }
            None if inner.runs.contains_key(&run_id) => Err(Error::Conflict(format!(
                "run {} is not in progress",
                run_id
            ))),
            None => Err(Error::NotFound(format!("run {}", run_id))),
        }
    }

    pub async fn active(&self) -> Vec<RunId> {
        let mut ids: Vec<_> = self.inner.read().await.active.keys().copied().collect();
        ids.sort();
        ids
    }
}
