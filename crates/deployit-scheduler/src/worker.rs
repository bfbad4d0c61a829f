//! Worker that drains the run queue.

use deployit_core::pipeline::{Pipeline, PipelineRun, StageStatus, TriggerInfo};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::task::{self, JoinSet};
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::history::RunHistory;
use crate::orchestrator::{PipelineEvent, PipelineOrchestrator};
use crate::queue::{RunQueue, TriggerRequest};

/// Run tasks keyed by pipeline. The pipeline name comes back even when the
/// task panicked or was aborted.
#[derive(Default)]
struct RunTasks {
    tasks: JoinSet<()>,
    pipelines: HashMap<task::Id, String>,
}

impl RunTasks {
    fn spawn<F>(&mut self, pipeline: String, run: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.tasks.spawn(run);
        self.pipelines.insert(handle.id(), pipeline);
    }

    fn len(&self) -> usize {
        self.tasks.len()
    }

    fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for the next task and return its pipeline.
    async fn join_next(&mut self) -> Option<String> {
        let id = match self.tasks.join_next_with_id().await? {
            Ok((id, ())) => id,
            Err(e) => {
                error!(error = %e, "Run task failed");
                e.id()
            }
        };
        self.pipelines.remove(&id)
    }
}

/// Starts queued runs, at most one at a time per pipeline.
#[derive(Clone)]
pub struct Worker {
    queue: Arc<RunQueue>,
    orchestrator: PipelineOrchestrator,
    history: RunHistory,
    pipelines: Arc<BTreeMap<String, Arc<Pipeline>>>,
}

impl Worker {
    pub fn new(
        queue: Arc<RunQueue>,
        orchestrator: PipelineOrchestrator,
        history: RunHistory,
        pipelines: impl IntoIterator<Item = Arc<Pipeline>>,
    ) -> Self {
        let pipelines = pipelines
            .into_iter()
            .map(|p| (p.name().to_string(), p))
            .collect();
        Self {
            queue,
            orchestrator,
            history,
            pipelines: Arc::new(pipelines),
        }
    }

    /// Run the worker loop until `shutdown` is cancelled, then wait for the
    /// runs already started.
    pub async fn run(self, shutdown: CancelToken) {
        info!(
            pipelines = self.pipelines.len(),
            policy = ?self.queue.policy(),
            "Starting worker"
        );

        // a pipeline stays busy from dispatch until its run task returns,
        // so pending requests for it keep coalescing in the queue
        let mut busy: HashSet<String> = HashSet::new();
        let mut tasks = RunTasks::default();

        loop {
            while let Some(request) = self.queue.take_ready(&busy).await {
                let Some(pipeline) = self.pipelines.get(&request.pipeline).cloned() else {
                    warn!(pipeline = %request.pipeline, "Dropping request for unknown pipeline");
                    continue;
                };
                busy.insert(request.pipeline.clone());
                let worker = self.clone();
                tasks.spawn(request.pipeline.clone(), async move {
                    worker.process(pipeline, request).await;
                });
            }

            tokio::select! {
                _ = self.queue.changed() => {}
                Some(pipeline) = tasks.join_next(), if !tasks.is_empty() => {
                    busy.remove(&pipeline);
                }
                _ = shutdown.cancelled() => break,
            }
        }

        info!(in_flight = tasks.len(), "Worker stopping");
        while !tasks.is_empty() {
            tasks.join_next().await;
        }
    }

    /// Execute one request to completion, mirroring progress into the
    /// history.
    pub async fn process(&self, pipeline: Arc<Pipeline>, request: TriggerRequest) -> PipelineRun {
        let number = self.history.next_number(pipeline.name()).await;
        let run = PipelineRun::new(&pipeline, number, request.trigger);
        let run_id = run.id;
        let cancel = CancelToken::new();
        self.history.record(&run).await;
        self.history.track(run_id, cancel.clone()).await;

        let (mut events, handle) = self.orchestrator.execute(pipeline.clone(), run, cancel);
        while let Some(event) = events.recv().await {
            match event {
                PipelineEvent::RunStarted { .. } => self.history.mark_started(run_id).await,
                PipelineEvent::StageStarted { stage } => {
                    self.history
                        .update_stage(run_id, &stage, StageStatus::Running)
                        .await
                }
                PipelineEvent::StageLog { stage, line } => debug!(
                    pipeline = %pipeline.name(),
                    run_id = %run_id,
                    stage = %stage,
                    stream = ?line.stream,
                    "{}",
                    line.content
                ),
                PipelineEvent::StageCompleted { stage, status } => {
                    self.history.update_stage(run_id, &stage, status).await
                }
                PipelineEvent::RunCompleted { .. } => {}
            }
        }

        let finished = match handle.await {
            Ok(run) => run,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Run task aborted");
                let mut run = self
                    .history
                    .get(run_id)
                    .await
                    .unwrap_or_else(|| PipelineRun::new(&pipeline, number, TriggerInfo::manual()));
                let stage = run
                    .stages
                    .iter()
                    .find(|s| s.status == StageStatus::Running)
                    .or_else(|| run.stages.first())
                    .map(|s| s.name.clone())
                    .unwrap_or_default();
                if !run.status.is_terminal() {
                    let _ = run.start();
                    let _ = run.fail(stage, format!("internal error: {}", e));
                }
                run
            }
        };
        self.history.finish(&finished).await;
        finished
    }
}
