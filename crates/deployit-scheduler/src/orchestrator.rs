//! Pipeline orchestrator: runs the stages of one pipeline run in order.

use chrono::Utc;
use deployit_config::VariableContext;
use deployit_core::artifact::{Artifact, ArtifactRef, ArtifactStore};
use deployit_core::deployer::Deployer;
use deployit_core::executor::{Executor, LogLine};
use deployit_core::pipeline::{
    ActionKind, Pipeline, PipelineRun, RunStatus, Stage, StageStatus,
};
use deployit_core::source::{Revision, SourceFetcher};
use deployit_core::{Error, Result, RunId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::actions::{self, StageContext};
use crate::cancel::CancelToken;
use crate::lock::RunLock;

const EVENT_BUFFER: usize = 256;

/// Event emitted during pipeline execution.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    RunStarted {
        run_id: RunId,
        pipeline: String,
        number: u64,
    },
    StageStarted {
        stage: String,
    },
    StageLog {
        stage: String,
        line: LogLine,
    },
    StageCompleted {
        stage: String,
        status: StageStatus,
    },
    RunCompleted {
        run_id: RunId,
        status: RunStatus,
    },
}

/// Runs pipelines against a fixed set of collaborators.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    store: Arc<dyn ArtifactStore>,
    fetcher: Arc<dyn SourceFetcher>,
    executor: Arc<dyn Executor>,
    deployer: Arc<dyn Deployer>,
    locks: RunLock,
    keep_artifacts: bool,
}

impl PipelineOrchestrator {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        fetcher: Arc<dyn SourceFetcher>,
        executor: Arc<dyn Executor>,
        deployer: Arc<dyn Deployer>,
    ) -> Self {
        Self {
            store,
            fetcher,
            executor,
            deployer,
            locks: RunLock::new(),
            keep_artifacts: false,
        }
    }

    /// Share a run lock with other orchestrators.
    pub fn with_run_lock(mut self, locks: RunLock) -> Self {
        self.locks = locks;
        self
    }

    /// Keep a run's artifacts in the store after it finishes.
    pub fn keep_artifacts(mut self, keep: bool) -> Self {
        self.keep_artifacts = keep;
        self
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn deployer(&self) -> &Arc<dyn Deployer> {
        &self.deployer
    }

    pub fn run_lock(&self) -> &RunLock {
        &self.locks
    }

    /// Execute a run, returning a channel of events and a handle to the
    /// finished run.
    ///
    /// The run waits for any other run of the same pipeline to finish
    /// first. Dropping the receiver is fine; events are then discarded.
    pub fn execute(
        &self,
        pipeline: Arc<Pipeline>,
        run: PipelineRun,
        cancel: CancelToken,
    ) -> (
        mpsc::Receiver<PipelineEvent>,
        tokio::task::JoinHandle<PipelineRun>,
    ) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let this = self.clone();
        let handle = tokio::spawn(async move { this.execute_inner(pipeline, run, cancel, tx).await });
        (rx, handle)
    }

    async fn execute_inner(
        self,
        pipeline: Arc<Pipeline>,
        mut run: PipelineRun,
        cancel: CancelToken,
        tx: mpsc::Sender<PipelineEvent>,
    ) -> PipelineRun {
        let _guard = self.locks.acquire(pipeline.name()).await;

        if let Err(e) = run.start() {
            error!(run_id = %run.id, error = %e, "Run cannot start");
            return run;
        }
        info!(
            pipeline = %pipeline.name(),
            run_id = %run.id,
            number = run.number,
            trigger = %run.trigger.kind,
            "Pipeline run started"
        );
        let _ = tx
            .send(PipelineEvent::RunStarted {
                run_id: run.id,
                pipeline: pipeline.name().to_string(),
                number: run.number,
            })
            .await;

        let mut vars = VariableContext::for_run(&pipeline, &run);
        let mut failure: Option<(String, String)> = None;
        let mut cancelled = false;

        for (index, stage) in pipeline.stages().iter().enumerate() {
            // cancellation only takes effect between stages
            if failure.is_none() && cancel.is_cancelled() {
                info!(run_id = %run.id, stage = %stage.name, "Run cancelled before stage");
                cancelled = true;
                failure = Some((stage.name.clone(), Error::Cancelled.to_string()));
            }
            if let Some((failed, _)) = &failure {
                let reason = if cancelled {
                    "run cancelled".to_string()
                } else {
                    format!("stage '{}' failed", failed)
                };
                self.skip(&mut run, &stage.name, &reason, &tx).await;
                continue;
            }

            if let Some(result) = run.stage_mut(&stage.name) {
                result.status = StageStatus::Running;
                result.started_at = Some(Utc::now());
            }
            info!(run_id = %run.id, stage = %stage.name, "Stage started");
            let _ = tx
                .send(PipelineEvent::StageStarted {
                    stage: stage.name.clone(),
                })
                .await;

            let requested = run.trigger.revision.clone();
            let outcome = self
                .execute_stage(&pipeline, run.id, stage, index, &mut vars, requested, &tx)
                .await;

            let status = match outcome {
                Ok(outputs) => {
                    info!(run_id = %run.id, stage = %stage.name, outputs = outputs.len(), "Stage succeeded");
                    if let Some(result) = run.stage_mut(&stage.name) {
                        result.outputs = outputs;
                    }
                    StageStatus::Succeeded
                }
                Err(e) => {
                    error!(run_id = %run.id, stage = %stage.name, error = %e, "Stage failed");
                    failure = Some((stage.name.clone(), e.to_string()));
                    StageStatus::Failed {
                        message: e.to_string(),
                    }
                }
            };
            if let Some(result) = run.stage_mut(&stage.name) {
                result.status = status.clone();
                result.finished_at = Some(Utc::now());
            }
            let _ = tx
                .send(PipelineEvent::StageCompleted {
                    stage: stage.name.clone(),
                    status,
                })
                .await;
        }

        let transition = match &failure {
            Some((stage, message)) => run.fail(stage.clone(), message.clone()),
            None => run.succeed(),
        };
        if let Err(e) = transition {
            error!(run_id = %run.id, error = %e, "Failed to record run outcome");
        }

        if !self.keep_artifacts {
            match self.store.remove_run(run.id).await {
                Ok(stats) => info!(
                    run_id = %run.id,
                    artifacts = stats.artifacts_deleted,
                    bytes = stats.bytes_freed,
                    "Run artifacts removed"
                ),
                Err(e) => warn!(run_id = %run.id, error = %e, "Failed to remove run artifacts"),
            }
        }

        match &run.status {
            RunStatus::Succeeded => {
                info!(pipeline = %pipeline.name(), run_id = %run.id, "Pipeline run succeeded")
            }
            status => {
                error!(pipeline = %pipeline.name(), run_id = %run.id, status = %status, "Pipeline run failed")
            }
        }
        let _ = tx
            .send(PipelineEvent::RunCompleted {
                run_id: run.id,
                status: run.status.clone(),
            })
            .await;
        run
    }

    async fn skip(
        &self,
        run: &mut PipelineRun,
        stage: &str,
        reason: &str,
        tx: &mpsc::Sender<PipelineEvent>,
    ) {
        let status = StageStatus::Skipped {
            reason: reason.to_string(),
        };
        if let Some(result) = run.stage_mut(stage) {
            result.status = status.clone();
        }
        let _ = tx
            .send(PipelineEvent::StageCompleted {
                stage: stage.to_string(),
                status,
            })
            .await;
    }

    /// Validate inputs, run every action, then publish the outputs.
    #[allow(clippy::too_many_arguments)]
    async fn execute_stage(
        &self,
        pipeline: &Pipeline,
        run_id: RunId,
        stage: &Stage,
        index: usize,
        vars: &mut VariableContext,
        requested: Option<Revision>,
        tx: &mpsc::Sender<PipelineEvent>,
    ) -> Result<Vec<ArtifactRef>> {
        for input in stage.inputs() {
            match self.store.get(run_id, input).await {
                Ok(artifact) if artifact.is_empty() => {
                    return Err(Error::EmptyArtifact(format!(
                        "input '{}' of stage '{}' is empty",
                        input, stage.name
                    )));
                }
                Ok(_) => {}
                Err(Error::NotFound(_)) => {
                    return Err(Error::MissingInput {
                        stage: stage.name.clone(),
                        artifact: input.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        let mut produced: Vec<Artifact> = Vec::new();
        for action in &stage.actions {
            let ctx = StageContext {
                run_id,
                stage: stage.name.clone(),
                vars: vars.at_stage(&stage.name, index),
                env: Default::default(),
                store: self.store.clone(),
                events: tx.clone(),
            };
            match &action.kind {
                ActionKind::Source(source) => {
                    let (revision, artifact) = actions::source::run(
                        &ctx,
                        self.fetcher.as_ref(),
                        action,
                        source,
                        requested.as_ref(),
                    )
                    .await?;
                    vars.set_revision(&revision);
                    produced.push(artifact);
                }
                ActionKind::Build(build) => {
                    let ctx = StageContext {
                        env: pipeline.env().clone(),
                        ..ctx
                    };
                    produced.push(
                        actions::build::run(&ctx, self.executor.as_ref(), action, build).await?,
                    );
                }
                ActionKind::Deploy(deploy) => {
                    actions::deploy::run(&ctx, self.deployer.as_ref(), action, deploy).await?;
                }
            }
        }

        // outputs become visible only once the whole stage has succeeded
        let mut outputs = Vec::with_capacity(produced.len());
        for artifact in produced {
            outputs.push(self.store.put(run_id, artifact).await?);
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::DirectorySource;
    use crate::store::MemoryArtifactStore;
    use async_trait::async_trait;
    use deployit_core::artifact::ArtifactName;
    use deployit_core::buildspec::{ArtifactSelection, BuildSpec, PhaseName};
    use deployit_core::deployer::{
        ApplyAction, ApplyOutcome, DeployRequest, TargetState, TargetStatus, ValidationWarning,
    };
    use deployit_core::pipeline::{BuildAction, DeployAction, TriggerInfo};
    use deployit_core::source::{Revision, SourceRef};
    use deployit_deployer::LocalDeployer;
    use deployit_executor::LocalProcessExecutor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    fn name(s: &str) -> ArtifactName {
        ArtifactName::new(s).unwrap()
    }

    fn demo_pipeline(pipeline: &str, commands: &[&str]) -> Arc<Pipeline> {
        let spec = BuildSpec::new(ArtifactSelection::files(["out.txt"]))
            .with_phase(PhaseName::Build, commands.iter().copied());
        Arc::new(
            Pipeline::builder(pipeline)
                .source_stage(
                    "Source",
                    "Checkout",
                    SourceRef::github("acme", "demo", "main"),
                    name("src-1"),
                )
                .build_stage(
                    "Build",
                    "Synth",
                    name("src-1"),
                    name("build-1"),
                    BuildAction {
                        image: "alpine:latest".into(),
                        privileged: false,
                        spec,
                    },
                )
                .deploy_stage(
                    "Deploy",
                    "Apply",
                    DeployAction::new("demo-stack", name("build-1").at_path("out.txt")),
                )
                .build()
                .unwrap(),
        )
    }

    /// Records every apply and optionally rejects them.
    #[derive(Default)]
    struct RecordingDeployer {
        applies: Mutex<Vec<DeployRequest>>,
        reject: bool,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl Deployer for RecordingDeployer {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn validate(&self, _request: &DeployRequest) -> Result<Vec<ValidationWarning>> {
            Ok(Vec::new())
        }

        async fn apply(&self, request: DeployRequest) -> Result<ApplyOutcome> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let target = request.target.clone();
            self.applies.lock().await.push(request);
            if self.reject {
                return Err(Error::DeploymentFailed(format!("{}: template rejected", target)));
            }
            Ok(ApplyOutcome {
                target,
                action: ApplyAction::Created,
                changes: Vec::new(),
                status: TargetStatus::CreateComplete,
            })
        }

        async fn describe(&self, _target: &str) -> Result<Option<TargetState>> {
            Ok(None)
        }
    }

    struct Fixture {
        source_dir: tempfile::TempDir,
        state_dir: tempfile::TempDir,
        store: Arc<MemoryArtifactStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let source_dir = tempfile::tempdir().unwrap();
            std::fs::write(source_dir.path().join("README.md"), "demo app\n").unwrap();
            Self {
                source_dir,
                state_dir: tempfile::tempdir().unwrap(),
                store: Arc::new(MemoryArtifactStore::new()),
            }
        }

        fn orchestrator(&self, deployer: Arc<dyn Deployer>) -> PipelineOrchestrator {
            PipelineOrchestrator::new(
                self.store.clone(),
                Arc::new(DirectorySource::new(self.source_dir.path())),
                Arc::new(LocalProcessExecutor::new()),
                deployer,
            )
        }

        fn local_deployer(&self) -> Arc<LocalDeployer> {
            Arc::new(LocalDeployer::new(self.state_dir.path()))
        }
    }

    async fn run_to_end(
        orchestrator: &PipelineOrchestrator,
        pipeline: &Arc<Pipeline>,
        number: u64,
    ) -> (PipelineRun, Vec<PipelineEvent>) {
        let run = PipelineRun::new(pipeline, number, TriggerInfo::manual());
        let (mut rx, handle) = orchestrator.execute(pipeline.clone(), run, CancelToken::new());
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (handle.await.unwrap(), events)
    }

    fn stage_status(run: &PipelineRun, stage: &str) -> StageStatus {
        run.stage(stage).unwrap().status.clone()
    }

    #[tokio::test]
    async fn test_source_build_deploy_succeeds() {
        let fixture = Fixture::new();
        let deployer = fixture.local_deployer();
        let orchestrator = fixture.orchestrator(deployer.clone()).keep_artifacts(true);
        let pipeline = demo_pipeline("demo", &["echo hello > out.txt"]);

        let (run, events) = run_to_end(&orchestrator, &pipeline, 1).await;

        assert_eq!(run.status, RunStatus::Succeeded);
        assert!(run.started_at.is_some() && run.finished_at.is_some());
        for stage in ["Source", "Build", "Deploy"] {
            assert_eq!(stage_status(&run, stage), StageStatus::Succeeded);
        }

        let build = orchestrator.store.get(run.id, &name("build-1")).await.unwrap();
        assert_eq!(build.files().len(), 1);
        assert_eq!(&build.file("out.txt").unwrap()[..], b"hello\n");
        assert_eq!(run.stage("Source").unwrap().outputs[0].name, name("src-1"));

        let state = deployer.describe("demo-stack").await.unwrap().unwrap();
        assert_eq!(state.status, TargetStatus::CreateComplete);
        assert_eq!(state.resources, vec!["Template".to_string()]);
        assert_eq!(
            state.template_digest.as_deref(),
            Some(deployit_core::deployer::Template::new("out.txt", "hello\n").digest().as_str())
        );

        assert!(matches!(events.first(), Some(PipelineEvent::RunStarted { number: 1, .. })));
        assert!(matches!(
            events.last(),
            Some(PipelineEvent::RunCompleted {
                status: RunStatus::Succeeded,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_failing_build_never_deploys() {
        let fixture = Fixture::new();
        let deployer = Arc::new(RecordingDeployer::default());
        let orchestrator = fixture.orchestrator(deployer.clone()).keep_artifacts(true);
        let pipeline = demo_pipeline("demo", &["exit 1"]);

        let (run, _) = run_to_end(&orchestrator, &pipeline, 1).await;

        match &run.status {
            RunStatus::Failed { stage, message } => {
                assert_eq!(stage, "Build");
                assert!(message.contains("exit code 1"), "{}", message);
            }
            other => panic!("unexpected status {:?}", other),
        }
        assert!(matches!(stage_status(&run, "Build"), StageStatus::Failed { .. }));
        assert!(matches!(stage_status(&run, "Deploy"), StageStatus::Skipped { .. }));
        assert!(deployer.applies.lock().await.is_empty());

        // no output registered for the failed build
        assert!(!orchestrator.store.contains(run.id, &name("build-1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_failure_inside_and_or_list_fails_build() {
        for failing in ["test -f missing.txt && echo found", "false || false && true"] {
            let fixture = Fixture::new();
            let deployer = Arc::new(RecordingDeployer::default());
            let orchestrator = fixture.orchestrator(deployer.clone());
            let pipeline = demo_pipeline("demo", &[failing, "echo hello > out.txt"]);

            let (run, events) = run_to_end(&orchestrator, &pipeline, 1).await;

            assert_eq!(run.failed_stage(), Some("Build"), "{}", failing);
            assert!(matches!(stage_status(&run, "Deploy"), StageStatus::Skipped { .. }));
            assert!(deployer.applies.lock().await.is_empty());
            // the command after the failing one never ran
            assert!(!events.iter().any(|e| matches!(
                e,
                PipelineEvent::StageLog { line, .. } if line.content.contains("found")
            )));
        }
    }

    #[tokio::test]
    async fn test_empty_selection_fails_build() {
        let fixture = Fixture::new();
        let deployer = Arc::new(RecordingDeployer::default());
        let orchestrator = fixture.orchestrator(deployer.clone());
        let pipeline = demo_pipeline("demo", &["echo hello > other.txt"]);

        let (run, _) = run_to_end(&orchestrator, &pipeline, 1).await;

        assert_eq!(run.failed_stage(), Some("Build"));
        match &run.status {
            RunStatus::Failed { message, .. } => assert!(message.contains("empty artifact")),
            other => panic!("unexpected status {:?}", other),
        }
        assert!(deployer.applies.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_apply_fails_deploy_stage_without_retry() {
        let fixture = Fixture::new();
        let deployer = Arc::new(RecordingDeployer {
            reject: true,
            ..Default::default()
        });
        let orchestrator = fixture.orchestrator(deployer.clone());
        let pipeline = demo_pipeline("demo", &["echo hello > out.txt"]);

        let (run, _) = run_to_end(&orchestrator, &pipeline, 1).await;

        assert_eq!(run.failed_stage(), Some("Deploy"));
        assert_eq!(deployer.applies.lock().await.len(), 1);
        assert!(run.status.to_string().contains("template rejected"));
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent_and_reproducible() {
        let fixture = Fixture::new();
        let deployer = fixture.local_deployer();
        let orchestrator = fixture.orchestrator(deployer.clone()).keep_artifacts(true);
        let pipeline = demo_pipeline("demo", &["echo hello > out.txt"]);

        let (first, _) = run_to_end(&orchestrator, &pipeline, 1).await;
        let (second, _) = run_to_end(&orchestrator, &pipeline, 2).await;
        assert_eq!(first.status, RunStatus::Succeeded);
        assert_eq!(second.status, RunStatus::Succeeded);

        let a = orchestrator.store.get(first.id, &name("build-1")).await.unwrap();
        let b = orchestrator.store.get(second.id, &name("build-1")).await.unwrap();
        assert_eq!(a.checksum(), b.checksum());
        assert_eq!(a.files(), b.files());

        // second apply of the same template changed nothing
        let state = deployer.describe("demo-stack").await.unwrap().unwrap();
        assert_eq!(state.revision, 1);
    }

    #[tokio::test]
    async fn test_artifacts_removed_after_run() {
        let fixture = Fixture::new();
        let orchestrator = fixture.orchestrator(fixture.local_deployer());
        let pipeline = demo_pipeline("demo", &["echo hello > out.txt"]);

        let (run, _) = run_to_end(&orchestrator, &pipeline, 1).await;
        assert_eq!(run.status, RunStatus::Succeeded);
        assert!(orchestrator.store.list(run.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_requested_revision_is_used() {
        let fixture = Fixture::new();
        let orchestrator = fixture.orchestrator(fixture.local_deployer());
        let pipeline = demo_pipeline("demo", &["echo hello > out.txt"]);

        let trigger = TriggerInfo::at(
            deployit_core::pipeline::TriggerKind::Push,
            Revision::new("0000000000"),
        );
        let run = PipelineRun::new(&pipeline, 1, trigger);
        let (rx, handle) = orchestrator.execute(pipeline.clone(), run, CancelToken::new());
        drop(rx);
        let run = handle.await.unwrap();

        // the directory is not at that revision
        assert_eq!(run.failed_stage(), Some("Source"));
        assert!(matches!(stage_status(&run, "Build"), StageStatus::Skipped { .. }));
    }

    #[tokio::test]
    async fn test_cancel_between_stages() {
        let fixture = Fixture::new();
        let deployer = Arc::new(RecordingDeployer::default());
        let orchestrator = fixture.orchestrator(deployer.clone());
        let pipeline = demo_pipeline("demo", &["sleep 0.3", "echo hello > out.txt"]);

        let cancel = CancelToken::new();
        let run = PipelineRun::new(&pipeline, 1, TriggerInfo::manual());
        let (mut rx, handle) = orchestrator.execute(pipeline.clone(), run, cancel.clone());

        // cancel while the build is in flight
        while let Some(event) = rx.recv().await {
            if let PipelineEvent::StageStarted { stage } = &event {
                if stage == "Build" {
                    cancel.cancel();
                }
            }
        }
        let run = handle.await.unwrap();

        // the in-flight build finished; the deploy never started
        assert_eq!(stage_status(&run, "Build"), StageStatus::Succeeded);
        assert_eq!(
            stage_status(&run, "Deploy"),
            StageStatus::Skipped {
                reason: "run cancelled".into()
            }
        );
        assert_eq!(run.failed_stage(), Some("Deploy"));
        assert!(deployer.applies.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_runs_of_same_pipeline_never_overlap() {
        let fixture = Fixture::new();
        let deployer = Arc::new(RecordingDeployer {
            delay: Duration::from_millis(100),
            ..Default::default()
        });
        let orchestrator = fixture.orchestrator(deployer.clone());
        let pipeline = demo_pipeline("demo", &["echo hello > out.txt"]);

        let handles: Vec<_> = (1..=2)
            .map(|n| {
                let run = PipelineRun::new(&pipeline, n, TriggerInfo::manual());
                let (rx, handle) = orchestrator.execute(pipeline.clone(), run, CancelToken::new());
                drop(rx);
                handle
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().status, RunStatus::Succeeded);
        }

        assert_eq!(deployer.applies.lock().await.len(), 2);
        assert_eq!(deployer.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_pipelines_run_concurrently() {
        let fixture = Fixture::new();
        let deployer = Arc::new(RecordingDeployer {
            delay: Duration::from_millis(500),
            ..Default::default()
        });
        let orchestrator = fixture.orchestrator(deployer.clone());

        let handles: Vec<_> = ["alpha", "beta"]
            .into_iter()
            .map(|p| {
                let pipeline = demo_pipeline(p, &["echo hello > out.txt"]);
                let run = PipelineRun::new(&pipeline, 1, TriggerInfo::manual());
                let (rx, handle) = orchestrator.execute(pipeline, run, CancelToken::new());
                drop(rx);
                handle
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().status, RunStatus::Succeeded);
        }
        assert_eq!(deployer.max_in_flight.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_started_run_is_not_restarted() {
        let fixture = Fixture::new();
        let orchestrator = fixture.orchestrator(fixture.local_deployer());
        let pipeline = demo_pipeline("demo", &["echo hello > out.txt"]);

        let mut run = PipelineRun::new(&pipeline, 1, TriggerInfo::manual());
        run.start().unwrap();
        run.succeed().unwrap();
        let (_rx, handle) = orchestrator.execute(pipeline.clone(), run, CancelToken::new());
        let run = handle.await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(stage_status(&run, "Source"), StageStatus::Pending);
    }
}
