//! Build action: run the phased commands in a throwaway workspace and
//! select the output files.

use deployit_core::artifact::Artifact;
use deployit_core::executor::{Executor, JobSpec, JobStatus, LogStream};
use deployit_core::pipeline::{Action, BuildAction};
use deployit_core::{Error, Result};
use futures::StreamExt;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{error, info, warn};

use super::StageContext;
use crate::workspace::{blocking, safe_join, select_files, write_tree};

/// Stderr lines kept for the failure message.
const STDERR_TAIL: usize = 10;
/// How long to wait for trailing log lines after the job has exited.
const LOG_DRAIN: Duration = Duration::from_secs(5);

pub async fn run(
    ctx: &StageContext,
    executor: &dyn Executor,
    action: &Action,
    build: &BuildAction,
) -> Result<Artifact> {
    let output = action.outputs.first().ok_or_else(|| {
        Error::Internal(format!("build action '{}' declares no output", action.name))
    })?;

    // Removed when dropped, whatever the outcome
    let workspace = tempfile::Builder::new()
        .prefix("deployit-build-")
        .tempdir()?;

    for (index, input) in action.inputs.iter().enumerate() {
        let artifact = ctx.store.get(ctx.run_id, input).await?;
        // primary input is the workspace root, the rest get a directory each
        let dest = if index == 0 {
            workspace.path().to_path_buf()
        } else {
            safe_join(workspace.path(), input.as_str())?
        };
        let files = artifact.files().clone();
        blocking(move || write_tree(&dest, &files)).await?;
    }

    let vars = &ctx.vars;
    let mut env = vars.interpolate_map(&ctx.env);
    env.extend(vars.interpolate_map(&build.spec.env));
    env.extend(vars.job_env());

    let mut spec = JobSpec::shell(
        vars.interpolate(&build.image),
        vars.interpolate(&build.spec.script()),
        workspace.path().to_path_buf(),
    );
    spec.env = env;
    spec.privileged = build.privileged;

    if !executor.can_execute(&spec).await {
        return Err(Error::ExecutionFailed(format!(
            "executor '{}' cannot run action '{}'",
            executor.name(),
            action.name
        )));
    }

    info!(
        run_id = %ctx.run_id,
        stage = %ctx.stage,
        action = %action.name,
        image = %spec.image,
        executor = executor.name(),
        "Spawning build job"
    );
    let handle = executor.spawn(spec).await?;
    let mut logs = executor.logs(&handle).await?;

    let log_ctx = ctx.clone();
    let mut log_task = tokio::spawn(async move {
        let mut tail = VecDeque::with_capacity(STDERR_TAIL);
        while let Some(line) = logs.next().await {
            if line.stream == LogStream::Stderr {
                if tail.len() == STDERR_TAIL {
                    tail.pop_front();
                }
                tail.push_back(log_ctx.vars.mask(&line.content));
            }
            log_ctx.log(line).await;
        }
        tail
    });

    let result = executor.wait(&handle).await?;

    let stderr_tail = match tokio::time::timeout(LOG_DRAIN, &mut log_task).await {
        Ok(Ok(tail)) => tail,
        Ok(Err(e)) => {
            warn!(error = %e, "Log forwarding task failed");
            VecDeque::new()
        }
        Err(_) => {
            // the log stream may still be following a stopped container
            log_task.abort();
            VecDeque::new()
        }
    };

    match result.status {
        JobStatus::Succeeded { .. } => {}
        JobStatus::Failed { message, .. } => {
            let tail: Vec<String> = stderr_tail.into_iter().collect();
            error!(
                run_id = %ctx.run_id,
                stage = %ctx.stage,
                action = %action.name,
                exit_code = ?result.exit_code,
                "Build command failed"
            );
            let mut detail = format!("action '{}' failed: {}", action.name, message);
            if !tail.is_empty() {
                detail.push('\n');
                detail.push_str(&tail.join("\n"));
            }
            return Err(Error::ExecutionFailed(detail));
        }
        JobStatus::Cancelled { .. } => {
            return Err(Error::ExecutionFailed(format!(
                "action '{}': build job was cancelled",
                action.name
            )));
        }
        other => {
            return Err(Error::Internal(format!(
                "action '{}': job ended in unexpected state {:?}",
                action.name, other
            )));
        }
    }

    let root = workspace.path().to_path_buf();
    let selection = build.spec.artifacts.clone();
    let files = blocking(move || select_files(&root, &selection)).await?;
    let artifact = Artifact::new(output.clone(), "", files);

    if artifact.files().is_empty() {
        return Err(Error::EmptyArtifact(format!(
            "action '{}' selected no files for '{}' (patterns: {})",
            action.name,
            output,
            build.spec.artifacts.files.join(", ")
        )));
    }
    if artifact.is_empty() {
        return Err(Error::EmptyArtifact(format!(
            "action '{}' selected only zero-byte files for '{}'",
            action.name, output
        )));
    }

    info!(
        run_id = %ctx.run_id,
        stage = %ctx.stage,
        action = %action.name,
        artifact = %output,
        files = artifact.files().len(),
        size = artifact.size(),
        "Build output selected"
    );
    Ok(artifact)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryArtifactStore;
    use bytes::Bytes;
    use deployit_config::VariableContextBuilder;
    use deployit_core::RunId;
    use deployit_core::artifact::{ArtifactName, ArtifactStore};
    use deployit_core::buildspec::{ArtifactSelection, BuildSpec, PhaseName};
    use deployit_executor::LocalProcessExecutor;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn name(s: &str) -> ArtifactName {
        ArtifactName::new(s).unwrap()
    }

    async fn context(inputs: &[(&str, &[(&str, &str)])]) -> (StageContext, mpsc::Receiver<crate::PipelineEvent>) {
        let store: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new());
        let run_id = RunId::new();
        for (artifact, files) in inputs {
            let files = files
                .iter()
                .map(|(p, c)| (p.to_string(), Bytes::from(c.to_string())))
                .collect();
            store
                .put(run_id, Artifact::new(name(artifact), "", files))
                .await
                .unwrap();
        }
        let (tx, rx) = mpsc::channel(1024);
        let ctx = StageContext {
            run_id,
            stage: "Build".into(),
            vars: VariableContextBuilder::new()
                .with_stage("Build", 1)
                .with_secret("TOKEN", "hunter2")
                .build(),
            env: BTreeMap::from([("GREETING".to_string(), "hi".to_string())]),
            store,
            events: tx,
        };
        (ctx, rx)
    }

    fn action(inputs: &[&str], spec: BuildSpec) -> (Action, BuildAction) {
        let build = BuildAction {
            image: "alpine:latest".into(),
            privileged: false,
            spec,
        };
        let mut action = Action::build("Synth", name(inputs[0]), name("build-1"), build.clone());
        for extra in &inputs[1..] {
            action = action.with_input(name(extra));
        }
        (action, build)
    }

    fn log_lines(rx: &mut mpsc::Receiver<crate::PipelineEvent>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let crate::PipelineEvent::StageLog { line, .. } = event {
                lines.push(line.content);
            }
        }
        lines
    }

    #[tokio::test]
    async fn test_build_selects_output() {
        let (ctx, mut rx) = context(&[("src-1", &[("README.md", "demo")])]).await;
        let spec = BuildSpec::new(ArtifactSelection::files(["out.txt"]))
            .with_phase(PhaseName::Install, ["test -f README.md"])
            .with_phase(PhaseName::Build, ["echo hello > out.txt", "echo $GREETING"]);
        let (action, build) = action(&["src-1"], spec);

        let artifact = run(&ctx, &LocalProcessExecutor::new(), &action, &build)
            .await
            .unwrap();
        assert_eq!(artifact.name().as_str(), "build-1");
        assert_eq!(artifact.files().len(), 1);
        assert_eq!(artifact.file("out.txt").unwrap(), &Bytes::from("hello\n"));

        let lines = log_lines(&mut rx);
        assert!(lines.iter().any(|l| l == "--- phase: install"));
        assert!(lines.iter().any(|l| l == "hi"));
    }

    #[tokio::test]
    async fn test_failing_command_stops_later_phases() {
        let (ctx, mut rx) = context(&[("src-1", &[("README.md", "demo")])]).await;
        let spec = BuildSpec::new(ArtifactSelection::files(["out.txt"]))
            .with_phase(PhaseName::Build, ["echo broken >&2", "exit 3", "echo hello > out.txt"])
            .with_phase(PhaseName::PostBuild, ["echo post"]);
        let (action, build) = action(&["src-1"], spec);

        let err = run(&ctx, &LocalProcessExecutor::new(), &action, &build)
            .await
            .unwrap_err();
        match err {
            Error::ExecutionFailed(message) => {
                assert!(message.contains("exit code 3"), "{}", message);
                assert!(message.contains("broken"), "{}", message);
            }
            other => panic!("unexpected error: {}", other),
        }
        let lines = log_lines(&mut rx);
        assert!(!lines.iter().any(|l| l == "post" || l.contains("post_build")));
    }

    #[tokio::test]
    async fn test_no_matching_files_is_empty_artifact() {
        let (ctx, _rx) = context(&[("src-1", &[("README.md", "demo")])]).await;
        let spec = BuildSpec::new(ArtifactSelection::files(["cdk.out/*.template.json"]))
            .with_phase(PhaseName::Build, ["echo nothing"]);
        let (action, build) = action(&["src-1"], spec);

        let err = run(&ctx, &LocalProcessExecutor::new(), &action, &build)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyArtifact(_)), "{}", err);
    }

    #[tokio::test]
    async fn test_zero_byte_output_is_empty_artifact() {
        let (ctx, _rx) = context(&[("src-1", &[("README.md", "demo")])]).await;
        let spec = BuildSpec::new(ArtifactSelection::files(["out.txt"]))
            .with_phase(PhaseName::Build, ["touch out.txt"]);
        let (action, build) = action(&["src-1"], spec);

        let err = run(&ctx, &LocalProcessExecutor::new(), &action, &build)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyArtifact(_)));
    }

    #[tokio::test]
    async fn test_secondary_inputs_and_masking() {
        let (ctx, mut rx) = context(&[
            ("src-1", &[("app.txt", "app")]),
            ("config", &[("values.json", "{}")]),
        ])
        .await;
        let spec = BuildSpec::new(ArtifactSelection::files(["bundle/**"]))
            .with_phase(
                PhaseName::Build,
                [
                    "mkdir -p bundle",
                    "cp app.txt config/values.json bundle/",
                    "echo token=${secrets.TOKEN}",
                ],
            );
        let (action, build) = action(&["src-1", "config"], spec);

        let artifact = run(&ctx, &LocalProcessExecutor::new(), &action, &build)
            .await
            .unwrap();
        let paths: Vec<_> = artifact.files().keys().map(String::as_str).collect();
        assert_eq!(paths, vec!["bundle/app.txt", "bundle/values.json"]);

        let lines = log_lines(&mut rx);
        assert!(lines.iter().any(|l| l == "token=***"));
        assert!(!lines.iter().any(|l| l.contains("hunter2")));
    }
}
