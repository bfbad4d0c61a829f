//! Local pipeline execution command.

use anyhow::{Context, Result};
use deployit_config::SystemConfig;
use deployit_core::executor::LogStream;
use deployit_core::pipeline::{PipelineRun, RunStatus, StageStatus, TriggerInfo, TriggerKind};
use deployit_core::source::Revision;
use deployit_scheduler::{CancelToken, PipelineEvent, runtime};
use std::path::{Path, PathBuf};

use super::{fetcher, load_pipeline_file};

/// Run a pipeline once. Ctrl-C stops the run before its next stage.
pub async fn run(
    config: &SystemConfig,
    path: &Path,
    source_dir: Option<PathBuf>,
    revision: Option<String>,
    json: bool,
) -> Result<()> {
    let pipeline = load_pipeline_file(path)?;
    let orchestrator = runtime::orchestrator(config, fetcher(source_dir)?)?;

    let trigger = match revision {
        Some(revision) => TriggerInfo::at(TriggerKind::Manual, Revision::new(revision)),
        None => TriggerInfo::manual(),
    };
    let run = PipelineRun::new(&pipeline, 1, trigger);

    let cancel = CancelToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupted, stopping after the current stage");
                cancel.cancel();
            }
        })
    };

    let (mut rx, handle) = orchestrator.execute(pipeline.clone(), run, cancel);
    while let Some(event) = rx.recv().await {
        if !json {
            print_event(&event);
        }
    }
    interrupt.abort();

    let run = handle.await.context("Pipeline execution task failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_summary(&run);
    }

    match &run.status {
        RunStatus::Succeeded => Ok(()),
        RunStatus::Failed { stage, message } => {
            anyhow::bail!("Pipeline failed at stage '{}': {}", stage, message)
        }
        other => anyhow::bail!("Pipeline ended in state {}", other),
    }
}

fn print_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::RunStarted {
            pipeline, number, ..
        } => {
            println!("--- Pipeline '{}' run #{} ---\n", pipeline, number);
        }
        PipelineEvent::StageStarted { stage } => {
            println!("▶ Stage '{}' started", stage);
        }
        PipelineEvent::StageLog { stage, line } => {
            let stream_marker = match line.stream {
                LogStream::Stdout => " ",
                LogStream::Stderr => "!",
                LogStream::System => "*",
            };
            println!("  [{}]{} {}", stage, stream_marker, line.content);
        }
        PipelineEvent::StageCompleted { stage, status } => match status {
            StageStatus::Succeeded => println!("✓ Stage '{}' completed successfully\n", stage),
            StageStatus::Failed { message } => println!("✗ Stage '{}' failed: {}\n", stage, message),
            StageStatus::Skipped { reason } => println!("⊘ Stage '{}' skipped: {}", stage, reason),
            _ => {}
        },
        PipelineEvent::RunCompleted { status, .. } => {
            println!("--- Pipeline {} ---", status);
        }
    }
}

fn print_summary(run: &PipelineRun) {
    println!("\n--- Stage Summary ---");
    for stage in &run.stages {
        let status = match &stage.status {
            StageStatus::Succeeded => "✓ succeeded".to_string(),
            StageStatus::Failed { message } => format!("✗ failed: {}", message),
            StageStatus::Skipped { reason } => format!("⊘ skipped: {}", reason),
            StageStatus::Pending => "○ pending".to_string(),
            StageStatus::Running => "▶ running".to_string(),
        };
        println!("  {} - {}", stage.name, status);
        for output in &stage.outputs {
            println!(
                "      {} ({} file(s), {} bytes, sha256:{})",
                output.name,
                output.files,
                output.size,
                output.checksum
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::validate::DEMO_PIPELINE;
    use deployit_config::system::DeployerConfig;

    struct Workspace {
        dir: tempfile::TempDir,
    }

    impl Workspace {
        fn new(pipeline: &str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("deployit.kdl"), pipeline).unwrap();
            std::fs::create_dir(dir.path().join("app")).unwrap();
            std::fs::write(dir.path().join("app/README.md"), "demo\n").unwrap();
            Self { dir }
        }

        fn config(&self) -> SystemConfig {
            SystemConfig {
                deployer: DeployerConfig::Local {
                    state_dir: self.dir.path().join("state"),
                },
                ..Default::default()
            }
        }
    }

    #[tokio::test]
    async fn test_run_then_status() {
        let ws = Workspace::new(DEMO_PIPELINE);
        let config = ws.config();

        run(
            &config,
            &ws.dir.path().join("deployit.kdl"),
            Some(ws.dir.path().join("app")),
            None,
            false,
        )
        .await
        .unwrap();

        crate::commands::status::status(&config, "demo-stack", true)
            .await
            .unwrap();
        assert!(crate::commands::status::status(&config, "other", false)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_failed_build_is_an_error() {
        let ws = Workspace::new(&DEMO_PIPELINE.replace("echo hello > out.txt", "exit 2"));
        let err = run(
            &ws.config(),
            &ws.dir.path().join("deployit.kdl"),
            Some(ws.dir.path().join("app")),
            None,
            true,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("stage 'Build'"), "{}", err);
    }
}
