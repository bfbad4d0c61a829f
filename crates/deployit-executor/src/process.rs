//! Local process executor.
//!
//! Runs the job command directly on the host, inside the job's workspace
//! directory, with a cleared environment. The build image is ignored.

use async_trait::async_trait;
use chrono::Utc;
use deployit_core::executor::*;
use deployit_core::id::JobId;
use deployit_core::{Error, Result};
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

struct ProcessJob {
    logs: Option<mpsc::UnboundedReceiver<LogLine>>,
    status: watch::Receiver<JobStatus>,
    kill: Option<oneshot::Sender<()>>,
}

/// Executor running jobs as local child processes.
pub struct LocalProcessExecutor {
    jobs: Arc<Mutex<HashMap<JobId, ProcessJob>>>,
    path: String,
}

impl LocalProcessExecutor {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            path: std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string()),
        }
    }
}

impl Default for LocalProcessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn forward_lines<R>(
    reader: R,
    stream: LogStream,
    tx: mpsc::UnboundedSender<LogLine>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    // receiver gone means nobody wants the logs; keep draining
                    let _ = tx.send(LogLine::new(stream, line));
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "failed to read job output");
                    break;
                }
            }
        }
    })
}

async fn wait_timeout(timeout: Option<std::time::Duration>) {
    match timeout {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl Executor for LocalProcessExecutor {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn can_execute(&self, spec: &JobSpec) -> bool {
        !spec.command.is_empty() && spec.workspace.is_dir()
    }

    async fn spawn(&self, spec: JobSpec) -> Result<JobHandle> {
        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| Error::InvalidInput("job has no command".to_string()))?;

        let mut child = Command::new(program)
            .args(args)
            .current_dir(&spec.workspace)
            .env_clear()
            .env("PATH", &self.path)
            .env("HOME", &spec.workspace)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::ExecutionFailed(format!("failed to start '{}': {}", program, e)))?;

        let pid = child.id().map(|p| p.to_string()).unwrap_or_default();
        info!(job_id = %spec.id, pid = %pid, workspace = %spec.workspace.display(), "Started job process");

        let started_at = Utc::now();
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(JobStatus::Running { started_at });
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        let stdout = child
            .stdout
            .take()
            .map(|out| forward_lines(out, LogStream::Stdout, log_tx.clone()));
        let stderr = child
            .stderr
            .take()
            .map(|err| forward_lines(err, LogStream::Stderr, log_tx.clone()));

        let job_id = spec.id;
        let timeout = spec.timeout;
        tokio::spawn(async move {
            let final_status = tokio::select! {
                exit = child.wait() => match exit {
                    Ok(exit) if exit.success() => JobStatus::Succeeded {
                        started_at,
                        finished_at: Utc::now(),
                    },
                    Ok(exit) => JobStatus::Failed {
                        started_at: Some(started_at),
                        finished_at: Utc::now(),
                        exit_code: exit.code(),
                        message: match exit.code() {
                            Some(code) => format!("exit code {}", code),
                            None => "terminated by signal".to_string(),
                        },
                    },
                    Err(e) => JobStatus::Failed {
                        started_at: Some(started_at),
                        finished_at: Utc::now(),
                        exit_code: None,
                        message: e.to_string(),
                    },
                },
                Ok(()) = kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(job_id = %job_id, error = %e, "Failed to kill job process");
                    }
                    JobStatus::Cancelled {
                        started_at: Some(started_at),
                        cancelled_at: Utc::now(),
                    }
                }
                _ = wait_timeout(timeout) => {
                    if let Err(e) = child.kill().await {
                        warn!(job_id = %job_id, error = %e, "Failed to kill job process");
                    }
                    let _ = log_tx.send(LogLine::new(LogStream::System, "job timed out"));
                    JobStatus::Failed {
                        started_at: Some(started_at),
                        finished_at: Utc::now(),
                        exit_code: None,
                        message: "timed out".to_string(),
                    }
                }
            };

            // flush output before reporting the terminal status
            for reader in [stdout, stderr].into_iter().flatten() {
                let _ = reader.await;
            }
            drop(log_tx);
            debug!(job_id = %job_id, status = ?final_status, "Job process finished");
            let _ = status_tx.send(final_status);
        });

        self.jobs.lock().await.insert(
            spec.id,
            ProcessJob {
                logs: Some(log_rx),
                status: status_rx,
                kill: Some(kill_tx),
            },
        );

        Ok(JobHandle {
            id: spec.id,
            executor_id: pid,
            executor_name: self.name().to_string(),
        })
    }

    async fn logs(&self, handle: &JobHandle) -> Result<BoxStream<'static, LogLine>> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&handle.id)
            .ok_or_else(|| Error::NotFound(format!("job {}", handle.id)))?;
        let rx = job
            .logs
            .take()
            .ok_or_else(|| Error::Conflict(format!("logs of job {} already taken", handle.id)))?;
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus> {
        let jobs = self.jobs.lock().await;
        let job = jobs
            .get(&handle.id)
            .ok_or_else(|| Error::NotFound(format!("job {}", handle.id)))?;
        Ok(job.status.borrow().clone())
    }

    async fn wait(&self, handle: &JobHandle) -> Result<JobResult> {
        let mut status_rx = {
            let jobs = self.jobs.lock().await;
            jobs.get(&handle.id)
                .ok_or_else(|| Error::NotFound(format!("job {}", handle.id)))?
                .status
                .clone()
        };

        let status = status_rx
            .wait_for(|s| s.is_terminal())
            .await
            .map_err(|_| Error::Internal(format!("job {} watcher went away", handle.id)))?
            .clone();

        // once both the logs and the result are collected the job is done
        {
            let mut jobs = self.jobs.lock().await;
            if jobs.get(&handle.id).is_some_and(|j| j.logs.is_none()) {
                jobs.remove(&handle.id);
            }
        }

        let exit_code = match &status {
            JobStatus::Succeeded { .. } => Some(0),
            JobStatus::Failed { exit_code, .. } => *exit_code,
            _ => None,
        };
        Ok(JobResult { status, exit_code })
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&handle.id)
            .ok_or_else(|| Error::NotFound(format!("job {}", handle.id)))?;
        if let Some(kill) = job.kill.take() {
            info!(job_id = %handle.id, "Cancelling job process");
            // the process may already have exited
            let _ = kill.send(());
        }
        Ok(())
    }
}
