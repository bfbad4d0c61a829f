//! Executor trait and job types.
//!
//! Executors run build jobs in isolated environments (local processes,
//! containers). A job sees one workspace directory; whatever it leaves there
//! is what the build action collects.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::Result;
use crate::id::JobId;

/// Specification for a job to execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Unique identifier for this job.
    pub id: JobId,
    /// Base image for container executors. Ignored by the process executor.
    pub image: String,
    /// Command and arguments.
    pub command: Vec<String>,
    /// Host directory the job runs in. Container executors mount it.
    pub workspace: PathBuf,
    /// Environment variables. Executors pass nothing else through beyond
    /// what they need to locate binaries.
    pub env: BTreeMap<String, String>,
    /// Run the container privileged (needed for docker-in-docker builds).
    pub privileged: bool,
    /// Maximum execution time.
    pub timeout: Option<Duration>,
}

impl JobSpec {
    /// A job running `script` through `/bin/sh -c`.
    pub fn shell(image: impl Into<String>, script: impl Into<String>, workspace: PathBuf) -> Self {
        Self {
            id: JobId::new(),
            image: image.into(),
            command: vec!["/bin/sh".to_string(), "-c".to_string(), script.into()],
            workspace,
            env: BTreeMap::new(),
            privileged: false,
            timeout: None,
        }
    }
}

/// Handle to a running or completed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHandle {
    /// The job ID.
    pub id: JobId,
    /// Executor-specific identifier (e.g., process id, container ID).
    pub executor_id: String,
    /// Name of the executor running this job.
    pub executor_name: String,
}

/// Status of a job execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobStatus {
    /// Job is waiting to start.
    Pending,
    /// Job is currently running.
    Running { started_at: DateTime<Utc> },
    /// Job completed successfully.
    Succeeded {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    },
    /// Job failed.
    Failed {
        started_at: Option<DateTime<Utc>>,
        finished_at: DateTime<Utc>,
        exit_code: Option<i32>,
        message: String,
    },
    /// Job was cancelled.
    Cancelled {
        started_at: Option<DateTime<Utc>>,
        cancelled_at: DateTime<Utc>,
    },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded { .. } | JobStatus::Failed { .. } | JobStatus::Cancelled { .. }
        )
    }
}

/// Result of a completed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    /// Final status.
    pub status: JobStatus,
    /// Exit code if available.
    pub exit_code: Option<i32>,
}

/// A line of log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub content: String,
}

impl LogLine {
    pub fn new(stream: LogStream, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

/// Trait for job executors.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Check if this executor can handle the given job spec.
    async fn can_execute(&self, spec: &JobSpec) -> bool;

    /// Spawn a new job.
    async fn spawn(&self, spec: JobSpec) -> Result<JobHandle>;

    /// Get a stream of log lines from a job. The stream ends when the job
    /// exits.
    async fn logs(&self, handle: &JobHandle) -> Result<BoxStream<'static, LogLine>>;

    /// Get the current status of a job.
    async fn status(&self, handle: &JobHandle) -> Result<JobStatus>;

    /// Wait for a job to complete.
    async fn wait(&self, handle: &JobHandle) -> Result<JobResult>;

    /// Cancel a running job.
    async fn cancel(&self, handle: &JobHandle) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_job_spec() {
        let spec = JobSpec::shell("alpine:3", "echo hi", PathBuf::from("/tmp/ws"));
        assert_eq!(spec.command, vec!["/bin/sh", "-c", "echo hi"]);
        assert_eq!(spec.image, "alpine:3");
        assert!(!spec.privileged);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(
            !JobStatus::Running {
                started_at: Utc::now()
            }
            .is_terminal()
        );
        assert!(
            JobStatus::Failed {
                started_at: None,
                finished_at: Utc::now(),
                exit_code: Some(1),
                message: "exit 1".into(),
            }
            .is_terminal()
        );
        assert!(
            JobStatus::Cancelled {
                started_at: None,
                cancelled_at: Utc::now(),
            }
            .is_terminal()
        );
    }
}
