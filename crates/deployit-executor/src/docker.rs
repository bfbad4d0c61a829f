//! Local Docker executor implementation.
//!
//! The job workspace is bind-mounted at `/workspace` and used as the
//! working directory, so files the build writes land in the host workspace.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use chrono::Utc;
use deployit_core::executor::*;
use deployit_core::id::JobId;
use deployit_core::{Error, Result};
use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::{debug, info, warn};

const WORKSPACE_MOUNT: &str = "/workspace";

/// Local Docker executor for builds that need their declared image.
pub struct LocalDockerExecutor {
    docker: Docker,
}

impl LocalDockerExecutor {
    /// Create a new LocalDockerExecutor connecting to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    fn container_name(job_id: &JobId) -> String {
        format!("deployit-job-{}", job_id)
    }

    fn container_config(spec: &JobSpec) -> Config<String> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let host_config = HostConfig {
            binds: Some(vec![format!(
                "{}:{}:rw",
                spec.workspace.display(),
                WORKSPACE_MOUNT
            )]),
            privileged: Some(spec.privileged),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            cmd: if spec.command.is_empty() {
                None
            } else {
                Some(spec.command.clone())
            },
            env: Some(env),
            working_dir: Some(WORKSPACE_MOUNT.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    async fn remove(&self, container_name: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(container_name, Some(options))
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to remove container: {}", e)))
    }
}

#[async_trait]
impl Executor for LocalDockerExecutor {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn can_execute(&self, _spec: &JobSpec) -> bool {
        // Check if Docker is available
        self.docker.ping().await.is_ok()
    }

    async fn spawn(&self, spec: JobSpec) -> Result<JobHandle> {
        let container_name = Self::container_name(&spec.id);

        // Pull the image first
        info!(image = %spec.image, "Pulling image");
        let create_image_options = CreateImageOptions {
            from_image: spec.image.clone(),
            ..Default::default()
        };

        let mut pull_stream = self
            .docker
            .create_image(Some(create_image_options), None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Pull warning");
                }
            }
        }

        let create_options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        info!(container = %container_name, privileged = spec.privileged, "Creating container");
        let container = self
            .docker
            .create_container(Some(create_options), Self::container_config(&spec))
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to create container: {}", e)))?;

        info!(container = %container_name, "Starting container");
        self.docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to start container: {}", e)))?;

        Ok(JobHandle {
            id: spec.id,
            executor_id: container.id,
            executor_name: self.name().to_string(),
        })
    }

    async fn logs(&self, handle: &JobHandle) -> Result<BoxStream<'static, LogLine>> {
        let container_name = Self::container_name(&handle.id);

        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let stream = self.docker.logs(&container_name, Some(options));

        let mapped_stream = stream.filter_map(|result| async move {
            match result {
                Ok(output) => {
                    let (stream, message) = match output {
                        LogOutput::StdErr { message } => (LogStream::Stderr, message),
                        LogOutput::StdOut { message }
                        | LogOutput::Console { message }
                        | LogOutput::StdIn { message } => (LogStream::Stdout, message),
                    };
                    Some(LogLine {
                        timestamp: Utc::now(),
                        stream,
                        content: String::from_utf8_lossy(&message).trim_end().to_string(),
                    })
                }
                Err(e) => {
                    warn!(error = %e, "Log stream error");
                    None
                }
            }
        });

        Ok(Box::pin(mapped_stream))
    }

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus> {
        let container_name = Self::container_name(&handle.id);

        let inspect = self
            .docker
            .inspect_container(&container_name, None)
            .await
            .map_err(|e| Error::NotFound(format!("Container not found: {}", e)))?;

        let state = inspect
            .state
            .ok_or_else(|| Error::Internal("No state".to_string()))?;

        let parse_time = |s: Option<String>| {
            s.and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc))
        };

        let status = if state.running.unwrap_or(false) {
            JobStatus::Running {
                started_at: parse_time(state.started_at).unwrap_or_else(Utc::now),
            }
        } else if state.paused.unwrap_or(false) {
            JobStatus::Pending
        } else {
            // Container has exited
            let exit_code = state.exit_code.map(|c| c as i32);
            let started_at = parse_time(state.started_at);
            let finished_at = parse_time(state.finished_at).unwrap_or_else(Utc::now);

            if exit_code == Some(0) {
                JobStatus::Succeeded {
                    started_at: started_at.unwrap_or(finished_at),
                    finished_at,
                }
            } else {
                JobStatus::Failed {
                    started_at,
                    finished_at,
                    exit_code,
                    message: state
                        .error
                        .filter(|e| !e.is_empty())
                        .unwrap_or_else(|| format!("exit code {}", exit_code.unwrap_or(-1))),
                }
            }
        };

        Ok(status)
    }

    async fn wait(&self, handle: &JobHandle) -> Result<JobResult> {
        let container_name = Self::container_name(&handle.id);

        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(&container_name, Some(options));

        // A non-zero exit surfaces as an error from the wait stream; the
        // inspected state below carries the exit code either way.
        if let Some(Err(e)) = stream.next().await {
            debug!(container = %container_name, error = %e, "Wait returned error");
        }

        let status = self.status(handle).await?;
        let exit_code = match &status {
            JobStatus::Succeeded { .. } => Some(0),
            JobStatus::Failed { exit_code, .. } => *exit_code,
            _ => None,
        };

        // workspace is on the host, the container is disposable
        if let Err(e) = self.remove(&container_name).await {
            warn!(container = %container_name, error = %e, "Failed to remove finished container");
        }

        Ok(JobResult { status, exit_code })
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        let container_name = Self::container_name(&handle.id);

        self.docker
            .stop_container(&container_name, None)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to stop container: {}", e)))?;

        self.remove(&container_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn make_test_spec() -> JobSpec {
        let mut spec = JobSpec::shell(
            "alpine:latest",
            "echo hello > out.txt",
            PathBuf::from("/tmp/deployit-ws"),
        );
        spec.env.insert("FOO".to_string(), "bar".to_string());
        spec
    }

    #[test]
    fn test_container_name_generation() {
        let id = JobId::new();
        let name = LocalDockerExecutor::container_name(&id);

        assert!(name.starts_with("deployit-job-"));
        assert_eq!(name, LocalDockerExecutor::container_name(&id));
        assert_ne!(name, LocalDockerExecutor::container_name(&JobId::new()));
    }

    #[test]
    fn test_workspace_is_bind_mounted() {
        let config = LocalDockerExecutor::container_config(&make_test_spec());
        let host = config.host_config.unwrap();

        assert_eq!(
            host.binds,
            Some(vec!["/tmp/deployit-ws:/workspace:rw".to_string()])
        );
        assert_eq!(host.privileged, Some(false));
        assert_eq!(config.working_dir.as_deref(), Some("/workspace"));
        assert_eq!(config.env, Some(vec!["FOO=bar".to_string()]));
        assert_eq!(
            config.cmd,
            Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "echo hello > out.txt".to_string()
            ])
        );
    }

    #[test]
    fn test_privileged_flag() {
        let mut spec = make_test_spec();
        spec.privileged = true;
        let config = LocalDockerExecutor::container_config(&spec);
        assert_eq!(config.host_config.unwrap().privileged, Some(true));
    }

    #[test]
    fn test_empty_command_uses_image_default() {
        let mut spec = make_test_spec();
        spec.command.clear();
        assert!(LocalDockerExecutor::container_config(&spec).cmd.is_none());
    }
}
