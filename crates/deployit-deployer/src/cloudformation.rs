//! CloudFormation engine driven through the `aws` CLI.
//!
//! `aws cloudformation deploy` already implements create-or-update through
//! change sets; this engine only prepares arguments, streams output and maps
//! stack states.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deployit_core::deployer::*;
use deployit_core::{Error, Result};
use std::io::Write;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

const NO_CHANGES: &str = "No changes to deploy";
const OUTPUT_TAIL: usize = 20;

/// Deployer applying templates as CloudFormation stacks.
pub struct CloudFormationDeployer {
    /// Path to the aws binary
    aws_bin: String,
    region: Option<String>,
    profile: Option<String>,
}

impl CloudFormationDeployer {
    pub fn new(region: Option<String>, profile: Option<String>) -> Self {
        let aws_bin = std::env::var("AWS_CLI_BIN").unwrap_or_else(|_| "aws".to_string());
        Self {
            aws_bin,
            region,
            profile,
        }
    }

    fn global_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(region) = &self.region {
            args.push("--region".to_string());
            args.push(region.clone());
        }
        if let Some(profile) = &self.profile {
            args.push("--profile".to_string());
            args.push(profile.clone());
        }
        args
    }

    fn deploy_args(&self, request: &DeployRequest, template_file: &str) -> Vec<String> {
        let mut args = vec![
            "cloudformation".to_string(),
            "deploy".to_string(),
            "--template-file".to_string(),
            template_file.to_string(),
            "--stack-name".to_string(),
            request.target.clone(),
            "--no-fail-on-empty-changeset".to_string(),
        ];
        if let Some(role) = &request.role {
            args.push("--role-arn".to_string());
            args.push(role.clone());
        }
        if !request.capabilities.is_empty() {
            args.push("--capabilities".to_string());
            args.extend(request.capabilities.iter().cloned());
        }
        if !request.parameters.is_empty() {
            args.push("--parameter-overrides".to_string());
            args.extend(
                request
                    .parameters
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v)),
            );
        }
        args.extend(self.global_args());
        args
    }

    /// Run an `aws` command to completion, returning stdout on success.
    async fn run_json(&self, args: &[&str]) -> Result<std::result::Result<String, String>> {
        let output = Command::new(&self.aws_bin)
            .args(args)
            .args(self.global_args())
            .args(["--output", "json"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::DeploymentFailed(format!("failed to run {}: {}", self.aws_bin, e)))?;

        if output.status.success() {
            Ok(Ok(String::from_utf8_lossy(&output.stdout).to_string()))
        } else {
            Ok(Err(String::from_utf8_lossy(&output.stderr).to_string()))
        }
    }

    async fn stack_exists(&self, stack: &str) -> Result<bool> {
        Ok(self.describe_stack(stack).await?.is_some())
    }

    async fn describe_stack(&self, stack: &str) -> Result<Option<serde_json::Value>> {
        match self
            .run_json(&["cloudformation", "describe-stacks", "--stack-name", stack])
            .await?
        {
            Ok(stdout) => {
                let json: serde_json::Value = serde_json::from_str(&stdout)
                    .map_err(|e| Error::Internal(format!("unexpected describe-stacks output: {}", e)))?;
                Ok(json
                    .get("Stacks")
                    .and_then(|s| s.as_array())
                    .and_then(|s| s.first())
                    .cloned())
            }
            Err(stderr) if stderr.contains("does not exist") => Ok(None),
            Err(stderr) => Err(Error::DeploymentFailed(format!(
                "describe-stacks failed for '{}': {}",
                stack,
                stderr.trim()
            ))),
        }
    }

    async fn stack_resources(&self, stack: &str) -> Result<Vec<String>> {
        match self
            .run_json(&["cloudformation", "list-stack-resources", "--stack-name", stack])
            .await?
        {
            Ok(stdout) => {
                let json: serde_json::Value = serde_json::from_str(&stdout).map_err(|e| {
                    Error::Internal(format!("unexpected list-stack-resources output: {}", e))
                })?;
                Ok(json
                    .get("StackResourceSummaries")
                    .and_then(|s| s.as_array())
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|r| r.get("LogicalResourceId")?.as_str())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default())
            }
            Err(stderr) => {
                warn!(stack = %stack, error = %stderr.trim(), "Could not list stack resources");
                Ok(Vec::new())
            }
        }
    }
}

/// Map a CloudFormation stack status onto the engine-neutral status.
fn map_stack_status(status: &str, reason: Option<&str>) -> TargetStatus {
    let reason = || reason.unwrap_or(status).to_string();
    match status {
        "CREATE_COMPLETE" | "IMPORT_COMPLETE" => TargetStatus::CreateComplete,
        "CREATE_FAILED" | "ROLLBACK_COMPLETE" | "ROLLBACK_FAILED" | "ROLLBACK_IN_PROGRESS" => {
            TargetStatus::CreateFailed { reason: reason() }
        }
        s if s.starts_with("UPDATE_ROLLBACK") || s.ends_with("_FAILED") => {
            TargetStatus::UpdateFailed { reason: reason() }
        }
        s if s.starts_with("CREATE_") => TargetStatus::CreateComplete,
        _ => TargetStatus::UpdateComplete,
    }
}

fn parse_time(value: Option<&serde_json::Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn tail(lines: &[String]) -> String {
    let start = lines.len().saturating_sub(OUTPUT_TAIL);
    lines[start..].join("\n")
}

#[async_trait]
impl Deployer for CloudFormationDeployer {
    fn name(&self) -> &'static str {
        "cloudformation"
    }

    async fn validate(&self, request: &DeployRequest) -> Result<Vec<ValidationWarning>> {
        let mut warnings = Vec::new();
        if request.template.as_json().is_none() && !request.template.path.ends_with(".yaml")
            && !request.template.path.ends_with(".yml")
        {
            warnings.push(ValidationWarning {
                field: "template".to_string(),
                message: format!(
                    "'{}' is neither JSON nor a YAML file; CloudFormation will likely reject it",
                    request.template.path
                ),
            });
        }
        if request.role.is_none() {
            warnings.push(ValidationWarning {
                field: "role".to_string(),
                message: "no role given; CloudFormation uses the caller's credentials".to_string(),
            });
        }
        Ok(warnings)
    }

    async fn apply(&self, request: DeployRequest) -> Result<ApplyOutcome> {
        let existed = self.stack_exists(&request.target).await?;

        let mut template_file = tempfile::Builder::new()
            .prefix("deployit-template-")
            .suffix(if request.template.as_json().is_some() {
                ".json"
            } else {
                ".yaml"
            })
            .tempfile()?;
        template_file.write_all(&request.template.body)?;
        template_file.flush()?;
        let template_path = template_file.path().display().to_string();

        let args = self.deploy_args(&request, &template_path);
        info!(stack = %request.target, existed, "Running aws cloudformation deploy");

        let mut child = Command::new(&self.aws_bin)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::DeploymentFailed(format!("failed to run {}: {}", self.aws_bin, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("aws stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("aws stderr not captured".to_string()))?;

        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();
        let mut output_lines = Vec::new();
        let mut stderr_open = true;

        // Stream output
        loop {
            tokio::select! {
                line = stdout_reader.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            debug!(stack = %request.target, "{}", line);
                            output_lines.push(line);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "Error reading stdout");
                            break;
                        }
                    }
                }
                line = stderr_reader.next_line(), if stderr_open => {
                    match line {
                        Ok(Some(line)) => {
                            debug!(stack = %request.target, "{}", line);
                            output_lines.push(line);
                        }
                        Ok(None) => stderr_open = false,
                        Err(e) => {
                            warn!(error = %e, "Error reading stderr");
                            stderr_open = false;
                        }
                    }
                }
            }
        }
        while stderr_open {
            match stderr_reader.next_line().await {
                Ok(Some(line)) => output_lines.push(line),
                _ => stderr_open = false,
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            let output = tail(&output_lines);
            error!(stack = %request.target, output = %output, "CloudFormation deploy failed");
            return Err(Error::DeploymentFailed(format!(
                "{}: aws cloudformation deploy exited with {}:\n{}",
                request.target,
                status.code().map(|c| c.to_string()).unwrap_or_else(|| "signal".into()),
                output
            )));
        }

        let action = if output_lines.iter().any(|l| l.contains(NO_CHANGES)) {
            ApplyAction::Unchanged
        } else if existed {
            ApplyAction::Updated
        } else {
            ApplyAction::Created
        };

        let target_status = match self.describe(&request.target).await? {
            Some(state) => state.status,
            None => TargetStatus::CreateComplete,
        };
        info!(stack = %request.target, action = %action, status = %target_status, "Stack deployed");

        Ok(ApplyOutcome {
            target: request.target,
            action,
            // change sets are the engine's business
            changes: Vec::new(),
            status: target_status,
        })
    }

    async fn describe(&self, target: &str) -> Result<Option<TargetState>> {
        let Some(stack) = self.describe_stack(target).await? else {
            return Ok(None);
        };
        let status = stack
            .get("StackStatus")
            .and_then(|s| s.as_str())
            .unwrap_or("UNKNOWN");
        let reason = stack.get("StackStatusReason").and_then(|s| s.as_str());
        let updated_at = parse_time(stack.get("LastUpdatedTime"))
            .or_else(|| parse_time(stack.get("CreationTime")))
            .unwrap_or_else(Utc::now);

        Ok(Some(TargetState {
            target: target.to_string(),
            status: map_stack_status(status, reason),
            template_digest: None,
            resources: self.stack_resources(target).await?,
            revision: 0,
            updated_at,
        }))
    }
}
