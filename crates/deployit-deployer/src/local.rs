//! File-backed local provisioning engine.
//!
//! Each target is one JSON state document under the state directory. JSON
//! templates with a top-level `Resources` object are diffed per logical
//! resource; any other template is a single opaque `Template` resource.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deployit_core::deployer::*;
use deployit_core::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{info, warn};

const OPAQUE_RESOURCE: &str = "Template";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ResourceRecord {
    resource_type: Option<String>,
    digest: String,
}

/// Persisted state of one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TargetRecord {
    target: String,
    status: TargetStatus,
    template_digest: Option<String>,
    resources: BTreeMap<String, ResourceRecord>,
    revision: u64,
    updated_at: DateTime<Utc>,
}

impl TargetRecord {
    fn to_state(&self) -> TargetState {
        TargetState {
            target: self.target.clone(),
            status: self.status.clone(),
            template_digest: self.template_digest.clone(),
            resources: self.resources.keys().cloned().collect(),
            revision: self.revision,
            updated_at: self.updated_at,
        }
    }
}

/// Local engine keeping target state in JSON files.
pub struct LocalDeployer {
    state_dir: PathBuf,
    // applies are serialized; targets are cheap to rewrite
    lock: Mutex<()>,
}

impl LocalDeployer {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn state_path(&self, target: &str) -> PathBuf {
        self.state_dir.join(format!("{}.json", target))
    }

    async fn load(&self, target: &str) -> Result<Option<TargetRecord>> {
        match tokio::fs::read(self.state_path(target)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| Error::Internal(format!("corrupt state for '{}': {}", target, e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write via a temp file and rename so readers never see a partial state.
    async fn store(&self, record: &TargetRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.state_dir).await?;
        let body = serde_json::to_vec_pretty(record)
            .map_err(|e| Error::Internal(format!("failed to encode state: {}", e)))?;
        let path = self.state_path(&record.target);
        let tmp = self.state_dir.join(format!(".{}.json.tmp", record.target));
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// Stack-name rule: starts with a letter, then letters, digits and hyphens.
fn check_target_name(target: &str) -> Result<()> {
    let mut chars = target.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-')
        && target.len() <= 128;
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "invalid target name '{}': use letters, digits and hyphens, starting with a letter",
            target
        )))
    }
}

fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Resources declared by a template, or the reason it cannot be applied.
fn template_resources(
    template: &Template,
) -> std::result::Result<BTreeMap<String, ResourceRecord>, String> {
    if template.body.iter().all(|b| b.is_ascii_whitespace()) {
        return Err("template is empty".to_string());
    }

    let Some(json) = template.as_json() else {
        let mut resources = BTreeMap::new();
        resources.insert(
            OPAQUE_RESOURCE.to_string(),
            ResourceRecord {
                resource_type: None,
                digest: template.digest(),
            },
        );
        return Ok(resources);
    };

    let declared = json
        .as_object()
        .ok_or("template must be a JSON object")?
        .get("Resources")
        .ok_or("template has no Resources section")?
        .as_object()
        .ok_or("Resources must be an object")?;
    if declared.is_empty() {
        return Err("template declares no resources".to_string());
    }

    declared
        .iter()
        .map(|(logical_id, definition)| {
            let resource_type = definition
                .get("Type")
                .and_then(|t| t.as_str())
                .ok_or_else(|| format!("resource '{}' has no Type", logical_id))?;
            // serde_json maps are ordered, so this encoding is canonical
            let encoded = serde_json::to_vec(definition).map_err(|e| e.to_string())?;
            Ok((
                logical_id.clone(),
                ResourceRecord {
                    resource_type: Some(resource_type.to_string()),
                    digest: digest(&encoded),
                },
            ))
        })
        .collect()
}

fn diff(
    old: &BTreeMap<String, ResourceRecord>,
    new: &BTreeMap<String, ResourceRecord>,
) -> Vec<ResourceChange> {
    let mut changes = Vec::new();
    for (id, record) in new {
        let kind = match old.get(id) {
            None => ChangeKind::Add,
            Some(prev) if prev != record => ChangeKind::Modify,
            Some(_) => continue,
        };
        changes.push(ResourceChange {
            logical_id: id.clone(),
            resource_type: record.resource_type.clone(),
            kind,
        });
    }
    for (id, record) in old {
        if !new.contains_key(id) {
            changes.push(ResourceChange {
                logical_id: id.clone(),
                resource_type: record.resource_type.clone(),
                kind: ChangeKind::Remove,
            });
        }
    }
    changes
}

#[async_trait]
impl Deployer for LocalDeployer {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn validate(&self, request: &DeployRequest) -> Result<Vec<ValidationWarning>> {
        check_target_name(&request.target)?;
        let mut warnings = Vec::new();
        if request.role.is_some() {
            warnings.push(ValidationWarning {
                field: "role".to_string(),
                message: "the local engine does not assume roles".to_string(),
            });
        }
        if !request.parameters.is_empty() {
            warnings.push(ValidationWarning {
                field: "parameters".to_string(),
                message: "the local engine ignores template parameters".to_string(),
            });
        }
        Ok(warnings)
    }

    async fn apply(&self, request: DeployRequest) -> Result<ApplyOutcome> {
        check_target_name(&request.target)?;
        let _guard = self.lock.lock().await;

        let existing = self.load(&request.target).await?;

        let resources = match template_resources(&request.template) {
            Ok(resources) => resources,
            Err(reason) => {
                let record = match existing {
                    Some(mut prev) if prev.template_digest.is_some() => {
                        prev.status = TargetStatus::UpdateFailed {
                            reason: reason.clone(),
                        };
                        prev.updated_at = Utc::now();
                        prev
                    }
                    _ => TargetRecord {
                        target: request.target.clone(),
                        status: TargetStatus::CreateFailed {
                            reason: reason.clone(),
                        },
                        template_digest: None,
                        resources: BTreeMap::new(),
                        revision: 0,
                        updated_at: Utc::now(),
                    },
                };
                self.store(&record).await?;
                warn!(stack = %request.target, status = %record.status, "Template rejected");
                return Err(Error::DeploymentFailed(format!(
                    "{}: {}",
                    request.target, reason
                )));
            }
        };

        // only a successful apply leaves a template digest behind
        let deployed = existing.as_ref().filter(|r| r.template_digest.is_some());
        let template_digest = request.template.digest();
        let (action, changes, revision) = match deployed {
            None => (
                ApplyAction::Created,
                diff(&BTreeMap::new(), &resources),
                1,
            ),
            Some(prev) if prev.template_digest.as_deref() == Some(template_digest.as_str()) => {
                (ApplyAction::Unchanged, Vec::new(), prev.revision)
            }
            Some(prev) => (
                ApplyAction::Updated,
                diff(&prev.resources, &resources),
                prev.revision + 1,
            ),
        };
        // a no-op apply on a healthy target leaves its record untouched
        if let Some(prev) = deployed.filter(|_| action == ApplyAction::Unchanged) {
            if !prev.status.is_failed() {
                info!(stack = %request.target, revision, "Template unchanged");
                return Ok(ApplyOutcome {
                    target: request.target,
                    action,
                    changes,
                    status: prev.status.clone(),
                });
            }
        }

        let status = match action {
            ApplyAction::Created => TargetStatus::CreateComplete,
            ApplyAction::Updated | ApplyAction::Unchanged => TargetStatus::UpdateComplete,
        };

        let record = TargetRecord {
            target: request.target.clone(),
            status: status.clone(),
            template_digest: Some(template_digest),
            resources,
            revision,
            updated_at: Utc::now(),
        };
        self.store(&record).await?;

        info!(
            stack = %request.target,
            action = %action,
            changes = changes.len(),
            revision,
            "Applied template"
        );

        Ok(ApplyOutcome {
            target: request.target,
            action,
            changes,
            status,
        })
    }

    async fn describe(&self, target: &str) -> Result<Option<TargetState>> {
        check_target_name(target)?;
        Ok(self.load(target).await?.map(|r| r.to_state()))
    }
}
