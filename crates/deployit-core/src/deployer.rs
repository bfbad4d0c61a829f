//! Deployer trait and deployment types.
//!
//! A deployer is the provisioning engine: it takes a resource template and a
//! target (stack) name and creates or updates the target. Diffing and
//! rollback are the engine's business; the pipeline only sequences the call.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::Result;

/// A template file taken from a build artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    /// Path of the file inside its artifact.
    pub path: String,
    pub body: Bytes,
}

impl Template {
    pub fn new(path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            body: body.into(),
        }
    }

    /// SHA-256 of the body.
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(&self.body))
    }

    /// The body parsed as JSON, if it is JSON.
    pub fn as_json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

/// Specification for one apply call.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    /// Target environment / stack name.
    pub target: String,
    pub template: Template,
    /// Role the engine assumes while applying.
    pub role: Option<String>,
    /// Acknowledged capabilities (e.g. `CAPABILITY_IAM`).
    pub capabilities: Vec<String>,
    /// Template parameter overrides.
    pub parameters: BTreeMap<String, String>,
}

impl DeployRequest {
    pub fn new(target: impl Into<String>, template: Template) -> Self {
        Self {
            target: target.into(),
            template,
            role: None,
            capabilities: Vec::new(),
            parameters: BTreeMap::new(),
        }
    }
}

/// What an apply did to the target as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyAction {
    Created,
    Updated,
    Unchanged,
}

impl fmt::Display for ApplyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyAction::Created => write!(f, "created"),
            ApplyAction::Updated => write!(f, "updated"),
            ApplyAction::Unchanged => write!(f, "unchanged"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Add,
    Modify,
    Remove,
}

/// A change to one logical resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceChange {
    pub logical_id: String,
    pub resource_type: Option<String>,
    pub kind: ChangeKind,
}

/// Status of a target as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TargetStatus {
    CreateComplete,
    UpdateComplete,
    /// The first apply failed; nothing is provisioned.
    CreateFailed { reason: String },
    /// An update failed; the previous known-good resources stay in place.
    UpdateFailed { reason: String },
}

impl TargetStatus {
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            TargetStatus::CreateFailed { .. } | TargetStatus::UpdateFailed { .. }
        )
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetStatus::CreateComplete => write!(f, "CREATE_COMPLETE"),
            TargetStatus::UpdateComplete => write!(f, "UPDATE_COMPLETE"),
            TargetStatus::CreateFailed { reason } => write!(f, "CREATE_FAILED ({})", reason),
            TargetStatus::UpdateFailed { reason } => write!(f, "UPDATE_FAILED ({})", reason),
        }
    }
}

/// Current state of a target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetState {
    pub target: String,
    pub status: TargetStatus,
    /// Digest of the last successfully applied template.
    pub template_digest: Option<String>,
    /// Logical ids of the provisioned resources.
    pub resources: Vec<String>,
    /// Number of successful applies that changed something.
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

/// Result of an apply call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub target: String,
    pub action: ApplyAction,
    pub changes: Vec<ResourceChange>,
    pub status: TargetStatus,
}

impl ApplyOutcome {
    pub fn is_noop(&self) -> bool {
        self.action == ApplyAction::Unchanged && self.changes.is_empty()
    }
}

/// Warning from deployment validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
}

/// Trait for deployers (provisioning engines).
#[async_trait]
pub trait Deployer: Send + Sync {
    /// Name of this deployer.
    fn name(&self) -> &'static str;

    /// Validate a request before applying it.
    async fn validate(&self, request: &DeployRequest) -> Result<Vec<ValidationWarning>>;

    /// Create the target if it does not exist, otherwise update it to match
    /// the template. Applying the same template twice must report
    /// `Unchanged` with no changes the second time. A rejected apply
    /// returns `Error::DeploymentFailed` and leaves the target either at its
    /// previous state or marked failed.
    async fn apply(&self, request: DeployRequest) -> Result<ApplyOutcome>;

    /// Current state of a target, `None` if it does not exist.
    async fn describe(&self, target: &str) -> Result<Option<TargetState>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_digest_is_stable() {
        let a = Template::new("t.json", "{}");
        let b = Template::new("other.json", "{}");
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), Template::new("t.json", "{ }").digest());
    }

    #[test]
    fn test_template_json_detection() {
        assert!(Template::new("t.json", r#"{"Resources":{}}"#).as_json().is_some());
        assert!(Template::new("out.txt", "hello\n").as_json().is_none());
    }

    #[test]
    fn test_noop_outcome() {
        let outcome = ApplyOutcome {
            target: "demo-stack".into(),
            action: ApplyAction::Unchanged,
            changes: vec![],
            status: TargetStatus::UpdateComplete,
        };
        assert!(outcome.is_noop());
    }

    #[test]
    fn test_target_status_display() {
        assert_eq!(TargetStatus::CreateComplete.to_string(), "CREATE_COMPLETE");
        let failed = TargetStatus::UpdateFailed {
            reason: "bad template".into(),
        };
        assert!(failed.is_failed());
        assert_eq!(failed.to_string(), "UPDATE_FAILED (bad template)");
    }
}
