//! Artifacts and the storage abstraction used to hand them between stages.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::id::{ArtifactId, RunId};
use crate::{Error, Result};

/// Symbolic name of an artifact slot.
///
/// The producing action declares the name as an output and every consumer
/// refers to the same name, so a pipeline is wired by reference rather than
/// by repeating path strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactName(String);

impl ArtifactName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::config("artifact name must not be empty"));
        }
        if !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
            return Err(Error::config(format!(
                "artifact name '{}' must start with a letter or digit",
                name
            )));
        }
        if let Some(bad) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
        {
            return Err(Error::config(format!(
                "artifact name '{}' contains invalid character '{}'",
                name, bad
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ArtifactName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ArtifactName> for String {
    fn from(name: ArtifactName) -> Self {
        name.0
    }
}

/// An immutable bundle of files produced by one stage.
///
/// Fields are private; once built an artifact cannot change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    id: ArtifactId,
    name: ArtifactName,
    location: String,
    files: BTreeMap<String, Bytes>,
    checksum: String,
    created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(
        name: ArtifactName,
        location: impl Into<String>,
        files: BTreeMap<String, Bytes>,
    ) -> Self {
        let checksum = content_checksum(&files);
        Self {
            id: ArtifactId::new(),
            name,
            location: location.into(),
            files,
            checksum,
            created_at: Utc::now(),
        }
    }

    /// Rebuild a previously stored artifact from its persisted parts.
    pub fn from_parts(
        id: ArtifactId,
        name: ArtifactName,
        location: impl Into<String>,
        files: BTreeMap<String, Bytes>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let checksum = content_checksum(&files);
        Self {
            id,
            name,
            location: location.into(),
            files,
            checksum,
            created_at,
        }
    }

    /// Re-home an artifact at a new storage location, keeping its identity.
    pub fn relocated(&self, location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            ..self.clone()
        }
    }

    pub fn id(&self) -> ArtifactId {
        self.id
    }

    pub fn name(&self) -> &ArtifactName {
        &self.name
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn files(&self) -> &BTreeMap<String, Bytes> {
        &self.files
    }

    pub fn file(&self, path: &str) -> Option<&Bytes> {
        self.files.get(path)
    }

    /// SHA-256 over the sorted `(path, contents)` pairs. Two artifacts with
    /// the same files have the same checksum regardless of id or timestamp.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn size(&self) -> u64 {
        self.files.values().map(|b| b.len() as u64).sum()
    }

    /// No files, or only zero-byte files.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn to_ref(&self) -> ArtifactRef {
        ArtifactRef {
            id: self.id,
            name: self.name.clone(),
            location: self.location.clone(),
            checksum: self.checksum.clone(),
            size: self.size(),
            files: self.files.len(),
            created_at: self.created_at,
        }
    }
}

fn content_checksum(files: &BTreeMap<String, Bytes>) -> String {
    let mut hasher = Sha256::new();
    for (path, contents) in files {
        hasher.update((path.len() as u64).to_be_bytes());
        hasher.update(path.as_bytes());
        hasher.update((contents.len() as u64).to_be_bytes());
        hasher.update(contents);
    }
    hex::encode(hasher.finalize())
}

/// Reference to a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub id: ArtifactId,
    pub name: ArtifactName,
    /// Storage location (backend-specific).
    pub location: String,
    /// Content hash for integrity.
    pub checksum: String,
    /// Size in bytes.
    pub size: u64,
    /// Number of files.
    pub files: usize,
    pub created_at: DateTime<Utc>,
}

/// Statistics from removing a run's artifacts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneStats {
    pub artifacts_deleted: u64,
    pub bytes_freed: u64,
}

/// Trait for artifact storage backends.
///
/// `put` publishes atomically: a concurrent `get` sees either no artifact or
/// the complete one.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Name of this backend.
    fn name(&self) -> &'static str;

    /// Store an artifact for a run. Publishing the same name twice in one
    /// run is a conflict.
    async fn put(&self, run_id: RunId, artifact: Artifact) -> Result<ArtifactRef>;

    /// Retrieve an artifact by name.
    async fn get(&self, run_id: RunId, name: &ArtifactName) -> Result<Artifact>;

    /// Whether an artifact is published, without loading it.
    async fn contains(&self, run_id: RunId, name: &ArtifactName) -> Result<bool>;

    /// List artifacts for a pipeline run.
    async fn list(&self, run_id: RunId) -> Result<Vec<ArtifactRef>>;

    /// Delete every artifact belonging to a run.
    async fn remove_run(&self, run_id: RunId) -> Result<PruneStats>;
}
