//! Source references, revisions and the fetcher trait used by the source
//! stage and the trigger.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::Result;

/// Git hosting provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitProvider {
    #[default]
    Github,
    Gitlab,
    Bitbucket,
}

impl fmt::Display for GitProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GitProvider::Github => write!(f, "github"),
            GitProvider::Gitlab => write!(f, "gitlab"),
            GitProvider::Bitbucket => write!(f, "bitbucket"),
        }
    }
}

impl std::str::FromStr for GitProvider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "github" => Ok(GitProvider::Github),
            "gitlab" => Ok(GitProvider::Gitlab),
            "bitbucket" => Ok(GitProvider::Bitbucket),
            _ => Err(format!("Unknown git provider: {}", s)),
        }
    }
}

impl GitProvider {
    fn host(&self) -> &'static str {
        match self {
            GitProvider::Github => "github.com",
            GitProvider::Gitlab => "gitlab.com",
            GitProvider::Bitbucket => "bitbucket.org",
        }
    }
}

/// A watched branch of a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub provider: GitProvider,
    pub owner: String,
    pub repository: String,
    pub branch: String,
    /// Reference to the credential used to reach the repository (a
    /// connection ARN or the name of an environment variable). Never the
    /// secret itself.
    pub connection: Option<String>,
}

impl SourceRef {
    pub fn github(
        owner: impl Into<String>,
        repository: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            provider: GitProvider::Github,
            owner: owner.into(),
            repository: repository.into(),
            branch: branch.into(),
            connection: None,
        }
    }

    pub fn with_connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = Some(connection.into());
        self
    }

    /// `owner/repository`.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repository)
    }

    pub fn clone_url(&self) -> String {
        format!(
            "https://{}/{}/{}.git",
            self.provider.host(),
            self.owner,
            self.repository
        )
    }

    /// Whether a push to `full_name` on `branch` concerns this reference.
    pub fn matches(&self, full_name: &str, branch: &str) -> bool {
        self.full_name().eq_ignore_ascii_case(full_name) && self.branch == branch
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.provider, self.full_name(), self.branch)
    }
}

/// An opaque revision identifier (commit SHA or content digest).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(pub String);

impl Revision {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(7).map(|(i, _)| i).unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Snapshot of a source reference at one revision.
#[derive(Debug, Clone)]
pub struct SourceSnapshot {
    pub revision: Revision,
    pub files: BTreeMap<String, Bytes>,
}

/// Reads a source reference.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Name of this fetcher.
    fn name(&self) -> &'static str;

    /// Current head revision of the reference. Cheap; used to detect
    /// changes. Connectivity problems are `Error::SourceUnavailable`.
    async fn head(&self, source: &SourceRef) -> Result<Revision>;

    /// Contents of the reference at `revision`.
    async fn snapshot(&self, source: &SourceRef, revision: &Revision) -> Result<SourceSnapshot>;
}

/// Parsed push event data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEvent {
    pub r#ref: String,
    pub before: String,
    pub after: String,
    pub repository_full_name: String,
    pub branch: Option<String>,
    pub pusher: String,
}

impl PushEvent {
    /// Parse a GitHub push webhook payload.
    pub fn from_github_payload(payload: &serde_json::Value) -> Option<Self> {
        let r#ref = payload.get("ref")?.as_str()?.to_string();
        let before = payload.get("before")?.as_str()?.to_string();
        let after = payload.get("after")?.as_str()?.to_string();
        let repository_full_name = payload
            .get("repository")?
            .get("full_name")?
            .as_str()?
            .to_string();

        let branch = r#ref.strip_prefix("refs/heads/").map(str::to_string);

        let pusher = payload
            .get("pusher")
            .and_then(|p| p.get("name"))
            .and_then(|n| n.as_str())
            .unwrap_or("unknown")
            .to_string();

        Some(PushEvent {
            r#ref,
            before,
            after,
            repository_full_name,
            branch,
            pusher,
        })
    }

    /// Branch deletions report an all-zero `after` SHA.
    pub fn is_deletion(&self) -> bool {
        !self.after.is_empty() && self.after.chars().all(|c| c == '0')
    }
}
