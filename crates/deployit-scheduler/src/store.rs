//! Artifact stores.
//!
//! Both stores publish atomically. The memory store swaps a complete
//! artifact in under a lock; the filesystem store writes into a hidden
//! staging directory and renames it into place.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deployit_core::artifact::{Artifact, ArtifactName, ArtifactRef, ArtifactStore, PruneStats};
use deployit_core::{ArtifactId, Error, Result, RunId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::workspace::{blocking, read_tree, write_tree};

/// In-process store, lost on restart.
#[derive(Default)]
pub struct MemoryArtifactStore {
    runs: RwLock<HashMap<RunId, BTreeMap<ArtifactName, Artifact>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, run_id: RunId, artifact: Artifact) -> Result<ArtifactRef> {
        let mut runs = self.runs.write().await;
        let artifacts = runs.entry(run_id).or_default();
        if artifacts.contains_key(artifact.name()) {
            return Err(Error::Conflict(format!(
                "artifact '{}' already published for run {}",
                artifact.name(),
                run_id
            )));
        }
        let stored = artifact.relocated(format!("memory://{}/{}", run_id, artifact.name()));
        let reference = stored.to_ref();
        artifacts.insert(stored.name().clone(), stored);
        debug!(run_id = %run_id, artifact = %reference.name, size = reference.size, "Stored artifact");
        Ok(reference)
    }

    async fn get(&self, run_id: RunId, name: &ArtifactName) -> Result<Artifact> {
        self.runs
            .read()
            .await
            .get(&run_id)
            .and_then(|a| a.get(name))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("artifact '{}' in run {}", name, run_id)))
    }

    async fn contains(&self, run_id: RunId, name: &ArtifactName) -> Result<bool> {
        Ok(self
            .runs
            .read()
            .await
            .get(&run_id)
            .is_some_and(|a| a.contains_key(name)))
    }

    async fn list(&self, run_id: RunId) -> Result<Vec<ArtifactRef>> {
        Ok(self
            .runs
            .read()
            .await
            .get(&run_id)
            .map(|a| a.values().map(Artifact::to_ref).collect())
            .unwrap_or_default())
    }

    async fn remove_run(&self, run_id: RunId) -> Result<PruneStats> {
        let removed = self.runs.write().await.remove(&run_id);
        Ok(removed
            .map(|artifacts| PruneStats {
                artifacts_deleted: artifacts.len() as u64,
                bytes_freed: artifacts.values().map(Artifact::size).sum(),
            })
            .unwrap_or_default())
    }
}

const MANIFEST: &str = "manifest.json";
const FILES_DIR: &str = "files";

/// Persisted next to the files of each artifact.
#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    id: ArtifactId,
    name: ArtifactName,
    checksum: String,
    created_at: DateTime<Utc>,
}

/// Store laid out as `<root>/<run>/<artifact>/{manifest.json,files/...}`.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: RunId) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    fn artifact_dir(&self, run_id: RunId, name: &ArtifactName) -> PathBuf {
        self.run_dir(run_id).join(name.as_str())
    }

    fn load(dir: &Path) -> Result<Artifact> {
        let manifest: Manifest = serde_json::from_slice(&std::fs::read(dir.join(MANIFEST))?)
            .map_err(|e| Error::Internal(format!("corrupt manifest in {}: {}", dir.display(), e)))?;
        let files = read_tree(&dir.join(FILES_DIR))?;
        let artifact = Artifact::from_parts(
            manifest.id,
            manifest.name,
            dir.display().to_string(),
            files,
            manifest.created_at,
        );
        if artifact.checksum() != manifest.checksum {
            return Err(Error::Internal(format!(
                "artifact in {} does not match its checksum",
                dir.display()
            )));
        }
        Ok(artifact)
    }

    fn stored_names(run_dir: &Path) -> Result<Vec<PathBuf>> {
        if !run_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(run_dir)? {
            let entry = entry?;
            // staging directories start with a dot
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            if entry.file_type()?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    fn name(&self) -> &'static str {
        "fs"
    }

    async fn put(&self, run_id: RunId, artifact: Artifact) -> Result<ArtifactRef> {
        let final_dir = self.artifact_dir(run_id, artifact.name());
        let staging = self
            .run_dir(run_id)
            .join(format!(".{}-{}", artifact.name(), artifact.id().short()));

        let stored = artifact.relocated(final_dir.display().to_string());
        let reference = stored.to_ref();
        let manifest = Manifest {
            id: stored.id(),
            name: stored.name().clone(),
            checksum: stored.checksum().to_string(),
            created_at: stored.created_at(),
        };
        let manifest = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| Error::Internal(format!("failed to encode manifest: {}", e)))?;
        let files = stored.files().clone();
        let name = stored.name().clone();

        blocking(move || {
            if final_dir.exists() {
                return Err(Error::Conflict(format!(
                    "artifact '{}' already published for run {}",
                    name, run_id
                )));
            }
            write_tree(&staging.join(FILES_DIR), &files)?;
            std::fs::write(staging.join(MANIFEST), manifest)?;
            if let Err(e) = std::fs::rename(&staging, &final_dir) {
                let _ = std::fs::remove_dir_all(&staging);
                return Err(if final_dir.exists() {
                    Error::Conflict(format!(
                        "artifact '{}' already published for run {}",
                        name, run_id
                    ))
                } else {
                    Error::Io(e)
                });
            }
            Ok(())
        })
        .await?;

        debug!(run_id = %run_id, artifact = %reference.name, location = %reference.location, "Stored artifact");
        Ok(reference)
    }

    async fn get(&self, run_id: RunId, name: &ArtifactName) -> Result<Artifact> {
        let dir = self.artifact_dir(run_id, name);
        let missing = format!("artifact '{}' in run {}", name, run_id);
        blocking(move || {
            if !dir.join(MANIFEST).is_file() {
                return Err(Error::NotFound(missing));
            }
            Self::load(&dir)
        })
        .await
    }

    async fn contains(&self, run_id: RunId, name: &ArtifactName) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.artifact_dir(run_id, name).join(MANIFEST)).await?)
    }

    async fn list(&self, run_id: RunId) -> Result<Vec<ArtifactRef>> {
        let run_dir = self.run_dir(run_id);
        blocking(move || {
            Self::stored_names(&run_dir)?
                .iter()
                .map(|dir| Self::load(dir).map(|a| a.to_ref()))
                .collect()
        })
        .await
    }

    async fn remove_run(&self, run_id: RunId) -> Result<PruneStats> {
        let stats = self
            .list(run_id)
            .await?
            .iter()
            .fold(PruneStats::default(), |mut stats, r| {
                stats.artifacts_deleted += 1;
                stats.bytes_freed += r.size;
                stats
            });
        let run_dir = self.run_dir(run_id);
        if tokio::fs::try_exists(&run_dir).await? {
            tokio::fs::remove_dir_all(&run_dir).await?;
            info!(run_id = %run_id, deleted = stats.artifacts_deleted, "Removed run artifacts");
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn artifact(name: &str, entries: &[(&str, &str)]) -> Artifact {
        let files = entries
            .iter()
            .map(|(p, c)| (p.to_string(), Bytes::from(c.to_string())))
            .collect();
        Artifact::new(ArtifactName::new(name).unwrap(), "", files)
    }

    async fn exercise(store: &dyn ArtifactStore) {
        let run = RunId::new();
        let name = ArtifactName::new("build-1").unwrap();

        assert!(!store.contains(run, &name).await.unwrap());
        assert!(matches!(
            store.get(run, &name).await,
            Err(Error::NotFound(_))
        ));

        let original = artifact("build-1", &[("out.txt", "hello\n"), ("dir/x.json", "{}")]);
        let reference = store.put(run, original.clone()).await.unwrap();
        assert_eq!(reference.checksum, original.checksum());
        assert_eq!(reference.files, 2);
        assert_eq!(reference.size, 8);

        let loaded = store.get(run, &name).await.unwrap();
        assert_eq!(loaded.id(), original.id());
        assert_eq!(loaded.files(), original.files());
        assert_eq!(loaded.location(), reference.location);
        assert!(store.contains(run, &name).await.unwrap());

        // published once per run
        assert!(matches!(
            store.put(run, artifact("build-1", &[("other", "x")])).await,
            Err(Error::Conflict(_))
        ));
        // other runs are independent
        assert!(store.put(RunId::new(), original.clone()).await.is_ok());

        store.put(run, artifact("src-1", &[("a", "b")])).await.unwrap();
        let names: Vec<_> = store
            .list(run)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name.to_string())
            .collect();
        assert_eq!(names, vec!["build-1", "src-1"]);

        let stats = store.remove_run(run).await.unwrap();
        assert_eq!(stats.artifacts_deleted, 2);
        assert_eq!(stats.bytes_freed, 9);
        assert!(store.list(run).await.unwrap().is_empty());
        assert_eq!(store.remove_run(run).await.unwrap(), PruneStats::default());
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(&MemoryArtifactStore::new()).await;
    }

    #[tokio::test]
    async fn test_fs_store() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FsArtifactStore::new(dir.path())).await;
    }

    #[tokio::test]
    async fn test_fs_store_ignores_staging_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let run = RunId::new();
        std::fs::create_dir_all(dir.path().join(run.to_string()).join(".build-1-partial/files"))
            .unwrap();

        assert!(store.list(run).await.unwrap().is_empty());
        let name = ArtifactName::new("build-1").unwrap();
        assert!(!store.contains(run, &name).await.unwrap());
    }

    #[tokio::test]
    async fn test_fs_store_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let run = RunId::new();
        let reference = store
            .put(run, artifact("build-1", &[("out.txt", "hello\n")]))
            .await
            .unwrap();

        std::fs::write(
            Path::new(&reference.location).join("files/out.txt"),
            "tampered",
        )
        .unwrap();
        let name = ArtifactName::new("build-1").unwrap();
        assert!(matches!(
            store.get(run, &name).await,
            Err(Error::Internal(_))
        ));
    }
}
