//! File tree helpers shared by the stores, the sources and the build action.
//!
//! Artifact paths are always relative and `/`-separated, whatever the host.

use bytes::Bytes;
use deployit_core::buildspec::ArtifactSelection;
use deployit_core::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Directories never read into an artifact.
const SKIPPED_DIRS: &[&str] = &[".git"];

/// Join a relative artifact path onto `root`, refusing anything that would
/// escape it.
pub fn safe_join(root: &Path, relative: &str) -> Result<PathBuf> {
    let path = Path::new(relative);
    let escapes = path.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if relative.is_empty() || escapes {
        return Err(Error::InvalidInput(format!(
            "artifact path '{}' must be relative and stay inside its root",
            relative
        )));
    }
    Ok(root.join(path))
}

/// Read every regular file below `root`, keyed by its relative path.
pub fn read_tree(root: &Path) -> Result<BTreeMap<String, Bytes>> {
    let mut files = BTreeMap::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0 || !SKIPPED_DIRS.iter().any(|d| e.file_name() == *d)
        });

    for entry in walker {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = relative_path(root, entry.path())?;
        let contents = std::fs::read(entry.path())?;
        files.insert(relative, Bytes::from(contents));
    }
    Ok(files)
}

/// Write files below `root`, creating directories as needed.
pub fn write_tree(root: &Path, files: &BTreeMap<String, Bytes>) -> Result<()> {
    std::fs::create_dir_all(root)?;
    for (relative, contents) in files {
        let dest = safe_join(root, relative)?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&dest, contents)?;
    }
    Ok(())
}

/// Apply a selection rule to a finished build workspace.
///
/// Keys are relative to the rule's base directory, or bare file names when
/// paths are discarded. A missing base directory selects nothing.
pub fn select_files(
    workspace: &Path,
    selection: &ArtifactSelection,
) -> Result<BTreeMap<String, Bytes>> {
    let base = match selection.base() {
        Some(dir) => safe_join(workspace, dir)?,
        None => workspace.to_path_buf(),
    };
    if !base.is_dir() {
        return Ok(BTreeMap::new());
    }

    let matcher = selection.compile()?;
    let mut selected = BTreeMap::new();
    for (path, contents) in read_tree(&base)? {
        if !matcher.is_match(&path) {
            continue;
        }
        let key = if selection.discard_paths {
            path.rsplit('/').next().unwrap_or(&path).to_string()
        } else {
            path.clone()
        };
        if selected.insert(key.clone(), contents).is_some() {
            return Err(Error::Conflict(format!(
                "more than one selected file is stored as '{}' once paths are discarded",
                key
            )));
        }
    }
    Ok(selected)
}

/// Content digest of a file tree, used as the revision of local sources.
pub fn tree_digest(files: &BTreeMap<String, Bytes>) -> String {
    let mut hasher = Sha256::new();
    for (path, contents) in files {
        hasher.update(path.as_bytes());
        hasher.update([0]);
        hasher.update((contents.len() as u64).to_be_bytes());
        hasher.update(contents);
    }
    hex::encode(hasher.finalize())
}

/// Run a blocking file walk off the async runtime.
pub async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("file task failed: {}", e)))?
}

fn relative_path(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| Error::Internal(format!("{} is outside {}", path.display(), root.display())))?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(entries: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (path, contents) in entries {
            let full = dir.path().join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, contents).unwrap();
        }
        dir
    }

    #[test]
    fn test_read_tree_skips_git() {
        let dir = fixture(&[
            ("a.txt", "a"),
            ("nested/b.txt", "b"),
            (".git/HEAD", "ref: refs/heads/main"),
        ]);
        let files = read_tree(dir.path()).unwrap();
        let paths: Vec<_> = files.keys().map(String::as_str).collect();
        assert_eq!(paths, vec!["a.txt", "nested/b.txt"]);
    }

    #[test]
    fn test_write_tree_round_trips() {
        let src = fixture(&[("x/y/z.txt", "deep")]);
        let files = read_tree(src.path()).unwrap();
        let dest = tempfile::tempdir().unwrap();
        write_tree(dest.path(), &files).unwrap();
        assert_eq!(
            std::fs::read_to_string(dest.path().join("x/y/z.txt")).unwrap(),
            "deep"
        );
    }

    #[test]
    fn test_safe_join_rejects_escapes() {
        let root = Path::new("/tmp/root");
        assert!(safe_join(root, "ok/file.txt").is_ok());
        assert!(safe_join(root, "../etc/passwd").is_err());
        assert!(safe_join(root, "/etc/passwd").is_err());
        assert!(safe_join(root, "").is_err());
    }

    #[test]
    fn test_select_with_base_directory() {
        let ws = fixture(&[
            ("cdk.out/CdkLab3Stack.template.json", "{}"),
            ("cdk.out/manifest.json", "{}"),
            ("src/app.ts", "x"),
        ]);
        let rule = ArtifactSelection::files(["*.template.json"]).with_base_directory("cdk.out");
        let files = select_files(ws.path(), &rule).unwrap();
        let paths: Vec<_> = files.keys().map(String::as_str).collect();
        assert_eq!(paths, vec!["CdkLab3Stack.template.json"]);
    }

    #[test]
    fn test_select_discarding_paths() {
        let ws = fixture(&[("out/a/one.json", "1"), ("out/b/two.json", "2")]);
        let rule = ArtifactSelection::files(["**/*.json"]).with_discard_paths(true);
        let files = select_files(ws.path(), &rule).unwrap();
        let paths: Vec<_> = files.keys().map(String::as_str).collect();
        assert_eq!(paths, vec!["one.json", "two.json"]);

        let clash = fixture(&[("a/same.json", "1"), ("b/same.json", "2")]);
        assert!(matches!(
            select_files(clash.path(), &rule),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn test_missing_base_selects_nothing() {
        let ws = fixture(&[("out.txt", "hello")]);
        let rule = ArtifactSelection::files(["out.txt"]).with_base_directory("dist");
        assert!(select_files(ws.path(), &rule).unwrap().is_empty());
    }

    #[test]
    fn test_tree_digest_tracks_content() {
        let a = read_tree(fixture(&[("f", "1")]).path()).unwrap();
        let b = read_tree(fixture(&[("f", "1")]).path()).unwrap();
        let c = read_tree(fixture(&[("f", "2")]).path()).unwrap();
        assert_eq!(tree_digest(&a), tree_digest(&b));
        assert_ne!(tree_digest(&a), tree_digest(&c));
    }
}
