//! CLI command implementations.

pub mod run;
pub mod status;
pub mod validate;
pub mod watch;

use anyhow::{Context, Result};
use deployit_config::{SystemConfig, load_pipeline, load_system_config};
use deployit_core::pipeline::Pipeline;
use deployit_core::source::SourceFetcher;
use deployit_scheduler::{DirectorySource, GitSource};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Logs go to stderr so command output on stdout stays clean.
pub fn init_tracing(json: bool, verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// System configuration from `path` (or the defaults) with `DEPLOYIT_*`
/// overrides applied.
pub fn load_config(path: Option<&Path>) -> Result<SystemConfig> {
    let mut config = match path {
        Some(path) => load_system_config(path)
            .with_context(|| format!("Failed to load system config: {}", path.display()))?,
        None => SystemConfig::default(),
    };
    config
        .apply_env()
        .context("Failed to apply DEPLOYIT_* environment overrides")?;
    Ok(config)
}

pub fn load_pipeline_file(path: &Path) -> Result<Arc<Pipeline>> {
    let pipeline = load_pipeline(path)
        .with_context(|| format!("Failed to load pipeline: {}", path.display()))?;
    Ok(Arc::new(pipeline))
}

/// A local directory when given, otherwise the pipeline's repository.
pub fn fetcher(source_dir: Option<PathBuf>) -> Result<Arc<dyn SourceFetcher>> {
    Ok(match source_dir {
        Some(dir) => {
            let dir = dir
                .canonicalize()
                .with_context(|| format!("Source directory not found: {}", dir.display()))?;
            Arc::new(DirectorySource::new(dir)) as Arc<dyn SourceFetcher>
        }
        None => Arc::new(GitSource::new()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config_defaults_without_file() {
        let config = load_config(None).unwrap();
        assert_eq!(config.api.listen, SystemConfig::default().api.listen);
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config(Some(Path::new("/nonexistent/system.kdl"))).unwrap_err();
        assert!(err.to_string().contains("system.kdl"));
    }

    #[test]
    fn test_fetcher_selection() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(fetcher(Some(dir.path().to_path_buf())).unwrap().name(), "directory");
        assert_eq!(fetcher(None).unwrap().name(), "git");
        assert!(fetcher(Some(dir.path().join("missing"))).is_err());
    }
}
