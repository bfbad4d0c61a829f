//! Wiring of stores, executors and engines from the system configuration.

use deployit_config::SystemConfig;
use deployit_config::system::{DeployerConfig, ExecutorConfig, StoreConfig};
use deployit_core::Result;
use deployit_core::artifact::ArtifactStore;
use deployit_core::deployer::Deployer;
use deployit_core::executor::Executor;
use deployit_core::source::SourceFetcher;
use deployit_deployer::{CloudFormationDeployer, LocalDeployer};
use deployit_executor::{LocalDockerExecutor, LocalProcessExecutor};
use std::sync::Arc;
use tracing::info;

use crate::orchestrator::PipelineOrchestrator;
use crate::store::{FsArtifactStore, MemoryArtifactStore};

pub fn artifact_store(config: &StoreConfig) -> Arc<dyn ArtifactStore> {
    match config {
        StoreConfig::Memory => Arc::new(MemoryArtifactStore::new()),
        StoreConfig::Fs { path } => Arc::new(FsArtifactStore::new(path.clone())),
    }
}

/// The Docker executor connects to the daemon eagerly so a missing daemon
/// fails at startup instead of on the first build.
pub fn executor(config: &ExecutorConfig) -> Result<Arc<dyn Executor>> {
    let executor: Arc<dyn Executor> = match config {
        ExecutorConfig::Process => Arc::new(LocalProcessExecutor::new()),
        ExecutorConfig::Docker => Arc::new(LocalDockerExecutor::new()?),
    };
    Ok(executor)
}

pub fn deployer(config: &DeployerConfig) -> Arc<dyn Deployer> {
    match config {
        DeployerConfig::Local { state_dir } => Arc::new(LocalDeployer::new(state_dir.clone())),
        DeployerConfig::CloudFormation { region, profile } => {
            Arc::new(CloudFormationDeployer::new(region.clone(), profile.clone()))
        }
    }
}

/// Build an orchestrator for `config`, fetching sources with `fetcher`.
pub fn orchestrator(
    config: &SystemConfig,
    fetcher: Arc<dyn SourceFetcher>,
) -> Result<PipelineOrchestrator> {
    let store = artifact_store(&config.store);
    let executor = executor(&config.executor)?;
    let deployer = deployer(&config.deployer);
    info!(
        store = store.name(),
        executor = executor.name(),
        engine = deployer.name(),
        source = fetcher.name(),
        keep_artifacts = config.keep_artifacts,
        "Runtime configured"
    );
    Ok(PipelineOrchestrator::new(store, fetcher, executor, deployer)
        .keep_artifacts(config.keep_artifacts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::DirectorySource;

    #[test]
    fn test_defaults() {
        let config = SystemConfig::default();
        assert_eq!(artifact_store(&config.store).name(), "memory");
        assert_eq!(executor(&config.executor).unwrap().name(), "process");
        assert_eq!(deployer(&config.deployer).name(), "local");
    }

    #[test]
    fn test_configured_backends() {
        let dir = tempfile::tempdir().unwrap();
        let store = artifact_store(&StoreConfig::Fs {
            path: dir.path().to_path_buf(),
        });
        assert_eq!(store.name(), "fs");

        let engine = deployer(&DeployerConfig::CloudFormation {
            region: Some("eu-west-1".into()),
            profile: None,
        });
        assert_eq!(engine.name(), "cloudformation");
    }

    #[tokio::test]
    async fn test_orchestrator_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = SystemConfig {
            keep_artifacts: true,
            ..Default::default()
        };
        let orchestrator =
            orchestrator(&config, Arc::new(DirectorySource::new(dir.path()))).unwrap();
        assert_eq!(orchestrator.store().name(), "memory");
    }
}
