//! System configuration parsing.
//!
//! ```kdl
//! store "fs" path="/var/lib/deployit/artifacts" keep-artifacts=#false
//! executor "docker"
//! deployer "local" state-dir="/var/lib/deployit/state"
//! trigger poll-interval=60 max-attempts=5 base-delay-ms=1000 max-delay-ms=60000 queue="latest-wins"
//! api listen="0.0.0.0:8080" webhook-secret-env="DEPLOYIT_WEBHOOK_SECRET"
//! history keep-runs=100
//! ```
//!
//! Every node is optional; an empty document yields the defaults.
//! `DEPLOYIT_*` environment variables override file values.

use crate::pipeline::{get_first_string_arg, get_int_prop, get_bool_prop, get_string_prop};
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// System-wide configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    pub store: StoreConfig,
    /// Keep a run's artifacts after it completes.
    pub keep_artifacts: bool,
    pub executor: ExecutorConfig,
    pub deployer: DeployerConfig,
    pub trigger: TriggerConfig,
    pub api: ApiConfig,
    pub history: HistoryConfig,
}

/// Artifact store backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    #[default]
    Memory,
    Fs { path: PathBuf },
}

/// Build execution environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExecutorConfig {
    /// Local `sh` processes; the build image is ignored.
    #[default]
    Process,
    /// Containers on the local Docker daemon.
    Docker,
}

/// Provisioning engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeployerConfig {
    Local {
        state_dir: PathBuf,
    },
    CloudFormation {
        region: Option<String>,
        profile: Option<String>,
    },
}

impl Default for DeployerConfig {
    fn default() -> Self {
        DeployerConfig::Local {
            state_dir: PathBuf::from(".deployit/state"),
        }
    }
}

/// What happens to trigger requests that arrive while a run is pending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueuePolicy {
    /// Keep only the newest pending request per pipeline.
    #[default]
    LatestWins,
    /// Keep every request, first in first out.
    SerializeAll,
}

impl std::str::FromStr for QueuePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "latest-wins" | "latest" => Ok(QueuePolicy::LatestWins),
            "serialize-all" | "serialize" | "fifo" => Ok(QueuePolicy::SerializeAll),
            other => Err(ConfigError::invalid(
                "queue",
                format!("unknown queue policy: {}", other),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub poll_interval: Duration,
    /// Attempts per poll before giving up until the next interval.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub queue: QueuePolicy,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            queue: QueuePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiConfig {
    pub listen: String,
    /// Name of the environment variable holding the webhook secret.
    pub webhook_secret_env: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            webhook_secret_env: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Finished runs kept per pipeline; older ones are forgotten.
    pub keep_runs: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { keep_runs: 100 }
    }
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "store" => {
                config.store = parse_store(node)?;
                if let Some(keep) = get_bool_prop(node, "keep-artifacts") {
                    config.keep_artifacts = keep;
                }
            }
            "executor" => {
                config.executor = parse_executor(
                    &get_first_string_arg(node).unwrap_or_else(|| "process".to_string()),
                )?;
            }
            "deployer" => {
                config.deployer = parse_deployer(node)?;
            }
            "trigger" => {
                parse_trigger(node, &mut config.trigger)?;
            }
            "api" => {
                if let Some(listen) = get_string_prop(node, "listen") {
                    config.api.listen = listen;
                }
                config.api.webhook_secret_env = get_string_prop(node, "webhook-secret-env");
            }
            "history" => {
                if let Some(keep) = positive_prop(node, "keep-runs")? {
                    config.history.keep_runs = usize::try_from(keep)
                        .map_err(|_| ConfigError::invalid("keep-runs", "too large"))?;
                }
            }
            _ => {}
        }
    }

    Ok(config)
}

/// Read a system configuration file.
pub fn load_system_config(path: &Path) -> ConfigResult<SystemConfig> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_system_config(&text)
}

fn parse_store(node: &KdlNode) -> ConfigResult<StoreConfig> {
    match get_first_string_arg(node).as_deref().unwrap_or("memory") {
        "memory" => Ok(StoreConfig::Memory),
        "fs" => {
            let path = get_string_prop(node, "path")
                .ok_or_else(|| ConfigError::MissingField("store path".to_string()))?;
            Ok(StoreConfig::Fs {
                path: PathBuf::from(path),
            })
        }
        other => Err(ConfigError::invalid(
            "store",
            format!("unknown artifact store: {}", other),
        )),
    }
}

fn parse_executor(kind: &str) -> ConfigResult<ExecutorConfig> {
    match kind {
        "process" | "local" => Ok(ExecutorConfig::Process),
        "docker" => Ok(ExecutorConfig::Docker),
        other => Err(ConfigError::invalid(
            "executor",
            format!("unknown executor: {}", other),
        )),
    }
}

fn parse_deployer(node: &KdlNode) -> ConfigResult<DeployerConfig> {
    match get_first_string_arg(node).as_deref().unwrap_or("local") {
        "local" => Ok(DeployerConfig::Local {
            state_dir: get_string_prop(node, "state-dir")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".deployit/state")),
        }),
        "cloudformation" => Ok(DeployerConfig::CloudFormation {
            region: get_string_prop(node, "region"),
            profile: get_string_prop(node, "profile"),
        }),
        other => Err(ConfigError::invalid(
            "deployer",
            format!("unknown deployer: {}", other),
        )),
    }
}

fn parse_trigger(node: &KdlNode, trigger: &mut TriggerConfig) -> ConfigResult<()> {
    if let Some(secs) = positive_prop(node, "poll-interval")? {
        trigger.poll_interval = Duration::from_secs(secs);
    }
    if let Some(attempts) = positive_prop(node, "max-attempts")? {
        trigger.max_attempts = u32::try_from(attempts)
            .map_err(|_| ConfigError::invalid("max-attempts", "too large"))?;
    }
    if let Some(ms) = positive_prop(node, "base-delay-ms")? {
        trigger.base_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = positive_prop(node, "max-delay-ms")? {
        trigger.max_delay = Duration::from_millis(ms);
    }
    if let Some(queue) = get_string_prop(node, "queue") {
        trigger.queue = queue.parse()?;
    }
    if trigger.base_delay > trigger.max_delay {
        return Err(ConfigError::invalid(
            "base-delay-ms",
            "must not exceed max-delay-ms",
        ));
    }
    Ok(())
}

fn positive_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u64>> {
    match get_int_prop(node, name) {
        None => Ok(None),
        Some(v) if v > 0 => u64::try_from(v)
            .map(Some)
            .map_err(|_| ConfigError::invalid(name, "too large")),
        Some(v) => Err(ConfigError::invalid(
            name,
            format!("must be positive, got {}", v),
        )),
    }
}

impl SystemConfig {
    /// Overlay `DEPLOYIT_*` variables from the process environment.
    pub fn apply_env(&mut self) -> ConfigResult<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Overlay `DEPLOYIT_*` variables read through `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(store) = lookup("DEPLOYIT_STORE") {
            self.store = match store.as_str() {
                "memory" => StoreConfig::Memory,
                "fs" => StoreConfig::Fs {
                    path: lookup("DEPLOYIT_STORE_PATH")
                        .map(PathBuf::from)
                        .ok_or_else(|| ConfigError::MissingField("DEPLOYIT_STORE_PATH".into()))?,
                },
                other => {
                    return Err(ConfigError::invalid(
                        "DEPLOYIT_STORE",
                        format!("unknown artifact store: {}", other),
                    ));
                }
            };
        } else if let (Some(path), StoreConfig::Fs { .. }) = (lookup("DEPLOYIT_STORE_PATH"), &self.store) {
            self.store = StoreConfig::Fs {
                path: PathBuf::from(path),
            };
        }
        if let Some(keep) = lookup("DEPLOYIT_KEEP_ARTIFACTS") {
            self.keep_artifacts = matches!(keep.as_str(), "1" | "true" | "yes");
        }
        if let Some(executor) = lookup("DEPLOYIT_EXECUTOR") {
            self.executor = parse_executor(&executor)?;
        }
        if let Some(deployer) = lookup("DEPLOYIT_DEPLOYER") {
            self.deployer = match deployer.as_str() {
                "local" => DeployerConfig::default(),
                "cloudformation" => DeployerConfig::CloudFormation {
                    region: None,
                    profile: None,
                },
                other => {
                    return Err(ConfigError::invalid(
                        "DEPLOYIT_DEPLOYER",
                        format!("unknown deployer: {}", other),
                    ));
                }
            };
        }
        match &mut self.deployer {
            DeployerConfig::Local { state_dir } => {
                if let Some(dir) = lookup("DEPLOYIT_STATE_DIR") {
                    *state_dir = PathBuf::from(dir);
                }
            }
            DeployerConfig::CloudFormation { region, profile } => {
                if let Some(r) = lookup("AWS_REGION") {
                    region.get_or_insert(r);
                }
                if let Some(p) = lookup("DEPLOYIT_AWS_PROFILE") {
                    *profile = Some(p);
                }
            }
        }
        if let Some(secs) = lookup("DEPLOYIT_POLL_INTERVAL") {
            let secs: u64 = secs
                .parse()
                .map_err(|_| ConfigError::invalid("DEPLOYIT_POLL_INTERVAL", "not a number"))?;
            self.trigger.poll_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(queue) = lookup("DEPLOYIT_QUEUE_POLICY") {
            self.trigger.queue = queue.parse()?;
        }
        if let Some(listen) = lookup("DEPLOYIT_LISTEN") {
            self.api.listen = listen;
        }
        if let Some(keep) = lookup("DEPLOYIT_KEEP_RUNS") {
            self.history.keep_runs = keep
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| ConfigError::invalid("DEPLOYIT_KEEP_RUNS", "not a positive number"))?;
        }
        Ok(())
    }

    /// The webhook secret, read from the configured environment variable.
    pub fn webhook_secret(&self) -> Option<String> {
        self.api
            .webhook_secret_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|s| !s.is_empty())
    }
}
