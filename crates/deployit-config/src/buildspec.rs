//! YAML buildspec files (CodeBuild layout).
//!
//! ```yaml
//! version: 0.2
//! env:
//!   variables:
//!     NODE_ENV: production
//! phases:
//!   install:
//!     commands:
//!       - npm install -g aws-cdk
//!   build:
//!     commands:
//!       - npx cdk synth
//! artifacts:
//!   base-directory: cdk.out
//!   files:
//!     - CdkLab3Stack.template.json
//! ```

use crate::{ConfigError, ConfigResult};
use deployit_core::buildspec::{ArtifactSelection, BuildSpec, PhaseName};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct RawBuildSpec {
    version: Option<serde_yaml::Value>,
    #[serde(default)]
    env: RawEnv,
    #[serde(default)]
    phases: BTreeMap<String, RawPhase>,
    artifacts: Option<RawArtifacts>,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(default)]
    variables: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
struct RawPhase {
    #[serde(default)]
    commands: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawArtifacts {
    #[serde(default)]
    files: Vec<String>,
    base_directory: Option<String>,
    discard_paths: Option<serde_yaml::Value>,
}

/// Parse a buildspec document.
pub fn parse_buildspec(yaml: &str) -> ConfigResult<BuildSpec> {
    let raw: RawBuildSpec = serde_yaml::from_str(yaml)?;

    let artifacts = raw
        .artifacts
        .ok_or_else(|| ConfigError::MissingField("buildspec artifacts".to_string()))?;
    let mut selection = ArtifactSelection::files(artifacts.files)
        .with_discard_paths(yaml_flag(artifacts.discard_paths.as_ref(), "discard-paths")?);
    if let Some(base) = artifacts.base_directory {
        selection = selection.with_base_directory(base);
    }

    // phases run in their fixed order whatever order the file lists them in
    let mut phases = Vec::with_capacity(raw.phases.len());
    for (name, phase) in raw.phases {
        let phase_name: PhaseName = name.parse()?;
        phases.push((phase_name, phase.commands));
    }
    phases.sort_by_key(|(name, _)| *name);

    let mut spec = BuildSpec::new(selection);
    if let Some(version) = raw.version {
        spec.version = yaml_scalar(&version, "version")?;
    }
    for (name, commands) in phases {
        spec = spec.with_phase(name, commands);
    }
    for (key, value) in raw.env.variables {
        let value = yaml_scalar(&value, &format!("env.variables.{}", key))?;
        spec = spec.with_env(key, value);
    }

    spec.validate()?;
    Ok(spec)
}

/// Read and parse a buildspec file.
pub fn load_buildspec(path: &Path) -> ConfigResult<BuildSpec> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_buildspec(&text)
}

fn yaml_scalar(value: &serde_yaml::Value, field: &str) -> ConfigResult<String> {
    match value {
        serde_yaml::Value::String(s) => Ok(s.clone()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        _ => Err(ConfigError::invalid(field, "expected a scalar value")),
    }
}

// CodeBuild files commonly spell booleans `yes` / `no`.
fn yaml_flag(value: Option<&serde_yaml::Value>, field: &str) -> ConfigResult<bool> {
    match value {
        None => Ok(false),
        Some(serde_yaml::Value::Bool(b)) => Ok(*b),
        Some(serde_yaml::Value::String(s)) => match s.to_lowercase().as_str() {
            "yes" | "true" | "on" => Ok(true),
            "no" | "false" | "off" => Ok(false),
            other => Err(ConfigError::invalid(field, format!("not a boolean: {}", other))),
        },
        Some(_) => Err(ConfigError::invalid(field, "expected a boolean")),
    }
}
