//! Variable interpolation for pipeline configurations.
//!
//! Supports variables like:
//! - `${source.owner}` - Repository owner
//! - `${source.repo}` - Repository name
//! - `${source.branch}` - Watched branch
//! - `${source.revision}` - Revision being built
//! - `${source.short_revision}` - Short (7 char) revision
//! - `${pipeline.name}` - Pipeline name
//! - `${pipeline.id}` - Pipeline ID
//! - `${run.id}` - Run ID
//! - `${run.number}` - Run number
//! - `${run.trigger}` - What started the run (push, poll, manual)
//! - `${stage.name}` - Current stage name
//! - `${stage.index}` - Current stage position, starting at 0
//! - `${env.VAR_NAME}` - Environment variable
//! - `${secrets.SECRET_NAME}` - Secret value
//! - `${timestamp}` - Unix timestamp
//! - `${date}` - ISO date (YYYY-MM-DD)
//! - `${datetime}` - ISO datetime

use deployit_core::pipeline::{Pipeline, PipelineRun};
use deployit_core::source::{Revision, SourceRef};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

const MASK: &str = "***";

/// Variable context containing all available variables for interpolation.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    /// Source-related variables
    pub source: SourceContext,
    /// Pipeline-related variables
    pub pipeline: PipelineContext,
    /// Run-related variables
    pub run: RunContext,
    /// Stage-related variables
    pub stage: StageContext,
    /// Environment variables
    pub env: HashMap<String, String>,
    /// Secrets (will be masked in logs)
    pub secrets: HashMap<String, String>,
    /// Custom variables defined by user
    pub custom: HashMap<String, String>,
}

/// Source context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct SourceContext {
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub revision: String,
    pub short_revision: String,
}

/// Pipeline context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct PipelineContext {
    pub id: String,
    pub name: String,
}

/// Run context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub id: String,
    pub number: u64,
    pub trigger: String,
}

/// Stage context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct StageContext {
    pub name: String,
    pub index: usize,
}

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}").unwrap()
});

impl VariableContext {
    /// Create a new empty variable context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for one run. Pipeline env entries become custom variables.
    pub fn for_run(pipeline: &Pipeline, run: &PipelineRun) -> Self {
        let mut builder = VariableContextBuilder::new()
            .with_source(pipeline.source())
            .with_pipeline(pipeline.id().to_string(), pipeline.name())
            .with_run(run.id.to_string(), run.number)
            .with_trigger(run.trigger.kind.to_string());
        if let Some(revision) = &run.trigger.revision {
            builder = builder.with_revision(revision);
        }
        let mut ctx = builder.build();
        for (key, value) in pipeline.env() {
            ctx.custom.insert(key.clone(), value.clone());
        }
        ctx
    }

    /// Populate environment variables from the current process environment.
    pub fn populate_env(&mut self) {
        for (key, value) in std::env::vars() {
            self.env.insert(key, value);
        }
    }

    /// Add a custom variable.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.custom.insert(name.to_string(), value.into());
    }

    /// Record the revision a run resolved to once the source stage ran.
    pub fn set_revision(&mut self, revision: &Revision) {
        self.source.revision = revision.as_str().to_string();
        self.source.short_revision = revision.short().to_string();
    }

    /// Same context, positioned at another stage.
    pub fn at_stage(&self, name: impl Into<String>, index: usize) -> Self {
        let mut ctx = self.clone();
        ctx.stage = StageContext {
            name: name.into(),
            index,
        };
        ctx
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["source", "owner"] => Some(self.source.owner.clone()),
            ["source", "repo"] => Some(self.source.repo.clone()),
            ["source", "branch"] => Some(self.source.branch.clone()),
            ["source", "revision"] => Some(self.source.revision.clone()),
            ["source", "short_revision"] => Some(self.source.short_revision.clone()),

            ["pipeline", "id"] => Some(self.pipeline.id.clone()),
            ["pipeline", "name"] => Some(self.pipeline.name.clone()),

            ["run", "id"] => Some(self.run.id.clone()),
            ["run", "number"] => Some(self.run.number.to_string()),
            ["run", "trigger"] => Some(self.run.trigger.clone()),

            ["stage", "name"] => Some(self.stage.name.clone()),
            ["stage", "index"] => Some(self.stage.index.to_string()),

            ["env", name] => self.env.get(*name).cloned(),
            ["secrets", name] => self.secrets.get(*name).cloned(),

            ["timestamp"] => Some(chrono::Utc::now().timestamp().to_string()),
            ["date"] => Some(chrono::Utc::now().format("%Y-%m-%d").to_string()),
            ["datetime"] => Some(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()),

            // Single-part names check custom variables
            [name] => self.custom.get(*name).cloned(),

            _ => None,
        }
    }

    /// Interpolate all variables in a string.
    /// Variables are specified as `${var_name}` or `${namespace.var_name}`.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    /// Interpolate variables in a list of strings.
    pub fn interpolate_vec(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|s| self.interpolate(s)).collect()
    }

    /// Interpolate the values of a map.
    pub fn interpolate_map(&self, map: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.interpolate(v)))
            .collect()
    }

    /// Get a list of all secret variable names used in a string.
    pub fn find_secrets_in_string(&self, input: &str) -> Vec<String> {
        VAR_REGEX
            .captures_iter(input)
            .filter_map(|caps| {
                let var_name = &caps[1];
                if var_name.starts_with("secrets.") {
                    Some(var_name.to_string())
                } else {
                    None
                }
            })
            .collect()
    }

    /// Get all secret values that should be masked in logs.
    pub fn get_secret_values(&self) -> Vec<&str> {
        self.secrets.values().map(|s| s.as_str()).collect()
    }

    /// Replace every secret value in `text` with `***`.
    pub fn mask(&self, text: &str) -> String {
        let mut secrets: Vec<&str> = self
            .get_secret_values()
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect();
        // longest first so a secret containing another is masked whole
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        secrets
            .into_iter()
            .fold(text.to_string(), |acc, secret| acc.replace(secret, MASK))
    }

    /// Run variables exported to build jobs as `DEPLOYIT_*`.
    pub fn job_env(&self) -> BTreeMap<String, String> {
        [
            ("DEPLOYIT_PIPELINE_ID", self.pipeline.id.clone()),
            ("DEPLOYIT_PIPELINE_NAME", self.pipeline.name.clone()),
            ("DEPLOYIT_RUN_ID", self.run.id.clone()),
            ("DEPLOYIT_RUN_NUMBER", self.run.number.to_string()),
            ("DEPLOYIT_STAGE_NAME", self.stage.name.clone()),
            ("DEPLOYIT_SOURCE_BRANCH", self.source.branch.clone()),
            ("DEPLOYIT_SOURCE_REVISION", self.source.revision.clone()),
        ]
        .into_iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}

/// Builder for creating VariableContext.
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self {
            ctx: VariableContext::new(),
        }
    }

    pub fn with_source(mut self, source: &SourceRef) -> Self {
        self.ctx.source.owner = source.owner.clone();
        self.ctx.source.repo = source.repository.clone();
        self.ctx.source.branch = source.branch.clone();
        self
    }

    pub fn with_revision(mut self, revision: &Revision) -> Self {
        self.ctx.set_revision(revision);
        self
    }

    pub fn with_pipeline(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.ctx.pipeline.id = id.into();
        self.ctx.pipeline.name = name.into();
        self
    }

    pub fn with_run(mut self, id: impl Into<String>, number: u64) -> Self {
        self.ctx.run.id = id.into();
        self.ctx.run.number = number;
        self
    }

    pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.ctx.run.trigger = trigger.into();
        self
    }

    pub fn with_stage(mut self, name: impl Into<String>, index: usize) -> Self {
        self.ctx.stage.name = name.into();
        self.ctx.stage.index = index;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.env.insert(key.into(), value.into());
        self
    }

    pub fn with_secret(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.secrets.insert(key.into(), value.into());
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.custom.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}

impl Default for VariableContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
