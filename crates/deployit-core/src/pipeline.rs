//! Pipeline definitions, construction-time validation and run state.
//!
//! A pipeline is data: an ordered list of stages, each holding typed
//! actions that name the artifacts they consume and produce. One builder
//! covers every variant; `PipelineBuilder::build` rejects malformed
//! definitions before any run exists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use crate::artifact::{ArtifactName, ArtifactRef};
use crate::buildspec::BuildSpec;
use crate::id::{PipelineId, RunId};
use crate::source::{Revision, SourceRef};
use crate::{Error, Result};

/// A file inside a named artifact; the deploy stage's template location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemplateRef {
    pub artifact: ArtifactName,
    pub path: String,
}

impl ArtifactName {
    pub fn at_path(&self, path: impl Into<String>) -> TemplateRef {
        TemplateRef {
            artifact: self.clone(),
            path: path.into(),
        }
    }
}

impl fmt::Display for TemplateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.artifact, self.path)
    }
}

/// Fetch a snapshot of a source reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceAction {
    pub source: SourceRef,
}

/// Run a build specification in an isolated environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildAction {
    /// Base image of the execution environment.
    pub image: String,
    pub privileged: bool,
    pub spec: BuildSpec,
}

/// Apply a template to a target through the provisioning engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployAction {
    /// Stack / environment name.
    pub target: String,
    pub template: TemplateRef,
    /// Role assumed by the engine while applying.
    pub role: Option<String>,
    /// Grant the engine full IAM capabilities.
    pub admin_permissions: bool,
    pub capabilities: Vec<String>,
    pub parameters: BTreeMap<String, String>,
}

impl DeployAction {
    pub fn new(target: impl Into<String>, template: TemplateRef) -> Self {
        Self {
            target: target.into(),
            template,
            role: None,
            admin_permissions: false,
            capabilities: Vec::new(),
            parameters: BTreeMap::new(),
        }
    }

    /// Capabilities passed to the engine; admin permissions imply the IAM
    /// capabilities.
    pub fn effective_capabilities(&self) -> Vec<String> {
        let mut caps = self.capabilities.clone();
        if self.admin_permissions {
            for cap in ["CAPABILITY_IAM", "CAPABILITY_NAMED_IAM"] {
                if !caps.iter().any(|c| c == cap) {
                    caps.push(cap.to_string());
                }
            }
        }
        caps
    }
}

/// What an action does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ActionKind {
    Source(SourceAction),
    Build(BuildAction),
    Deploy(DeployAction),
}

impl ActionKind {
    pub fn stage_kind(&self) -> StageKind {
        match self {
            ActionKind::Source(_) => StageKind::Source,
            ActionKind::Build(_) => StageKind::Build,
            ActionKind::Deploy(_) => StageKind::Deploy,
        }
    }
}

/// A named unit of execution with declared inputs and outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    pub inputs: Vec<ArtifactName>,
    pub outputs: Vec<ArtifactName>,
    pub kind: ActionKind,
}

impl Action {
    pub fn source(name: impl Into<String>, source: SourceRef, output: ArtifactName) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: vec![output],
            kind: ActionKind::Source(SourceAction { source }),
        }
    }

    pub fn build(
        name: impl Into<String>,
        input: ArtifactName,
        output: ArtifactName,
        build: BuildAction,
    ) -> Self {
        Self {
            name: name.into(),
            inputs: vec![input],
            outputs: vec![output],
            kind: ActionKind::Build(build),
        }
    }

    /// The deploy action's only input is the artifact its template lives in.
    pub fn deploy(name: impl Into<String>, deploy: DeployAction) -> Self {
        Self {
            name: name.into(),
            inputs: vec![deploy.template.artifact.clone()],
            outputs: Vec::new(),
            kind: ActionKind::Deploy(deploy),
        }
    }

    /// Add a secondary input (build actions only use it).
    pub fn with_input(mut self, input: ArtifactName) -> Self {
        self.inputs.push(input);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Source,
    Build,
    Deploy,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Source => write!(f, "source"),
            StageKind::Build => write!(f, "build"),
            StageKind::Deploy => write!(f, "deploy"),
        }
    }
}

/// A named step in a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub actions: Vec<Action>,
}

impl Stage {
    pub fn new(name: impl Into<String>, actions: Vec<Action>) -> Self {
        Self {
            name: name.into(),
            actions,
        }
    }

    /// Kind shared by every action, `None` for an empty or mixed stage.
    pub fn kind(&self) -> Option<StageKind> {
        let first = self.actions.first()?.kind.stage_kind();
        self.actions
            .iter()
            .all(|a| a.kind.stage_kind() == first)
            .then_some(first)
    }

    pub fn inputs(&self) -> impl Iterator<Item = &ArtifactName> {
        self.actions.iter().flat_map(|a| a.inputs.iter())
    }

    pub fn outputs(&self) -> impl Iterator<Item = &ArtifactName> {
        self.actions.iter().flat_map(|a| a.outputs.iter())
    }
}

/// A validated pipeline definition.
///
/// Invariants, checked at construction:
/// - exactly one source stage, and it is first
/// - exactly one deploy stage, and it is last
/// - every stage input is produced by a strictly earlier stage
/// - every artifact name is produced once
/// - the deploy template path is selected by the producing build's rule
#[derive(Debug, Clone, Serialize)]
pub struct Pipeline {
    id: PipelineId,
    name: String,
    source: SourceRef,
    stages: Vec<Stage>,
    env: BTreeMap<String, String>,
}

impl Pipeline {
    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(name)
    }

    pub fn new(
        name: impl Into<String>,
        stages: Vec<Stage>,
        env: BTreeMap<String, String>,
    ) -> Result<Self> {
        PipelineBuilder {
            name: name.into(),
            stages,
            env,
        }
        .build()
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// The source this pipeline watches.
    pub fn source(&self) -> &SourceRef {
        &self.source
    }
}

/// Parameterized pipeline builder.
#[derive(Debug, Clone, Default)]
pub struct PipelineBuilder {
    name: String,
    stages: Vec<Stage>,
    env: BTreeMap<String, String>,
}

impl PipelineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn source_stage(
        self,
        stage: impl Into<String>,
        action: impl Into<String>,
        source: SourceRef,
        output: ArtifactName,
    ) -> Self {
        self.stage(Stage::new(stage, vec![Action::source(action, source, output)]))
    }

    pub fn build_stage(
        self,
        stage: impl Into<String>,
        action: impl Into<String>,
        input: ArtifactName,
        output: ArtifactName,
        build: BuildAction,
    ) -> Self {
        self.stage(Stage::new(
            stage,
            vec![Action::build(action, input, output, build)],
        ))
    }

    pub fn deploy_stage(
        self,
        stage: impl Into<String>,
        action: impl Into<String>,
        deploy: DeployAction,
    ) -> Self {
        self.stage(Stage::new(stage, vec![Action::deploy(action, deploy)]))
    }

    pub fn build(self) -> Result<Pipeline> {
        if self.name.trim().is_empty() {
            return Err(Error::config("pipeline name must not be empty"));
        }
        validate_stages(&self.stages)?;
        let source = self.stages[0]
            .actions
            .iter()
            .find_map(|a| match &a.kind {
                ActionKind::Source(src) => Some(src.source.clone()),
                _ => None,
            })
            .ok_or_else(|| Error::config("source stage has no source action"))?;
        Ok(Pipeline {
            id: PipelineId::new(),
            name: self.name,
            source,
            stages: self.stages,
            env: self.env,
        })
    }
}

fn validate_stages(stages: &[Stage]) -> Result<()> {
    if stages.len() < 2 {
        return Err(Error::config(
            "a pipeline needs at least a source stage and a deploy stage",
        ));
    }

    let mut stage_names = HashSet::new();
    let mut action_names = HashSet::new();
    let mut kinds = Vec::with_capacity(stages.len());

    for stage in stages {
        if stage.name.trim().is_empty() {
            return Err(Error::config("stage name must not be empty"));
        }
        if !stage_names.insert(stage.name.as_str()) {
            return Err(Error::config(format!("duplicate stage '{}'", stage.name)));
        }
        if stage.actions.is_empty() {
            return Err(Error::config(format!("stage '{}' has no actions", stage.name)));
        }
        for action in &stage.actions {
            if action.name.trim().is_empty() {
                return Err(Error::config(format!(
                    "stage '{}' has an action without a name",
                    stage.name
                )));
            }
            if !action_names.insert(action.name.as_str()) {
                return Err(Error::config(format!("duplicate action '{}'", action.name)));
            }
            check_arity(&stage.name, action)?;
        }
        let kind = stage.kind().ok_or_else(|| {
            Error::config(format!("stage '{}' mixes action kinds", stage.name))
        })?;
        kinds.push(kind);
    }

    check_ordering(stages, &kinds)?;
    check_artifact_flow(stages)
}

fn check_arity(stage: &str, action: &Action) -> Result<()> {
    let bad = |what: &str| {
        Err(Error::config(format!(
            "action '{}' in stage '{}' {}",
            action.name, stage, what
        )))
    };
    match &action.kind {
        ActionKind::Source(_) => {
            if !action.inputs.is_empty() {
                return bad("is a source action and cannot take inputs");
            }
            if action.outputs.len() != 1 {
                return bad("must produce exactly one artifact");
            }
        }
        ActionKind::Build(build) => {
            if action.inputs.is_empty() {
                return bad("needs at least one input artifact");
            }
            if action.outputs.len() != 1 {
                return bad("must produce exactly one artifact");
            }
            if build.image.trim().is_empty() {
                return bad("has no build image");
            }
            build
                .spec
                .validate()
                .map_err(|e| Error::config(format!("action '{}': {}", action.name, e)))?;
        }
        ActionKind::Deploy(deploy) => {
            if !action.outputs.is_empty() {
                return bad("is a deploy action and cannot produce artifacts");
            }
            if action.inputs != [deploy.template.artifact.clone()] {
                return bad("must take exactly its template artifact as input");
            }
            if deploy.target.trim().is_empty() {
                return bad("has no deploy target");
            }
            if deploy.template.path.trim().is_empty() {
                return bad("has no template path");
            }
        }
    }
    Ok(())
}

fn check_ordering(stages: &[Stage], kinds: &[StageKind]) -> Result<()> {
    let count = |k: StageKind| kinds.iter().filter(|&&x| x == k).count();

    if kinds[0] != StageKind::Source {
        return Err(Error::config(format!(
            "first stage '{}' must be a source stage, found {}",
            stages[0].name, kinds[0]
        )));
    }
    let last = kinds.len() - 1;
    if kinds[last] != StageKind::Deploy {
        return Err(Error::config(format!(
            "last stage '{}' must be a deploy stage, found {}",
            stages[last].name, kinds[last]
        )));
    }
    if count(StageKind::Source) != 1 {
        return Err(Error::config("a pipeline has exactly one source stage"));
    }
    if count(StageKind::Deploy) != 1 {
        return Err(Error::config("a pipeline has exactly one deploy stage"));
    }
    Ok(())
}

fn check_artifact_flow(stages: &[Stage]) -> Result<()> {
    // artifact -> producing action, filled stage by stage so only strictly
    // earlier stages are visible to a stage's inputs
    let mut produced: HashMap<&ArtifactName, &Action> = HashMap::new();

    for stage in stages {
        for action in &stage.actions {
            for input in &action.inputs {
                if produced.contains_key(input) {
                    continue;
                }
                let later = stage.outputs().any(|o| o == input);
                return Err(Error::config(if later {
                    format!(
                        "stage '{}' consumes '{}' which it produces itself",
                        stage.name, input
                    )
                } else {
                    format!(
                        "stage '{}' consumes '{}' which no earlier stage produces",
                        stage.name, input
                    )
                }));
            }
            if let ActionKind::Deploy(deploy) = &action.kind {
                if let Some(producer) = produced.get(&deploy.template.artifact) {
                    check_template_selected(deploy, producer)?;
                }
            }
        }
        for action in &stage.actions {
            for output in &action.outputs {
                if produced.insert(output, action).is_some() {
                    return Err(Error::config(format!(
                        "artifact '{}' is produced more than once",
                        output
                    )));
                }
            }
        }
    }
    Ok(())
}

/// The deploy template path and the build's selection rule must agree;
/// checked once here instead of failing at deploy time.
fn check_template_selected(deploy: &DeployAction, producer: &Action) -> Result<()> {
    let ActionKind::Build(build) = &producer.kind else {
        // Source snapshots carry arbitrary files; checked when the run
        // reaches the deploy stage.
        return Ok(());
    };
    if build.spec.artifacts.selects(&deploy.template.path)? {
        Ok(())
    } else {
        Err(Error::config(format!(
            "template '{}' would not be selected by the artifact rule {:?} of action '{}'",
            deploy.template, build.spec.artifacts.files, producer.name
        )))
    }
}

/// Overall status of a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed { stage: String, message: String },
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed { .. })
    }

    fn label(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Failed { stage, message } => {
                write!(f, "failed at stage '{}': {}", stage, message)
            }
            other => f.write_str(other.label()),
        }
    }
}

/// Status of a stage within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed { message: String },
    Skipped { reason: String },
}

/// Result of a stage execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub name: String,
    pub status: StageStatus,
    /// Artifacts the stage published.
    pub outputs: Vec<ArtifactRef>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Push,
    Poll,
    Manual,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerKind::Push => write!(f, "push"),
            TriggerKind::Poll => write!(f, "poll"),
            TriggerKind::Manual => write!(f, "manual"),
        }
    }
}

/// What started a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerInfo {
    pub kind: TriggerKind,
    /// Revision to build; `None` means the current head.
    pub revision: Option<Revision>,
    pub actor: Option<String>,
}

impl TriggerInfo {
    pub fn manual() -> Self {
        Self {
            kind: TriggerKind::Manual,
            revision: None,
            actor: None,
        }
    }

    pub fn at(kind: TriggerKind, revision: Revision) -> Self {
        Self {
            kind,
            revision: Some(revision),
            actor: None,
        }
    }
}

/// One run of a pipeline. Status moves `Pending → Running → Succeeded |
/// Failed` and never leaves a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: RunId,
    pub pipeline_id: PipelineId,
    pub pipeline: String,
    /// Per-pipeline run counter, starting at 1.
    pub number: u64,
    pub trigger: TriggerInfo,
    pub status: RunStatus,
    pub stages: Vec<StageResult>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(pipeline: &Pipeline, number: u64, trigger: TriggerInfo) -> Self {
        Self {
            id: RunId::new(),
            pipeline_id: pipeline.id(),
            pipeline: pipeline.name().to_string(),
            number,
            trigger,
            status: RunStatus::Pending,
            stages: pipeline
                .stages()
                .iter()
                .map(|s| StageResult {
                    name: s.name.clone(),
                    status: StageStatus::Pending,
                    outputs: Vec::new(),
                    started_at: None,
                    finished_at: None,
                })
                .collect(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        self.transition(RunStatus::Running)
    }

    pub fn succeed(&mut self) -> Result<()> {
        self.transition(RunStatus::Succeeded)
    }

    pub fn fail(&mut self, stage: impl Into<String>, message: impl Into<String>) -> Result<()> {
        self.transition(RunStatus::Failed {
            stage: stage.into(),
            message: message.into(),
        })
    }

    fn transition(&mut self, next: RunStatus) -> Result<()> {
        let allowed = matches!(
            (&self.status, &next),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Running, RunStatus::Succeeded)
                | (RunStatus::Running, RunStatus::Failed { .. })
        );
        if !allowed {
            return Err(Error::InvalidTransition(format!(
                "run {} cannot move from {} to {}",
                self.id,
                self.status.label(),
                next.label()
            )));
        }
        let now = Utc::now();
        match next {
            RunStatus::Running => self.started_at = Some(now),
            _ => self.finished_at = Some(now),
        }
        self.status = next;
        Ok(())
    }

    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn stage_mut(&mut self, name: &str) -> Option<&mut StageResult> {
        self.stages.iter_mut().find(|s| s.name == name)
    }

    /// Name of the failed stage, if the run failed.
    pub fn failed_stage(&self) -> Option<&str> {
        match &self.status {
            RunStatus::Failed { stage, .. } => Some(stage),
            _ => None,
        }
    }
}
