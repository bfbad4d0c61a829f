//! Pipeline configuration parsing.
//!
//! ```kdl
//! pipeline "cdk-lab3"
//!
//! stage "Source" {
//!     source "GitHub_Source" output="source_output" {
//!         owner "acme"
//!         repo "infra"
//!         branch "main"
//!         connection "arn:aws:codestar-connections:us-east-1:123:connection/abc"
//!     }
//! }
//!
//! stage "Build" {
//!     build "Build" input="source_output" output="build_output" {
//!         image "aws/codebuild/standard:7.0"
//!         phase "install" {
//!             run "npm install -g aws-cdk"
//!         }
//!         phase "build" {
//!             run "npx cdk synth"
//!         }
//!         artifacts base-directory="cdk.out" {
//!             files "CdkLab3Stack.template.json"
//!         }
//!     }
//! }
//!
//! stage "Deploy" {
//!     deploy "Deploy" target="CdkLab3Stack" {
//!         template artifact="build_output" path="CdkLab3Stack.template.json"
//!         admin-permissions #true
//!     }
//! }
//! ```
//!
//! A build action may instead reference a YAML file with
//! `buildspec="buildspec.yml"`, resolved relative to the pipeline file.

use crate::buildspec::load_buildspec;
use crate::{ConfigError, ConfigResult};
use deployit_core::artifact::ArtifactName;
use deployit_core::buildspec::{ArtifactSelection, BuildSpec, PhaseName};
use deployit_core::pipeline::{Action, BuildAction, DeployAction, Pipeline, Stage};
use deployit_core::source::{GitProvider, SourceRef};
use kdl::{KdlDocument, KdlNode};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Parse a pipeline configuration from KDL text. Buildspec file references
/// resolve against the current directory.
pub fn parse_pipeline(kdl: &str) -> ConfigResult<Pipeline> {
    parse_pipeline_in(kdl, Path::new("."))
}

/// Read a pipeline file; buildspec references resolve next to it.
pub fn load_pipeline(path: &Path) -> ConfigResult<Pipeline> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    parse_pipeline_in(&text, base)
}

fn parse_pipeline_in(kdl: &str, base: &Path) -> ConfigResult<Pipeline> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = String::new();
    let mut stages = Vec::new();
    let mut env = BTreeMap::new();

    for node in doc.nodes() {
        match node.name().value() {
            "pipeline" => {
                name = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;
            }
            "stage" => {
                stages.push(parse_stage(node, base)?);
            }
            "env" => {
                env.extend(parse_env_block(node));
            }
            _ => {} // Ignore unknown nodes
        }
    }

    if name.is_empty() {
        return Err(ConfigError::MissingField("pipeline name".to_string()));
    }

    Ok(Pipeline::new(name, stages, env)?)
}

fn parse_stage(node: &KdlNode, base: &Path) -> ConfigResult<Stage> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("stage name".to_string()))?;

    let mut actions = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let action = match child.name().value() {
                "source" => parse_source_action(child)?,
                "build" => parse_build_action(child, base)?,
                "deploy" => parse_deploy_action(child)?,
                other => {
                    return Err(ConfigError::invalid(
                        format!("stage '{}'", name),
                        format!("unknown action type: {}", other),
                    ));
                }
            };
            actions.push(action);
        }
    }

    Ok(Stage::new(name, actions))
}

fn action_name(node: &KdlNode) -> ConfigResult<String> {
    get_first_string_arg(node).ok_or_else(|| {
        ConfigError::MissingField(format!("{} action name", node.name().value()))
    })
}

fn artifact_prop(node: &KdlNode, prop: &str, action: &str) -> ConfigResult<ArtifactName> {
    let value = get_string_prop(node, prop)
        .ok_or_else(|| ConfigError::MissingField(format!("{} of action '{}'", prop, action)))?;
    Ok(ArtifactName::new(value)?)
}

fn parse_source_action(node: &KdlNode) -> ConfigResult<Action> {
    let name = action_name(node)?;
    let output = artifact_prop(node, "output", &name)?;

    let mut provider = GitProvider::default();
    let mut owner = None;
    let mut repo = None;
    let mut branch = None;
    let mut connection = None;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "provider" => {
                    let value = get_first_string_arg(child).unwrap_or_default();
                    provider = value
                        .parse()
                        .map_err(|e: String| ConfigError::invalid("provider", e))?;
                }
                "owner" => owner = get_first_string_arg(child),
                "repo" | "repository" => repo = get_first_string_arg(child),
                "branch" => branch = get_first_string_arg(child),
                "connection" => connection = get_first_string_arg(child),
                _ => {}
            }
        }
    }

    let missing = |field: &str| ConfigError::MissingField(format!("{} of action '{}'", field, name));
    let mut source = SourceRef::github(
        owner.ok_or_else(|| missing("owner"))?,
        repo.ok_or_else(|| missing("repo"))?,
        branch.unwrap_or_else(|| "main".to_string()),
    );
    source.provider = provider;
    if let Some(connection) = connection {
        source = source.with_connection(connection);
    }

    Ok(Action::source(name, source, output))
}

fn parse_build_action(node: &KdlNode, base: &Path) -> ConfigResult<Action> {
    let name = action_name(node)?;
    let input = artifact_prop(node, "input", &name)?;
    let output = artifact_prop(node, "output", &name)?;

    let mut image = String::new();
    let mut privileged = false;
    let mut extra_inputs = Vec::new();
    let mut env = BTreeMap::new();
    let mut phases: Vec<(PhaseName, Vec<String>)> = Vec::new();
    let mut selection = None;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "image" => {
                    image = get_first_string_arg(child).unwrap_or_default();
                }
                "privileged" => {
                    privileged = get_first_bool_arg(child).unwrap_or(true);
                }
                "input" => {
                    for extra in get_all_string_args(child) {
                        extra_inputs.push(ArtifactName::new(extra)?);
                    }
                }
                "env" => {
                    env.extend(parse_env_block(child));
                }
                "phase" => {
                    let phase = get_first_string_arg(child)
                        .ok_or_else(|| ConfigError::MissingField("phase name".to_string()))?;
                    let phase: PhaseName = phase.parse()?;
                    let commands = child
                        .children()
                        .map(|c| {
                            c.nodes()
                                .iter()
                                .filter(|n| n.name().value() == "run")
                                .filter_map(get_first_string_arg)
                                .collect()
                        })
                        .unwrap_or_default();
                    phases.push((phase, commands));
                }
                "artifacts" => {
                    selection = Some(parse_selection(child));
                }
                _ => {}
            }
        }
    }

    if image.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "image for build action '{}'",
            name
        )));
    }

    let mut spec = match get_string_prop(node, "buildspec") {
        Some(file) => {
            if !phases.is_empty() || selection.is_some() {
                return Err(ConfigError::invalid(
                    format!("build action '{}'", name),
                    "use either buildspec= or inline phases and artifacts, not both",
                ));
            }
            load_buildspec(&resolve(base, &file))?
        }
        None => {
            let selection = selection.ok_or_else(|| {
                ConfigError::MissingField(format!("artifacts of build action '{}'", name))
            })?;
            // keep declaration order so out-of-order phases fail validation
            let mut spec = BuildSpec::new(selection);
            for (phase, commands) in phases {
                if spec.phases.iter().any(|p| p.name == phase) {
                    return Err(ConfigError::Duplicate(format!(
                        "phase '{}' in build action '{}'",
                        phase, name
                    )));
                }
                spec = spec.with_phase(phase, commands);
            }
            spec
        }
    };
    for (key, value) in env {
        spec = spec.with_env(key, value);
    }

    let mut action = Action::build(
        name,
        input,
        output,
        BuildAction {
            image,
            privileged,
            spec,
        },
    );
    for extra in extra_inputs {
        action = action.with_input(extra);
    }
    Ok(action)
}

fn parse_selection(node: &KdlNode) -> ArtifactSelection {
    let mut files = get_string_list_prop(node, "files");
    if files.is_empty() {
        files = get_all_string_args(node);
    }
    let mut selection = ArtifactSelection::files(files)
        .with_discard_paths(get_bool_prop(node, "discard-paths").unwrap_or(false));
    if let Some(base) = get_string_prop(node, "base-directory") {
        selection = selection.with_base_directory(base);
    }
    selection
}

fn parse_deploy_action(node: &KdlNode) -> ConfigResult<Action> {
    let name = action_name(node)?;
    let target = get_string_prop(node, "target")
        .ok_or_else(|| ConfigError::MissingField(format!("target of action '{}'", name)))?;

    let mut template = None;
    let mut role = None;
    let mut admin_permissions = false;
    let mut capabilities = Vec::new();
    let mut parameters = BTreeMap::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "template" => {
                    let artifact = artifact_prop(child, "artifact", &name)?;
                    let path = get_string_prop(child, "path").ok_or_else(|| {
                        ConfigError::MissingField(format!("template path of action '{}'", name))
                    })?;
                    template = Some(artifact.at_path(path));
                }
                "role" => role = get_first_string_arg(child),
                "admin-permissions" => {
                    admin_permissions = get_first_bool_arg(child).unwrap_or(true);
                }
                "capabilities" => capabilities.extend(get_all_string_args(child)),
                "parameter" => {
                    let args = get_all_string_args(child);
                    match args.as_slice() {
                        [key, value] => {
                            if parameters.insert(key.clone(), value.clone()).is_some() {
                                return Err(ConfigError::Duplicate(format!(
                                    "parameter '{}' of action '{}'",
                                    key, name
                                )));
                            }
                        }
                        _ => {
                            return Err(ConfigError::invalid(
                                "parameter",
                                "expected: parameter \"Key\" \"value\"",
                            ));
                        }
                    }
                }
                _ => {}
            }
        }
    }

    let template = template
        .ok_or_else(|| ConfigError::MissingField(format!("template of action '{}'", name)))?;

    let mut deploy = DeployAction::new(target, template);
    deploy.role = role;
    deploy.admin_permissions = admin_permissions;
    deploy.capabilities = capabilities;
    deploy.parameters = parameters;
    Ok(Action::deploy(name, deploy))
}

fn parse_env_block(node: &KdlNode) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let key = child.name().value().to_string();
            if let Some(val) = get_first_string_arg(child) {
                env.insert(key, val);
            }
        }
    }
    env
}

fn resolve(base: &Path, file: &str) -> PathBuf {
    let path = Path::new(file);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

// Helper functions for extracting values from KDL nodes, shared with the
// system configuration parser.

pub(crate) fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_first_bool_arg(node: &KdlNode) -> Option<bool> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_bool())
}

pub(crate) fn get_first_int_arg(node: &KdlNode) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
}

pub(crate) fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

pub(crate) fn get_int_prop(node: &KdlNode, name: &str) -> Option<i128> {
    node.get(name).and_then(|v| v.as_integer())
}

fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let mut result = Vec::new();

    // Repeated attributes like files="a" files="b"
    for entry in node.entries() {
        if let Some(entry_name) = entry.name() {
            if entry_name.value() == name {
                if let Some(s) = entry.value().as_string() {
                    result.push(s.to_string());
                }
            }
        }
    }

    if !result.is_empty() {
        return result;
    }

    // Block syntax: every child named `name` contributes its arguments
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == name {
                result.extend(get_all_string_args(child));
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use deployit_core::pipeline::{ActionKind, StageKind};

    const CDK_PIPELINE: &str = r#"
        pipeline "cdk-lab3"

        env {
            REGION "us-east-1"
        }

        stage "Source" {
            source "GitHub_Source" output="source_output" {
                owner "Deepak-Tamizhalagan"
                repo "cdk-lab3-aws-pipeline"
                branch "main"
                connection "arn:aws:codestar-connections:us-east-1:123456789012:connection/abc"
            }
        }

        stage "Build" {
            build "Build" input="source_output" output="build_output" {
                image "aws/codebuild/standard:7.0"
                privileged #true
                phase "install" {
                    run "npm install -g aws-cdk"
                    run "npm ci"
                }
                phase "build" {
                    run "npx cdk synth"
                }
                artifacts base-directory="cdk.out" {
                    files "CdkLab3Stack.template.json"
                }
            }
        }

        stage "Deploy" {
            deploy "Deploy" target="CdkLab3Stack" {
                template artifact="build_output" path="CdkLab3Stack.template.json"
                admin-permissions #true
                parameter "Env" "prod"
            }
        }
    "#;

    fn config_message(result: ConfigResult<Pipeline>) -> String {
        match result {
            Err(ConfigError::Pipeline(deployit_core::Error::Configuration(msg))) => msg,
            Err(other) => panic!("expected pipeline configuration error, got {}", other),
            Ok(p) => panic!("expected an error, pipeline '{}' parsed", p.name()),
        }
    }

    #[test]
    fn test_parse_cdk_pipeline() {
        let pipeline = parse_pipeline(CDK_PIPELINE).unwrap();
        assert_eq!(pipeline.name(), "cdk-lab3");
        assert_eq!(pipeline.env()["REGION"], "us-east-1");

        let kinds: Vec<_> = pipeline.stages().iter().map(|s| s.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                Some(StageKind::Source),
                Some(StageKind::Build),
                Some(StageKind::Deploy)
            ]
        );

        let source = pipeline.source();
        assert_eq!(source.full_name(), "Deepak-Tamizhalagan/cdk-lab3-aws-pipeline");
        assert!(source.connection.is_some());

        let ActionKind::Build(build) = &pipeline.stages()[1].actions[0].kind else {
            panic!("expected build action");
        };
        assert!(build.privileged);
        assert_eq!(build.spec.commands().count(), 3);
        assert_eq!(build.spec.artifacts.base(), Some("cdk.out"));

        let ActionKind::Deploy(deploy) = &pipeline.stages()[2].actions[0].kind else {
            panic!("expected deploy action");
        };
        assert_eq!(deploy.target, "CdkLab3Stack");
        assert_eq!(deploy.template.path, "CdkLab3Stack.template.json");
        assert!(deploy.admin_permissions);
        assert_eq!(deploy.parameters["Env"], "prod");
    }

    #[test]
    fn test_missing_pipeline_name() {
        let result = parse_pipeline(r#"stage "Source" {}"#);
        assert!(matches!(result, Err(ConfigError::MissingField(_))));
    }

    #[test]
    fn test_deploy_before_build_rejected() {
        let kdl = r#"
            pipeline "bad"
            stage "Source" {
                source "Src" output="src" { owner "a"; repo "b" }
            }
            stage "Deploy" {
                deploy "Deploy" target="stack" {
                    template artifact="out" path="out.txt"
                }
            }
            stage "Build" {
                build "Build" input="src" output="out" {
                    image "alpine"
                    phase "build" { run "echo hello > out.txt"; }
                    artifacts { files "out.txt"; }
                }
            }
        "#;
        let msg = config_message(parse_pipeline(kdl));
        assert!(msg.contains("last stage"), "{}", msg);
    }

    #[test]
    fn test_template_not_selected_rejected() {
        let kdl = r#"
            pipeline "drift"
            stage "Source" {
                source "Src" output="src" { owner "a"; repo "b" }
            }
            stage "Build" {
                build "Build" input="src" output="out" {
                    image "alpine"
                    phase "build" { run "make"; }
                    artifacts { files "Stack.template.json"; }
                }
            }
            stage "Deploy" {
                deploy "Deploy" target="stack" {
                    template artifact="out" path="cdk.out/Stack.template.json"
                }
            }
        "#;
        let msg = config_message(parse_pipeline(kdl));
        assert!(msg.contains("would not be selected"), "{}", msg);
    }

    #[test]
    fn test_out_of_order_phases_rejected() {
        let kdl = r#"
            pipeline "phases"
            stage "Source" {
                source "Src" output="src" { owner "a"; repo "b" }
            }
            stage "Build" {
                build "Build" input="src" output="out" {
                    image "alpine"
                    phase "build" { run "make"; }
                    phase "install" { run "apk add make"; }
                    artifacts { files "out.txt"; }
                }
            }
            stage "Deploy" {
                deploy "Deploy" target="stack" {
                    template artifact="out" path="out.txt"
                }
            }
        "#;
        let msg = config_message(parse_pipeline(kdl));
        assert!(msg.contains("must come before"), "{}", msg);
    }

    #[test]
    fn test_missing_image() {
        let kdl = r#"
            pipeline "noimage"
            stage "Build" {
                build "Build" input="src" output="out" {
                    artifacts { files "out.txt"; }
                }
            }
        "#;
        assert!(matches!(
            parse_pipeline(kdl),
            Err(ConfigError::MissingField(_))
        ));
    }

    #[test]
    fn test_unknown_action_type() {
        let kdl = r#"
            pipeline "bad"
            stage "Test" {
                approve "Manual"
            }
        "#;
        assert!(matches!(
            parse_pipeline(kdl),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_buildspec_file_reference() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("buildspec.yml"),
            "phases:\n  build:\n    commands:\n      - echo hello > out.txt\nartifacts:\n  files:\n    - out.txt\n",
        )
        .unwrap();
        let pipeline_path = dir.path().join("pipeline.kdl");
        std::fs::write(
            &pipeline_path,
            r#"
            pipeline "from-file"
            stage "Source" {
                source "Src" output="src" { owner "a"; repo "b" }
            }
            stage "Build" {
                build "Build" input="src" output="out" buildspec="buildspec.yml" {
                    image "alpine"
                }
            }
            stage "Deploy" {
                deploy "Deploy" target="demo-stack" {
                    template artifact="out" path="out.txt"
                }
            }
            "#,
        )
        .unwrap();

        let pipeline = load_pipeline(&pipeline_path).unwrap();
        let ActionKind::Build(build) = &pipeline.stages()[1].actions[0].kind else {
            panic!("expected build action");
        };
        assert!(
            build
                .spec
                .script()
                .starts_with("echo '--- phase: build'\necho hello > out.txt\n")
        );
    }

    #[test]
    fn test_invalid_artifact_name() {
        let kdl = r#"
            pipeline "bad"
            stage "Source" {
                source "Src" output="src output" { owner "a"; repo "b" }
            }
        "#;
        assert!(matches!(parse_pipeline(kdl), Err(ConfigError::Pipeline(_))));
    }
}
