//! Build specifications: phased command lists plus the artifact-selection
//! rule that decides which files become the build output.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::{Error, Result};

/// Build phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    Install,
    PreBuild,
    Build,
    PostBuild,
}

impl PhaseName {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseName::Install => "install",
            PhaseName::PreBuild => "pre_build",
            PhaseName::Build => "build",
            PhaseName::PostBuild => "post_build",
        }
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PhaseName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "install" => Ok(PhaseName::Install),
            "pre_build" => Ok(PhaseName::PreBuild),
            "build" => Ok(PhaseName::Build),
            "post_build" => Ok(PhaseName::PostBuild),
            _ => Err(Error::config(format!("unknown build phase: {}", s))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub name: PhaseName,
    pub commands: Vec<String>,
}

/// Which files of the build workspace form the output artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSelection {
    /// Directory (relative to the workspace) the patterns are rooted at.
    pub base_directory: Option<String>,
    /// Glob patterns: `*` and `?` stay within one path segment, `**`
    /// crosses segments.
    pub files: Vec<String>,
    /// Store matched files by file name only.
    pub discard_paths: bool,
}

impl ArtifactSelection {
    pub fn files<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            base_directory: None,
            files: patterns.into_iter().map(Into::into).collect(),
            discard_paths: false,
        }
    }

    pub fn with_base_directory(mut self, dir: impl Into<String>) -> Self {
        self.base_directory = Some(dir.into());
        self
    }

    pub fn with_discard_paths(mut self, discard: bool) -> Self {
        self.discard_paths = discard;
        self
    }

    /// Base directory with `.` and empty values normalized away.
    pub fn base(&self) -> Option<&str> {
        self.base_directory
            .as_deref()
            .map(|d| d.trim_end_matches('/'))
            .filter(|d| !d.is_empty() && *d != ".")
    }

    pub fn validate(&self) -> Result<()> {
        if self.files.is_empty() {
            return Err(Error::config("artifact selection declares no files"));
        }
        if let Some(base) = self.base() {
            check_relative(base, "base directory")?;
        }
        for pattern in &self.files {
            if pattern.trim().is_empty() {
                return Err(Error::config("artifact selection has an empty pattern"));
            }
            check_relative(pattern, "file pattern")?;
        }
        self.compile().map(|_| ())
    }

    pub fn compile(&self) -> Result<SelectionMatcher> {
        let patterns = self
            .files
            .iter()
            .map(|p| glob_to_regex(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(SelectionMatcher { patterns })
    }

    /// Whether `path`, as it would appear inside the output artifact, can be
    /// produced by this rule.
    pub fn selects(&self, path: &str) -> Result<bool> {
        if !self.discard_paths {
            return Ok(self.compile()?.is_match(path));
        }
        if path.contains('/') {
            return Ok(false);
        }
        // With discarded paths only the last segment of a pattern constrains
        // the stored name.
        for pattern in &self.files {
            let last = pattern.rsplit('/').next().unwrap_or(pattern);
            let last = if last == "**" { "*" } else { last };
            if glob_to_regex(last)?.is_match(path) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn check_relative(path: &str, what: &str) -> Result<()> {
    if path.starts_with('/') || path.split('/').any(|seg| seg == "..") {
        return Err(Error::config(format!(
            "{} '{}' must stay inside the build workspace",
            what, path
        )));
    }
    Ok(())
}

/// Compiled form of an [`ArtifactSelection`]'s patterns.
#[derive(Debug, Clone)]
pub struct SelectionMatcher {
    patterns: Vec<Regex>,
}

impl SelectionMatcher {
    /// `path` is relative to the selection's base directory, `/`-separated.
    pub fn is_match(&self, path: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(path))
    }
}

fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let pattern = pattern.trim_start_matches("./");
    let mut re = String::from("^");
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    // `**/` matches zero or more whole directories
                    re.push_str("(?:[^/]+/)*");
                    i += 3;
                } else {
                    re.push_str(".*");
                    i += 2;
                }
            }
            '*' => {
                re.push_str("[^/]*");
                i += 1;
            }
            '?' => {
                re.push_str("[^/]");
                i += 1;
            }
            c => {
                re.push_str(&regex::escape(&c.to_string()));
                i += 1;
            }
        }
    }
    re.push('$');
    Regex::new(&re)
        .map_err(|e| Error::config(format!("invalid file pattern '{}': {}", pattern, e)))
}

/// Declarative description of a build: ordered phases and the output rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    pub version: String,
    pub env: BTreeMap<String, String>,
    pub phases: Vec<Phase>,
    pub artifacts: ArtifactSelection,
}

impl BuildSpec {
    pub fn new(artifacts: ArtifactSelection) -> Self {
        Self {
            version: "0.2".to_string(),
            env: BTreeMap::new(),
            phases: Vec::new(),
            artifacts,
        }
    }

    /// Append commands to a phase, creating it if needed.
    pub fn with_phase<I, S>(mut self, name: PhaseName, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let commands = commands.into_iter().map(Into::into);
        match self.phases.iter_mut().find(|p| p.name == name) {
            Some(phase) => phase.commands.extend(commands),
            None => self.phases.push(Phase {
                name,
                commands: commands.collect(),
            }),
        }
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn commands(&self) -> impl Iterator<Item = (PhaseName, &str)> {
        self.phases
            .iter()
            .flat_map(|p| p.commands.iter().map(move |c| (p.name, c.as_str())))
    }

    pub fn validate(&self) -> Result<()> {
        for pair in self.phases.windows(2) {
            if pair[0].name >= pair[1].name {
                return Err(Error::config(format!(
                    "build phase '{}' must come before '{}' and appear once",
                    pair[1].name, pair[0].name
                )));
            }
        }
        if self.commands().next().is_none() {
            return Err(Error::config("build specification has no commands"));
        }
        self.artifacts.validate()
    }

    /// Render the phases as one POSIX shell script. Every command is followed
    /// by its own status check, so the first non-zero exit ends the script and
    /// no later command or phase runs, including failures inside `&&` and `||`
    /// lists.
    pub fn script(&self) -> String {
        let mut script = String::new();
        for phase in &self.phases {
            if phase.commands.is_empty() {
                continue;
            }
            script.push_str(&format!("echo '--- phase: {}'\n", phase.name));
            for command in &phase.commands {
                script.push_str(command);
                script.push('\n');
                script.push_str(STATUS_CHECK);
                script.push('\n');
            }
        }
        script
    }
}

/// Kept on its own line so a trailing `# comment` in a command cannot hide it.
const STATUS_CHECK: &str = r#"__rc=$?; if [ "$__rc" -ne 0 ]; then exit "$__rc"; fi"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_file_pattern() {
        let rule = ArtifactSelection::files(["CdkLab3Stack.template.json"]);
        let matcher = rule.compile().unwrap();
        assert!(matcher.is_match("CdkLab3Stack.template.json"));
        assert!(!matcher.is_match("Other.template.json"));
        assert!(!matcher.is_match("nested/CdkLab3Stack.template.json"));
    }

    #[test]
    fn test_star_stays_in_segment() {
        let matcher = ArtifactSelection::files(["*.template.json"]).compile().unwrap();
        assert!(matcher.is_match("A.template.json"));
        assert!(!matcher.is_match("dir/A.template.json"));
    }

    #[test]
    fn test_double_star_crosses_segments() {
        let matcher = ArtifactSelection::files(["**/*"]).compile().unwrap();
        assert!(matcher.is_match("a.txt"));
        assert!(matcher.is_match("a/b/c.txt"));

        let matcher = ArtifactSelection::files(["assets/**"]).compile().unwrap();
        assert!(matcher.is_match("assets/x/y.bin"));
        assert!(!matcher.is_match("other/x"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let matcher = ArtifactSelection::files(["out(1).txt"]).compile().unwrap();
        assert!(matcher.is_match("out(1).txt"));
        assert!(!matcher.is_match("out1.txt"));
    }

    #[test]
    fn test_selection_validation() {
        assert!(ArtifactSelection::default().validate().is_err());
        assert!(ArtifactSelection::files(["../secret"]).validate().is_err());
        assert!(ArtifactSelection::files(["/etc/passwd"]).validate().is_err());
        assert!(ArtifactSelection::files([" "]).validate().is_err());
        assert!(
            ArtifactSelection::files(["a.json"])
                .with_base_directory("../up")
                .validate()
                .is_err()
        );
        assert!(
            ArtifactSelection::files(["a.json"])
                .with_base_directory("cdk.out")
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_selects_with_discarded_paths() {
        let rule = ArtifactSelection::files(["dist/**/*.json"]).with_discard_paths(true);
        assert!(rule.selects("stack.json").unwrap());
        assert!(!rule.selects("dist/stack.json").unwrap());
        assert!(!rule.selects("stack.yaml").unwrap());
    }

    #[test]
    fn test_base_normalization() {
        assert_eq!(ArtifactSelection::files(["a"]).with_base_directory(".").base(), None);
        assert_eq!(
            ArtifactSelection::files(["a"]).with_base_directory("cdk.out/").base(),
            Some("cdk.out")
        );
    }

    #[test]
    fn test_phase_order_enforced() {
        let spec = BuildSpec::new(ArtifactSelection::files(["out.txt"]))
            .with_phase(PhaseName::Build, ["make"])
            .with_phase(PhaseName::Install, ["apt-get install -y make"]);
        assert!(spec.validate().is_err());

        let spec = BuildSpec::new(ArtifactSelection::files(["out.txt"]))
            .with_phase(PhaseName::Install, ["apt-get install -y make"])
            .with_phase(PhaseName::Build, ["make"]);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_with_phase_appends() {
        let spec = BuildSpec::new(ArtifactSelection::files(["out.txt"]))
            .with_phase(PhaseName::Build, ["a"])
            .with_phase(PhaseName::Build, ["b"]);
        assert_eq!(spec.phases.len(), 1);
        assert_eq!(spec.phases[0].commands, vec!["a", "b"]);
    }

    #[test]
    fn test_spec_without_commands_is_invalid() {
        let spec = BuildSpec::new(ArtifactSelection::files(["out.txt"]));
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_script_rendering() {
        let spec = BuildSpec::new(ArtifactSelection::files(["out.txt"]))
            .with_phase(PhaseName::Install, ["npm install -g aws-cdk"])
            .with_phase(PhaseName::Build, ["cdk synth", "echo done"]);
        assert_eq!(
            spec.script(),
            format!(
                "echo '--- phase: install'\n\
                 npm install -g aws-cdk\n{check}\n\
                 echo '--- phase: build'\n\
                 cdk synth\n{check}\n\
                 echo done\n{check}\n",
                check = STATUS_CHECK
            )
        );
    }

    #[test]
    fn test_script_checks_every_command() {
        let spec = BuildSpec::new(ArtifactSelection::files(["out.txt"]))
            .with_phase(PhaseName::Build, ["test -f x && echo found # look for x"]);
        let script = spec.script();
        let lines: Vec<_> = script.lines().collect();
        assert_eq!(lines[1], "test -f x && echo found # look for x");
        assert_eq!(lines[2], STATUS_CHECK);
        assert!(!script.contains("set -e"));
    }

    #[test]
    fn test_phase_name_parsing() {
        assert_eq!("pre-build".parse::<PhaseName>().unwrap(), PhaseName::PreBuild);
        assert_eq!("POST_BUILD".parse::<PhaseName>().unwrap(), PhaseName::PostBuild);
        assert!("deploy".parse::<PhaseName>().is_err());
    }
}
