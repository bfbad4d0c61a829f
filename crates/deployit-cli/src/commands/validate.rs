//! Pipeline definition validation.

use anyhow::Result;
use deployit_config::load_pipeline;
use serde_json::json;
use std::path::Path;

pub fn validate(path: &Path, json: bool) -> Result<()> {
    let pipeline = match load_pipeline(path) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            if json {
                println!("{}", json!({ "valid": false, "error": e.to_string() }));
            }
            anyhow::bail!("Configuration error in {}: {}", path.display(), e);
        }
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({ "valid": true, "pipeline": pipeline }))?
        );
        return Ok(());
    }

    println!("Configuration is valid");
    println!(
        "Pipeline '{}' watching {}",
        pipeline.name(),
        pipeline.source()
    );
    for stage in pipeline.stages() {
        let kind = stage.kind().map(|k| k.to_string()).unwrap_or_default();
        let actions: Vec<&str> = stage.actions.iter().map(|a| a.name.as_str()).collect();
        println!("  {} [{}]: {}", stage.name, kind, actions.join(", "));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) const DEMO_PIPELINE: &str = r#"
pipeline "demo"

stage "Source" {
    source "Checkout" output="src" {
        owner "acme"
        repo "demo"
        branch "main"
    }
}

stage "Build" {
    build "Synth" input="src" output="out" {
        image "alpine:latest"
        phase "build" {
            run "echo hello > out.txt"
        }
        artifacts {
            files "out.txt"
        }
    }
}

stage "Deploy" {
    deploy "Apply" target="demo-stack" {
        template artifact="out" path="out.txt"
    }
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deployit.kdl");
        std::fs::write(&path, DEMO_PIPELINE).unwrap();
        validate(&path, false).unwrap();
        validate(&path, true).unwrap();
    }

    #[test]
    fn test_template_outside_selection_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deployit.kdl");
        std::fs::write(&path, DEMO_PIPELINE.replace("path=\"out.txt\"", "path=\"other.json\""))
            .unwrap();
        let err = validate(&path, false).unwrap_err();
        assert!(err.to_string().contains("Configuration error"));
    }
}
