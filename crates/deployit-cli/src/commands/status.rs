//! Deploy target status.

use anyhow::{Context, Result};
use deployit_config::SystemConfig;
use deployit_scheduler::runtime;

pub async fn status(config: &SystemConfig, target: &str, json: bool) -> Result<()> {
    let deployer = runtime::deployer(&config.deployer);
    let state = deployer
        .describe(target)
        .await
        .with_context(|| format!("Failed to describe target '{}'", target))?;

    let Some(state) = state else {
        if json {
            println!("null");
        }
        anyhow::bail!("Target '{}' does not exist ({} engine)", target, deployer.name());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    println!("Target:    {}", state.target);
    println!("Status:    {}", state.status);
    println!("Revision:  {}", state.revision);
    println!("Updated:   {}", state.updated_at.to_rfc3339());
    if let Some(digest) = &state.template_digest {
        println!("Template:  sha256:{}", digest);
    }
    println!("Resources: {}", state.resources.len());
    for resource in &state.resources {
        println!("  - {}", resource);
    }
    Ok(())
}
