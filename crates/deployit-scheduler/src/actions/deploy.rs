//! Deploy action: hand the selected template to the provisioning engine.
//!
//! A rejected apply is never retried here; the operator decides what to do
//! with a bad template.

use deployit_core::deployer::{ApplyOutcome, DeployRequest, Deployer, Template};
use deployit_core::pipeline::{Action, DeployAction};
use deployit_core::{Error, Result};
use tracing::{info, warn};

use super::StageContext;

pub async fn run(
    ctx: &StageContext,
    deployer: &dyn Deployer,
    action: &Action,
    deploy: &DeployAction,
) -> Result<ApplyOutcome> {
    let template = &deploy.template;
    let artifact = match ctx.store.get(ctx.run_id, &template.artifact).await {
        Ok(artifact) => artifact,
        Err(Error::NotFound(_)) => {
            return Err(Error::MissingInput {
                stage: ctx.stage.clone(),
                artifact: template.artifact.to_string(),
            });
        }
        Err(e) => return Err(e),
    };
    let body = artifact
        .file(&template.path)
        .ok_or_else(|| Error::MissingInput {
            stage: ctx.stage.clone(),
            artifact: template.to_string(),
        })?
        .clone();

    let vars = &ctx.vars;
    let mut request = DeployRequest::new(
        vars.interpolate(&deploy.target),
        Template::new(template.path.clone(), body),
    );
    request.role = deploy.role.as_deref().map(|r| vars.interpolate(r));
    request.capabilities = deploy.effective_capabilities();
    request.parameters = vars.interpolate_map(&deploy.parameters);

    for warning in deployer.validate(&request).await? {
        warn!(
            stage = %ctx.stage,
            action = %action.name,
            field = %warning.field,
            "{}",
            warning.message
        );
        ctx.system(format!("warning: {}: {}", warning.field, warning.message))
            .await;
    }

    let stack = request.target.clone();
    info!(
        run_id = %ctx.run_id,
        stage = %ctx.stage,
        action = %action.name,
        stack = %stack,
        template = %template,
        digest = %request.template.digest(),
        engine = deployer.name(),
        "Applying template"
    );
    ctx.system(format!("Applying {} to {}", template, stack)).await;

    let outcome = deployer.apply(request).await?;

    info!(
        run_id = %ctx.run_id,
        stage = %ctx.stage,
        stack = %stack,
        result = %outcome.action,
        changes = outcome.changes.len(),
        status = %outcome.status,
        "Template applied"
    );
    ctx.system(format!(
        "{} {}: {} resource change(s), {}",
        stack,
        outcome.action,
        outcome.changes.len(),
        outcome.status
    ))
    .await;
    Ok(outcome)
}
