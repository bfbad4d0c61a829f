//! Source action: snapshot the watched branch into an artifact.

use deployit_core::artifact::Artifact;
use deployit_core::pipeline::{Action, SourceAction};
use deployit_core::source::{Revision, SourceFetcher};
use deployit_core::{Error, Result};
use tracing::info;

use super::StageContext;

/// Snapshot `requested`, or the current head when no revision was given.
pub async fn run(
    ctx: &StageContext,
    fetcher: &dyn SourceFetcher,
    action: &Action,
    source: &SourceAction,
    requested: Option<&Revision>,
) -> Result<(Revision, Artifact)> {
    let output = action.outputs.first().ok_or_else(|| {
        Error::Internal(format!("source action '{}' declares no output", action.name))
    })?;

    let revision = match requested {
        Some(revision) => revision.clone(),
        None => fetcher.head(&source.source).await?,
    };
    ctx.system(format!("Fetching {} at {}", source.source, revision.short()))
        .await;

    let snapshot = fetcher.snapshot(&source.source, &revision).await?;
    let artifact = Artifact::new(output.clone(), "", snapshot.files);
    if artifact.is_empty() {
        return Err(Error::EmptyArtifact(format!(
            "source {} at {} has no content",
            source.source,
            revision.short()
        )));
    }

    info!(
        run_id = %ctx.run_id,
        stage = %ctx.stage,
        action = %action.name,
        revision = %snapshot.revision.short(),
        files = artifact.files().len(),
        "Source snapshot ready"
    );
    Ok((snapshot.revision, artifact))
}
