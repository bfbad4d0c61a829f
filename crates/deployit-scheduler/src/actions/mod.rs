//! Stage actions. Each runs to completion once started; cancellation is
//! only honoured between stages.

pub mod build;
pub mod deploy;
pub mod source;

use deployit_config::VariableContext;
use deployit_core::RunId;
use deployit_core::artifact::ArtifactStore;
use deployit_core::executor::{LogLine, LogStream};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::orchestrator::PipelineEvent;

/// What an action sees of the run it belongs to.
#[derive(Clone)]
pub struct StageContext {
    pub run_id: RunId,
    pub stage: String,
    /// Variables positioned at this stage.
    pub vars: VariableContext,
    /// Pipeline-level environment, before interpolation.
    pub env: BTreeMap<String, String>,
    pub store: Arc<dyn ArtifactStore>,
    pub events: mpsc::Sender<PipelineEvent>,
}

impl StageContext {
    /// Forward a log line to the run's event stream with secrets masked.
    pub async fn log(&self, mut line: LogLine) {
        line.content = self.vars.mask(&line.content);
        let _ = self
            .events
            .send(PipelineEvent::StageLog {
                stage: self.stage.clone(),
                line,
            })
            .await;
    }

    pub async fn system(&self, message: impl Into<String>) {
        self.log(LogLine::new(LogStream::System, message)).await;
    }
}
