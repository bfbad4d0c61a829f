//! Application state.

use deployit_core::pipeline::Pipeline;
use deployit_scheduler::{RunHistory, RunQueue};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub pipelines: Arc<BTreeMap<String, Arc<Pipeline>>>,
    pub queue: Arc<RunQueue>,
    pub history: RunHistory,
    /// Push webhooks must be signed with this secret when set.
    pub webhook_secret: Option<Arc<str>>,
}

impl AppState {
    pub fn new(
        pipelines: impl IntoIterator<Item = Arc<Pipeline>>,
        queue: Arc<RunQueue>,
        history: RunHistory,
    ) -> Self {
        Self {
            pipelines: Arc::new(
                pipelines
                    .into_iter()
                    .map(|p| (p.name().to_string(), p))
                    .collect(),
            ),
            queue,
            history,
            webhook_secret: None,
        }
    }

    pub fn with_webhook_secret(mut self, secret: Option<String>) -> Self {
        self.webhook_secret = secret.map(Arc::from);
        self
    }

    pub fn pipeline(&self, name: &str) -> Option<&Arc<Pipeline>> {
        self.pipelines.get(name)
    }

    /// Pipelines watching `full_name` (`owner/repo`, case-insensitive) at
    /// `branch`.
    pub fn pipelines_watching<'a>(
        &'a self,
        full_name: &'a str,
        branch: &'a str,
    ) -> impl Iterator<Item = &'a Arc<Pipeline>> + 'a {
        self.pipelines.values().filter(move |p| {
            let source = p.source();
            source.full_name().eq_ignore_ascii_case(full_name) && source.branch == branch
        })
    }
}
