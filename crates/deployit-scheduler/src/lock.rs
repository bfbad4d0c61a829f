//! Per-pipeline run lock.
//!
//! Two runs of the same pipeline would race to apply templates to the same
//! target, so they are serialized. Runs of different pipelines are not.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct RunLock {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

/// Held for the lifetime of a run.
#[derive(Debug)]
pub struct RunGuard {
    pipeline: String,
    _guard: OwnedMutexGuard<()>,
}

impl RunGuard {
    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }
}

impl RunLock {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, pipeline: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(pipeline.to_string())
            .or_default()
            .clone()
    }

    /// Wait until no other run of `pipeline` holds the lock.
    pub async fn acquire(&self, pipeline: &str) -> RunGuard {
        let slot = self.slot(pipeline).await;
        let guard = match slot.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                debug!(pipeline = %pipeline, "Waiting for the previous run to finish");
                slot.lock_owned().await
            }
        };
        RunGuard {
            pipeline: pipeline.to_string(),
            _guard: guard,
        }
    }

    pub async fn try_acquire(&self, pipeline: &str) -> Option<RunGuard> {
        let guard = self.slot(pipeline).await.try_lock_owned().ok()?;
        Some(RunGuard {
            pipeline: pipeline.to_string(),
            _guard: guard,
        })
    }

    pub async fn is_locked(&self, pipeline: &str) -> bool {
        match self.locks.lock().await.get(pipeline) {
            Some(slot) => slot.try_lock().is_err(),
            None => false,
        }
    }
}
