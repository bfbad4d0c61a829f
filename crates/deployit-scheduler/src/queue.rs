//! In-memory run queue with an explicit coalescing policy.

use chrono::{DateTime, Utc};
use deployit_config::QueuePolicy;
use deployit_core::pipeline::TriggerInfo;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use tokio::sync::{Mutex, Notify};
use tracing::info;

/// A request to run a pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerRequest {
    pub pipeline: String,
    pub trigger: TriggerInfo,
    pub requested_at: DateTime<Utc>,
}

impl TriggerRequest {
    pub fn new(pipeline: impl Into<String>, trigger: TriggerInfo) -> Self {
        Self {
            pipeline: pipeline.into(),
            trigger,
            requested_at: Utc::now(),
        }
    }
}

/// What `submit` did with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submitted {
    Queued { position: usize },
    /// A pending request for the same pipeline was replaced.
    Replaced { position: usize },
}

/// Pending trigger requests.
pub struct RunQueue {
    policy: QueuePolicy,
    pending: Mutex<VecDeque<TriggerRequest>>,
    notify: Notify,
}

impl RunQueue {
    pub fn new(policy: QueuePolicy) -> Self {
        Self {
            policy,
            pending: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn policy(&self) -> QueuePolicy {
        self.policy
    }

    /// Add a request. Under `LatestWins` a pending request for the same
    /// pipeline is replaced in place; under `SerializeAll` every request is
    /// kept in arrival order.
    pub async fn submit(&self, request: TriggerRequest) -> Submitted {
        let mut pending = self.pending.lock().await;

        let existing = match self.policy {
            QueuePolicy::LatestWins => pending.iter().position(|r| r.pipeline == request.pipeline),
            QueuePolicy::SerializeAll => None,
        };

        let submitted = match existing {
            Some(position) => {
                let previous = std::mem::replace(&mut pending[position], request);
                let current = &pending[position];
                info!(
                    pipeline = %current.pipeline,
                    replaced = %describe(&previous.trigger),
                    revision = %describe(&current.trigger),
                    "Newer trigger replaces pending run request"
                );
                Submitted::Replaced { position }
            }
            None => {
                info!(
                    pipeline = %request.pipeline,
                    trigger = %request.trigger.kind,
                    revision = %describe(&request.trigger),
                    "Queued run request"
                );
                pending.push_back(request);
                Submitted::Queued {
                    position: pending.len() - 1,
                }
            }
        };
        drop(pending);

        self.notify.notify_one();
        submitted
    }

    /// Take the oldest request whose pipeline is not in `busy`.
    pub async fn take_ready(&self, busy: &HashSet<String>) -> Option<TriggerRequest> {
        let mut pending = self.pending.lock().await;
        let position = pending.iter().position(|r| !busy.contains(&r.pipeline))?;
        pending.remove(position)
    }

    /// Wait until a request is submitted. A submission that happened while
    /// nobody was waiting is not lost.
    pub async fn changed(&self) {
        self.notify.notified().await;
    }

    pub async fn pending(&self) -> Vec<TriggerRequest> {
        self.pending.lock().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }
}

fn describe(trigger: &TriggerInfo) -> String {
    trigger
        .revision
        .as_ref()
        .map(|r| r.short().to_string())
        .unwrap_or_else(|| "head".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use deployit_core::pipeline::TriggerKind;
    use deployit_core::source::Revision;
    use std::time::Duration;

    fn push(pipeline: &str, rev: &str) -> TriggerRequest {
        TriggerRequest::new(pipeline, TriggerInfo::at(TriggerKind::Push, Revision::new(rev)))
    }

    fn revisions(requests: &[TriggerRequest]) -> Vec<String> {
        requests
            .iter()
            .map(|r| format!("{}@{}", r.pipeline, describe(&r.trigger)))
            .collect()
    }

    #[tokio::test]
    async fn test_latest_wins_replaces_pending() {
        let queue = RunQueue::new(QueuePolicy::LatestWins);
        assert_eq!(
            queue.submit(push("demo", "aaaaaaa1")).await,
            Submitted::Queued { position: 0 }
        );
        queue.submit(push("other", "ccccccc1")).await;
        assert_eq!(
            queue.submit(push("demo", "bbbbbbb1")).await,
            Submitted::Replaced { position: 0 }
        );

        assert_eq!(
            revisions(&queue.pending().await),
            vec!["demo@bbbbbbb", "other@ccccccc"]
        );
    }

    #[tokio::test]
    async fn test_serialize_all_keeps_every_request() {
        let queue = RunQueue::new(QueuePolicy::SerializeAll);
        queue.submit(push("demo", "aaaaaaa1")).await;
        queue.submit(push("demo", "bbbbbbb1")).await;

        assert_eq!(queue.len().await, 2);
        assert_eq!(
            revisions(&queue.pending().await),
            vec!["demo@aaaaaaa", "demo@bbbbbbb"]
        );
    }

    #[tokio::test]
    async fn test_take_ready_skips_busy_pipelines() {
        let queue = RunQueue::new(QueuePolicy::SerializeAll);
        queue.submit(push("demo", "aaaaaaa1")).await;
        queue.submit(push("other", "ccccccc1")).await;

        let busy: HashSet<String> = ["demo".to_string()].into();
        let next = queue.take_ready(&busy).await.unwrap();
        assert_eq!(next.pipeline, "other");
        assert!(queue.take_ready(&busy).await.is_none());

        let next = queue.take_ready(&HashSet::new()).await.unwrap();
        assert_eq!(next.pipeline, "demo");
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_submit_wakes_waiter() {
        let queue = RunQueue::new(QueuePolicy::default());
        queue.submit(push("demo", "aaaaaaa1")).await;
        // the permit from the earlier submit is kept
        tokio::time::timeout(Duration::from_millis(100), queue.changed())
            .await
            .unwrap();
    }
}
