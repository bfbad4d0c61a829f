//! Source trigger: polls a pipeline's source and queues a run per change.
//!
//! Reaching the source is the only operation in the system that retries.

use deployit_config::system::TriggerConfig;
use deployit_core::pipeline::{Pipeline, TriggerInfo, TriggerKind};
use deployit_core::source::{Revision, SourceFetcher};
use deployit_core::{Error, Result};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::queue::{RunQueue, Submitted, TriggerRequest};

/// Exponential backoff with full jitter for transient errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&TriggerConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &TriggerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay,
            max_delay: config.max_delay,
        }
    }

    /// Upper bound of the delay after the given failed attempt (0-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;
        let exp = base.saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(exp.min(max))
    }

    /// A random delay in `[0, ceiling(attempt)]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or
    /// runs out of attempts.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay(attempt);
                    warn!(
                        operation = %what,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Polls one pipeline's source and submits a run request on every new
/// revision.
pub struct SourceTrigger {
    pipeline: Arc<Pipeline>,
    fetcher: Arc<dyn SourceFetcher>,
    queue: Arc<RunQueue>,
    interval: Duration,
    retry: RetryPolicy,
    last_seen: Option<Revision>,
}

impl SourceTrigger {
    pub fn new(
        pipeline: Arc<Pipeline>,
        fetcher: Arc<dyn SourceFetcher>,
        queue: Arc<RunQueue>,
        config: &TriggerConfig,
    ) -> Self {
        Self {
            pipeline,
            fetcher,
            queue,
            interval: config.poll_interval,
            retry: RetryPolicy::from_config(config),
            last_seen: None,
        }
    }

    /// Treat `revision` as already built, so only later changes trigger.
    pub fn with_last_seen(mut self, revision: Revision) -> Self {
        self.last_seen = Some(revision);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn last_seen(&self) -> Option<&Revision> {
        self.last_seen.as_ref()
    }

    /// Check the source once. Returns the new revision if a run was queued.
    pub async fn poll_once(&mut self) -> Result<Option<Revision>> {
        let source = self.pipeline.source();
        let fetcher: &dyn SourceFetcher = self.fetcher.as_ref();
        let head = self
            .retry
            .retry("source head", move || fetcher.head(source))
            .await?;

        if self.last_seen.as_ref() == Some(&head) {
            debug!(pipeline = %self.pipeline.name(), revision = %head.short(), "Source unchanged");
            return Ok(None);
        }

        info!(
            pipeline = %self.pipeline.name(),
            previous = %self.last_seen.as_ref().map(|r| r.short()).unwrap_or("none"),
            revision = %head.short(),
            "Source change detected"
        );
        let request = TriggerRequest::new(
            self.pipeline.name(),
            TriggerInfo::at(TriggerKind::Poll, head.clone()),
        );
        if let Submitted::Replaced { .. } = self.queue.submit(request).await {
            debug!(pipeline = %self.pipeline.name(), "Change coalesced with a pending request");
        }
        self.last_seen = Some(head.clone());
        Ok(Some(head))
    }

    /// Poll until `shutdown` is cancelled. Errors are logged, never fatal.
    pub async fn run(mut self, shutdown: CancelToken) {
        info!(
            pipeline = %self.pipeline.name(),
            source = %self.pipeline.source(),
            interval_secs = self.interval.as_secs(),
            "Starting source trigger"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => break,
            }

            match self.poll_once().await {
                Ok(_) => {}
                Err(e) if e.is_transient() => warn!(
                    pipeline = %self.pipeline.name(),
                    attempts = self.retry.max_attempts,
                    error = %e,
                    "Source still unavailable, trying again next interval"
                ),
                Err(e @ Error::NotFound(_)) => warn!(
                    pipeline = %self.pipeline.name(),
                    error = %e,
                    "Source branch not found"
                ),
                Err(e) => error!(pipeline = %self.pipeline.name(), error = %e, "Source poll failed"),
            }
        }
        info!(pipeline = %self.pipeline.name(), "Source trigger stopped");
    }
}
