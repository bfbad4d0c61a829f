//! Pipeline runs for DeployIt.
//!
//! Holds the artifact stores, source fetchers and stage actions, the
//! orchestrator that walks a run through its stages, and the trigger, queue
//! and worker that decide when runs start.

pub mod actions;
pub mod cancel;
pub mod history;
pub mod lock;
pub mod orchestrator;
pub mod queue;
pub mod runtime;
pub mod source;
pub mod store;
pub mod trigger;
pub mod worker;
pub mod workspace;

pub use cancel::CancelToken;
pub use history::RunHistory;
pub use lock::{RunGuard, RunLock};
pub use orchestrator::{PipelineEvent, PipelineOrchestrator};
pub use queue::{RunQueue, Submitted, TriggerRequest};
pub use source::{DirectorySource, GitSource};
pub use store::{FsArtifactStore, MemoryArtifactStore};
pub use trigger::{RetryPolicy, SourceTrigger};
pub use worker::Worker;
