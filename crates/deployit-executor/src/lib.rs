//! Build execution environments for deployit.
//!
//! Provides executor implementations for running build jobs:
//! - Local processes in an ephemeral workspace (default)
//! - Local Docker containers with the workspace bind-mounted

pub mod docker;
pub mod process;

pub use deployit_core::executor::{
    Executor, JobHandle, JobResult, JobSpec, JobStatus, LogLine, LogStream,
};
pub use docker::LocalDockerExecutor;
pub use process::LocalProcessExecutor;
