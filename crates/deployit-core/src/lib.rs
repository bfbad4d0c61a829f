//! Core domain types and traits for deployit.
//!
//! This crate contains:
//! - Resource identifiers
//! - Artifacts and the artifact store trait
//! - Build specifications and artifact selection rules
//! - Source references and the fetcher trait
//! - Executor trait and job types
//! - Deployer trait and deployment types
//! - Pipeline definitions and run state

pub mod artifact;
pub mod buildspec;
pub mod deployer;
pub mod error;
pub mod executor;
pub mod id;
pub mod pipeline;
pub mod source;

pub use error::{Error, Result};
pub use id::{ArtifactId, JobId, PipelineId, RunId};
