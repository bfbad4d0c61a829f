//! Configuration parsing for deployit.
//!
//! This crate handles parsing of:
//! - Pipeline definitions (KDL)
//! - Buildspec files (YAML)
//! - System configuration (KDL plus `DEPLOYIT_*` overrides)
//! - Variable interpolation

pub mod buildspec;
pub mod error;
pub mod pipeline;
pub mod system;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use pipeline::{load_pipeline, parse_pipeline};
pub use system::{HistoryConfig, QueuePolicy, SystemConfig, load_system_config, parse_system_config};
pub use variables::{
    PipelineContext, RunContext, SourceContext, StageContext, VariableContext,
    VariableContextBuilder,
};
