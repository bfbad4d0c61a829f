//! Provisioning engines for DeployIt pipelines.
//!
//! Provides deployer implementations:
//! - Local (state files on disk, used for development and tests)
//! - CloudFormation (through the aws CLI)

pub mod cloudformation;
pub mod local;

pub use cloudformation::CloudFormationDeployer;
pub use deployit_core::deployer::{
    ApplyAction, ApplyOutcome, ChangeKind, DeployRequest, Deployer, ResourceChange, TargetState,
    TargetStatus, Template, ValidationWarning,
};
pub use local::LocalDeployer;
