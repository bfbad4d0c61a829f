//! Error types for deployit.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Pipeline definition rejected before any run starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A stage's declared input is absent when the stage starts.
    #[error("stage '{stage}' is missing input '{artifact}'")]
    MissingInput { stage: String, artifact: String },

    #[error("empty artifact: {0}")]
    EmptyArtifact(String),

    #[error("invalid state transition: {0}")]
    InvalidTransition(String),

    /// The source reference could not be reached. Retried by the trigger.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("deployment failed: {0}")]
    DeploymentFailed(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::SourceUnavailable(_) | Error::Timeout(_))
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connectivity_errors_are_transient() {
        assert!(Error::SourceUnavailable("dns".into()).is_transient());
        assert!(Error::Timeout("ls-remote".into()).is_transient());
        assert!(!Error::DeploymentFailed("rejected".into()).is_transient());
        assert!(!Error::ExecutionFailed("exit 1".into()).is_transient());
        assert!(!Error::Configuration("bad".into()).is_transient());
    }

    #[test]
    fn test_missing_input_names_stage_and_artifact() {
        let err = Error::MissingInput {
            stage: "Deploy".into(),
            artifact: "build_output".into(),
        };
        assert_eq!(
            err.to_string(),
            "stage 'Deploy' is missing input 'build_output'"
        );
    }
}
