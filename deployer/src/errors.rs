//! Error types for the Mineclifford deployer

use std::time::Duration;

use thiserror::Error;

/// Failure of one pipeline stage.
///
/// Every variant is fatal for the job that produced it. The coordinator turns
/// it into a terminal error event and an `error` record status.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("{program} could not be started: {reason}")]
    ToolUnavailable { program: String, reason: String },

    #[error("{step} timed out after {}s", timeout.as_secs())]
    ExecutionTimeout { step: String, timeout: Duration },

    #[error("{step} failed with exit code {exit_code}:\n{tail}")]
    ExecutionFailed {
        step: String,
        exit_code: i32,
        tail: String,
    },

    #[error("Unable to interpret tool output: {0}")]
    OutputParseError(String),

    #[error("Hosts unreachable after connectivity checks: {}", hosts.join(", "))]
    UnreachableHosts { hosts: Vec<String> },

    #[error("Job workspace error: {0}")]
    Workspace(String),
}

impl PipelineError {
    /// Short machine-friendly name of the failure kind
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::ToolUnavailable { .. } => "tool_unavailable",
            PipelineError::ExecutionTimeout { .. } => "execution_timeout",
            PipelineError::ExecutionFailed { .. } => "execution_failed",
            PipelineError::OutputParseError(_) => "output_parse_error",
            PipelineError::UnreachableHosts { .. } => "unreachable_hosts",
            PipelineError::Workspace(_) => "workspace",
        }
    }
}

/// Main error type for the deployer
#[derive(Error, Debug)]
pub enum DeployerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("A deployment is already in progress for server {0}")]
    JobAlreadyActive(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),
}

impl From<url::ParseError> for DeployerError {
    fn from(err: url::ParseError) -> Self {
        DeployerError::ConfigError(err.to_string())
    }
}
