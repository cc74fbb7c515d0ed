use thiserror::Error;

use crate::executor::ExecError;
use crate::store::StoreError;

pub const CANCELLED_MESSAGE: &str = "Deployment cancelled by user.";

#[derive(Debug, Error)]
pub enum DeployError {
    /// The persisted status was observed as `cancelled-by-user`.
    #[error("{}", CANCELLED_MESSAGE)]
    Cancelled,

    #[error("{0}")]
    Fatal(String),

    #[error("Command failed with exit code {exit_code}: {command}\n{output}")]
    Command {
        command: String,
        exit_code: i32,
        output: String,
    },

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid compose manifest: {0}")]
    Manifest(#[from] serde_yaml::Error),

    #[error("Template rendering failed: {0}")]
    Template(#[from] minijinja::Error),

    #[error("Invalid state file: {0}")]
    State(#[from] serde_json::Error),
}

impl DeployError {
    pub fn fatal(message: impl Into<String>) -> Self {
        DeployError::Fatal(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DeployError::Cancelled)
    }
}
