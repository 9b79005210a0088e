use std::time::Duration;

use history::SessionId;
use thiserror::Error;

use crate::decision::ParseError;
use crate::registry::RegistrationConflict;

#[derive(Debug, Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error(transparent)]
    RegistrationConflict(#[from] RegistrationConflict),

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("tool execution failed: {0}")]
    ToolExecution(String),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("gave up after {attempts} failed decision attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("step limit of {0} reached")]
    StepLimit(usize),

    #[error("interaction failed: {0}")]
    Interaction(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("result already set")]
    AlreadySet,

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("session closed: {0}")]
    SessionClosed(SessionId),

    #[error("session already has a consumer: {0}")]
    SessionBusy(SessionId),

    #[error(transparent)]
    History(#[from] history::Error),

    #[error(transparent)]
    Transport(#[from] mcp::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure stored in a [`ResultFuture`](crate::ResultFuture).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// The provider went away before or while the command ran.
    #[error("provider {0} unavailable")]
    ProviderUnavailable(String),

    /// The command ran and failed.
    #[error("{0}")]
    Failed(String),
}

impl From<CommandError> for Error {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::ProviderUnavailable(name) => Error::ProviderUnavailable(name),
            CommandError::Failed(message) => Error::CommandFailed(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
