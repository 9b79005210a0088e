//! CLI error types.

use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigError;

/// CLI errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The audit database does not exist yet.
    ///
    /// Nothing has been run with persistence enabled.
    #[error("database not found at {path}. Run 'harbor run' first")]
    DatabaseNotFound { path: PathBuf },

    /// No run matches the given session id prefix.
    #[error("no session found matching '{prefix}'")]
    SessionNotFound { prefix: String },

    /// Multiple runs match the given prefix.
    #[error("multiple sessions match '{prefix}': {matches:?}")]
    AmbiguousSession {
        prefix: String,
        matches: Vec<String>,
    },

    #[error("no tool providers configured in {path}")]
    NoProviders { path: PathBuf },

    #[error("run failed: {0}")]
    RunFailed(String),

    #[error("no API key: set backend.api_key or ANTHROPIC_API_KEY")]
    MissingApiKey,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Runtime(#[from] runtime::Error),

    #[error(transparent)]
    History(#[from] history::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
