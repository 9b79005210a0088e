//! Transport error types.

use crate::protocol::JsonRpcError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to spawn provider: {0}")]
    Spawn(std::io::Error),

    #[error("provider I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("provider not initialized")]
    NotInitialized,

    #[error("provider exited unexpectedly")]
    ServerExited,

    #[error("timeout waiting for response")]
    Timeout,

    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("malformed frame from provider: {0}")]
    Frame(serde_json::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON-RPC error: {0}")]
    JsonRpc(#[from] JsonRpcError),

    #[error("tool call failed: {0}")]
    ToolCallFailed(String),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}

impl Error {
    /// Whether the connection can no longer be trusted and must be re-established.
    ///
    /// Protocol-level failures (a JSON-RPC error object, a tool result flagged
    /// `isError`, a result that does not match the expected shape) leave the
    /// stream in sync and return `false`.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Error::Spawn(_)
                | Error::Io(_)
                | Error::NotInitialized
                | Error::ServerExited
                | Error::Timeout
                | Error::Frame(_)
                | Error::FrameTooLarge { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
