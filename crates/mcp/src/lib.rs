//! Stdio transport for tool providers speaking the Model Context Protocol.
//!
//! A provider is a subprocess that exchanges newline-delimited JSON-RPC 2.0
//! frames over stdin/stdout. This crate handles spawning, the
//! `initialize` handshake, tool discovery, tool calls, and liveness probes.
//! Lifecycle policy (restarts, health checks, scheduling) lives in the
//! runtime crate.
//!
//! # Example
//!
//! ```no_run
//! use mcp::{Connection, ProviderConfig};
//!
//! # async fn example() -> mcp::Result<()> {
//! let config = ProviderConfig::new("calc", "calc-provider");
//!
//! let mut conn = Connection::spawn(config).await?;
//! let tools = conn.handshake().await?;
//! for tool in &tools {
//!     println!("Tool: {}", tool.name);
//! }
//!
//! let result = conn
//!     .call_tool("add", Some(serde_json::json!({ "a": 1, "b": 2 })))
//!     .await?;
//! println!("{:?}", result.texts());
//!
//! conn.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod connection;
mod error;
mod protocol;

pub use connection::{Connection, DEFAULT_TIMEOUT, MAX_FRAME_SIZE, ProviderConfig};
pub use error::{Error, Result};
pub use protocol::{
    CallToolParams, CallToolResult, Implementation, Incoming, InitializeParams, InitializeResult,
    JsonRpcError, JsonRpcNotification, JsonRpcReply, JsonRpcRequest, JsonRpcResponse,
    ListToolsResult, PROTOCOL_VERSION, ProviderMessage, RequestId, ServerCapabilities, Tool,
    ToolContent,
};
