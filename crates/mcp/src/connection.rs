//! A live connection to one tool-provider subprocess.
//!
//! A [`Connection`] is owned by exactly one task. Every method takes
//! `&mut self`, so requests are naturally serialized and no locking is
//! needed around the child's stdio.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::protocol::{
    CallToolParams, CallToolResult, Incoming, InitializeParams, InitializeResult,
    JsonRpcNotification, JsonRpcReply, JsonRpcRequest, JsonRpcResponse, ListToolsParams,
    ListToolsResult, ProviderMessage, RequestId, Tool,
};

/// Default timeout for a single request/response exchange.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Maximum size of a single frame (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// How to launch a tool provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Handle to a running provider process.
pub struct Connection {
    config: ProviderConfig,
    process: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    next_id: i64,
    request_timeout: Duration,
    server_info: Option<InitializeResult>,
}

impl Connection {
    /// Spawn the provider process. Must be called from within a Tokio runtime.
    pub async fn spawn(config: ProviderConfig) -> Result<Self> {
        let mut process = Command::new(&config.command)
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(Error::Spawn)?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| Error::Spawn(std::io::Error::other("failed to capture stdin")))?;
        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn(std::io::Error::other("failed to capture stdout")))?;

        debug!(provider = %config.name, pid = ?process.id(), "spawned provider");

        Ok(Self {
            config,
            process,
            stdin,
            stdout: BufReader::new(stdout),
            next_id: 1,
            request_timeout: DEFAULT_TIMEOUT,
            server_info: None,
        })
    }

    /// Override the per-request timeout.
    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Server identity reported during the handshake.
    pub fn server_info(&self) -> Option<&InitializeResult> {
        self.server_info.as_ref()
    }

    /// Run `initialize`, acknowledge it, and discover the tool catalog.
    pub async fn handshake(&mut self) -> Result<Vec<Tool>> {
        let params = serde_json::to_value(InitializeParams::default())?;
        let result: InitializeResult = self.request("initialize", Some(params)).await?;
        debug!(
            provider = %self.config.name,
            server = %result.server_info.name,
            protocol = %result.protocol_version,
            "handshake accepted"
        );
        self.server_info = Some(result);
        self.notify("notifications/initialized").await?;
        self.list_tools().await
    }

    /// Fetch every page of `tools/list`.
    pub async fn list_tools(&mut self) -> Result<Vec<Tool>> {
        self.ensure_initialized()?;
        let mut tools = Vec::new();
        let mut cursor = None;
        loop {
            let params = serde_json::to_value(ListToolsParams { cursor })?;
            let page: ListToolsResult = self.request("tools/list", Some(params)).await?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(tools),
            }
        }
    }

    /// Call a tool. A result flagged `isError` becomes [`Error::ToolCallFailed`].
    pub async fn call_tool(&mut self, name: &str, arguments: Option<Value>) -> Result<CallToolResult> {
        self.ensure_initialized()?;
        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments,
        })?;
        let result: CallToolResult = self.request("tools/call", Some(params)).await?;

        if result.is_error {
            return Err(Error::ToolCallFailed(result.texts().join("\n")));
        }
        Ok(result)
    }

    /// Lightweight liveness probe.
    pub async fn ping(&mut self) -> Result<()> {
        if !self.is_running() {
            return Err(Error::ServerExited);
        }
        let _: Value = self.request("ping", None).await?;
        Ok(())
    }

    /// Whether the child process is still alive.
    pub fn is_running(&mut self) -> bool {
        matches!(self.process.try_wait(), Ok(None))
    }

    /// Kill the provider process.
    pub async fn shutdown(mut self) -> Result<()> {
        if self.is_running() {
            self.process.kill().await?;
        }
        debug!(provider = %self.config.name, "provider stopped");
        Ok(())
    }

    // --- Internal methods ---

    fn ensure_initialized(&self) -> Result<()> {
        match self.server_info {
            Some(_) => Ok(()),
            None => Err(Error::NotInitialized),
        }
    }

    fn next_request_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    async fn request<R>(&mut self, method: &str, params: Option<Value>) -> Result<R>
    where
        R: DeserializeOwned,
    {
        let id = self.next_request_id();
        let mut request = JsonRpcRequest::new(id, method);
        if let Some(params) = params {
            request = request.with_params(params);
        }
        self.write_frame(&request).await?;

        let response = timeout(self.request_timeout, self.await_response(id))
            .await
            .map_err(|_| Error::Timeout)??;

        let value = response.into_result()?;
        serde_json::from_value(value).map_err(|e| Error::InvalidResponse(format!("{method}: {e}")))
    }

    async fn notify(&mut self, method: &str) -> Result<()> {
        self.write_frame(&JsonRpcNotification::new(method)).await
    }

    async fn write_frame(&mut self, frame: &impl Serialize) -> Result<()> {
        let mut line = serde_json::to_vec(frame)?;
        line.push(b'\n');
        self.stdin.write_all(&line).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Read frames until the response for `id` arrives.
    ///
    /// Notifications are skipped, provider-initiated requests are answered,
    /// and responses to earlier (timed-out) requests are discarded.
    async fn await_response(&mut self, id: i64) -> Result<JsonRpcResponse> {
        loop {
            match self.read_frame().await? {
                Incoming::Response(response) => match &response.id {
                    RequestId::Number(n) if *n == id => return Ok(response),
                    RequestId::Number(n) if *n < id => {
                        debug!(provider = %self.config.name, stale = n, "discarding stale response");
                    }
                    other => {
                        return Err(Error::InvalidResponse(format!(
                            "response id mismatch: expected {id}, got {other:?}"
                        )));
                    }
                },
                Incoming::Message(message) => self.handle_provider_message(message).await?,
            }
        }
    }

    async fn handle_provider_message(&mut self, message: ProviderMessage) -> Result<()> {
        let Some(id) = message.id else {
            trace!(provider = %self.config.name, method = %message.method, "provider notification");
            return Ok(());
        };
        let reply = if message.method == "ping" {
            JsonRpcReply::ok(id, Value::Object(Default::default()))
        } else {
            JsonRpcReply::method_not_found(id, &message.method)
        };
        self.write_frame(&reply).await
    }

    async fn read_frame(&mut self) -> Result<Incoming> {
        let mut line = String::new();
        loop {
            line.clear();
            let bytes_read = self.stdout.read_line(&mut line).await?;
            if bytes_read == 0 {
                return Err(Error::ServerExited);
            }
            if line.len() > MAX_FRAME_SIZE {
                return Err(Error::FrameTooLarge {
                    size: line.len(),
                    max: MAX_FRAME_SIZE,
                });
            }
            if !line.trim().is_empty() {
                break;
            }
        }
        serde_json::from_str(&line).map_err(Error::Frame)
    }
}
