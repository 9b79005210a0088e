//! Tool execution seam.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use history::CallRecord;
use mcp::CallToolResult;
use serde_json::Value;
use tracing::debug;

use crate::bridge::CommandBridge;
use crate::registry::{ToolDescriptor, ToolRegistry};
use crate::{Error, Result};

/// Text output of one tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub provider: String,
    pub texts: Vec<String>,
}

/// Boundary between the decision loop and tool side effects.
pub trait ToolHost: Send + Sync {
    /// Catalog text for prompts.
    fn describe_all(&self) -> String;

    /// Look up a tool by name.
    fn resolve(&self, name: &str) -> Result<ToolDescriptor>;

    /// Run `call` against the tool described by `tool`.
    fn execute(
        &self,
        tool: &ToolDescriptor,
        call: &CallRecord,
    ) -> impl Future<Output = Result<ToolOutput>> + Send;
}

/// Executes tools on supervised providers.
pub struct ProviderToolHost {
    registry: Arc<ToolRegistry>,
    bridge: Arc<CommandBridge>,
    timeout: Duration,
}

impl ProviderToolHost {
    pub fn new(registry: Arc<ToolRegistry>, bridge: Arc<CommandBridge>, timeout: Duration) -> Self {
        Self {
            registry,
            bridge,
            timeout,
        }
    }
}

/// Tool arguments on the wire: an object, or nothing at all.
fn arguments(parameters: &Value) -> Result<Option<Value>> {
    match parameters {
        Value::Null => Ok(None),
        Value::Object(map) if map.is_empty() => Ok(None),
        Value::Object(_) => Ok(Some(parameters.clone())),
        other => Err(Error::ToolExecution(format!(
            "parameters must be an object, got {other}"
        ))),
    }
}

impl ToolHost for ProviderToolHost {
    fn describe_all(&self) -> String {
        self.registry.describe_all()
    }

    fn resolve(&self, name: &str) -> Result<ToolDescriptor> {
        self.registry.resolve(name)
    }

    async fn execute(&self, tool: &ToolDescriptor, call: &CallRecord) -> Result<ToolOutput> {
        let name = call.name.clone();
        let arguments = arguments(&call.parameters)?;
        debug!(provider = %tool.provider, tool = %name, "submitting tool call");

        let future = self.bridge.submit::<CallToolResult, _>(&tool.provider, move |conn| {
            Box::pin(async move { conn.call_tool(&name, arguments).await })
        })?;
        let result = future.wait_async(self.timeout).await?;

        Ok(ToolOutput {
            provider: tool.provider.clone(),
            texts: result.texts(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn arguments_accept_objects_only() {
        assert_eq!(arguments(&Value::Null).unwrap(), None);
        assert_eq!(arguments(&json!({})).unwrap(), None);
        assert_eq!(
            arguments(&json!({"a": 1})).unwrap(),
            Some(json!({"a": 1}))
        );
        assert!(matches!(
            arguments(&json!([1, 2])),
            Err(Error::ToolExecution(_))
        ));
    }

    #[tokio::test]
    async fn execute_on_unknown_provider_fails() {
        let host = ProviderToolHost::new(
            Arc::new(ToolRegistry::new()),
            Arc::new(CommandBridge::new(Vec::new())),
            Duration::from_millis(50),
        );
        let tool = ToolDescriptor {
            name: "add".into(),
            description: String::new(),
            schema: json!({"type": "object"}),
            provider: "calc".into(),
        };
        let call = CallRecord {
            name: "add".into(),
            parameters: json!({"a": 1, "b": 2}),
            reasoning_tag: None,
            reasoning: None,
        };
        let err = host.execute(&tool, &call).await.unwrap_err();
        assert!(matches!(err, Error::UnknownProvider(name) if name == "calc"));
    }
}
