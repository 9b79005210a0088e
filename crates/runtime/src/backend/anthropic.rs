//! Anthropic Messages API backend.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Generator;
use crate::{Error, Result};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: [ApiMessage<'a>; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    input_tokens: u32,
    output_tokens: u32,
}

/// Builder for [`AnthropicBackend`].
#[derive(Debug, Clone)]
pub struct AnthropicBackendBuilder {
    api_key: String,
    model: String,
    max_tokens: u32,
    system: Option<String>,
    endpoint: String,
}

impl AnthropicBackendBuilder {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            max_tokens: 4096,
            system: None,
            endpoint: ANTHROPIC_API_URL.to_string(),
        }
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// System prompt sent with every request.
    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Override the Messages API URL.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn build(self) -> AnthropicBackend {
        AnthropicBackend {
            client: reqwest::Client::new(),
            api_key: self.api_key,
            model: self.model,
            max_tokens: self.max_tokens,
            system: self.system,
            endpoint: self.endpoint,
        }
    }
}

/// Single-turn generation against the Anthropic Messages API.
pub struct AnthropicBackend {
    client: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    system: Option<String>,
    endpoint: String,
}

impl AnthropicBackend {
    pub fn builder(api_key: impl Into<String>, model: impl Into<String>) -> AnthropicBackendBuilder {
        AnthropicBackendBuilder::new(api_key, model)
    }

    fn request_body<'a>(&'a self, prompt: &'a str) -> ApiRequest<'a> {
        ApiRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: [ApiMessage {
                role: "user",
                content: prompt,
            }],
            system: self.system.as_deref(),
        }
    }
}

impl std::fmt::Display for AnthropicBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "anthropic({})", self.model)
    }
}

impl Generator for AnthropicBackend {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .header("accept", "application/json")
            .json(&self.request_body(prompt))
            .send()
            .await
            .map_err(|e| Error::Generation(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Generation(format!("{status}: {body}")));
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| Error::Generation(e.to_string()))?;

        if let Some(usage) = &api_response.usage {
            debug!(
                model = %self.model,
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                "generation complete"
            );
        }

        Ok(api_response
            .content
            .into_iter()
            .map(|block| block.text)
            .collect())
    }
}
