//! Configuration loading from harbor.toml.

use std::path::Path;
use std::time::Duration;

use mcp::ProviderConfig;
use runtime::{LoopConfig, OrchestratorConfig, SupervisorConfig};
use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Tool providers, one `[[provider]]` table each.
    #[serde(rename = "provider")]
    pub providers: Vec<ProviderConfig>,
    pub supervisor: SupervisorSection,
    pub decision: DecisionSection,
    pub backend: BackendSection,
    pub broker: BrokerSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    pub probe_interval_ms: u64,
    pub restart_backoff_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            probe_interval_ms: 1000,
            restart_backoff_ms: 5000,
            request_timeout_ms: 15000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DecisionSection {
    pub generation_timeout_secs: u64,
    pub tool_timeout_secs: u64,
    pub max_decision_retries: u32,
    pub max_steps: usize,
    pub reject_repeated_calls: bool,
    pub require_plan: bool,
}

impl Default for DecisionSection {
    fn default() -> Self {
        Self {
            generation_timeout_secs: 20,
            tool_timeout_secs: 30,
            max_decision_retries: 3,
            max_steps: 50,
            reject_repeated_calls: true,
            require_plan: false,
        }
    }
}

/// Generation backend settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BackendSection {
    pub model: String,
    /// Anthropic API key. Falls back to `ANTHROPIC_API_KEY`.
    pub api_key: Option<String>,
    pub max_tokens: u32,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            model: runtime::DEFAULT_MODEL.to_string(),
            api_key: None,
            max_tokens: 4096,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BrokerSection {
    pub retention_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            retention_secs: 3600,
            sweep_interval_secs: 300,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (i, provider) in self.providers.iter().enumerate() {
            if provider.name.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("provider #{} has no name", i + 1)));
            }
            if self.providers[..i].iter().any(|p| p.name == provider.name) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate provider name: {}",
                    provider.name
                )));
            }
        }
        if self.decision.max_steps == 0 {
            return Err(ConfigError::Invalid("decision.max_steps must be positive".into()));
        }
        Ok(())
    }

    /// The API key from the file, or from the environment.
    pub fn api_key(&self) -> Option<String> {
        self.backend
            .api_key
            .clone()
            .filter(|key| !key.is_empty())
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
            .filter(|key| !key.is_empty())
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        let supervisor = &self.supervisor;
        let decision = &self.decision;
        OrchestratorConfig {
            supervisor: SupervisorConfig {
                probe_interval: Duration::from_millis(supervisor.probe_interval_ms),
                restart_backoff: Duration::from_millis(supervisor.restart_backoff_ms),
                request_timeout: Duration::from_millis(supervisor.request_timeout_ms),
            },
            decision: LoopConfig {
                generation_timeout: Duration::from_secs(decision.generation_timeout_secs),
                max_decision_retries: decision.max_decision_retries,
                max_steps: decision.max_steps,
                reject_repeated_calls: decision.reject_repeated_calls,
                require_plan: decision.require_plan,
            },
            tool_timeout: Duration::from_secs(decision.tool_timeout_secs),
            session_retention: Duration::from_secs(self.broker.retention_secs),
            sweep_interval: Duration::from_secs(self.broker.sweep_interval_secs),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert!(config.providers.is_empty());
        assert_eq!(config.backend.model, runtime::DEFAULT_MODEL);

        let orchestrator = config.orchestrator();
        assert_eq!(orchestrator.supervisor.probe_interval, Duration::from_secs(1));
        assert_eq!(orchestrator.supervisor.restart_backoff, Duration::from_secs(5));
        assert_eq!(orchestrator.supervisor.request_timeout, Duration::from_secs(15));
        assert_eq!(orchestrator.decision.generation_timeout, Duration::from_secs(20));
        assert_eq!(orchestrator.decision.max_decision_retries, 3);
        assert_eq!(orchestrator.decision.max_steps, 50);
        assert!(orchestrator.decision.reject_repeated_calls);
        assert!(!orchestrator.decision.require_plan);
        assert_eq!(orchestrator.tool_timeout, Duration::from_secs(30));
        assert_eq!(orchestrator.session_retention, Duration::from_secs(3600));
        assert_eq!(orchestrator.sweep_interval, Duration::from_secs(300));
    }

    #[test]
    fn parses_providers_and_overrides() {
        let config = Config::parse(
            r#"
            [[provider]]
            name = "calc"
            command = "calc-provider"

            [[provider]]
            name = "files"
            command = "npx"
            args = ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]
            env = { NODE_ENV = "production" }

            [decision]
            max_steps = 10
            require_plan = true

            [backend]
            model = "claude-haiku"
            max_tokens = 1024
            "#,
        )
        .unwrap();

        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0], ProviderConfig::new("calc", "calc-provider"));
        assert_eq!(config.providers[1].args.len(), 3);
        assert_eq!(config.providers[1].env["NODE_ENV"], "production");
        assert_eq!(config.decision.max_steps, 10);
        assert!(config.decision.require_plan);
        assert_eq!(config.decision.max_decision_retries, 3);
        assert_eq!(config.backend.model, "claude-haiku");
        assert_eq!(config.backend.max_tokens, 1024);
    }

    #[test]
    fn rejects_duplicate_provider_names() {
        let err = Config::parse(
            r#"
            [[provider]]
            name = "calc"
            command = "a"

            [[provider]]
            name = "calc"
            command = "b"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("calc")));
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(matches!(
            Config::parse("[[provider]]\nname = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn config_file_key_wins_over_environment() {
        let config = Config::parse("[backend]\napi_key = \"sk-from-file\"").unwrap();
        assert_eq!(config.api_key().as_deref(), Some("sk-from-file"));
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harbor.toml");
        std::fs::write(&path, "[broker]\nretention_secs = 60\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.broker.retention_secs, 60);
        assert!(matches!(
            Config::load(dir.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
