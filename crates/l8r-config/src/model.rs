use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application configuration, loaded from `~/.l8r/config.yml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub gateway: GatewayConfig,
    pub llm: LlmProviderConfig,
    pub agent: AgentConfig,
    pub database: DatabaseConfig,
    pub tracing: TracingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Include error detail in 5xx bodies. Should be off in production.
    pub expose_error_details: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            expose_error_details: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmProviderConfig {
    pub provider: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

impl Default for LlmProviderConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            api_key: None,
            base_url: None,
            model: "gpt-4o".to_string(),
            max_tokens: None,
            temperature: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Account every tool call is scoped to.
    pub account_id: String,
    /// Inline system prompt. Takes precedence over `prompt_url`.
    pub system_prompt: Option<String>,
    /// Remote prompt location, fetched once per process.
    pub prompt_url: Option<String>,
    /// Upper bound on model rounds per turn. `None` removes the cap.
    pub max_tool_rounds: Option<usize>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            account_id: "user_demo_001".to_string(),
            system_prompt: None,
            prompt_url: None,
            max_tool_rounds: Some(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: Option<PathBuf>,
    /// Seed the demo account when the database has no users.
    pub seed_if_empty: bool,
    /// Probability that a simulated payment retry succeeds.
    pub retry_success_rate: f64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            seed_if_empty: true,
            retry_success_rate: 0.9,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    pub enabled: bool,
    pub project_name: String,
    pub path: Option<PathBuf>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            project_name: "l8r-customer-service".to_string(),
            path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_yields_defaults() {
        let config: AppConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.gateway.port, 3000);
        assert_eq!(config.llm.model, "gpt-4o");
        assert_eq!(config.agent.account_id, "user_demo_001");
        assert_eq!(config.agent.max_tool_rounds, Some(10));
        assert!(config.tracing.enabled);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let yaml = "gateway:\n  port: 8080\nagent:\n  max_tool_rounds: null\n";
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.gateway.port, 8080);
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.agent.max_tool_rounds, None);
        assert_eq!(config.agent.account_id, "user_demo_001");
    }
}
