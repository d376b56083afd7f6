//! Configuration management for the reasoning engine
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default, config/{APP_ENV}, config/local)
//! - Default values

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct AppConfig {
    /// LLM backend configuration
    pub llm: LlmConfig,

    /// Knowledge-similarity lookup configuration
    pub knowledge: KnowledgeConfig,

    /// Pipeline and session configuration
    #[validate(nested)]
    pub reasoning: ReasoningConfig,

    /// Observability configuration
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Set to false to run fully offline on heuristic fallbacks
    pub enabled: bool,

    /// Base URL of the generation endpoint
    pub endpoint: String,

    /// Model used for general queries
    pub general_model: String,

    /// Model used for code-oriented queries
    pub code_model: String,

    /// Per-call timeout in seconds
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    /// Base URL of the indexing service search API (None disables lookups)
    pub search_url: Option<String>,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Matches requested per entity
    pub limit: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct ReasoningConfig {
    /// Entity confidence below which grounding asks for clarification
    #[validate(range(min = 0.0, max = 1.0))]
    pub ambiguity_threshold: f64,

    /// Rule-based confidence above which hybrid mode skips the LLM
    #[validate(range(min = 0.0, max = 1.0))]
    pub hybrid_threshold: f64,

    /// Forward-chaining iteration limit
    #[validate(range(min = 1, max = 32))]
    pub max_depth: usize,

    /// Poll interval for synchronous reasoning, in milliseconds
    #[validate(range(min = 1, max = 60_000))]
    pub poll_interval_ms: u64,

    /// Deadline for synchronous reasoning, in seconds
    #[validate(range(min = 1, max = 86_400))]
    pub sync_timeout_secs: u64,

    /// Retention of complete/failed sessions, in seconds
    #[validate(range(min = 1, max = 2_592_000))]
    pub terminal_ttl_secs: u64,

    /// Retention of suspended sessions, in seconds
    #[validate(range(min = 1, max = 2_592_000))]
    pub suspended_ttl_secs: u64,

    /// Interval between eviction sweeps, in seconds
    #[validate(range(min = 1, max = 86_400))]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level or filter directive (debug, info, docforge_core=debug)
    pub log_level: String,

    /// Enable JSON logging
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    pub metrics_port: u16,

    /// Service name for logs
    pub service_name: String,
}

// Default value functions
fn default_llm_endpoint() -> String { "http://localhost:11434".to_string() }
fn default_general_model() -> String { "llama3.2".to_string() }
fn default_code_model() -> String { "qwen2.5-coder".to_string() }
fn default_llm_timeout() -> u64 { 30 }
fn default_knowledge_timeout() -> u64 { 5 }
fn default_knowledge_limit() -> usize { 3 }
fn default_ambiguity_threshold() -> f64 { 0.5 }
fn default_hybrid_threshold() -> f64 { 0.7 }
fn default_max_depth() -> usize { 5 }
fn default_poll_interval() -> u64 { 100 }
fn default_sync_timeout() -> u64 { 30 }
fn default_terminal_ttl() -> u64 { 900 }
fn default_suspended_ttl() -> u64 { 3600 }
fn default_sweep_interval() -> u64 { 60 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "docforge-reasoning".to_string() }

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: default_llm_endpoint(),
            general_model: default_general_model(),
            code_model: default_code_model(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            search_url: None,
            timeout_secs: default_knowledge_timeout(),
            limit: default_knowledge_limit(),
        }
    }
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            ambiguity_threshold: default_ambiguity_threshold(),
            hybrid_threshold: default_hybrid_threshold(),
            max_depth: default_max_depth(),
            poll_interval_ms: default_poll_interval(),
            sync_timeout_secs: default_sync_timeout(),
            terminal_ttl_secs: default_terminal_ttl(),
            suspended_ttl_secs: default_suspended_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables with APP__ prefix
            // e.g., APP__LLM__ENDPOINT=http://ollama:11434
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize::<Self>()?.validated()
    }

    /// Load from a specific file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize::<Self>()?.validated()
    }

    /// Parse an inline TOML document, without environment overrides
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize::<Self>()?
            .validated()
    }

    /// Reject out-of-range values after deserialization
    pub fn validated(self) -> Result<Self, ConfigError> {
        self.validate()
            .map_err(|e| ConfigError::Message(format!("invalid configuration: {}", e)))?;
        Ok(self)
    }
}

impl LlmConfig {
    /// Get the per-call timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ReasoningConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.llm.endpoint, "http://localhost:11434");
        assert_eq!(config.reasoning.max_depth, 5);
        assert_eq!(config.reasoning.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.reasoning.sync_timeout(), Duration::from_secs(30));
        assert!(config.knowledge.search_url.is_none());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [llm]
            code_model = "deepseek-coder"

            [reasoning]
            ambiguity_threshold = 0.6
            "#,
        )
        .unwrap();

        assert_eq!(config.llm.code_model, "deepseek-coder");
        assert_eq!(config.llm.general_model, "llama3.2");
        assert_eq!(config.reasoning.ambiguity_threshold, 0.6);
        assert_eq!(config.reasoning.hybrid_threshold, 0.7);
        assert_eq!(config.observability.metrics_port, 9090);
    }

    #[test]
    fn test_out_of_range_reasoning_values_rejected() {
        for toml in [
            "[reasoning]\npoll_interval_ms = 0",
            "[reasoning]\nsync_timeout_secs = 100000000",
            "[reasoning]\nhybrid_threshold = 1.5",
            "[reasoning]\nsuspended_ttl_secs = 0",
        ] {
            let err = AppConfig::from_toml_str(toml).unwrap_err();
            assert!(err.to_string().contains("invalid configuration"), "{toml}: {err}");
        }
    }
}
