//! Configuration management
//!
//! Every tunable is validated at construction time. Invalid values fail
//! loudly with a `ConfigError` instead of surfacing mid-run.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration validation error
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} = {value} is out of range ({min}..={max})")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("{field} must be at least {min:?}, got {value:?}")]
    IntervalTooShort {
        field: &'static str,
        value: Duration,
        min: Duration,
    },

    #[error("unknown log level: {0}")]
    UnknownLogLevel(String),

    #[error("missing required setting: {0}")]
    Missing(&'static str),
}

/// Per-agent sampling configuration. Immutable once handed to an agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1024,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
        }
    }
}

impl AgentConfig {
    /// Validate numeric ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("temperature", self.temperature, 0.0, 2.0)?;
        check_range("top_p", self.top_p, 0.0, 1.0)?;
        check_range("frequency_penalty", self.frequency_penalty, -2.0, 2.0)?;
        check_range("presence_penalty", self.presence_penalty, -2.0, 2.0)?;
        if self.max_tokens == 0 {
            return Err(ConfigError::OutOfRange {
                field: "max_tokens",
                value: 0.0,
                min: 1.0,
                max: f64::MAX,
            });
        }
        Ok(())
    }
}

/// Orchestrator-wide tunables
#[derive(Debug, Clone)]
pub struct SystemParams {
    /// Sampling temperature for the deliberation agent
    pub deliberation_temperature: f32,
    /// Sampling temperature for the execution agent
    pub execution_temperature: f32,
    /// Max response tokens for both agents
    pub max_tokens: u32,
    /// Deliberation loop tick interval (min 0.5s)
    pub deliberation_interval: Duration,
    /// Execution loop tick interval (min 0.1s)
    pub execution_interval: Duration,
    /// Trigger history compression at this fraction of the context window
    pub compression_threshold: f32,
    /// Context window override (auto-detected from the model if None)
    pub max_context_tokens: Option<usize>,
    /// Directory for legacy code execution
    pub sandbox_path: PathBuf,
    /// Root directory for file tools
    pub workspace_path: PathBuf,
    /// SQLite database path for the memory store
    pub memory_path: PathBuf,
    /// Disable the sandbox denylist
    pub unsafe_mode: bool,
    /// Log level hint for the binary ("trace".."error")
    pub log_level: String,
}

impl Default for SystemParams {
    fn default() -> Self {
        Self {
            deliberation_temperature: 0.7,
            execution_temperature: 0.3,
            max_tokens: 1024,
            deliberation_interval: Duration::from_secs(3),
            execution_interval: Duration::from_secs(1),
            compression_threshold: 0.8,
            max_context_tokens: None,
            sandbox_path: PathBuf::from("./sandbox"),
            workspace_path: PathBuf::from("."),
            memory_path: PathBuf::from("./animus.db"),
            unsafe_mode: false,
            log_level: "info".to_string(),
        }
    }
}

impl SystemParams {
    /// Validate all numeric ranges and intervals
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range(
            "deliberation_temperature",
            self.deliberation_temperature,
            0.0,
            2.0,
        )?;
        check_range("execution_temperature", self.execution_temperature, 0.0, 2.0)?;
        check_range(
            "compression_threshold",
            self.compression_threshold,
            0.5,
            1.0,
        )?;

        if self.max_tokens == 0 {
            return Err(ConfigError::OutOfRange {
                field: "max_tokens",
                value: 0.0,
                min: 1.0,
                max: f64::MAX,
            });
        }

        check_interval(
            "deliberation_interval",
            self.deliberation_interval,
            Duration::from_millis(500),
        )?;
        check_interval(
            "execution_interval",
            self.execution_interval,
            Duration::from_millis(100),
        )?;

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
            other => Err(ConfigError::UnknownLogLevel(other.to_string())),
        }
    }

    /// Load parameters from environment variables (ANIMUS_* prefix)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut params = Self::default();

        if let Some(v) = env_f32("ANIMUS_DELIBERATION_TEMPERATURE") {
            params.deliberation_temperature = v;
        }
        if let Some(v) = env_f32("ANIMUS_EXECUTION_TEMPERATURE") {
            params.execution_temperature = v;
        }
        if let Ok(v) = std::env::var("ANIMUS_MAX_TOKENS") {
            if let Ok(n) = v.parse() {
                params.max_tokens = n;
            }
        }
        if let Some(v) = env_f32("ANIMUS_DELIBERATION_INTERVAL") {
            params.deliberation_interval = Duration::from_secs_f32(v);
        }
        if let Some(v) = env_f32("ANIMUS_EXECUTION_INTERVAL") {
            params.execution_interval = Duration::from_secs_f32(v);
        }
        if let Some(v) = env_f32("ANIMUS_COMPRESSION_THRESHOLD") {
            params.compression_threshold = v;
        }
        if let Ok(v) = std::env::var("ANIMUS_MAX_CONTEXT_TOKENS") {
            params.max_context_tokens = v.parse().ok();
        }
        if let Ok(v) = std::env::var("ANIMUS_SANDBOX_PATH") {
            params.sandbox_path = expand_path(&v);
        }
        if let Ok(v) = std::env::var("ANIMUS_WORKSPACE") {
            params.workspace_path = expand_path(&v);
        }
        if let Ok(v) = std::env::var("ANIMUS_MEMORY_PATH") {
            params.memory_path = expand_path(&v);
        }
        if let Ok(v) = std::env::var("ANIMUS_UNSAFE_MODE") {
            params.unsafe_mode = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("ANIMUS_LOG_LEVEL") {
            params.log_level = v;
        }

        params.validate()?;
        Ok(params)
    }

    /// Agent config for the deliberation agent
    pub fn deliberation_config(&self) -> AgentConfig {
        AgentConfig {
            temperature: self.deliberation_temperature,
            max_tokens: self.max_tokens,
            ..AgentConfig::default()
        }
    }

    /// Agent config for the execution agent
    pub fn execution_config(&self) -> AgentConfig {
        AgentConfig {
            temperature: self.execution_temperature,
            max_tokens: self.max_tokens,
            ..AgentConfig::default()
        }
    }
}

/// LLM provider connection settings
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// API key for the provider
    pub api_key: String,
    /// Base URL (None for the OpenAI default)
    pub base_url: Option<String>,
    /// Model name
    pub model: String,
    /// Per-request HTTP timeout
    pub timeout: Duration,
}

impl ProviderConfig {
    /// Load provider settings from environment variables
    ///
    /// `ANIMUS_API_KEY` (falls back to `OPENAI_API_KEY`), `ANIMUS_BASE_URL`,
    /// `ANIMUS_MODEL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("ANIMUS_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| ConfigError::Missing("ANIMUS_API_KEY"))?;

        let base_url = std::env::var("ANIMUS_BASE_URL").ok();

        let model =
            std::env::var("ANIMUS_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        let timeout = std::env::var("ANIMUS_REQUEST_TIMEOUT")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(120));

        Ok(Self {
            api_key,
            base_url,
            model,
            timeout,
        })
    }
}

fn check_range(field: &'static str, value: f32, min: f32, max: f32) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field,
            value: value as f64,
            min: min as f64,
            max: max as f64,
        });
    }
    Ok(())
}

fn check_interval(
    field: &'static str,
    value: Duration,
    min: Duration,
) -> Result<(), ConfigError> {
    if value < min {
        return Err(ConfigError::IntervalTooShort { field, value, min });
    }
    Ok(())
}

fn env_f32(name: &str) -> Option<f32> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(SystemParams::default().validate().is_ok());
        assert!(AgentConfig::default().validate().is_ok());
    }

    #[test]
    fn test_temperature_range_enforced() {
        let mut params = SystemParams::default();
        params.deliberation_temperature = 2.5;
        assert!(params.validate().is_err());

        let mut config = AgentConfig::default();
        config.temperature = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_interval_floors_enforced() {
        let mut params = SystemParams::default();
        params.deliberation_interval = Duration::from_millis(100);
        assert!(matches!(
            params.validate(),
            Err(ConfigError::IntervalTooShort { field: "deliberation_interval", .. })
        ));

        params.deliberation_interval = Duration::from_millis(500);
        params.execution_interval = Duration::from_millis(50);
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_compression_threshold_range() {
        let mut params = SystemParams::default();
        params.compression_threshold = 0.3;
        assert!(params.validate().is_err());
        params.compression_threshold = 1.0;
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_unknown_log_level_rejected() {
        let mut params = SystemParams::default();
        params.log_level = "verbose".to_string();
        assert!(matches!(
            params.validate(),
            Err(ConfigError::UnknownLogLevel(_))
        ));
    }

    #[test]
    fn test_zero_max_tokens_rejected() {
        let mut config = AgentConfig::default();
        config.max_tokens = 0;
        assert!(config.validate().is_err());
    }
}
