//! Agent configuration loaded from TOML with environment overrides.
//!
//! Every section has defaults, so an empty file is a valid configuration:
//!
//! ```toml
//! max_steps = 12
//!
//! [budget]
//! max_usd = 0.25
//!
//! [models.coder]
//! provider = "ollama"
//! model = "qwen2.5-coder"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::budget::ModelPricing;
use crate::sandbox::ExecutionLimits;

pub const ENV_MAX_STEPS: &str = "RLM_MAX_STEPS";
pub const ENV_MAX_DEPTH: &str = "RLM_MAX_DEPTH";
pub const ENV_MAX_USD: &str = "RLM_MAX_USD";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {var}: {value:?}")]
    EnvOverride { var: String, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which wire protocol and defaults a model endpoint uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Ollama,
    Gemini,
}

impl Provider {
    /// OpenAI-compatible base URL for the provider.
    pub fn default_base_url(self) -> &'static str {
        match self {
            Provider::OpenAi => "https://api.openai.com/v1",
            Provider::Ollama => "http://localhost:11434/v1",
            Provider::Gemini => "https://generativelanguage.googleapis.com/v1beta/openai",
        }
    }

    pub fn default_api_key_env(self) -> Option<&'static str> {
        match self {
            Provider::OpenAi => Some("OPENAI_API_KEY"),
            Provider::Ollama => None,
            Provider::Gemini => Some("GEMINI_API_KEY"),
        }
    }
}

/// Endpoint, model and pricing for one role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub provider: Provider,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
    pub input_price_per_1m: f64,
    pub output_price_per_1m: f64,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            provider: Provider::OpenAi,
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key_env: None,
            input_price_per_1m: 0.30,
            output_price_per_1m: 2.50,
            temperature: None,
            max_tokens: None,
        }
    }
}

impl ModelSettings {
    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.provider.default_base_url())
    }

    pub fn api_key_env(&self) -> Option<&str> {
        self.api_key_env
            .as_deref()
            .or_else(|| self.provider.default_api_key_env())
    }

    pub fn pricing(&self) -> ModelPricing {
        ModelPricing {
            input_per_1m: self.input_price_per_1m,
            output_per_1m: self.output_price_per_1m,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub router: ModelSettings,
    pub coder: ModelSettings,
    pub responder: ModelSettings,
    pub delegator: ModelSettings,
    pub sub_query: ModelSettings,
}

impl ModelsConfig {
    pub fn roles(&self) -> [(&'static str, &ModelSettings); 5] {
        [
            ("router", &self.router),
            ("coder", &self.coder),
            ("responder", &self.responder),
            ("delegator", &self.delegator),
            ("sub_query", &self.sub_query),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    pub timeout_ms: u64,
    pub max_operations: u64,
    pub max_recursion: usize,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        let limits = ExecutionLimits::default();
        Self {
            timeout_ms: limits.timeout.as_millis() as u64,
            max_operations: limits.max_operations,
            max_recursion: limits.max_call_depth,
        }
    }
}

impl ExecutionSettings {
    pub fn limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            timeout: Duration::from_millis(self.timeout_ms),
            max_operations: self.max_operations,
            max_call_depth: self.max_recursion,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetSettings {
    pub max_usd: f64,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self { max_usd: 1.0 }
    }
}

/// When and how the responder's history context is summarised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionSettings {
    pub threshold_chars: usize,
    pub chunk_chars: usize,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            threshold_chars: 32_000,
            chunk_chars: 8_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_steps: u32,
    pub max_depth: u32,
    pub max_delegate_rounds: u32,
    pub max_subtasks: usize,
    pub max_chunk_chars: usize,
    /// Base directory for run directories; `None` disables artifacts.
    pub output_dir: Option<PathBuf>,
    /// Read-only directory of input files.
    pub context_dir: Option<PathBuf>,
    pub execution: ExecutionSettings,
    pub budget: BudgetSettings,
    pub compaction: CompactionSettings,
    pub models: ModelsConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 10,
            max_depth: 3,
            max_delegate_rounds: 2,
            max_subtasks: 5,
            max_chunk_chars: 50_000,
            output_dir: None,
            context_dir: None,
            execution: ExecutionSettings::default(),
            budget: BudgetSettings::default(),
            compaction: CompactionSettings::default(),
            models: ModelsConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Parses and validates a TOML document. Environment overrides are not applied.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `path`, applies `RLM_*` overrides and validates.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: AgentConfig = toml::from_str(&text)?;
        config.apply_env_overrides()?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup(ENV_MAX_STEPS) {
            self.max_steps = parse_override(ENV_MAX_STEPS, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_DEPTH) {
            self.max_depth = parse_override(ENV_MAX_DEPTH, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_USD) {
            self.budget.max_usd = parse_override(ENV_MAX_USD, &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_steps == 0 {
            return Err(ConfigError::Invalid("max_steps must be at least 1".into()));
        }
        if self.max_chunk_chars == 0 {
            return Err(ConfigError::Invalid("max_chunk_chars must be positive".into()));
        }
        if !self.budget.max_usd.is_finite() || self.budget.max_usd <= 0.0 {
            return Err(ConfigError::Invalid("budget.max_usd must be positive".into()));
        }
        if self.execution.timeout_ms == 0 {
            return Err(ConfigError::Invalid("execution.timeout_ms must be positive".into()));
        }
        if self.compaction.chunk_chars == 0 {
            return Err(ConfigError::Invalid("compaction.chunk_chars must be positive".into()));
        }
        for (role, settings) in self.models.roles() {
            if settings.model.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("models.{role}.model is empty")));
            }
            if settings.input_price_per_1m < 0.0 || settings.output_price_per_1m < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "models.{role} prices must not be negative"
                )));
            }
        }
        Ok(())
    }
}

fn parse_override<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::EnvOverride {
        var: var.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.max_steps, 10);
        assert_eq!(config.max_depth, 3);
        assert_eq!(config.max_delegate_rounds, 2);
        assert_eq!(config.max_subtasks, 5);
        assert_eq!(config.max_chunk_chars, 50_000);
        assert_eq!(config.budget.max_usd, 1.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(AgentConfig::from_toml_str("").unwrap(), AgentConfig::default());
    }

    #[test]
    fn test_partial_document() {
        let config = AgentConfig::from_toml_str(
            r#"
            max_steps = 4

            [budget]
            max_usd = 0.25

            [models.coder]
            provider = "ollama"
            model = "qwen2.5-coder"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_steps, 4);
        assert_eq!(config.budget.max_usd, 0.25);
        assert_eq!(config.models.coder.provider, Provider::Ollama);
        assert_eq!(config.models.coder.base_url(), "http://localhost:11434/v1");
        assert_eq!(config.models.coder.api_key_env(), None);
        assert_eq!(config.models.router.model, "gpt-4o-mini");
    }

    #[test]
    fn test_validate_rejects_zero_steps() {
        let err = AgentConfig::from_toml_str("max_steps = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_unknown_provider_is_parse_error() {
        let err = AgentConfig::from_toml_str("[models.router]\nprovider = \"acme\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_overrides() {
        let mut config = AgentConfig::default();
        config
            .apply_overrides(|name| match name {
                ENV_MAX_STEPS => Some("3".into()),
                ENV_MAX_USD => Some("0.1".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.max_steps, 3);
        assert_eq!(config.budget.max_usd, 0.1);
        assert_eq!(config.max_depth, 3);

        let err = config
            .apply_overrides(|name| (name == ENV_MAX_DEPTH).then(|| "deep".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::EnvOverride { .. }));
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rlm.toml");
        std::fs::write(&path, "max_subtasks = 2\n").unwrap();
        let config = AgentConfig::load(&path).unwrap();
        assert_eq!(config.max_subtasks, 2);
        assert!(matches!(
            AgentConfig::load(&dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_execution_limits_conversion() {
        let settings = ExecutionSettings {
            timeout_ms: 1500,
            max_operations: 10,
            max_recursion: 5,
        };
        let limits = settings.limits();
        assert_eq!(limits.timeout, Duration::from_millis(1500));
        assert_eq!(limits.max_call_depth, 5);
    }
}
