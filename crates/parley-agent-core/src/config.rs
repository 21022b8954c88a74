use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parley_ai::{
    ChatTransportRef, DEFAULT_RETRY_BASE_BACKOFF_MS, DEFAULT_TRANSPORT_RETRY_COUNT, ModelCatalog,
    ModelSpec, ReliableTransport,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context_window::{ContextWindowOptions, DEFAULT_CONTEXT_BUDGET_RATIO};
use crate::stream_state::DEFAULT_EMPTY_RESPONSE_PLACEHOLDER;

const DEFAULT_PARLEY_HOME_DIR_NAME: &str = ".parley";
pub const CONFIG_FILE_NAME: &str = "parley.toml";
pub const DEFAULT_CANCELLED_ACKNOWLEDGEMENT: &str = "Generation stopped.";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {} failed: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse parley.toml failed: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub context_budget_ratio: f64,
    /// Fixed token budget. Overrides the ratio when set.
    pub context_budget_tokens: Option<usize>,
    pub empty_response_placeholder: String,
    pub cancelled_acknowledgement: String,
    pub transport_retry_count: usize,
    pub retry_base_backoff_ms: u64,
    pub provider_backoff_ms: HashMap<String, u64>,
    pub validate_tool_arguments: bool,
    /// Stop after a tool batch that produced a resource block instead of
    /// feeding the results back to the model.
    pub short_circuit_resource_results: bool,
    pub models: Vec<ModelSpec>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            context_budget_ratio: DEFAULT_CONTEXT_BUDGET_RATIO,
            context_budget_tokens: None,
            empty_response_placeholder: DEFAULT_EMPTY_RESPONSE_PLACEHOLDER.to_string(),
            cancelled_acknowledgement: DEFAULT_CANCELLED_ACKNOWLEDGEMENT.to_string(),
            transport_retry_count: DEFAULT_TRANSPORT_RETRY_COUNT,
            retry_base_backoff_ms: DEFAULT_RETRY_BASE_BACKOFF_MS,
            provider_backoff_ms: HashMap::new(),
            validate_tool_arguments: true,
            short_circuit_resource_results: true,
            models: vec![],
        }
    }
}

impl OrchestratorConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config = if content.trim().is_empty() {
            Self::default()
        } else {
            toml::from_str::<Self>(content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Reads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.context_budget_ratio > 0.0 && self.context_budget_ratio <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "context_budget_ratio must be in (0, 1], got {}",
                self.context_budget_ratio
            )));
        }
        if self.context_budget_tokens == Some(0) {
            return Err(ConfigError::Invalid(
                "context_budget_tokens must be positive".to_string(),
            ));
        }
        if let Some(model) = self
            .models
            .iter()
            .find(|model| model.provider.trim().is_empty() || model.id.trim().is_empty())
        {
            return Err(ConfigError::Invalid(format!(
                "model entry needs provider and id: {model:?}"
            )));
        }
        Ok(())
    }

    /// Built-in catalog with configured entries layered on top.
    pub fn model_catalog(&self) -> ModelCatalog {
        let mut catalog = ModelCatalog::with_defaults();
        catalog.extend(self.models.iter().cloned());
        catalog
    }

    pub fn context_window_options(&self, provider: &str, model: &str) -> ContextWindowOptions {
        ContextWindowOptions {
            provider: provider.to_string(),
            model: model.to_string(),
            budget_ratio: self.context_budget_ratio,
            budget_tokens: self.context_budget_tokens,
        }
    }

    pub fn reliable_transport(&self, inner: ChatTransportRef) -> ReliableTransport {
        self.provider_backoff_ms.iter().fold(
            ReliableTransport::wrap(inner)
                .max_retries(self.transport_retry_count)
                .base_backoff_ms(self.retry_base_backoff_ms),
            |transport, (provider, backoff_ms)| {
                transport.provider_backoff_ms(provider.clone(), *backoff_ms)
            },
        )
    }
}

pub fn parley_home_dir(conf_dir: Option<&Path>) -> PathBuf {
    conf_dir
        .map(resolve_home_arg)
        .unwrap_or_else(|| home_dir().join(DEFAULT_PARLEY_HOME_DIR_NAME))
}

pub fn default_config_path(conf_dir: Option<&Path>) -> PathBuf {
    parley_home_dir(conf_dir).join(CONFIG_FILE_NAME)
}

fn resolve_home_arg(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    if raw == "~" {
        home_dir()
    } else if let Some(suffix) = raw.strip_prefix("~/") {
        home_dir().join(suffix)
    } else {
        path.to_path_buf()
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().expect("tempdir");
        let config = OrchestratorConfig::load(&dir.path().join(CONFIG_FILE_NAME)).expect("load");
        assert_eq!(config, OrchestratorConfig::default());
        assert_eq!(config.transport_retry_count, 3);
        assert_eq!(config.retry_base_backoff_ms, 1_000);
        assert!(config.short_circuit_resource_results);
    }

    #[test]
    fn toml_overrides_and_extends_model_catalog() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            r#"
context_budget_ratio = 0.5
empty_response_placeholder = "(no reply)"
transport_retry_count = 1
validate_tool_arguments = false

[provider_backoff_ms]
ollama = 250

[[models]]
provider = "local"
id = "tiny"
context_window = 4096

[[models]]
provider = "openai"
id = "gpt-4o"
context_window = 64000
"#,
        )
        .expect("write config");

        let config = OrchestratorConfig::load(&path).expect("load");
        assert_eq!(config.context_budget_ratio, 0.5);
        assert_eq!(config.empty_response_placeholder, "(no reply)");
        assert_eq!(config.transport_retry_count, 1);
        assert!(!config.validate_tool_arguments);
        assert_eq!(config.provider_backoff_ms.get("ollama"), Some(&250));
        assert_eq!(config.cancelled_acknowledgement, DEFAULT_CANCELLED_ACKNOWLEDGEMENT);

        let catalog = config.model_catalog();
        assert_eq!(catalog.lookup("local", "tiny").map(|spec| spec.context_window), Some(4096));
        assert_eq!(
            catalog.lookup("openai", "gpt-4o").map(|spec| spec.context_window),
            Some(64_000)
        );
    }

    #[test]
    fn rejects_out_of_range_ratio() {
        let error = OrchestratorConfig::from_toml_str("context_budget_ratio = 1.5")
            .expect_err("ratio too large");
        assert!(matches!(error, ConfigError::Invalid(_)));

        let error = OrchestratorConfig::from_toml_str("transport_retry_count = \"many\"")
            .expect_err("wrong type");
        assert!(matches!(error, ConfigError::Parse(_)));
    }

    #[test]
    fn explicit_conf_dir_is_used_verbatim() {
        let resolved = parley_home_dir(Some(Path::new("/tmp/parley-conf")));
        assert_eq!(resolved, PathBuf::from("/tmp/parley-conf"));
        assert!(default_config_path(None).ends_with(".parley/parley.toml"));
    }
}
