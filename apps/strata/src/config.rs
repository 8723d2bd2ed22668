//! # Application Configuration
//!
//! `strata.toml` holds the engine sections (`[similarity]`, `[merge]`,
//! `[consolidation]`, `[path]`) plus an optional `[provider]` section for the
//! remote capability service. Every key is optional.
//!
//! Environment overrides use the `STRATA_` prefix:
//! - `STRATA_PROVIDER_URL` → `provider.base_url`
//! - `STRATA_POOL_SIZE` → `consolidation.pool_size`

use serde::{Deserialize, Serialize};
use std::path::Path;
use strata_core::{EngineConfig, StrataError};

/// Default request timeout for provider calls, in seconds.
pub const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 60;

/// Where and how to reach the capability service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    /// Name of the environment variable holding the bearer token.
    pub api_key_env: Option<String>,
    pub timeout_secs: u64,
    /// Whether the service also provides embeddings.
    pub embeddings: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8700".to_string(),
            api_key_env: None,
            timeout_secs: DEFAULT_PROVIDER_TIMEOUT_SECS,
            embeddings: true,
        }
    }
}

impl ProviderConfig {
    /// Resolve the API key from the configured environment variable.
    #[must_use]
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|key| !key.is_empty())
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(flatten)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub provider: Option<ProviderConfig>,
}

impl AppConfig {
    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn from_file(path: &Path) -> Result<Self, StrataError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            StrataError::Config(format!("failed to read '{}': {}", path.display(), e))
        })?;
        Self::parse_toml(&contents)
    }

    /// Parse configuration from a TOML string, apply env overrides, then validate.
    pub fn parse_toml(toml_str: &str) -> Result<Self, StrataError> {
        let mut config: AppConfig = toml::from_str(toml_str)
            .map_err(|e| StrataError::Config(format!("failed to parse TOML: {}", e)))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, StrataError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("STRATA_PROVIDER_URL") {
            self.provider.get_or_insert_with(ProviderConfig::default).base_url = v;
        }
        if let Ok(v) = std::env::var("STRATA_POOL_SIZE") {
            if let Ok(size) = v.parse::<usize>() {
                self.engine.consolidation.pool_size = size;
            }
        }
    }

    pub fn validate(&self) -> Result<(), StrataError> {
        self.engine.validate()?;
        if let Some(provider) = &self.provider {
            if !provider.base_url.starts_with("http://") && !provider.base_url.starts_with("https://")
            {
                return Err(StrataError::Config(format!(
                    "provider.base_url must be an http(s) URL, got '{}'",
                    provider.base_url
                )));
            }
            if provider.timeout_secs == 0 {
                return Err(StrataError::Config(
                    "provider.timeout_secs must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }
}
