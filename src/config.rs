//! Configuration loading.
//!
//! Precedence: env vars > `./straylight.toml` > defaults. A `.env` file
//! is loaded first so env-var overrides can live there during
//! development.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

/// Environment variable prefix for overrides.
const ENV_PREFIX: &str = "STRAYLIGHT_";

/// Default extraction deadline in seconds.
const DEFAULT_EXTRACTOR_TIMEOUT_SECS: u64 = 15;

/// Text-generation provider settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Full URL of the completions route.
    pub endpoint: String,
    /// Model identifier sent with each request.
    pub model: String,
    /// Bearer key, when the endpoint requires one.
    pub api_key: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434/v1/completions".to_owned(),
            model: "llama3".to_owned(),
            api_key: None,
        }
    }
}

/// Pipeline tuning knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Extraction call deadline in seconds.
    pub extractor_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            extractor_timeout_secs: DEFAULT_EXTRACTOR_TIMEOUT_SECS,
        }
    }
}

/// Filesystem locations.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// SQLite journal file.
    pub journal_db: PathBuf,
    /// Directory for rotated log files.
    pub logs_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let base = directories::ProjectDirs::from("", "", "straylight")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            journal_db: base.join("journal.db"),
            logs_dir: base.join("logs"),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StraylightConfig {
    /// Text-generation provider.
    pub provider: ProviderConfig,
    /// Pipeline knobs.
    pub pipeline: PipelineConfig,
    /// Filesystem locations.
    pub paths: PathsConfig,
}

impl StraylightConfig {
    /// Load configuration with the standard precedence.
    ///
    /// # Errors
    ///
    /// Returns an error when a config file exists but cannot be parsed.
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let mut config = match std::fs::read_to_string("straylight.toml") {
            Ok(text) => Self::from_toml(&text)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from an explicit file path, then apply env
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error when the file is missing or unparseable.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config = Self::from_toml(&text)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error on invalid TOML or unknown value types.
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        toml::from_str(text).context("failed to parse configuration")
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}ENDPOINT")) {
            self.provider.endpoint = v;
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}MODEL")) {
            self.provider.model = v;
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}API_KEY")) {
            self.provider.api_key = Some(v);
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}EXTRACTOR_TIMEOUT_SECS")) {
            if let Ok(secs) = v.parse() {
                self.pipeline.extractor_timeout_secs = secs;
            }
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}JOURNAL_DB")) {
            self.paths.journal_db = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}LOGS_DIR")) {
            self.paths.logs_dir = PathBuf::from(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = StraylightConfig::default();
        assert_eq!(config.pipeline.extractor_timeout_secs, 15);
        assert!(config.provider.endpoint.starts_with("http"));
        assert!(config.provider.api_key.is_none());
    }

    #[test]
    fn parses_partial_toml() {
        let config = StraylightConfig::from_toml(
            r#"
            [provider]
            endpoint = "https://api.example.com/v1/completions"
            model = "gpt-4o-mini"
            "#,
        )
        .expect("parse");
        assert_eq!(config.provider.model, "gpt-4o-mini");
        // Unspecified sections fall back to defaults.
        assert_eq!(config.pipeline.extractor_timeout_secs, 15);
    }

    #[test]
    fn parses_pipeline_section() {
        let config = StraylightConfig::from_toml(
            r#"
            [pipeline]
            extractor_timeout_secs = 5
            "#,
        )
        .expect("parse");
        assert_eq!(config.pipeline.extractor_timeout_secs, 5);
    }

    #[test]
    fn rejects_invalid_toml() {
        assert!(StraylightConfig::from_toml("provider = [broken").is_err());
    }
}
