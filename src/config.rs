//! Configuration loading and types for the `upload-kit` CLI.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  The `upload` section becomes the manager's
//! [`GlobalUploadConfig`]; `logging` drives the tracing subscriber.

use std::path::Path;

use serde::Deserialize;

use crate::types::{CloudProvider, Credentials, GlobalUploadConfig};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Upload defaults.
    #[serde(default)]
    pub upload: UploadConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Defaults applied to calls that leave provider, bucket or credentials out.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UploadConfig {
    /// Provider used when a call names none.
    #[serde(default)]
    pub default_provider: Option<CloudProvider>,

    /// Bucket (or Azure container) the CLI uses when `--bucket` is absent.
    #[serde(default)]
    pub default_bucket: Option<String>,

    /// Credentials, tagged by `provider`.
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// The manager-level defaults from the `upload` section.
    ///
    /// Without an explicit `default_provider`, the credentials' provider is
    /// the default.
    pub fn global_upload_config(&self) -> GlobalUploadConfig {
        let default_provider = self
            .upload
            .default_provider
            .or_else(|| self.upload.credentials.as_ref().map(Credentials::provider));

        GlobalUploadConfig {
            default_provider,
            credentials: self.upload.credentials.clone(),
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config {}: {e}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("Failed to parse config {}: {e}", path.display()))?;
    Ok(config)
}

// -- Tests -------------------------------------------------------------------
