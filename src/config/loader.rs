//! Configuration file loading and parsing.

use crate::errors::Error;
use serde::Deserialize;
use std::path::PathBuf;

use super::EmbeddingBackend;

/// Configuration loaded from TOML file. Absent keys keep their defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub database_path: Option<PathBuf>,
    pub embedding_backend: Option<EmbeddingBackend>,
    pub embedding_model: Option<String>,
    pub model_cache: Option<PathBuf>,
    pub user_id: Option<String>,
    pub search_limit: Option<usize>,
    pub rrf_k: Option<f64>,
    pub keyword_weight: Option<f64>,
    pub vector_weight: Option<f64>,
    pub extraction_workers: Option<usize>,
    pub max_buffered_records: Option<usize>,
    pub settle_timeout_secs: Option<u64>,
    pub enable_semantic_memory: Option<bool>,
    pub enable_prediction_correction: Option<bool>,
}

/// Location of the user config file: `<config dir>/mnemon/config.toml`.
pub fn config_file_path() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let config_dir = dirs::config_dir().unwrap_or_else(|| home.join(".config"));
    config_dir.join("mnemon/config.toml")
}

/// Load configuration from TOML file.
pub fn load_from_file() -> Result<Option<ConfigFile>, Error> {
    let config_path = config_file_path();

    if config_path.exists() {
        let content = std::fs::read_to_string(&config_path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file {}: {e}",
                config_path.display()
            ))
        })?;

        let config: ConfigFile = toml::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "Failed to parse config file {}: {e}",
                config_path.display()
            ))
        })?;

        tracing::debug!(path = %config_path.display(), "loaded config file");
        Ok(Some(config))
    } else {
        Ok(None)
    }
}
