//! Configuration system for mnemon.

mod env_parser;
mod loader;
mod overrides;
mod paths;
mod validation;

#[cfg(test)]
mod tests_utils;
#[cfg(test)]
use tests_utils::ENV_MUTEX;

use crate::errors::Error;
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub use loader::ConfigFile;

/// Fixed logical user used when no explicit user id is given.
pub const DEFAULT_USER_ID: &str = "__user__";

/// Which embedder backs the vector index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// Local ONNX model downloaded from HuggingFace Hub.
    Onnx,
    /// Deterministic feature hashing; no model download.
    Hash,
}

impl FromStr for EmbeddingBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "onnx" => Ok(EmbeddingBackend::Onnx),
            "hash" => Ok(EmbeddingBackend::Hash),
            other => Err(Error::Config(format!(
                "Unknown embedding backend '{}' (expected 'onnx' or 'hash')",
                other
            ))),
        }
    }
}

/// Configuration values with priority: defaults < config file < env vars.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database shared by all user partitions.
    pub database_path: PathBuf,

    /// Embedder implementation.
    pub embedding_backend: EmbeddingBackend,

    /// HuggingFace embedding model identifier (ONNX backend).
    pub embedding_model: String,

    /// Directory for caching ONNX models.
    pub model_cache: PathBuf,

    /// Partition key used by the CLI and `MemoryService` when none is given.
    pub user_id: String,

    /// Results per source type returned by a search.
    pub search_limit: usize,

    /// RRF k parameter for hybrid fusion.
    pub rrf_k: f64,

    /// Weight of the keyword ranking in hybrid fusion.
    pub keyword_weight: f64,

    /// Weight of the vector ranking in hybrid fusion.
    pub vector_weight: f64,

    /// Number of background extraction threads.
    pub extraction_workers: usize,

    /// Buffered records per user before `ingest` flushes on its own.
    pub max_buffered_records: usize,

    /// Default wait for settlement, in seconds.
    pub settle_timeout_secs: u64,

    /// Derive semantic facts from episodic records.
    pub enable_semantic_memory: bool,

    /// Supersede facts when a later record changes their value.
    pub enable_prediction_correction: bool,
}

impl Default for Config {
    fn default() -> Self {
        // Use home directory with sensible fallback for systems without HOME
        let home = dirs::home_dir().unwrap_or_else(|| {
            std::env::var("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("."))
        });
        let mnemon_dir = home.join(".mnemon");

        Self {
            database_path: mnemon_dir.join("memory.db"),
            embedding_backend: EmbeddingBackend::Onnx,
            embedding_model: "BAAI/bge-small-en-v1.5".to_string(),
            model_cache: mnemon_dir.join("models"),
            user_id: DEFAULT_USER_ID.to_string(),
            search_limit: 10,
            rrf_k: 25.0,
            keyword_weight: 1.0,
            vector_weight: 1.0,
            extraction_workers: 2,
            max_buffered_records: 16,
            settle_timeout_secs: 60,
            enable_semantic_memory: true,
            enable_prediction_correction: true,
        }
    }
}

impl Config {
    /// Load configuration with defaults, file values, and environment overrides.
    pub fn load() -> Result<Self, Error> {
        let file_config = loader::load_from_file()?;

        let mut config = Config::default();

        if let Some(mut file) = file_config {
            if let Some(path) = file.database_path.as_mut() {
                paths::expand_tilde(path);
            }
            if let Some(path) = file.model_cache.as_mut() {
                paths::expand_tilde(path);
            }
            config.merge_from_file(file);
        }

        overrides::apply_env_overrides(&mut config)?;

        config.validate()?;

        Ok(config)
    }

    /// Configuration for a throwaway engine: database under `dir`, hashing
    /// embedder, one extraction worker.
    pub fn ephemeral(dir: &std::path::Path) -> Self {
        Self {
            database_path: dir.join("memory.db"),
            embedding_backend: EmbeddingBackend::Hash,
            model_cache: dir.join("models"),
            extraction_workers: 1,
            ..Self::default()
        }
    }

    /// Default settlement wait as a `Duration`.
    pub fn settle_timeout(&self) -> Duration {
        Duration::from_secs(self.settle_timeout_secs)
    }

    /// Merge configuration from a file into this config.
    fn merge_from_file(&mut self, file: ConfigFile) {
        if let Some(v) = file.database_path.filter(|p| !p.as_os_str().is_empty()) {
            self.database_path = v;
        }
        if let Some(v) = file.embedding_backend {
            self.embedding_backend = v;
        }
        if let Some(v) = file.embedding_model.filter(|m| !m.is_empty()) {
            self.embedding_model = v;
        }
        if let Some(v) = file.model_cache.filter(|p| !p.as_os_str().is_empty()) {
            self.model_cache = v;
        }
        if let Some(v) = file.user_id {
            self.user_id = v;
        }
        if let Some(v) = file.search_limit {
            self.search_limit = v;
        }
        if let Some(v) = file.rrf_k {
            self.rrf_k = v;
        }
        if let Some(v) = file.keyword_weight {
            self.keyword_weight = v;
        }
        if let Some(v) = file.vector_weight {
            self.vector_weight = v;
        }
        if let Some(v) = file.extraction_workers {
            self.extraction_workers = v;
        }
        if let Some(v) = file.max_buffered_records {
            self.max_buffered_records = v;
        }
        if let Some(v) = file.settle_timeout_secs {
            self.settle_timeout_secs = v;
        }
        if let Some(v) = file.enable_semantic_memory {
            self.enable_semantic_memory = v;
        }
        if let Some(v) = file.enable_prediction_correction {
            self.enable_prediction_correction = v;
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), Error> {
        validation::ConfigValidator::new(self).validate()
    }

    /// Ensure parent directories for database and cache paths exist.
    pub fn ensure_directories(&self) -> Result<(), Error> {
        if let Some(parent) = self.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::Config(format!(
                        "Failed to create database directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        if self.embedding_backend == EmbeddingBackend::Onnx
            && !self.model_cache.as_os_str().is_empty()
        {
            std::fs::create_dir_all(&self.model_cache).map_err(|e| {
                Error::Config(format!(
                    "Failed to create model cache directory {}: {e}",
                    self.model_cache.display()
                ))
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert!(config.database_path.ends_with(".mnemon/memory.db"));
        assert_eq!(config.embedding_model, "BAAI/bge-small-en-v1.5");
        assert_eq!(config.embedding_backend, EmbeddingBackend::Onnx);
        assert_eq!(config.user_id, DEFAULT_USER_ID);
        assert_eq!(config.rrf_k, 25.0);
        assert!(config.enable_semantic_memory);
        assert!(config.enable_prediction_correction);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_load_without_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        tests_utils::cleanup_env_vars(tests_utils::ALL_VARS);

        let config = Config::load().unwrap();
        assert_eq!(config.search_limit, 10);
        assert_eq!(config.extraction_workers, 2);
    }

    #[test]
    fn test_merge_from_file_only_overrides_present_fields() {
        let mut config = Config::default();
        let file: ConfigFile = toml::from_str(
            r#"
            embedding_backend = "hash"
            search_limit = 3
            enable_prediction_correction = false
            "#,
        )
        .unwrap();
        config.merge_from_file(file);

        assert_eq!(config.embedding_backend, EmbeddingBackend::Hash);
        assert_eq!(config.search_limit, 3);
        assert!(!config.enable_prediction_correction);
        assert_eq!(config.rrf_k, 25.0);
        assert!(config.database_path.ends_with(".mnemon/memory.db"));
    }

    #[test]
    fn test_ephemeral_uses_hash_backend() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::ephemeral(dir.path());
        assert_eq!(config.embedding_backend, EmbeddingBackend::Hash);
        assert!(config.database_path.starts_with(dir.path()));
        assert!(config.ensure_directories().is_ok());
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("ONNX".parse::<EmbeddingBackend>().unwrap(), EmbeddingBackend::Onnx);
        assert!(matches!("gpu".parse::<EmbeddingBackend>(), Err(Error::Config(_))));
    }
}
