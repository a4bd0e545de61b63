//! Environment variable overrides for configuration.

use crate::errors::Error;

use super::Config;
use super::env_parser::{
    apply_override, parse_env_bool, parse_env_path, parse_env_string, parse_env_value,
};

#[cfg(test)]
use super::tests_utils::ENV_MUTEX;

/// Apply `MNEMON_*` environment variable overrides to configuration.
pub fn apply_env_overrides(config: &mut Config) -> Result<(), Error> {
    apply_override("MNEMON_DATABASE_PATH", &mut config.database_path, parse_env_path)?;
    apply_override(
        "MNEMON_EMBEDDING_BACKEND",
        &mut config.embedding_backend,
        parse_env_value,
    )?;
    apply_override(
        "MNEMON_EMBEDDING_MODEL",
        &mut config.embedding_model,
        parse_env_string,
    )?;
    apply_override("MNEMON_MODEL_CACHE", &mut config.model_cache, parse_env_path)?;
    apply_override("MNEMON_USER", &mut config.user_id, parse_env_string)?;
    apply_override("MNEMON_SEARCH_LIMIT", &mut config.search_limit, parse_env_value)?;
    apply_override("MNEMON_RRF_K", &mut config.rrf_k, parse_env_value)?;
    apply_override(
        "MNEMON_KEYWORD_WEIGHT",
        &mut config.keyword_weight,
        parse_env_value,
    )?;
    apply_override(
        "MNEMON_VECTOR_WEIGHT",
        &mut config.vector_weight,
        parse_env_value,
    )?;
    apply_override(
        "MNEMON_EXTRACTION_WORKERS",
        &mut config.extraction_workers,
        parse_env_value,
    )?;
    apply_override(
        "MNEMON_MAX_BUFFERED_RECORDS",
        &mut config.max_buffered_records,
        parse_env_value,
    )?;
    apply_override(
        "MNEMON_SETTLE_TIMEOUT_SECS",
        &mut config.settle_timeout_secs,
        parse_env_value,
    )?;
    apply_override(
        "MNEMON_ENABLE_SEMANTIC_MEMORY",
        &mut config.enable_semantic_memory,
        parse_env_bool,
    )?;
    apply_override(
        "MNEMON_ENABLE_PREDICTION_CORRECTION",
        &mut config.enable_prediction_correction,
        parse_env_bool,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingBackend;
    use crate::config::tests_utils::{ALL_VARS, cleanup_env_vars, set_env_var};
    use std::path::PathBuf;

    #[test]
    fn test_env_var_overrides_config() {
        let _guard = ENV_MUTEX.lock().unwrap();
        cleanup_env_vars(ALL_VARS);

        set_env_var("MNEMON_DATABASE_PATH", "/custom/path/db.db");
        set_env_var("MNEMON_EMBEDDING_BACKEND", "hash");
        set_env_var("MNEMON_EMBEDDING_MODEL", "env/model");
        set_env_var("MNEMON_USER", "alice");
        set_env_var("MNEMON_RRF_K", "60");
        set_env_var("MNEMON_EXTRACTION_WORKERS", "4");
        set_env_var("MNEMON_ENABLE_PREDICTION_CORRECTION", "false");

        let mut config = Config::default();
        apply_env_overrides(&mut config).unwrap();

        assert_eq!(config.database_path, PathBuf::from("/custom/path/db.db"));
        assert_eq!(config.embedding_backend, EmbeddingBackend::Hash);
        assert_eq!(config.embedding_model, "env/model");
        assert_eq!(config.user_id, "alice");
        assert_eq!(config.rrf_k, 60.0);
        assert_eq!(config.extraction_workers, 4);
        assert!(!config.enable_prediction_correction);
        assert!(config.enable_semantic_memory);

        cleanup_env_vars(ALL_VARS);
    }

    #[test]
    fn test_invalid_numeric_override() {
        let _guard = ENV_MUTEX.lock().unwrap();
        cleanup_env_vars(ALL_VARS);

        set_env_var("MNEMON_KEYWORD_WEIGHT", "invalid");

        let mut config = Config::default();
        let result = apply_env_overrides(&mut config);
        assert!(matches!(result, Err(Error::Config(_))));

        cleanup_env_vars(ALL_VARS);
    }

    #[test]
    fn test_empty_env_var_rejected() {
        let _guard = ENV_MUTEX.lock().unwrap();
        cleanup_env_vars(ALL_VARS);

        set_env_var("MNEMON_DATABASE_PATH", "");

        let mut config = Config::default();
        let result = apply_env_overrides(&mut config);
        assert!(matches!(result, Err(Error::Config(_))));

        cleanup_env_vars(ALL_VARS);
    }

    #[test]
    fn test_whitespace_env_var_rejected() {
        let _guard = ENV_MUTEX.lock().unwrap();
        cleanup_env_vars(ALL_VARS);

        set_env_var("MNEMON_EMBEDDING_MODEL", "   ");

        let mut config = Config::default();
        let result = apply_env_overrides(&mut config);
        assert!(matches!(result, Err(Error::Config(_))));

        cleanup_env_vars(ALL_VARS);
    }

    #[test]
    fn test_invalid_bool_override() {
        let _guard = ENV_MUTEX.lock().unwrap();
        cleanup_env_vars(ALL_VARS);

        set_env_var("MNEMON_ENABLE_SEMANTIC_MEMORY", "sometimes");

        let mut config = Config::default();
        assert!(matches!(
            apply_env_overrides(&mut config),
            Err(Error::Config(_))
        ));

        cleanup_env_vars(ALL_VARS);
    }

    #[test]
    fn test_unset_vars_leave_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap();
        cleanup_env_vars(ALL_VARS);

        let mut config = Config::default();
        apply_env_overrides(&mut config).unwrap();

        let defaults = Config::default();
        assert_eq!(config.database_path, defaults.database_path);
        assert_eq!(config.search_limit, defaults.search_limit);
        assert_eq!(config.user_id, defaults.user_id);
    }
}
