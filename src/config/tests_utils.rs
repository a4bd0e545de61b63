//! Shared test utilities for config module tests.

use std::sync::Mutex;

/// Mutex to serialize environment variable tests and prevent race conditions.
pub static ENV_MUTEX: Mutex<()> = Mutex::new(());

/// Every environment variable read by `apply_env_overrides`.
pub const ALL_VARS: &[&str] = &[
    "MNEMON_DATABASE_PATH",
    "MNEMON_EMBEDDING_BACKEND",
    "MNEMON_EMBEDDING_MODEL",
    "MNEMON_MODEL_CACHE",
    "MNEMON_USER",
    "MNEMON_SEARCH_LIMIT",
    "MNEMON_RRF_K",
    "MNEMON_KEYWORD_WEIGHT",
    "MNEMON_VECTOR_WEIGHT",
    "MNEMON_EXTRACTION_WORKERS",
    "MNEMON_MAX_BUFFERED_RECORDS",
    "MNEMON_SETTLE_TIMEOUT_SECS",
    "MNEMON_ENABLE_SEMANTIC_MEMORY",
    "MNEMON_ENABLE_PREDICTION_CORRECTION",
];

/// Set an environment variable. Callers hold `ENV_MUTEX`.
pub fn set_env_var(name: &str, value: &str) {
    // SAFETY: config tests serialize environment access through ENV_MUTEX.
    unsafe { std::env::set_var(name, value) };
}

/// Clean up environment variables used by mnemon config.
pub fn cleanup_env_vars(vars: &[&str]) {
    for var in vars {
        // SAFETY: config tests serialize environment access through ENV_MUTEX.
        unsafe { std::env::remove_var(var) };
    }
}
