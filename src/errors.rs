//! Error types for mnemon.

use std::time::Duration;

use thiserror::Error;

/// Main error type for mnemon operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite error.
    #[error("SQLite error: {0}")]
    SQLite(#[from] rusqlite::Error),

    /// Storage layer error (encoding, dimensions, limits).
    #[error("Store error: {0}")]
    Store(#[from] crate::sqlite::Error),

    /// ONNX inference error.
    #[error("Inference error: {0}")]
    Inference(String),

    /// Tokenization error.
    #[error("Tokenization error: {0}")]
    Tokenization(#[from] tokenizers::Error),

    /// ONNX session error.
    #[error("ONNX session error: {0}")]
    Onnx(#[from] ort::Error),

    /// HuggingFace Hub error.
    #[error("HuggingFace Hub error: {0}")]
    HfHub(#[from] hf_hub::api::sync::ApiError),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed ingestion payload or query. Nothing was persisted.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Empty or whitespace-only text.
    #[error("Input cannot be empty")]
    EmptyInput,

    /// Text exceeds the maximum accepted length.
    #[error("Input too long: {actual_length} bytes (max {max_length})")]
    InputTooLong {
        max_length: usize,
        actual_length: usize,
    },

    /// A settlement wait was abandoned. Pending work keeps running.
    #[error("Timed out after {0:?} waiting for semantic derivation")]
    Timeout(Duration),

    /// The engine has been shut down.
    #[error("Memory engine is closed")]
    Closed,

    /// Deriving facts from one episodic record failed.
    #[error("Extraction failed for record {record_id}: {reason}")]
    ExtractionFailure { record_id: u64, reason: String },

    /// Index entries disagree with the stores for a user.
    #[error("Index inconsistent for user '{user_id}': {detail}")]
    IndexInconsistency { user_id: String, detail: String },

    /// Record or fact not found.
    #[error("Not found: {0}")]
    NotFound(String),
}
