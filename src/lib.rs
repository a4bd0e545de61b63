//! mnemon - Episodic and semantic memory for conversational agents.
//!
//! Conversation turns are stored as episodic records. Background workers
//! derive durable semantic facts from them, superseding facts the user later
//! corrects. Both kinds of memory are searchable with BM25, vector, or hybrid
//! ranking. All operations are synchronous (no async/await required).
//!
//! # Example
//!
//! ```no_run
//! use mnemon::{Config, MemoryService, SearchMethod, Turn};
//!
//! let service = MemoryService::open(Config::load()?)?;
//!
//! service.ingest_turns(vec![
//!     Turn::user("My favorite color is blue."),
//!     Turn::assistant("Noted!"),
//! ])?;
//! service.await_derivation(None)?;
//!
//! for result in service.search("favorite color", SearchMethod::Hybrid)? {
//!     println!("{} {:.3}: {}", result.source_type.as_str(), result.score, result.content);
//! }
//!
//! service.shutdown()?;
//! # Ok::<(), mnemon::Error>(())
//! ```
//!
//! # Users
//!
//! `MemoryEngine` serves any number of user partitions from one database
//! file; every operation takes a `user_id`. `MemoryService` binds one user.

pub mod config;
pub mod coordinator;
pub mod embedding;
pub mod episodic;
pub mod errors;
pub mod extractor;
pub mod indexer;
pub mod memory_types;
mod rrf;
pub mod search;
pub mod service;
mod sqlite;
mod text;

// Re-export public API
pub use config::{Config, EmbeddingBackend};
pub use coordinator::{MemoryEngine, Settlement};
pub use embedding::{EMBEDDING_DIMS, Embedder, EmbeddingEngine, HashEmbedder};
pub use episodic::MAX_INPUT_LENGTH;
pub use errors::Error;
pub use extractor::{CandidateFact, FactExtractor, PatternExtractor, Polarity};
pub use memory_types::{
    EpisodicRecord, FactStatus, IngestResult, Role, ScoredResult, SemanticFact, SourceType, Turn,
};
pub use search::SearchMethod;
pub use service::MemoryService;
pub use sqlite::MAX_SEARCH_LIMIT;
