//! Single-user library boundary over `MemoryEngine`.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::coordinator::MemoryEngine;
use crate::embedding::Embedder;
use crate::errors::Error;
use crate::extractor::FactExtractor;
use crate::memory_types::{IngestResult, ScoredResult, Turn};
use crate::search::SearchMethod;

/// Memory for one fixed user (`config.user_id`, `"__user__"` by default).
///
/// Every ingestion is flushed immediately, so searches see it at once.
pub struct MemoryService {
    engine: MemoryEngine,
    user_id: String,
}

impl MemoryService {
    /// Open a service with the configured embedder and pattern extractor.
    pub fn open(config: Config) -> Result<Self, Error> {
        let user_id = config.user_id.clone();
        Ok(Self {
            engine: MemoryEngine::open(config)?,
            user_id,
        })
    }

    /// Open a service with explicit collaborators.
    pub fn with_components(
        config: Config,
        embedder: Arc<dyn Embedder>,
        extractor: Arc<dyn FactExtractor>,
    ) -> Result<Self, Error> {
        let user_id = config.user_id.clone();
        Ok(Self {
            engine: MemoryEngine::with_components(config, embedder, extractor)?,
            user_id,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The underlying engine, for inspection beyond this boundary.
    pub fn engine(&self) -> &MemoryEngine {
        &self.engine
    }

    #[must_use = "handle the error or the turns may be lost"]
    /// Ingest one batch of turns and make it durable and searchable.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for an empty batch; `Closed` after `shutdown`.
    pub fn ingest_turns(&self, turns: Vec<Turn>) -> Result<IngestResult, Error> {
        let result = self.engine.ingest(&self.user_id, turns)?;
        self.engine.flush(&self.user_id)?;
        Ok(result)
    }

    /// Block until facts from every ingested batch have been derived.
    ///
    /// `None` waits without a deadline.
    ///
    /// # Errors
    ///
    /// `Timeout` once `timeout` elapses; derivation carries on regardless.
    pub fn await_derivation(&self, timeout: Option<Duration>) -> Result<(), Error> {
        self.engine.wait_for_settled(&self.user_id, timeout)
    }

    #[must_use = "handle the error or results may be lost"]
    /// Search with the configured result limit.
    pub fn search(&self, query: &str, method: SearchMethod) -> Result<Vec<ScoredResult>, Error> {
        self.engine.search(&self.user_id, query, method)
    }

    /// Shut the engine down. Every later call, including another
    /// `shutdown`, fails with `Closed`.
    pub fn shutdown(&self) -> Result<(), Error> {
        self.engine.close()
    }
}
