//! Memory coordinator: per-user state, the ingestion pipeline and settlement.
//!
//! Each user id maps to one `UserMemoryState` holding its own SQLite
//! connection, write buffer, extraction queue and settlement counter. The
//! arena lock is only held to look up or insert a state; all other work locks
//! the user's own state.
//!
//! Ingestion: `ingest` buffers a record and advances the pending counter,
//! `flush` persists the buffer in one transaction, indexes it and queues it
//! for extraction. Extraction workers reconcile facts in the background and
//! decrement the counter once per record, success or not. `wait_for_settled`
//! flushes and then blocks until the counter reaches zero.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::config::Config;
use crate::embedding::{self, Embedder};
use crate::episodic::{EpisodicStore, ScanIter};
use crate::errors::Error;
use crate::extractor::{self, DerivationOutcome, FactExtractor, FactPolicy, PatternExtractor};
use crate::indexer::Indexer;
use crate::memory_types::{
    EpisodicRecord, FactStatus, IngestResult, ScoredResult, SemanticFact, Turn,
};
use crate::rrf::RrfConfig;
use crate::search::{self, SearchMethod, SearchParams};
use crate::sqlite::Database;

/// Counter of records whose extraction has not finished, with a broadcast
/// when it drops to zero.
#[derive(Default)]
pub struct Settlement {
    pending: Mutex<usize>,
    settled: Condvar,
}

impl Settlement {
    pub fn add(&self, n: usize) {
        *self.pending.lock() += n;
    }

    /// Mark one record finished. Wakes every waiter when nothing is left.
    pub fn complete(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.settled.notify_all();
        }
    }

    pub fn pending(&self) -> usize {
        *self.pending.lock()
    }

    /// Block until the counter is zero or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// `Timeout` if the deadline passes first. Pending work is unaffected.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let mut pending = self.pending.lock();
        match timeout {
            None => {
                while *pending > 0 {
                    self.settled.wait(&mut pending);
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while *pending > 0 {
                    if self.settled.wait_until(&mut pending, deadline).timed_out() && *pending > 0 {
                        return Err(Error::Timeout(timeout));
                    }
                }
            }
        }
        Ok(())
    }
}

struct UserStore {
    db: Database,
    episodic: EpisodicStore,
}

#[derive(Default)]
struct ExtractionQueue {
    records: VecDeque<EpisodicRecord>,
    /// True while the user is queued on or being served by a worker.
    scheduled: bool,
}

/// Everything the engine keeps for one user id.
pub struct UserMemoryState {
    user_id: String,
    store: Mutex<UserStore>,
    queue: Mutex<ExtractionQueue>,
    settlement: Settlement,
}

impl UserMemoryState {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn pending(&self) -> usize {
        self.settlement.pending()
    }
}

struct Shared {
    config: Config,
    indexer: Indexer,
    extractor: Arc<dyn FactExtractor>,
    session_marker: String,
    users: RwLock<HashMap<String, Arc<UserMemoryState>>>,
    jobs: Mutex<Option<Sender<Arc<UserMemoryState>>>>,
}

/// The memory engine: ingestion, settlement, search and fact inspection for
/// any number of user partitions sharing one database file.
pub struct MemoryEngine {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Held shared by every operation and exclusively by `close`.
    gate: RwLock<()>,
    closed: AtomicBool,
}

impl MemoryEngine {
    /// Open an engine with the configured embedder and the built-in
    /// `PatternExtractor`.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid, directories cannot be
    /// created or the embedding model cannot be loaded.
    pub fn open(config: Config) -> Result<Self, Error> {
        config.validate()?;
        let embedder = embedding::from_config(&config)?;
        Self::with_components(config, embedder, Arc::new(PatternExtractor::new()))
    }

    /// Open an engine with explicit collaborators.
    pub fn with_components(
        config: Config,
        embedder: Arc<dyn Embedder>,
        extractor: Arc<dyn FactExtractor>,
    ) -> Result<Self, Error> {
        config.validate()?;
        config.ensure_directories()?;

        let (sender, receiver) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            indexer: Indexer::new(embedder),
            extractor,
            session_marker: uuid::Uuid::new_v4().to_string(),
            users: RwLock::new(HashMap::new()),
            jobs: Mutex::new(Some(sender)),
            config,
        });

        let mut workers = Vec::with_capacity(shared.config.extraction_workers);
        for i in 0..shared.config.extraction_workers {
            let shared = Arc::clone(&shared);
            let receiver: Receiver<Arc<UserMemoryState>> = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("mnemon-extract-{}", i))
                .spawn(move || shared.worker_loop(receiver))?;
            workers.push(handle);
        }

        tracing::info!(
            database = %shared.config.database_path.display(),
            workers = workers.len(),
            semantic = shared.config.enable_semantic_memory,
            "memory engine started"
        );

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            gate: RwLock::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Session marker stamped on records ingested without an explicit one.
    pub fn session_marker(&self) -> &str {
        &self.shared.session_marker
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    #[must_use = "handle the error or the record may be lost"]
    /// Buffer one episodic record built from `turns`.
    ///
    /// The record becomes durable on the next `flush` (explicit, automatic
    /// once `max_buffered_records` are buffered, or via `wait_for_settled`).
    ///
    /// # Errors
    ///
    /// `InvalidInput` for an empty or malformed payload; nothing is buffered then.
    pub fn ingest(&self, user_id: &str, turns: Vec<Turn>) -> Result<IngestResult, Error> {
        let marker = self.shared.session_marker.clone();
        self.ingest_with_marker(user_id, turns, &marker)
    }

    #[must_use = "handle the error or the record may be lost"]
    /// `ingest` with an explicit session marker.
    pub fn ingest_with_marker(
        &self,
        user_id: &str,
        turns: Vec<Turn>,
        session_marker: &str,
    ) -> Result<IngestResult, Error> {
        let _gate = self.gate.read();
        self.ensure_open()?;
        let state = self.shared.state(user_id)?;

        let accepted_count = turns.len();
        let (record_id, buffered) = {
            let mut store = state.store.lock();
            let record_id = store.episodic.append(turns, session_marker)?;
            state.settlement.add(1);
            (record_id, store.episodic.buffered())
        };

        tracing::debug!(user_id, record_id, turns = accepted_count, "ingested record");

        if buffered >= self.shared.config.max_buffered_records {
            if let Err(e) = self.shared.flush_state(&state) {
                tracing::warn!(user_id, error = %e, "automatic flush failed; records stay buffered");
            }
        }

        Ok(IngestResult {
            accepted_count,
            record_id,
        })
    }

    #[must_use = "handle the error or buffered records may not be durable"]
    /// Persist, index and queue every buffered record of a user.
    ///
    /// A no-op when nothing is buffered.
    ///
    /// # Errors
    ///
    /// Store errors; the buffer is kept for a retry.
    pub fn flush(&self, user_id: &str) -> Result<(), Error> {
        let _gate = self.gate.read();
        self.ensure_open()?;
        let state = self.shared.state(user_id)?;
        self.shared.flush_state(&state)
    }

    #[must_use = "handle the error to know whether derivation settled"]
    /// Flush, then block until all derivation triggered so far has finished.
    ///
    /// Any number of callers may wait on the same user; all are released
    /// together. Must not be called from a context that cannot block.
    ///
    /// # Errors
    ///
    /// `Timeout` if `timeout` elapses first; queued work keeps running.
    pub fn wait_for_settled(&self, user_id: &str, timeout: Option<Duration>) -> Result<(), Error> {
        let state = {
            let _gate = self.gate.read();
            self.ensure_open()?;
            let state = self.shared.state(user_id)?;
            self.shared.flush_state(&state)?;
            state
        };
        state.settlement.wait(timeout)
    }

    /// Records still waiting for extraction (buffered or queued).
    pub fn pending(&self, user_id: &str) -> Result<usize, Error> {
        let _gate = self.gate.read();
        self.ensure_open()?;
        Ok(self.shared.state(user_id)?.pending())
    }

    #[must_use = "handle the error or results may be lost"]
    /// Search with the configured limit.
    pub fn search(
        &self,
        user_id: &str,
        query: &str,
        method: SearchMethod,
    ) -> Result<Vec<ScoredResult>, Error> {
        self.search_with_limit(user_id, query, method, self.shared.config.search_limit)
    }

    #[must_use = "handle the error or results may be lost"]
    /// Search a user's partition. `limit` applies to each source type.
    ///
    /// Results list every episodic hit before any semantic hit. Content that
    /// is still buffered is not visible until flushed.
    pub fn search_with_limit(
        &self,
        user_id: &str,
        query: &str,
        method: SearchMethod,
        limit: usize,
    ) -> Result<Vec<ScoredResult>, Error> {
        let _gate = self.gate.read();
        self.ensure_open()?;
        let state = self.shared.state(user_id)?;
        let params = self.shared.search_params(limit);

        let store = state.store.lock();
        search::search(
            &store.db,
            self.shared.indexer.embedder(),
            user_id,
            query,
            method,
            &params,
        )
    }

    /// Lazily scan persisted records with id greater than `marker`, ascending.
    ///
    /// Pages are read on demand; the user's store is locked only while a page
    /// is fetched.
    pub fn scan_since(
        &self,
        user_id: &str,
        marker: u64,
    ) -> Result<impl Iterator<Item = Result<EpisodicRecord, Error>> + use<>, Error> {
        let _gate = self.gate.read();
        self.ensure_open()?;
        let state = self.shared.state(user_id)?;

        Ok(ScanIter::new(marker, move |after, limit| {
            let store = state.store.lock();
            Ok(store.db.records_after(&state.user_id, after, limit)?)
        }))
    }

    /// A persisted episodic record by id.
    ///
    /// # Errors
    ///
    /// `NotFound` if the record does not exist or is still buffered.
    pub fn get_record(&self, user_id: &str, record_id: u64) -> Result<EpisodicRecord, Error> {
        let _gate = self.gate.read();
        self.ensure_open()?;
        let state = self.shared.state(user_id)?;
        let store = state.store.lock();
        store
            .db
            .get_record(user_id, record_id)?
            .ok_or_else(|| Error::NotFound(format!("record {}", record_id)))
    }

    /// Number of persisted episodic records.
    pub fn record_count(&self, user_id: &str) -> Result<u64, Error> {
        let _gate = self.gate.read();
        self.ensure_open()?;
        let state = self.shared.state(user_id)?;
        let store = state.store.lock();
        Ok(store.db.count_records(user_id)?)
    }

    /// Active facts in creation order.
    pub fn active_facts(&self, user_id: &str) -> Result<Vec<SemanticFact>, Error> {
        self.list_facts(user_id, Some(FactStatus::Active))
    }

    /// Every fact regardless of status, in creation order.
    pub fn fact_history(&self, user_id: &str) -> Result<Vec<SemanticFact>, Error> {
        self.list_facts(user_id, None)
    }

    fn list_facts(&self, user_id: &str, status: Option<FactStatus>) -> Result<Vec<SemanticFact>, Error> {
        let _gate = self.gate.read();
        self.ensure_open()?;
        let state = self.shared.state(user_id)?;
        let store = state.store.lock();
        Ok(store.db.list_facts(user_id, status)?)
    }

    /// A fact by id, whatever its status.
    ///
    /// # Errors
    ///
    /// `NotFound` if the user has no such fact.
    pub fn get_fact(&self, user_id: &str, fact_id: &str) -> Result<SemanticFact, Error> {
        let _gate = self.gate.read();
        self.ensure_open()?;
        let state = self.shared.state(user_id)?;
        let store = state.store.lock();
        store
            .db
            .get_fact(user_id, fact_id)?
            .ok_or_else(|| Error::NotFound(format!("fact {}", fact_id)))
    }

    /// Recreate a user's index entries from the stores. Returns the entry count.
    pub fn rebuild_index(&self, user_id: &str) -> Result<usize, Error> {
        let _gate = self.gate.read();
        self.ensure_open()?;
        let state = self.shared.state(user_id)?;
        let store = state.store.lock();
        self.shared.indexer.rebuild(&store.db, user_id)
    }

    /// Check a user's index entries against the stores.
    pub fn verify_index(&self, user_id: &str) -> Result<(), Error> {
        let _gate = self.gate.read();
        self.ensure_open()?;
        let state = self.shared.state(user_id)?;
        let store = state.store.lock();
        self.shared.indexer.verify(&store.db, user_id)
    }

    /// Flush every user, let the workers drain their queues, and release all
    /// connections.
    ///
    /// # Errors
    ///
    /// `Closed` if already closed. Otherwise the first flush error, after
    /// shutdown has completed anyway.
    pub fn close(&self) -> Result<(), Error> {
        let _gate = self.gate.write();
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        let users: Vec<Arc<UserMemoryState>> = self.shared.users.read().values().cloned().collect();
        let mut first_error = None;
        for state in &users {
            if let Err(e) = self.shared.flush_state(state) {
                tracing::warn!(user_id = %state.user_id, error = %e, "flush during close failed");
                first_error.get_or_insert(e);
            }
        }

        // Dropping the sender ends each worker once the channel is drained.
        drop(self.shared.jobs.lock().take());
        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                tracing::warn!("extraction worker panicked");
            }
        }

        for state in &users {
            if let Err(e) = state.store.lock().db.checkpoint() {
                tracing::warn!(user_id = %state.user_id, error = %e, "checkpoint failed");
            }
        }
        self.shared.users.write().clear();

        tracing::info!(users = users.len(), "memory engine closed");
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for MemoryEngine {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            if let Err(e) = self.close() {
                tracing::warn!(error = %e, "close on drop failed");
            }
        }
    }
}

impl Shared {
    fn search_params(&self, limit: usize) -> SearchParams {
        SearchParams {
            limit,
            rrf: RrfConfig {
                k: self.config.rrf_k,
            },
            keyword_weight: self.config.keyword_weight,
            vector_weight: self.config.vector_weight,
        }
    }

    fn policy(&self) -> FactPolicy {
        FactPolicy {
            prediction_correction: self.config.enable_prediction_correction,
        }
    }

    /// Look up or lazily open the state for `user_id`.
    fn state(&self, user_id: &str) -> Result<Arc<UserMemoryState>, Error> {
        if user_id.trim().is_empty() {
            return Err(Error::InvalidInput("user id cannot be blank".to_string()));
        }
        if let Some(state) = self.users.read().get(user_id) {
            return Ok(Arc::clone(state));
        }

        let opened = Arc::new(self.open_state(user_id)?);
        let mut users = self.users.write();
        Ok(Arc::clone(
            users.entry(user_id.to_string()).or_insert(opened),
        ))
    }

    fn open_state(&self, user_id: &str) -> Result<UserMemoryState, Error> {
        let db = Database::open(&self.config.database_path)?;
        let episodic = EpisodicStore::open(&db, user_id)?;

        match self.indexer.verify(&db, user_id) {
            Ok(()) => {}
            Err(Error::IndexInconsistency { detail, .. }) => {
                tracing::warn!(user_id, detail = %detail, "index inconsistent; rebuilding");
                self.indexer.rebuild(&db, user_id)?;
            }
            Err(e) => return Err(e),
        }

        tracing::debug!(user_id, "opened user state");
        Ok(UserMemoryState {
            user_id: user_id.to_string(),
            store: Mutex::new(UserStore { db, episodic }),
            queue: Mutex::new(ExtractionQueue::default()),
            settlement: Settlement::default(),
        })
    }

    fn flush_state(&self, state: &Arc<UserMemoryState>) -> Result<(), Error> {
        let mut guard = state.store.lock();
        let store = &mut *guard;
        let records = store.episodic.flush(&store.db)?;
        if records.is_empty() {
            return Ok(());
        }
        let indexed = self.indexer.index_records(&store.db, &state.user_id, &records);

        tracing::debug!(user_id = %state.user_id, records = records.len(), "flushed records");
        // Enqueue under the store lock so concurrent flushes keep record order.
        self.enqueue(state, records);

        if let Err(e) = indexed {
            tracing::warn!(
                user_id = %state.user_id,
                error = %e,
                "indexing flushed records failed; rebuilding"
            );
            self.indexer.rebuild(&store.db, &state.user_id)?;
        }
        Ok(())
    }

    fn enqueue(&self, state: &Arc<UserMemoryState>, records: Vec<EpisodicRecord>) {
        let schedule = {
            let mut queue = state.queue.lock();
            queue.records.extend(records);
            !std::mem::replace(&mut queue.scheduled, true)
        };
        if !schedule {
            return;
        }

        let sent = match self.jobs.lock().as_ref() {
            Some(sender) => sender.send(Arc::clone(state)).is_ok(),
            None => false,
        };
        if !sent {
            // No worker will ever see these records; settle them here.
            let mut queue = state.queue.lock();
            let dropped = queue.records.len();
            queue.records.clear();
            queue.scheduled = false;
            drop(queue);
            tracing::warn!(
                user_id = %state.user_id,
                records = dropped,
                "extraction workers stopped; records not derived"
            );
            for _ in 0..dropped {
                state.settlement.complete();
            }
        }
    }

    fn worker_loop(&self, jobs: Receiver<Arc<UserMemoryState>>) {
        for state in jobs.iter() {
            self.drain_user(&state);
        }
    }

    /// Process a user's queue in FIFO order until it is empty.
    fn drain_user(&self, state: &UserMemoryState) {
        loop {
            let record = {
                let mut queue = state.queue.lock();
                match queue.records.pop_front() {
                    Some(record) => record,
                    None => {
                        queue.scheduled = false;
                        return;
                    }
                }
            };

            let result = panic::catch_unwind(AssertUnwindSafe(|| self.process(state, &record)))
                .unwrap_or_else(|_| {
                    Err(Error::ExtractionFailure {
                        record_id: record.id,
                        reason: "extractor panicked".to_string(),
                    })
                });

            match result {
                Ok(outcome) => tracing::debug!(
                    user_id = %state.user_id,
                    record_id = record.id,
                    created = outcome.created,
                    superseded = outcome.superseded,
                    "extraction finished"
                ),
                Err(e) => tracing::warn!(
                    user_id = %state.user_id,
                    record_id = record.id,
                    error = %e,
                    "extraction failed"
                ),
            }
            state.settlement.complete();
        }
    }

    fn process(&self, state: &UserMemoryState, record: &EpisodicRecord) -> Result<DerivationOutcome, Error> {
        if !self.config.enable_semantic_memory {
            return Ok(DerivationOutcome::default());
        }

        let candidates = self
            .extractor
            .extract(record)
            .map_err(|e| match e {
                Error::ExtractionFailure { .. } => e,
                other => Error::ExtractionFailure {
                    record_id: record.id,
                    reason: other.to_string(),
                },
            })?;

        let store = state.store.lock();
        extractor::apply_candidates(
            &store.db,
            &self.indexer,
            self.policy(),
            record,
            &candidates,
        )
    }
}
