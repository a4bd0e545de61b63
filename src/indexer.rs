//! Keyword and vector index maintenance over episodic records and active facts.
//!
//! Every entry lives in one `index_entries` row: the text feeds the FTS5 table
//! through triggers and the embedding is stored as a BLOB next to it. Entries
//! are derived data; `rebuild` recreates them from the stores.

use std::sync::Arc;

use crate::embedding::Embedder;
use crate::episodic::ScanIter;
use crate::errors::Error;
use crate::memory_types::{EpisodicRecord, FactStatus, SemanticFact, SourceType};
use crate::sqlite::{Database, EntryRow};
use crate::text;

/// Computes index entries and applies them to a user's partition.
#[derive(Clone)]
pub struct Indexer {
    embedder: Arc<dyn Embedder>,
}

impl Indexer {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }

    pub fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }

    fn entry(
        &self,
        ref_type: SourceType,
        ref_id: String,
        content: String,
        created_at: &str,
    ) -> Result<EntryRow, Error> {
        let embedding = self.embedder.embed(&content)?;
        Ok(EntryRow {
            ref_type,
            ref_id,
            token_count: text::tokenize(&content).len(),
            content,
            embedding: Some(embedding),
            created_at: created_at.to_string(),
        })
    }

    fn record_entry(&self, record: &EpisodicRecord) -> Result<EntryRow, Error> {
        self.entry(
            SourceType::Episodic,
            record.id.to_string(),
            record.transcript(),
            &record.created_at,
        )
    }

    fn fact_entry(&self, fact: &SemanticFact) -> Result<EntryRow, Error> {
        self.entry(
            SourceType::Semantic,
            fact.id.clone(),
            fact.statement.clone(),
            &fact.created_at,
        )
    }

    /// Index freshly persisted episodic records.
    pub fn index_records(
        &self,
        db: &Database,
        user_id: &str,
        records: &[EpisodicRecord],
    ) -> Result<(), Error> {
        for record in records {
            db.replace_entry(user_id, &self.record_entry(record)?)?;
        }
        Ok(())
    }

    /// Index an active fact, replacing any previous entry for it.
    pub fn index_fact(&self, db: &Database, user_id: &str, fact: &SemanticFact) -> Result<(), Error> {
        if fact.status != FactStatus::Active {
            self.remove_fact(db, user_id, &fact.id)?;
            return Ok(());
        }
        db.replace_entry(user_id, &self.fact_entry(fact)?)?;
        Ok(())
    }

    /// Drop the entry of a fact that is no longer active.
    pub fn remove_fact(&self, db: &Database, user_id: &str, fact_id: &str) -> Result<bool, Error> {
        Ok(db.remove_entry(user_id, SourceType::Semantic, fact_id)?)
    }

    /// Recreate every entry of a user from the stores in one transaction.
    ///
    /// Returns the number of entries written.
    pub fn rebuild(&self, db: &Database, user_id: &str) -> Result<usize, Error> {
        let mut entries = Vec::new();
        for record in scan_all(db, user_id) {
            entries.push(self.record_entry(&record?)?);
        }
        for fact in db.list_facts(user_id, Some(FactStatus::Active))? {
            entries.push(self.fact_entry(&fact)?);
        }

        db.replace_all_entries(user_id, &entries)?;
        if let Err(e) = db.check_fts() {
            tracing::warn!(user_id, error = %e, "full-text index damaged; rebuilding it");
            db.rebuild_fts()?;
        }
        tracing::info!(user_id, entries = entries.len(), "rebuilt index");
        Ok(entries.len())
    }

    /// Check that the entries match the stores exactly and the FTS index is intact.
    ///
    /// # Errors
    ///
    /// `IndexInconsistency` naming the first difference found.
    pub fn verify(&self, db: &Database, user_id: &str) -> Result<(), Error> {
        let mut expected: Vec<(SourceType, String)> = Vec::new();
        for record in scan_all(db, user_id) {
            expected.push((SourceType::Episodic, record?.id.to_string()));
        }
        for fact in db.list_facts(user_id, Some(FactStatus::Active))? {
            expected.push((SourceType::Semantic, fact.id));
        }
        expected.sort_by(|a, b| (a.0.as_str(), &a.1).cmp(&(b.0.as_str(), &b.1)));

        let actual = db.entry_keys(user_id)?;
        if actual != expected {
            let missing = expected.iter().filter(|k| !actual.contains(k)).count();
            let stale = actual.iter().filter(|k| !expected.contains(k)).count();
            return Err(Error::IndexInconsistency {
                user_id: user_id.to_string(),
                detail: format!("{} missing entries, {} stale entries", missing, stale),
            });
        }

        db.check_fts().map_err(|e| Error::IndexInconsistency {
            user_id: user_id.to_string(),
            detail: format!("full-text index check failed: {}", e),
        })
    }
}

fn scan_all<'a>(
    db: &'a Database,
    user_id: &'a str,
) -> impl Iterator<Item = Result<EpisodicRecord, Error>> + 'a {
    ScanIter::new(0, move |after, limit| Ok(db.records_after(user_id, after, limit)?))
}
