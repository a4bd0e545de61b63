//! Semantic fact rows, their support sets and status transitions.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Database, Error, Result};
use crate::memory_types::{FactStatus, SemanticFact};

/// One mutation of the fact set, applied together with its siblings.
#[derive(Debug, Clone)]
pub enum FactWrite {
    /// Insert a brand new fact with its support set.
    Create(SemanticFact),
    /// Add a supporting record to an existing fact and refresh its confidence.
    Support {
        fact_id: String,
        record_id: u64,
        confidence: f64,
        updated_at: String,
    },
    /// Insert `replacement` and mark `old_id` superseded by it.
    Supersede {
        old_id: String,
        replacement: SemanticFact,
        evidence_record: u64,
        updated_at: String,
    },
    /// Mark a fact retracted by contradicting evidence.
    Retract {
        fact_id: String,
        evidence_record: u64,
        updated_at: String,
    },
}

const FACT_COLUMNS: &str = "id, user_id, subject, value, statement, confidence, status, \
                            superseded_by, evidence_record, created_at, updated_at";

fn row_to_fact(row: &Row<'_>) -> rusqlite::Result<(SemanticFact, String)> {
    let status: String = row.get(6)?;
    Ok((
        SemanticFact {
            id: row.get(0)?,
            user_id: row.get(1)?,
            subject: row.get(2)?,
            value: row.get(3)?,
            statement: row.get(4)?,
            confidence: row.get(5)?,
            supporting_record_ids: Vec::new(),
            status: FactStatus::Active,
            superseded_by: row.get(7)?,
            evidence_record: row.get::<_, Option<i64>>(8)?.map(|v| v as u64),
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        },
        status,
    ))
}

fn load_support(conn: &Connection, fact_id: &str) -> Result<Vec<u64>> {
    let mut stmt = conn
        .prepare("SELECT record_id FROM fact_support WHERE fact_id = ?1 ORDER BY record_id ASC")?;
    let ids: rusqlite::Result<Vec<i64>> = stmt.query_map([fact_id], |row| row.get(0))?.collect();
    Ok(ids?.into_iter().map(|id| id as u64).collect())
}

fn finish(conn: &Connection, raw: (SemanticFact, String)) -> Result<SemanticFact> {
    let (mut fact, status) = raw;
    fact.status = FactStatus::parse(&status)
        .ok_or_else(|| Error::Corrupt(format!("unknown fact status '{}'", status)))?;
    fact.supporting_record_ids = load_support(conn, &fact.id)?;
    Ok(fact)
}

fn insert_fact_row(conn: &Connection, fact: &SemanticFact) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO semantic_facts (id, user_id, subject, value, statement, confidence, status,
                                    superseded_by, evidence_record, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
        params![
            &fact.id,
            &fact.user_id,
            &fact.subject,
            &fact.value,
            &fact.statement,
            fact.confidence,
            fact.status.as_str(),
            &fact.superseded_by,
            fact.evidence_record.map(|r| r as i64),
            &fact.created_at,
            &fact.updated_at
        ],
    )?;
    for record_id in &fact.supporting_record_ids {
        add_support_row(conn, &fact.id, *record_id)?;
    }
    Ok(())
}

fn add_support_row(conn: &Connection, fact_id: &str, record_id: u64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO fact_support (fact_id, record_id) VALUES (?1, ?2)",
        params![fact_id, record_id as i64],
    )?;
    Ok(())
}

fn require_one(rows: usize, fact_id: &str) -> Result<()> {
    if rows == 0 {
        return Err(Error::Sqlite(format!(
            "No active fact found with id: {}",
            fact_id
        )));
    }
    Ok(())
}

impl Database {
    /// Apply a group of fact writes in one transaction.
    ///
    /// # Errors
    ///
    /// Returns error if any write fails; none of the group is applied then.
    pub fn apply_fact_writes(&self, writes: &[FactWrite]) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }

        let tx = self.conn.unchecked_transaction()?;
        for write in writes {
            match write {
                FactWrite::Create(fact) => insert_fact_row(&tx, fact)?,
                FactWrite::Support {
                    fact_id,
                    record_id,
                    confidence,
                    updated_at,
                } => {
                    let rows = tx.execute(
                        "UPDATE semantic_facts SET confidence = ?1, updated_at = ?2 \
                         WHERE id = ?3 AND status = 'active'",
                        params![confidence, updated_at, fact_id],
                    )?;
                    require_one(rows, fact_id)?;
                    add_support_row(&tx, fact_id, *record_id)?;
                }
                FactWrite::Supersede {
                    old_id,
                    replacement,
                    evidence_record,
                    updated_at,
                } => {
                    let rows = tx.execute(
                        "UPDATE semantic_facts SET status = 'superseded', superseded_by = ?1, \
                         evidence_record = ?2, updated_at = ?3 WHERE id = ?4 AND status = 'active'",
                        params![&replacement.id, *evidence_record as i64, updated_at, old_id],
                    )?;
                    require_one(rows, old_id)?;
                    insert_fact_row(&tx, replacement)?;
                }
                FactWrite::Retract {
                    fact_id,
                    evidence_record,
                    updated_at,
                } => {
                    let rows = tx.execute(
                        "UPDATE semantic_facts SET status = 'retracted', evidence_record = ?1, \
                         updated_at = ?2 WHERE id = ?3 AND status = 'active'",
                        params![*evidence_record as i64, updated_at, fact_id],
                    )?;
                    require_one(rows, fact_id)?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// The active fact for a subject, if any.
    pub fn active_fact_by_subject(
        &self,
        user_id: &str,
        subject: &str,
    ) -> Result<Option<SemanticFact>> {
        let sql = format!(
            "SELECT {} FROM semantic_facts \
             WHERE user_id = ?1 AND subject = ?2 AND status = 'active' \
             ORDER BY created_at DESC, id ASC LIMIT 1",
            FACT_COLUMNS
        );
        let raw = self
            .conn
            .query_row(&sql, params![user_id, subject], row_to_fact)
            .optional()?;
        raw.map(|r| finish(&self.conn, r)).transpose()
    }

    /// Retrieve a fact by id regardless of status.
    pub fn get_fact(&self, user_id: &str, id: &str) -> Result<Option<SemanticFact>> {
        let sql = format!(
            "SELECT {} FROM semantic_facts WHERE user_id = ?1 AND id = ?2",
            FACT_COLUMNS
        );
        let raw = self
            .conn
            .query_row(&sql, params![user_id, id], row_to_fact)
            .optional()?;
        raw.map(|r| finish(&self.conn, r)).transpose()
    }

    /// Facts for a user in creation order, optionally filtered by status.
    pub fn list_facts(
        &self,
        user_id: &str,
        status: Option<FactStatus>,
    ) -> Result<Vec<SemanticFact>> {
        let sql = format!(
            "SELECT {} FROM semantic_facts \
             WHERE user_id = ?1 AND (?2 IS NULL OR status = ?2) \
             ORDER BY created_at ASC, id ASC",
            FACT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let raw: rusqlite::Result<Vec<_>> = stmt
            .query_map(params![user_id, status.map(|s| s.as_str())], row_to_fact)?
            .collect();

        raw?.into_iter().map(|r| finish(&self.conn, r)).collect()
    }
}
