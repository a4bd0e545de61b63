//! Episodic record rows: append-only, one row per ingested batch.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, Result};
use crate::memory_types::{EpisodicRecord, Turn};

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<(String, u64, String, String, String)> {
    Ok((
        row.get::<_, String>(0)?,
        row.get::<_, i64>(1)? as u64,
        row.get::<_, String>(2)?,
        row.get::<_, String>(3)?,
        row.get::<_, String>(4)?,
    ))
}

fn decode(raw: (String, u64, String, String, String)) -> Result<EpisodicRecord> {
    let (user_id, id, turns_json, session_marker, created_at) = raw;
    let turns: Vec<Turn> = serde_json::from_str(&turns_json)?;
    Ok(EpisodicRecord {
        id,
        user_id,
        turns,
        created_at,
        session_marker,
    })
}

impl Database {
    /// Highest record id persisted for a user (0 when none).
    pub fn max_record_id(&self, user_id: &str) -> Result<u64> {
        let max: Option<i64> = self.conn.query_row(
            "SELECT MAX(id) FROM episodic_records WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0) as u64)
    }

    /// Persist a batch of records in a single transaction.
    ///
    /// Either every record in the batch is written or none is.
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails or any insert fails (the batch is rolled back).
    pub fn insert_records(&self, records: &[EpisodicRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO episodic_records (user_id, id, turns, session_marker, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )?;
            for record in records {
                let turns_json = serde_json::to_string(&record.turns)?;
                stmt.execute(params![
                    &record.user_id,
                    record.id as i64,
                    turns_json,
                    &record.session_marker,
                    &record.created_at
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Records with id greater than `after`, ascending, at most `limit`.
    pub fn records_after(
        &self,
        user_id: &str,
        after: u64,
        limit: usize,
    ) -> Result<Vec<EpisodicRecord>> {
        super::search::validate_limit(limit)?;

        let mut stmt = self.conn.prepare(
            r#"
            SELECT user_id, id, turns, session_marker, created_at
            FROM episodic_records
            WHERE user_id = ?1 AND id > ?2
            ORDER BY id ASC
            LIMIT ?3
            "#,
        )?;

        let raw: rusqlite::Result<Vec<_>> = stmt
            .query_map(params![user_id, after as i64, limit as i64], row_to_record)?
            .collect();

        raw?.into_iter().map(decode).collect()
    }

    /// Retrieve a single record. Returns None if it does not exist.
    pub fn get_record(&self, user_id: &str, id: u64) -> Result<Option<EpisodicRecord>> {
        let raw = self
            .conn
            .query_row(
                r#"
                SELECT user_id, id, turns, session_marker, created_at
                FROM episodic_records
                WHERE user_id = ?1 AND id = ?2
                "#,
                params![user_id, id as i64],
                row_to_record,
            )
            .optional()?;

        raw.map(decode).transpose()
    }

    /// Number of records stored for a user.
    pub fn count_records(&self, user_id: &str) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM episodic_records WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}
