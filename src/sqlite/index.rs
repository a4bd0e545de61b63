//! Index entry rows: one per (user, ref type, ref id), feeding FTS5 and vector search.

use rusqlite::{params, Connection};

use super::embedding::{blob_to_vec, vec_to_blob};
use super::{Database, Error, Result};
use crate::memory_types::SourceType;

/// A derived index entry as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryRow {
    pub ref_type: SourceType,
    pub ref_id: String,
    pub content: String,
    pub embedding: Option<Vec<f32>>,
    pub token_count: usize,
    pub created_at: String,
}

fn insert_entry_row(conn: &Connection, user_id: &str, entry: &EntryRow) -> Result<()> {
    let blob = entry.embedding.as_deref().map(vec_to_blob).transpose()?;
    conn.execute(
        r#"
        INSERT INTO index_entries (user_id, ref_type, ref_id, content, embedding, token_count, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            user_id,
            entry.ref_type.as_str(),
            &entry.ref_id,
            &entry.content,
            blob,
            entry.token_count as i64,
            &entry.created_at
        ],
    )?;
    Ok(())
}

fn delete_entry_row(conn: &Connection, user_id: &str, ref_type: SourceType, ref_id: &str) -> Result<bool> {
    let rows = conn.execute(
        "DELETE FROM index_entries WHERE user_id = ?1 AND ref_type = ?2 AND ref_id = ?3",
        params![user_id, ref_type.as_str(), ref_id],
    )?;
    Ok(rows > 0)
}

fn parse_ref_type(raw: &str) -> Result<SourceType> {
    SourceType::parse(raw).ok_or_else(|| Error::Corrupt(format!("unknown ref type '{}'", raw)))
}

impl Database {
    /// Insert an entry, replacing any previous entry for the same reference.
    pub fn replace_entry(&self, user_id: &str, entry: &EntryRow) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        delete_entry_row(&tx, user_id, entry.ref_type, &entry.ref_id)?;
        insert_entry_row(&tx, user_id, entry)?;
        tx.commit()?;
        Ok(())
    }

    /// Delete the entry for a reference. Returns true if one existed.
    pub fn remove_entry(&self, user_id: &str, ref_type: SourceType, ref_id: &str) -> Result<bool> {
        delete_entry_row(&self.conn, user_id, ref_type, ref_id)
    }

    /// Replace every entry of a user with `entries` in one transaction.
    pub fn replace_all_entries(&self, user_id: &str, entries: &[EntryRow]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM index_entries WHERE user_id = ?1", [user_id])?;
        for entry in entries {
            insert_entry_row(&tx, user_id, entry)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// All (ref type, ref id) keys indexed for a user, sorted.
    pub fn entry_keys(&self, user_id: &str) -> Result<Vec<(SourceType, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT ref_type, ref_id FROM index_entries WHERE user_id = ?1 ORDER BY ref_type, ref_id",
        )?;
        let raw: rusqlite::Result<Vec<(String, String)>> = stmt
            .query_map([user_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect();

        raw?.into_iter()
            .map(|(t, id)| Ok((parse_ref_type(&t)?, id)))
            .collect()
    }

    /// Load every entry of one ref type with its vector decoded to `dims` values.
    pub fn load_entries(
        &self,
        user_id: &str,
        ref_type: SourceType,
        dims: usize,
    ) -> Result<Vec<EntryRow>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT ref_id, content, embedding, token_count, created_at
            FROM index_entries
            WHERE user_id = ?1 AND ref_type = ?2
            "#,
        )?;

        let rows = stmt.query_map(params![user_id, ref_type.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<Vec<u8>>>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row_result in rows {
            let (ref_id, content, blob, token_count, created_at) = row_result?;
            let embedding = blob.map(|b| blob_to_vec(&b, dims)).transpose()?;
            entries.push(EntryRow {
                ref_type,
                ref_id,
                content,
                embedding,
                token_count: token_count.max(0) as usize,
                created_at,
            });
        }
        Ok(entries)
    }
}
