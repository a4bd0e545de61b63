//! FTS5 full-text search and BM25 ranking over index entries.

use super::search::Hit;
use super::{Database, Error};
use crate::memory_types::SourceType;
use crate::text;
use rusqlite::params;

pub type Result<T> = std::result::Result<T, Error>;

impl Database {
    /// Search one ref type of a user's index entries using FTS5 BM25 ranking.
    ///
    /// Query terms are OR-ed so a natural-language question still matches
    /// entries that share only some of its words; BM25 ranks entries sharing
    /// more (and rarer) terms higher. The returned score is `-bm25`, so higher
    /// is better.
    ///
    /// # Errors
    ///
    /// Returns error if the limit is invalid or the FTS5 search fails.
    pub fn search_bm25(
        &self,
        user_id: &str,
        ref_type: SourceType,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Hit>> {
        super::search::validate_limit(limit)?;

        let match_expr = Self::build_match_expr(query);

        // Empty query returns no results (avoid FTS5 syntax error)
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }

        let sql = r#"
            SELECT e.ref_id, e.content, e.created_at, bm25(index_fts) AS bm25_score
            FROM index_fts
            JOIN index_entries e ON e.rowid = index_fts.rowid
            WHERE index_fts MATCH ?1 AND e.user_id = ?2 AND e.ref_type = ?3
            ORDER BY bm25(index_fts), e.ref_id
            LIMIT ?4
        "#;

        let mut stmt = self.conn.prepare(sql)?;

        let hits: rusqlite::Result<Vec<Hit>> = stmt
            .query_map(
                params![match_expr, user_id, ref_type.as_str(), limit as i64],
                |row| {
                    Ok(Hit {
                        ref_id: row.get(0)?,
                        content: row.get(1)?,
                        created_at: row.get(2)?,
                        score: -row.get::<_, f64>(3)?,
                    })
                },
            )?
            .collect();

        Ok(hits?)
    }

    /// Run the FTS5 integrity check against the external content table.
    ///
    /// # Errors
    ///
    /// Returns error when the full-text index disagrees with `index_entries`.
    pub fn check_fts(&self) -> Result<()> {
        self.conn
            .execute("INSERT INTO index_fts(index_fts) VALUES('integrity-check')", [])?;
        Ok(())
    }

    /// Rebuild the full-text index from `index_entries`.
    pub fn rebuild_fts(&self) -> Result<()> {
        self.conn
            .execute("INSERT INTO index_fts(index_fts) VALUES('rebuild')", [])?;
        Ok(())
    }

    /// Build an FTS5 MATCH expression: quoted content words joined by OR.
    ///
    /// Stopwords are dropped unless the query consists only of stopwords.
    fn build_match_expr(query: &str) -> String {
        let words: Vec<&str> = query
            .split_whitespace()
            .filter(|word| word.chars().any(char::is_alphanumeric))
            .collect();

        let content: Vec<&str> = words
            .iter()
            .copied()
            .filter(|w| !text::is_stopword(w))
            .collect();
        let chosen = if content.is_empty() { words } else { content };

        chosen
            .into_iter()
            .map(|word| {
                let escaped = word.replace('"', "\"\"");
                format!("\"{}\"", escaped)
            })
            .collect::<Vec<_>>()
            .join(" OR ")
    }
}
