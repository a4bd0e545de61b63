//! SQLite backend for mnemon storage.
//!
//! This module provides:
//! - `Database`: Core SQLite connection and schema management
//! - `embedding`: BLOB conversion and cosine similarity
//! - `episodic`: Append-only episodic record rows
//! - `facts`: Semantic fact rows, support sets and status transitions
//! - `index`: Index entry rows (keyword + vector) per user
//! - `fts`: FTS5 full-text search with BM25 ranking
//! - `search`: Scored hits, ordering and limit validation

pub mod embedding;
pub mod episodic;
pub mod facts;
pub mod fts;
pub mod index;
pub mod search;

use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

pub use self::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
pub use self::facts::FactWrite;
pub use self::index::EntryRow;
pub use self::search::{Hit, MAX_SEARCH_LIMIT, sort_hits, validate_limit};

/// How long a connection waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Error types for SQLite operations.
#[derive(Debug)]
pub enum Error {
    Sqlite(String),
    InvalidBlobSize { expected: usize, actual: usize },
    MismatchedDimensions { expected: usize, actual: usize },
    EmptyVector,
    InvalidEmbedding(String),
    InvalidLimit(String),
    Corrupt(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Sqlite(msg) => write!(f, "Database error: {}", msg),
            Error::InvalidBlobSize { expected, actual } => {
                write!(
                    f,
                    "Invalid BLOB size: expected {} bytes, got {} bytes",
                    expected, actual
                )
            }
            Error::MismatchedDimensions { expected, actual } => {
                write!(
                    f,
                    "Mismatched dimensions: expected {} dimensions, got {} dimensions",
                    expected, actual
                )
            }
            Error::EmptyVector => write!(f, "Cannot compute similarity with empty vector"),
            Error::InvalidEmbedding(msg) => write!(f, "Invalid embedding: {}", msg),
            Error::InvalidLimit(msg) => write!(f, "Invalid limit: {}", msg),
            Error::Corrupt(msg) => write!(f, "Corrupt row: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Sqlite(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Corrupt(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// SQLite database backend for one user partition.
///
/// Every user state opens its own `Database` on the shared file, so
/// connections are never shared between users.
pub struct Database {
    conn: Connection,
}

/// Initialize database schema and create necessary tables and triggers.
fn create_schema(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS episodic_records (
            user_id TEXT NOT NULL,
            id INTEGER NOT NULL,
            turns TEXT NOT NULL,
            session_marker TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (user_id, id)
        );

        CREATE TABLE IF NOT EXISTS semantic_facts (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            value TEXT NOT NULL,
            statement TEXT NOT NULL,
            confidence REAL NOT NULL,
            status TEXT NOT NULL,
            superseded_by TEXT,
            evidence_record INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_facts_user_subject
            ON semantic_facts(user_id, subject, status);

        CREATE TABLE IF NOT EXISTS fact_support (
            fact_id TEXT NOT NULL,
            record_id INTEGER NOT NULL,
            PRIMARY KEY (fact_id, record_id)
        );

        CREATE TABLE IF NOT EXISTS index_entries (
            user_id TEXT NOT NULL,
            ref_type TEXT NOT NULL,
            ref_id TEXT NOT NULL,
            content TEXT NOT NULL,
            embedding BLOB,
            token_count INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (user_id, ref_type, ref_id)
        );

        CREATE VIRTUAL TABLE IF NOT EXISTS index_fts USING fts5(
            content,
            user_id UNINDEXED,
            ref_type UNINDEXED,
            tokenize='porter unicode61',
            content_rowid='rowid',
            content='index_entries'
        );

        CREATE TRIGGER IF NOT EXISTS index_fts_insert AFTER INSERT ON index_entries BEGIN
            INSERT INTO index_fts(rowid, content, user_id, ref_type)
            VALUES (new.rowid, new.content, new.user_id, new.ref_type);
        END;

        CREATE TRIGGER IF NOT EXISTS index_fts_delete AFTER DELETE ON index_entries BEGIN
            INSERT INTO index_fts(index_fts, rowid, content, user_id, ref_type)
            VALUES('delete', old.rowid, old.content, old.user_id, old.ref_type);
        END;

        CREATE TRIGGER IF NOT EXISTS index_fts_update AFTER UPDATE ON index_entries BEGIN
            INSERT INTO index_fts(index_fts, rowid, content, user_id, ref_type)
            VALUES('delete', old.rowid, old.content, old.user_id, old.ref_type);
            INSERT INTO index_fts(rowid, content, user_id, ref_type)
            VALUES (new.rowid, new.content, new.user_id, new.ref_type);
        END;
        "#,
    )?;
    Ok(())
}

impl Database {
    /// Open or create a SQLite database at the given path.
    ///
    /// Enables WAL so per-user connections on the same file can read while
    /// another one writes. Initializes the schema if the database is new.
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be opened or schema initialization fails.
    pub fn open(path: &Path) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_row| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        create_schema(&mut conn)?;
        Ok(Self { conn })
    }

    /// Open a private in-memory database.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        create_schema(&mut conn)?;
        Ok(Self { conn })
    }

    /// Force the write-ahead log into the main database file.
    ///
    /// # Errors
    ///
    /// Returns error if the checkpoint cannot run.
    pub fn checkpoint(&self) -> Result<()> {
        // In-memory databases report "memory" and ignore the pragma.
        self.conn
            .query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_row| Ok(()))?;
        Ok(())
    }

    /// Get internal connection (for tests).
    #[cfg(test)]
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}
