//! Episodic store: per-user write buffer, id allocation and lazy history scans.
//!
//! Records are assembled and validated in memory, buffered until `flush`, and
//! persisted as one SQLite transaction. Ids are allocated from the buffer so
//! they stay monotonic across flushes and never reused after a failed flush.

use crate::errors::Error;
use crate::memory_types::{EpisodicRecord, Turn};
use crate::sqlite::Database;

/// Maximum allowed turn length (100,000 bytes).
pub const MAX_INPUT_LENGTH: usize = 100_000;

/// Records fetched per page by `ScanIter`.
pub const SCAN_PAGE_SIZE: usize = 64;

/// Reject empty and whitespace-only text, and text longer than `MAX_INPUT_LENGTH`.
pub fn validate_input_length(text: &str) -> Result<(), Error> {
    if text.trim().is_empty() {
        return Err(Error::EmptyInput);
    }
    if text.len() > MAX_INPUT_LENGTH {
        return Err(Error::InputTooLong {
            max_length: MAX_INPUT_LENGTH,
            actual_length: text.len(),
        });
    }
    Ok(())
}

/// Validate an ingestion payload. Nothing is persisted when this fails.
///
/// # Errors
///
/// `InvalidInput` when `turns` is empty or any turn has blank or oversized content.
pub fn validate_turns(turns: &[Turn]) -> Result<(), Error> {
    if turns.is_empty() {
        return Err(Error::InvalidInput(
            "at least one turn is required".to_string(),
        ));
    }
    for (idx, turn) in turns.iter().enumerate() {
        validate_input_length(&turn.content)
            .map_err(|e| Error::InvalidInput(format!("turn {}: {}", idx, e)))?;
    }
    Ok(())
}

/// Unflushed records of one user plus the next id to hand out.
#[derive(Debug)]
pub struct EpisodicStore {
    user_id: String,
    next_id: u64,
    buffer: Vec<EpisodicRecord>,
}

impl EpisodicStore {
    /// Open the store for a user, continuing after the highest persisted id.
    pub fn open(db: &Database, user_id: &str) -> Result<Self, Error> {
        let next_id = db.max_record_id(user_id)? + 1;
        Ok(Self {
            user_id: user_id.to_string(),
            next_id,
            buffer: Vec::new(),
        })
    }

    /// Build a record from `turns` and buffer it. Returns the record id.
    pub fn append(&mut self, turns: Vec<Turn>, session_marker: &str) -> Result<u64, Error> {
        validate_turns(&turns)?;

        let id = self.next_id;
        self.next_id += 1;
        self.buffer.push(EpisodicRecord {
            id,
            user_id: self.user_id.clone(),
            turns,
            created_at: chrono::Utc::now().to_rfc3339(),
            session_marker: session_marker.to_string(),
        });
        Ok(id)
    }

    /// Number of records waiting for `flush`.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Persist every buffered record in one transaction and hand them back.
    ///
    /// On error nothing is written and the buffer is left intact for a retry.
    pub fn flush(&mut self, db: &Database) -> Result<Vec<EpisodicRecord>, Error> {
        if self.buffer.is_empty() {
            return Ok(Vec::new());
        }
        db.insert_records(&self.buffer)?;
        Ok(std::mem::take(&mut self.buffer))
    }
}

/// Lazy, finite scan over persisted records with id greater than a marker.
///
/// Pages are fetched on demand through `fetch(after, limit)`. The last id
/// yielded is the marker to resume from.
pub struct ScanIter<F> {
    fetch: F,
    marker: u64,
    page: std::vec::IntoIter<EpisodicRecord>,
    done: bool,
}

impl<F> ScanIter<F>
where
    F: FnMut(u64, usize) -> Result<Vec<EpisodicRecord>, Error>,
{
    pub fn new(marker: u64, fetch: F) -> Self {
        Self {
            fetch,
            marker,
            page: Vec::new().into_iter(),
            done: false,
        }
    }

    /// Id of the last record yielded (or the starting marker).
    pub fn marker(&self) -> u64 {
        self.marker
    }
}

impl<F> Iterator for ScanIter<F>
where
    F: FnMut(u64, usize) -> Result<Vec<EpisodicRecord>, Error>,
{
    type Item = Result<EpisodicRecord, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(record) = self.page.next() {
            self.marker = record.id;
            return Some(Ok(record));
        }
        if self.done {
            return None;
        }

        match (self.fetch)(self.marker, SCAN_PAGE_SIZE) {
            Ok(page) => {
                if page.len() < SCAN_PAGE_SIZE {
                    self.done = true;
                }
                self.page = page.into_iter();
                let record = self.page.next()?;
                self.marker = record.id;
                Some(Ok(record))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(text: &str) -> Vec<Turn> {
        vec![Turn::user(text), Turn::assistant("Noted.")]
    }

    #[test]
    fn test_validate_turns_empty() {
        assert!(matches!(validate_turns(&[]), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_validate_turns_blank_content() {
        let turns = vec![Turn::user("hello"), Turn::assistant("   ")];
        assert!(matches!(validate_turns(&turns), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_validate_input_too_long() {
        let long = "a".repeat(MAX_INPUT_LENGTH + 1);
        assert!(matches!(
            validate_input_length(&long),
            Err(Error::InputTooLong { .. })
        ));
        assert!(validate_input_length(&"a".repeat(MAX_INPUT_LENGTH)).is_ok());
    }

    #[test]
    fn test_append_allocates_monotonic_ids() {
        let db = Database::open_in_memory().unwrap();
        let mut store = EpisodicStore::open(&db, "u1").unwrap();

        assert_eq!(store.append(pair("one"), "s").unwrap(), 1);
        assert_eq!(store.append(pair("two"), "s").unwrap(), 2);
        assert_eq!(store.buffered(), 2);
    }

    #[test]
    fn test_invalid_append_consumes_no_id() {
        let db = Database::open_in_memory().unwrap();
        let mut store = EpisodicStore::open(&db, "u1").unwrap();

        assert!(store.append(Vec::new(), "s").is_err());
        assert_eq!(store.buffered(), 0);
        assert_eq!(store.append(pair("one"), "s").unwrap(), 1);
    }

    #[test]
    fn test_flush_persists_and_empties_buffer() {
        let db = Database::open_in_memory().unwrap();
        let mut store = EpisodicStore::open(&db, "u1").unwrap();
        store.append(pair("one"), "s").unwrap();

        let flushed = store.flush(&db).unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(store.buffered(), 0);
        assert_eq!(db.count_records("u1").unwrap(), 1);

        // Nothing buffered: no-op.
        assert!(store.flush(&db).unwrap().is_empty());
        assert_eq!(db.count_records("u1").unwrap(), 1);
    }

    #[test]
    fn test_reopen_continues_ids() {
        let db = Database::open_in_memory().unwrap();
        let mut store = EpisodicStore::open(&db, "u1").unwrap();
        store.append(pair("one"), "s").unwrap();
        store.append(pair("two"), "s").unwrap();
        store.flush(&db).unwrap();

        let mut reopened = EpisodicStore::open(&db, "u1").unwrap();
        assert_eq!(reopened.append(pair("three"), "s").unwrap(), 3);

        let mut other = EpisodicStore::open(&db, "u2").unwrap();
        assert_eq!(other.append(pair("first"), "s").unwrap(), 1);
    }

    #[test]
    fn test_scan_pages_lazily_in_order() {
        let db = Database::open_in_memory().unwrap();
        let mut store = EpisodicStore::open(&db, "u1").unwrap();
        for i in 0..(SCAN_PAGE_SIZE + 6) {
            store.append(pair(&format!("message {}", i)), "s").unwrap();
        }
        store.flush(&db).unwrap();

        let mut fetches = 0;
        let ids: Vec<u64> = ScanIter::new(0, |after, limit| {
            fetches += 1;
            Ok(db.records_after("u1", after, limit)?)
        })
        .map(|r| r.unwrap().id)
        .collect();

        assert_eq!(ids.len(), SCAN_PAGE_SIZE + 6);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(fetches, 2);
    }

    #[test]
    fn test_scan_restartable_from_marker() {
        let db = Database::open_in_memory().unwrap();
        let mut store = EpisodicStore::open(&db, "u1").unwrap();
        for text in ["a", "b", "c", "d"] {
            store.append(pair(text), "s").unwrap();
        }
        store.flush(&db).unwrap();

        let mut scan = ScanIter::new(0, |after, limit| Ok(db.records_after("u1", after, limit)?));
        scan.next().unwrap().unwrap();
        scan.next().unwrap().unwrap();
        let marker = scan.marker();
        assert_eq!(marker, 2);

        let rest: Vec<u64> = ScanIter::new(marker, |after, limit| {
            Ok(db.records_after("u1", after, limit)?)
        })
        .map(|r| r.unwrap().id)
        .collect();
        assert_eq!(rest, vec![3, 4]);
    }

    #[test]
    fn test_scan_stops_after_error() {
        let mut scan = ScanIter::new(0, |_, _| Err(Error::Closed));
        assert!(matches!(scan.next(), Some(Err(Error::Closed))));
        assert!(scan.next().is_none());
    }
}
