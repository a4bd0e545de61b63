//! Search result rows and limit validation.

use std::cmp::Ordering;

use super::{Error, Result};

/// Upper bound for any result limit.
pub const MAX_SEARCH_LIMIT: usize = 10_000;

/// A scored index hit before it is turned into a public search result.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub ref_id: String,
    pub content: String,
    pub created_at: String,
    /// Higher is better for every producer.
    pub score: f64,
}

/// Validate search limit is within acceptable bounds.
pub fn validate_limit(limit: usize) -> Result<()> {
    if limit == 0 {
        return Err(Error::InvalidLimit(
            "Limit must be greater than 0".to_string(),
        ));
    }
    if limit > i64::MAX as usize || limit > MAX_SEARCH_LIMIT {
        return Err(Error::InvalidLimit(format!(
            "Limit {} exceeds maximum allowed ({})",
            limit, MAX_SEARCH_LIMIT
        )));
    }
    Ok(())
}

/// Sort hits by score (highest first), breaking ties on ref id so repeated
/// runs over the same index return the same order.
pub fn sort_hits(hits: &mut [Hit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| compare_ids(&a.ref_id, &b.ref_id))
    });
}

/// Record ids compare numerically, anything else lexically.
fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}
