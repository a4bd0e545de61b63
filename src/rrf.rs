//! Weighted Reciprocal Rank Fusion (RRF) for hybrid search
//!
//! Merges ranked hit lists without score normalization.
//! Formula: score = Σ weight / (k + rank) for each ranking list
//!
//! Hits appearing in both the keyword and the vector ranking get boosted scores.

use std::collections::HashMap;

use crate::sqlite::{Hit, sort_hits};

/// RRF fusion configuration
#[derive(Debug, Clone, Copy)]
pub struct RrfConfig {
    /// The k parameter for RRF formula (default: 25.0)
    /// Prevents division by very small numbers and gives diminishing returns for top ranks
    pub k: f64,
}

impl Default for RrfConfig {
    fn default() -> Self {
        Self { k: 25.0 }
    }
}

/// One input ranking and the weight of its contribution.
#[derive(Debug, Clone)]
pub struct WeightedList {
    /// Hits sorted best first.
    pub hits: Vec<Hit>,
    pub weight: f64,
}

impl WeightedList {
    pub fn new(hits: Vec<Hit>, weight: f64) -> Self {
        Self { hits, weight }
    }
}

/// Fuses ranked hit lists using weighted Reciprocal Rank Fusion.
///
/// # Returns
///
/// Unique hits (by `ref_id`) sorted by accumulated score descending, ties
/// broken on `ref_id`. Each hit's `score` is replaced by its fused score.
/// Lists with a zero weight contribute nothing but their hits are still kept.
pub fn rrf_fusion(lists: Vec<WeightedList>, config: Option<RrfConfig>) -> Vec<Hit> {
    let config = config.unwrap_or_default();

    let mut fused: HashMap<String, Hit> = HashMap::new();

    for list in lists {
        for (rank, hit) in list.hits.into_iter().enumerate() {
            let rank = rank + 1; // 1-based ranking for RRF formula
            let contribution = list.weight / (config.k + rank as f64);

            fused
                .entry(hit.ref_id.clone())
                .and_modify(|existing| existing.score += contribution)
                .or_insert(Hit {
                    score: contribution,
                    ..hit
                });
        }
    }

    let mut results: Vec<Hit> = fused.into_values().collect();
    sort_hits(&mut results);
    results
}
