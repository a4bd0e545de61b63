//! Multi-strategy search over a user's index entries.
//!
//! Episodic and semantic entries are ranked as two separate lists, each cut to
//! the limit, and returned episodic first. Strategies are a closed enum
//! dispatched in `rank`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::embedding::{Embedder, l2_normalize};
use crate::episodic::validate_input_length;
use crate::errors::Error;
use crate::memory_types::{ScoredResult, SourceType};
use crate::rrf::{self, RrfConfig, WeightedList};
use crate::sqlite::{Database, EntryRow, Hit, cosine_similarity, sort_hits, validate_limit};

/// Maximum allowed candidate pool size for hybrid search to prevent DoS.
const MAX_CANDIDATE_POOL: usize = 10_000;

/// Retrieval strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMethod {
    /// BM25 and vector rankings fused with weighted RRF.
    #[default]
    Hybrid,
    /// FTS5 BM25 keyword ranking.
    #[serde(alias = "keyword")]
    Bm25,
    /// Cosine similarity against stored embeddings.
    Vector,
    /// Cosine after mean-centring, with a document length adjustment.
    #[serde(alias = "vector-variant")]
    VectorNorlift,
}

impl SearchMethod {
    pub const ALL: [SearchMethod; 4] = [
        SearchMethod::Hybrid,
        SearchMethod::Bm25,
        SearchMethod::Vector,
        SearchMethod::VectorNorlift,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMethod::Hybrid => "hybrid",
            SearchMethod::Bm25 => "bm25",
            SearchMethod::Vector => "vector",
            SearchMethod::VectorNorlift => "vector_norlift",
        }
    }

    fn needs_query_vector(&self) -> bool {
        !matches!(self, SearchMethod::Bm25)
    }
}

impl fmt::Display for SearchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "hybrid" => Ok(SearchMethod::Hybrid),
            "bm25" | "keyword" => Ok(SearchMethod::Bm25),
            "vector" => Ok(SearchMethod::Vector),
            "vector_norlift" | "vector_variant" => Ok(SearchMethod::VectorNorlift),
            other => Err(Error::InvalidInput(format!(
                "Unknown search method '{}' (expected hybrid, bm25, vector or vector_norlift)",
                other
            ))),
        }
    }
}

/// Tuning shared by every search of an engine.
#[derive(Debug, Clone, Copy)]
pub struct SearchParams {
    /// Results per source type.
    pub limit: usize,
    pub rrf: RrfConfig,
    pub keyword_weight: f64,
    pub vector_weight: f64,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            limit: 10,
            rrf: RrfConfig::default(),
            keyword_weight: 1.0,
            vector_weight: 1.0,
        }
    }
}

/// Run `query` against one user's partition.
///
/// # Errors
///
/// Returns error if:
/// - Query is blank (`InvalidInput`) or longer than 100,000 bytes
/// - Limit is 0 or exceeds 10,000
/// - Embedding the query or reading the index fails
pub fn search(
    db: &Database,
    embedder: &dyn Embedder,
    user_id: &str,
    query: &str,
    method: SearchMethod,
    params: &SearchParams,
) -> Result<Vec<ScoredResult>, Error> {
    let query = query.trim();
    validate_input_length(query).map_err(|e| match e {
        Error::EmptyInput => Error::InvalidInput("query cannot be blank".to_string()),
        other => other,
    })?;
    validate_limit(params.limit)?;

    let query_vec = if method.needs_query_vector() {
        Some(embedder.embed(query)?)
    } else {
        None
    };

    let mut results = Vec::new();
    for ref_type in [SourceType::Episodic, SourceType::Semantic] {
        let ctx = RankContext {
            db,
            dims: embedder.dims(),
            user_id,
            ref_type,
            query,
            query_vec: query_vec.as_deref(),
        };
        let mut hits = rank(&ctx, method, params)?;
        hits.truncate(params.limit);
        results.extend(hits.into_iter().map(|hit| ScoredResult {
            source_type: ref_type,
            id: hit.ref_id,
            content: hit.content,
            score: hit.score,
            created_at: hit.created_at,
        }));
    }

    tracing::debug!(
        user_id,
        method = %method,
        results = results.len(),
        "search complete"
    );
    Ok(results)
}

struct RankContext<'a> {
    db: &'a Database,
    dims: usize,
    user_id: &'a str,
    ref_type: SourceType,
    query: &'a str,
    query_vec: Option<&'a [f32]>,
}

impl RankContext<'_> {
    fn query_vec(&self) -> Result<&[f32], Error> {
        self.query_vec
            .ok_or_else(|| Error::Inference("query embedding missing".to_string()))
    }

    fn entries(&self) -> Result<Vec<EntryRow>, Error> {
        Ok(self.db.load_entries(self.user_id, self.ref_type, self.dims)?)
    }
}

fn rank(ctx: &RankContext<'_>, method: SearchMethod, params: &SearchParams) -> Result<Vec<Hit>, Error> {
    match method {
        SearchMethod::Bm25 => Ok(ctx
            .db
            .search_bm25(ctx.user_id, ctx.ref_type, ctx.query, params.limit)?),
        SearchMethod::Vector => rank_vector(ctx),
        SearchMethod::VectorNorlift => rank_norlift(ctx),
        SearchMethod::Hybrid => {
            let pool = params.limit.saturating_mul(10).clamp(50, MAX_CANDIDATE_POOL);
            let keyword = ctx.db.search_bm25(ctx.user_id, ctx.ref_type, ctx.query, pool)?;
            let mut vector = rank_vector(ctx)?;
            vector.truncate(pool);

            Ok(rrf::rrf_fusion(
                vec![
                    WeightedList::new(keyword, params.keyword_weight),
                    WeightedList::new(vector, params.vector_weight),
                ],
                Some(params.rrf),
            ))
        }
    }
}

fn to_hit(entry: EntryRow, score: f64) -> Hit {
    Hit {
        ref_id: entry.ref_id,
        content: entry.content,
        created_at: entry.created_at,
        score,
    }
}

fn rank_vector(ctx: &RankContext<'_>) -> Result<Vec<Hit>, Error> {
    let query = ctx.query_vec()?;
    let mut hits = Vec::new();
    for entry in ctx.entries()? {
        let Some(embedding) = entry.embedding.as_deref() else {
            continue;
        };
        let score = cosine_similarity(query, embedding)?;
        hits.push(to_hit(entry, score));
    }
    sort_hits(&mut hits);
    Ok(hits)
}

/// Cosine in a mean-centred space, divided by `sqrt(1 + ln(1 + tokens / avg_tokens))`.
///
/// With fewer than two entries there is no meaningful mean and vectors are
/// used as stored.
fn rank_norlift(ctx: &RankContext<'_>) -> Result<Vec<Hit>, Error> {
    let query = ctx.query_vec()?;
    let entries: Vec<EntryRow> = ctx
        .entries()?
        .into_iter()
        .filter(|e| e.embedding.is_some())
        .collect();
    if entries.is_empty() {
        return Ok(Vec::new());
    }

    let vectors: Vec<&[f32]> = entries
        .iter()
        .filter_map(|e| e.embedding.as_deref())
        .collect();
    let mean = (vectors.len() >= 2).then(|| mean_vector(&vectors, query.len()));
    let centre = |v: &[f32]| match &mean {
        Some(mean) => l2_normalize(&v.iter().zip(mean).map(|(x, m)| x - m).collect::<Vec<_>>()),
        None => v.to_vec(),
    };

    let centred_query = centre(query);
    let avg_tokens = (entries.iter().map(|e| e.token_count).sum::<usize>() as f64
        / entries.len() as f64)
        .max(1.0);

    let mut hits = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(embedding) = entry.embedding.as_deref() else {
            continue;
        };
        let cosine = cosine_similarity(&centred_query, &centre(embedding))?;
        let length_penalty = (1.0 + (1.0 + entry.token_count as f64 / avg_tokens).ln()).sqrt();
        hits.push(to_hit(entry, cosine / length_penalty));
    }
    sort_hits(&mut hits);
    Ok(hits)
}

fn mean_vector(vectors: &[&[f32]], dims: usize) -> Vec<f32> {
    let mut mean = vec![0.0f32; dims];
    for v in vectors {
        for (acc, x) in mean.iter_mut().zip(v.iter()) {
            *acc += x;
        }
    }
    let n = vectors.len() as f32;
    for value in mean.iter_mut() {
        *value /= n;
    }
    mean
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::indexer::Indexer;
    use crate::memory_types::{EpisodicRecord, FactStatus, SemanticFact, Turn};
    use crate::sqlite::FactWrite;
    use std::sync::Arc;

    fn seeded() -> (Database, Arc<HashEmbedder>) {
        let db = Database::open_in_memory().unwrap();
        let embedder = Arc::new(HashEmbedder::default());
        let indexer = Indexer::new(embedder.clone());

        let records: Vec<EpisodicRecord> = [
            "My favorite color is blue.",
            "I work at a bakery in Oslo.",
            "Rust programming is fun and my favorite language.",
        ]
        .iter()
        .enumerate()
        .map(|(i, text)| EpisodicRecord {
            id: i as u64 + 1,
            user_id: "u1".to_string(),
            turns: vec![Turn::user(*text), Turn::assistant("Noted.")],
            created_at: "2024-01-01T00:00:00Z".to_string(),
            session_marker: "s".to_string(),
        })
        .collect();
        db.insert_records(&records).unwrap();

        db.apply_fact_writes(&[FactWrite::Create(SemanticFact {
            id: "f1".to_string(),
            user_id: "u1".to_string(),
            subject: "favorite color".to_string(),
            value: "blue".to_string(),
            statement: "User's favorite color is blue.".to_string(),
            confidence: 0.8,
            supporting_record_ids: vec![1],
            status: FactStatus::Active,
            superseded_by: None,
            evidence_record: None,
            created_at: "2024-01-01T00:00:01Z".to_string(),
            updated_at: "2024-01-01T00:00:01Z".to_string(),
        })])
        .unwrap();
        indexer.rebuild(&db, "u1").unwrap();
        (db, embedder)
    }

    #[test]
    fn test_method_parse_and_aliases() {
        assert_eq!("hybrid".parse::<SearchMethod>().unwrap(), SearchMethod::Hybrid);
        assert_eq!("keyword".parse::<SearchMethod>().unwrap(), SearchMethod::Bm25);
        assert_eq!(
            "vector-variant".parse::<SearchMethod>().unwrap(),
            SearchMethod::VectorNorlift
        );
        assert_eq!(
            "vector_norlift".parse::<SearchMethod>().unwrap(),
            SearchMethod::VectorNorlift
        );
        assert!(matches!(
            "fuzzy".parse::<SearchMethod>(),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_method_serde_names() {
        assert_eq!(
            serde_json::to_string(&SearchMethod::VectorNorlift).unwrap(),
            "\"vector_norlift\""
        );
        let parsed: SearchMethod = serde_json::from_str("\"keyword\"").unwrap();
        assert_eq!(parsed, SearchMethod::Bm25);
        for method in SearchMethod::ALL {
            assert_eq!(method.as_str().parse::<SearchMethod>().unwrap(), method);
        }
    }

    #[test]
    fn test_empty_partition_returns_empty() {
        let db = Database::open_in_memory().unwrap();
        let embedder = HashEmbedder::default();
        for method in SearchMethod::ALL {
            let results = search(
                &db,
                &embedder,
                "nobody",
                "favorite color",
                method,
                &SearchParams::default(),
            )
            .unwrap();
            assert!(results.is_empty(), "{} returned results", method);
        }
    }

    #[test]
    fn test_blank_query_rejected() {
        let (db, embedder) = seeded();
        let err = search(
            &db,
            embedder.as_ref(),
            "u1",
            "   ",
            SearchMethod::Hybrid,
            &SearchParams::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_invalid_limit_rejected() {
        let (db, embedder) = seeded();
        let params = SearchParams {
            limit: 0,
            ..SearchParams::default()
        };
        assert!(search(&db, embedder.as_ref(), "u1", "color", SearchMethod::Bm25, &params).is_err());
    }

    #[test]
    fn test_episodic_results_precede_semantic() {
        let (db, embedder) = seeded();
        for method in SearchMethod::ALL {
            let results = search(
                &db,
                embedder.as_ref(),
                "u1",
                "favorite color",
                method,
                &SearchParams::default(),
            )
            .unwrap();

            let first_semantic = results
                .iter()
                .position(|r| r.source_type == SourceType::Semantic)
                .unwrap_or(results.len());
            assert!(
                results[first_semantic..]
                    .iter()
                    .all(|r| r.source_type == SourceType::Semantic),
                "{} interleaved source types",
                method
            );
            assert!(results.iter().any(|r| r.source_type == SourceType::Semantic));
        }
    }

    #[test]
    fn test_bm25_top_episodic_hit() {
        let (db, embedder) = seeded();
        let results = search(
            &db,
            embedder.as_ref(),
            "u1",
            "bakery Oslo",
            SearchMethod::Bm25,
            &SearchParams::default(),
        )
        .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source_type, SourceType::Episodic);
        assert_eq!(results[0].id, "2");
    }

    #[test]
    fn test_hybrid_finds_fact() {
        let (db, embedder) = seeded();
        let results = search(
            &db,
            embedder.as_ref(),
            "u1",
            "favorite color",
            SearchMethod::Hybrid,
            &SearchParams::default(),
        )
        .unwrap();

        let semantic: Vec<_> = results
            .iter()
            .filter(|r| r.source_type == SourceType::Semantic)
            .collect();
        assert_eq!(semantic.len(), 1);
        assert!(semantic[0].content.contains("blue"));
        assert_eq!(results[0].id, "1");
    }

    #[test]
    fn test_limit_applies_per_source_type() {
        let (db, embedder) = seeded();
        let params = SearchParams {
            limit: 1,
            ..SearchParams::default()
        };
        let results = search(
            &db,
            embedder.as_ref(),
            "u1",
            "favorite",
            SearchMethod::Vector,
            &params,
        )
        .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].source_type, SourceType::Episodic);
        assert_eq!(results[1].source_type, SourceType::Semantic);
    }

    #[test]
    fn test_norlift_prefers_specific_match() {
        let (db, embedder) = seeded();
        let results = search(
            &db,
            embedder.as_ref(),
            "u1",
            "rust programming language",
            SearchMethod::VectorNorlift,
            &SearchParams::default(),
        )
        .unwrap();
        assert_eq!(results[0].id, "3");
    }

    #[test]
    fn test_search_is_deterministic() {
        let (db, embedder) = seeded();
        let run = || {
            search(
                &db,
                embedder.as_ref(),
                "u1",
                "favorite",
                SearchMethod::Hybrid,
                &SearchParams::default(),
            )
            .unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_mean_vector() {
        let a = [1.0f32, 0.0];
        let b = [0.0f32, 1.0];
        assert_eq!(mean_vector(&[&a, &b], 2), vec![0.5, 0.5]);
    }
}
