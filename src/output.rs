//! JSON response types and formatting for CLI output.

use mnemon::{EpisodicRecord, ScoredResult, SemanticFact};
use serde::Serialize;

/// Response for a successful ingestion.
#[derive(Serialize)]
pub struct IngestResponse {
    pub status: String,
    pub record_id: u64,
    pub accepted_count: usize,
    /// Facts active for the user once derivation settled.
    pub active_facts: usize,
}

/// Response for search results.
#[derive(Serialize)]
pub struct SearchResponse<'a> {
    pub method: &'a str,
    pub results: &'a [ScoredResult],
}

/// Response for listing facts.
#[derive(Serialize)]
pub struct FactsResponse<'a> {
    pub facts: &'a [SemanticFact],
}

/// Response for the episodic history.
#[derive(Serialize)]
pub struct HistoryResponse<'a> {
    pub records: &'a [EpisodicRecord],
}

/// Response for an index rebuild.
#[derive(Serialize)]
pub struct RebuildResponse {
    pub status: String,
    pub entries: usize,
}

/// Print a value as formatted JSON to stdout.
pub fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Failed to serialize JSON: {}", e);
            std::process::exit(1);
        }
    }
}

/// One-line rendering of a fact for human output.
pub fn fact_line(fact: &SemanticFact) -> String {
    let mut line = format!(
        "{} [{} {:.2}] {}",
        fact.id,
        fact.status.as_str(),
        fact.confidence,
        fact.statement
    );
    if let Some(next) = &fact.superseded_by {
        line.push_str(&format!(" -> {}", next));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemon::{FactStatus, SourceType};

    fn fact(status: FactStatus, superseded_by: Option<&str>) -> SemanticFact {
        SemanticFact {
            id: "f1".to_string(),
            user_id: "u1".to_string(),
            subject: "favorite color".to_string(),
            value: "blue".to_string(),
            statement: "User's favorite color is blue.".to_string(),
            confidence: 0.8,
            supporting_record_ids: vec![1],
            status,
            superseded_by: superseded_by.map(str::to_string),
            evidence_record: None,
            created_at: "2024-01-01T00:00:00Z".to_string(),
            updated_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn test_serialize_ingest_response() {
        let response = IngestResponse {
            status: "ingested".to_string(),
            record_id: 3,
            accepted_count: 2,
            active_facts: 1,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"status\":\"ingested\""));
        assert!(json.contains("\"record_id\":3"));
    }

    #[test]
    fn test_serialize_search_response() {
        let results = vec![ScoredResult {
            source_type: SourceType::Semantic,
            id: "f1".to_string(),
            content: "User likes jazz.".to_string(),
            score: 0.5,
            created_at: "2024-01-01T00:00:00Z".to_string(),
        }];
        let json = serde_json::to_string(&SearchResponse {
            method: "hybrid",
            results: &results,
        })
        .unwrap();
        assert!(json.contains("\"method\":\"hybrid\""));
        assert!(json.contains("\"source_type\":\"semantic\""));
        assert!(json.contains("\"score\":0.5"));
    }

    #[test]
    fn test_fact_line() {
        assert_eq!(
            fact_line(&fact(FactStatus::Active, None)),
            "f1 [active 0.80] User's favorite color is blue."
        );
        assert!(fact_line(&fact(FactStatus::Superseded, Some("f2"))).ends_with(" -> f2"));
    }
}
