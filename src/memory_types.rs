//! Memory data types shared by the stores, the extractor and the search engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::Error;

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(Error::InvalidInput(format!("Unknown role: '{}'", other))),
        }
    }
}

/// A single conversation turn. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// One ingestion batch of turns, as persisted by the episodic store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpisodicRecord {
    /// Per-user monotonic identifier, starting at 1.
    pub id: u64,
    pub user_id: String,
    pub turns: Vec<Turn>,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    pub session_marker: String,
}

impl EpisodicRecord {
    /// Render the turns as `role: content` lines for indexing and display.
    pub fn transcript(&self) -> String {
        self.turns
            .iter()
            .map(|t| format!("{}: {}", t.role, t.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Lifecycle state of a semantic fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactStatus {
    Active,
    Superseded,
    Retracted,
}

impl FactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactStatus::Active => "active",
            FactStatus::Superseded => "superseded",
            FactStatus::Retracted => "retracted",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(FactStatus::Active),
            "superseded" => Some(FactStatus::Superseded),
            "retracted" => Some(FactStatus::Retracted),
            _ => None,
        }
    }
}

/// A durable fact derived from one or more episodic records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SemanticFact {
    pub id: String,
    pub user_id: String,
    /// Normalized subject key, e.g. `favorite color` or `likes:jazz`.
    pub subject: String,
    pub value: String,
    pub statement: String,
    pub confidence: f64,
    /// Supporting episodic record ids, ascending.
    pub supporting_record_ids: Vec<u64>,
    pub status: FactStatus,
    /// Newer fact that replaced this one (set when superseded).
    pub superseded_by: Option<String>,
    /// Record that corrected or contradicted this fact.
    pub evidence_record: Option<u64>,
    pub created_at: String,
    pub updated_at: String,
}

/// Result of a successful `ingest` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestResult {
    /// Number of turns accepted into the record.
    pub accepted_count: usize,
    /// Id of the newly created episodic record.
    pub record_id: u64,
}

/// Which store a search hit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Episodic,
    Semantic,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Episodic => "episodic",
            SourceType::Semantic => "semantic",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "episodic" => Some(SourceType::Episodic),
            "semantic" => Some(SourceType::Semantic),
            _ => None,
        }
    }
}

/// A single ranked search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredResult {
    pub source_type: SourceType,
    /// Record id (decimal) for episodic hits, fact id for semantic hits.
    pub id: String,
    pub content: String,
    pub score: f64,
    pub created_at: String,
}
