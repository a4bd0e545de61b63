//! Semantic derivation: candidate facts from episodic records and the policy
//! that turns them into fact-set changes.
//!
//! `FactExtractor` is the pluggable part; `PatternExtractor` is the built-in
//! rule-based implementation. `derive_facts` applies one record's candidates in
//! a single transaction and refreshes the index for every fact it touched.

use std::collections::HashMap;

use crate::errors::Error;
use crate::indexer::Indexer;
use crate::memory_types::{EpisodicRecord, FactStatus, Role, SemanticFact};
use crate::sqlite::{Database, FactWrite};
use crate::text;

/// Confidence increase when a record restates an active fact.
pub const SUPPORT_CONFIDENCE_STEP: f64 = 0.1;

/// Whether a candidate asserts a value or withdraws one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Assert,
    Retract,
}

/// A fact proposed by an extractor, not yet reconciled with the fact set.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateFact {
    /// Normalized subject key. Facts with equal subjects are related.
    pub subject: String,
    pub value: String,
    pub statement: String,
    pub confidence: f64,
    pub polarity: Polarity,
}

/// Derives candidate facts from one episodic record.
///
/// Called from the extraction workers, possibly for several users at once.
pub trait FactExtractor: Send + Sync {
    fn extract(&self, record: &EpisodicRecord) -> Result<Vec<CandidateFact>, Error>;
}

/// Leading discourse words that do not change the meaning of a statement.
const FILLERS: &[&str] = &[
    "actually", "also", "and", "but", "correction", "hey", "hmm", "no", "now", "oh", "ok",
    "okay", "so", "sorry", "update", "wait", "well", "yes",
];

const COPULAS: &[&str] = &["is", "are", "was"];
const NEGATED_COPULAS: &[&str] = &["isn't", "isnt", "aren't", "arent", "wasn't", "wasnt"];
const LIKE_VERBS: &[&str] = &["like", "love", "enjoy", "prefer"];
const MAX_SUBJECT_WORDS: usize = 4;

/// Rule-based extractor for first-person statements in user turns.
///
/// Recognized forms: `my <subject> is <value>`, `call me <name>`,
/// `i live in <place>`, `i work at|for <employer>`, `i am a <role>`,
/// `i like|love|enjoy|prefer <thing>`, and the retractions
/// `my <subject> is not <value>` and `i don't|do not|no longer like <thing>`.
#[derive(Debug, Clone, Default)]
pub struct PatternExtractor;

impl PatternExtractor {
    pub fn new() -> Self {
        Self
    }

    fn extract_sentence(&self, sentence: &str) -> Option<CandidateFact> {
        let words: Vec<&str> = sentence.split_whitespace().collect();
        let lower: Vec<String> = words.iter().map(|w| normalize_word(w)).collect();

        let mut start = 0;
        while start < lower.len() && FILLERS.contains(&lower[start].as_str()) {
            start += 1;
        }
        let words = &words[start..];
        let lower: Vec<&str> = lower[start..].iter().map(String::as_str).collect();

        match lower.as_slice() {
            ["my", ..] => possessive(words, &lower),
            ["call", "me", ..] => {
                simple(words, 2, "name", |v| format!("User's name is {}.", v), 0.8)
            }
            ["i", "live", "in", ..] => {
                simple(words, 3, "location", |v| format!("User lives in {}.", v), 0.8)
            }
            ["i", "work", "at" | "for", ..] => {
                simple(words, 3, "employer", |v| format!("User works at {}.", v), 0.8)
            }
            ["i", "am", "a" | "an", ..] => {
                simple(words, 2, "identity", |v| format!("User is {}.", v), 0.6)
            }
            ["i'm" | "im", "a" | "an", ..] => {
                simple(words, 1, "identity", |v| format!("User is {}.", v), 0.6)
            }
            ["i", "don't" | "dont", verb, ..] if LIKE_VERBS.contains(verb) => {
                likes(words, 3, Polarity::Retract)
            }
            ["i", "do", "not", verb, ..] if LIKE_VERBS.contains(verb) => {
                likes(words, 4, Polarity::Retract)
            }
            ["i", "no", "longer", verb, ..] if LIKE_VERBS.contains(verb) => {
                likes(words, 4, Polarity::Retract)
            }
            ["i", verb, ..] if LIKE_VERBS.contains(verb) => likes(words, 2, Polarity::Assert),
            _ => None,
        }
    }
}

impl FactExtractor for PatternExtractor {
    fn extract(&self, record: &EpisodicRecord) -> Result<Vec<CandidateFact>, Error> {
        Ok(record
            .turns
            .iter()
            .filter(|turn| turn.role == Role::User)
            .flat_map(|turn| split_sentences(&turn.content))
            .filter_map(|sentence| self.extract_sentence(sentence))
            .collect())
    }
}

fn split_sentences(content: &str) -> impl Iterator<Item = &str> {
    content
        .split(|c: char| matches!(c, '.' | '!' | '?' | ';' | '\n'))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Lowercase, straighten apostrophes, trim surrounding punctuation.
fn normalize_word(word: &str) -> String {
    word.replace('\u{2019}', "'")
        .trim_matches(|c: char| !(c.is_alphanumeric() || c == '\''))
        .to_lowercase()
}

fn join_value(words: &[&str]) -> Option<String> {
    let value = text::clean_value(&words.join(" "));
    let value = value.trim_matches(|c: char| c == ',' || c == '"').trim().to_string();
    if text::normalize_key(&value).is_empty() {
        None
    } else {
        Some(value)
    }
}

fn simple(
    words: &[&str],
    skip: usize,
    subject: &str,
    statement: impl Fn(&str) -> String,
    confidence: f64,
) -> Option<CandidateFact> {
    let value = join_value(words.get(skip..)?)?;
    Some(CandidateFact {
        subject: subject.to_string(),
        statement: statement(&value),
        value,
        confidence,
        polarity: Polarity::Assert,
    })
}

fn likes(words: &[&str], skip: usize, polarity: Polarity) -> Option<CandidateFact> {
    let mut rest = words.get(skip..)?.to_vec();
    if let Some(last) = rest.last() {
        if normalize_word(last) == "anymore" {
            rest.pop();
        }
    }
    let value = join_value(&rest)?;
    let statement = match polarity {
        Polarity::Assert => format!("User likes {}.", value),
        Polarity::Retract => format!("User does not like {}.", value),
    };
    Some(CandidateFact {
        subject: format!("likes:{}", text::normalize_key(&value)),
        statement,
        value,
        confidence: 0.7,
        polarity,
    })
}

/// `my <subject> is|are|was [not] <value>` and `my <subject> isn't <value>`.
fn possessive(words: &[&str], lower: &[&str]) -> Option<CandidateFact> {
    let verb_at = lower
        .iter()
        .skip(1)
        .position(|w| COPULAS.contains(w) || NEGATED_COPULAS.contains(w))?
        + 1;
    if verb_at == 1 || verb_at - 1 > MAX_SUBJECT_WORDS {
        return None;
    }

    let subject = text::normalize_key(&words[1..verb_at].join(" "));
    if subject.is_empty() {
        return None;
    }

    let verb = lower[verb_at];
    let (polarity, value_at) = if NEGATED_COPULAS.contains(&verb) {
        (Polarity::Retract, verb_at + 1)
    } else if lower.get(verb_at + 1) == Some(&"not") {
        (Polarity::Retract, verb_at + 2)
    } else {
        (Polarity::Assert, verb_at + 1)
    };

    let value = join_value(words.get(value_at..)?)?;
    let copula = if COPULAS.contains(&verb) {
        verb
    } else {
        verb.trim_end_matches("n't").trim_end_matches("nt")
    };
    let statement = match polarity {
        Polarity::Assert => format!("User's {} {} {}.", subject, copula, value),
        Polarity::Retract => format!("User's {} {} not {}.", subject, copula, value),
    };

    Some(CandidateFact {
        subject,
        value,
        statement,
        confidence: 0.8,
        polarity,
    })
}

/// Knobs of the reconciliation policy.
#[derive(Debug, Clone, Copy)]
pub struct FactPolicy {
    /// Replace a fact whose value changed instead of keeping both active.
    pub prediction_correction: bool,
}

/// What `derive_facts` did with one record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DerivationOutcome {
    pub created: usize,
    pub supported: usize,
    pub superseded: usize,
    pub retracted: usize,
}

/// Plans fact writes for one record against the active facts of a user.
///
/// Keeps an overlay of the active fact per subject so several candidates
/// from the same record see each other's effects.
struct Planner<'a> {
    db: &'a Database,
    user_id: &'a str,
    record_id: u64,
    policy: FactPolicy,
    now: String,
    active: HashMap<String, Option<SemanticFact>>,
    writes: Vec<FactWrite>,
    touched: Vec<String>,
    outcome: DerivationOutcome,
}

impl<'a> Planner<'a> {
    fn current(&mut self, subject: &str) -> Result<Option<SemanticFact>, Error> {
        if let Some(cached) = self.active.get(subject) {
            return Ok(cached.clone());
        }
        let found = self.db.active_fact_by_subject(self.user_id, subject)?;
        self.active.insert(subject.to_string(), found.clone());
        Ok(found)
    }

    fn new_fact(&self, candidate: &CandidateFact, support: Vec<u64>) -> SemanticFact {
        SemanticFact {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: self.user_id.to_string(),
            subject: candidate.subject.clone(),
            value: candidate.value.clone(),
            statement: candidate.statement.clone(),
            confidence: candidate.confidence.clamp(0.0, 1.0),
            supporting_record_ids: support,
            status: FactStatus::Active,
            superseded_by: None,
            evidence_record: None,
            created_at: self.now.clone(),
            updated_at: self.now.clone(),
        }
    }

    fn apply(&mut self, candidate: &CandidateFact) -> Result<(), Error> {
        let existing = self.current(&candidate.subject)?;
        let same_value = |fact: &SemanticFact| {
            text::normalize_key(&fact.value) == text::normalize_key(&candidate.value)
        };

        match (candidate.polarity, existing) {
            (Polarity::Assert, None) => {
                let fact = self.new_fact(candidate, vec![self.record_id]);
                self.touch(&fact.id);
                self.active.insert(candidate.subject.clone(), Some(fact.clone()));
                self.writes.push(FactWrite::Create(fact));
                self.outcome.created += 1;
            }
            (Polarity::Assert, Some(mut fact)) if same_value(&fact) => {
                if fact.supporting_record_ids.contains(&self.record_id) {
                    return Ok(());
                }
                fact.confidence = (fact.confidence + SUPPORT_CONFIDENCE_STEP).min(1.0);
                fact.supporting_record_ids.push(self.record_id);
                fact.updated_at = self.now.clone();
                self.writes.push(FactWrite::Support {
                    fact_id: fact.id.clone(),
                    record_id: self.record_id,
                    confidence: fact.confidence,
                    updated_at: self.now.clone(),
                });
                self.touch(&fact.id);
                self.active.insert(candidate.subject.clone(), Some(fact));
                self.outcome.supported += 1;
            }
            (Polarity::Assert, Some(old)) if self.policy.prediction_correction => {
                let mut support = old.supporting_record_ids.clone();
                if !support.contains(&self.record_id) {
                    support.push(self.record_id);
                }
                support.sort_unstable();
                let replacement = self.new_fact(candidate, support);
                self.touch(&old.id);
                self.touch(&replacement.id);
                self.active
                    .insert(candidate.subject.clone(), Some(replacement.clone()));
                self.writes.push(FactWrite::Supersede {
                    old_id: old.id,
                    replacement,
                    evidence_record: self.record_id,
                    updated_at: self.now.clone(),
                });
                self.outcome.superseded += 1;
            }
            (Polarity::Assert, Some(_)) => {
                let fact = self.new_fact(candidate, vec![self.record_id]);
                self.touch(&fact.id);
                self.active.insert(candidate.subject.clone(), Some(fact.clone()));
                self.writes.push(FactWrite::Create(fact));
                self.outcome.created += 1;
            }
            (Polarity::Retract, Some(fact)) if same_value(&fact) => {
                self.touch(&fact.id);
                self.active.insert(candidate.subject.clone(), None);
                self.writes.push(FactWrite::Retract {
                    fact_id: fact.id,
                    evidence_record: self.record_id,
                    updated_at: self.now.clone(),
                });
                self.outcome.retracted += 1;
            }
            (Polarity::Retract, _) => {}
        }
        Ok(())
    }

    fn touch(&mut self, fact_id: &str) {
        if !self.touched.iter().any(|id| id == fact_id) {
            self.touched.push(fact_id.to_string());
        }
    }
}

/// Extract candidates from `record` and reconcile them with the user's facts.
///
/// # Errors
///
/// `ExtractionFailure` wrapping whatever went wrong. Nothing is half-applied
/// in the fact tables.
pub fn derive_facts(
    db: &Database,
    indexer: &Indexer,
    extractor: &dyn FactExtractor,
    policy: FactPolicy,
    record: &EpisodicRecord,
) -> Result<DerivationOutcome, Error> {
    let candidates = extractor
        .extract(record)
        .map_err(|e| extraction_failure(record, e.to_string()))?;
    apply_candidates(db, indexer, policy, record, &candidates)
}

fn extraction_failure(record: &EpisodicRecord, reason: String) -> Error {
    Error::ExtractionFailure {
        record_id: record.id,
        reason,
    }
}

/// Reconcile one record's candidates with the user's facts.
///
/// The fact writes commit together; index entries of every touched fact are
/// refreshed afterwards (active facts indexed, others removed).
///
/// # Errors
///
/// `ExtractionFailure` wrapping whatever went wrong.
pub fn apply_candidates(
    db: &Database,
    indexer: &Indexer,
    policy: FactPolicy,
    record: &EpisodicRecord,
    candidates: &[CandidateFact],
) -> Result<DerivationOutcome, Error> {
    let failure = |reason: String| extraction_failure(record, reason);

    if candidates.is_empty() {
        return Ok(DerivationOutcome::default());
    }

    let mut planner = Planner {
        db,
        user_id: &record.user_id,
        record_id: record.id,
        policy,
        now: chrono::Utc::now().to_rfc3339(),
        active: HashMap::new(),
        writes: Vec::new(),
        touched: Vec::new(),
        outcome: DerivationOutcome::default(),
    };
    for candidate in candidates {
        planner.apply(candidate).map_err(|e| failure(e.to_string()))?;
    }

    let Planner {
        writes,
        touched,
        outcome,
        ..
    } = planner;

    db.apply_fact_writes(&writes)
        .map_err(|e| failure(e.to_string()))?;

    for fact_id in &touched {
        let result = match db.get_fact(&record.user_id, fact_id) {
            Ok(Some(fact)) => indexer.index_fact(db, &record.user_id, &fact),
            Ok(None) => indexer.remove_fact(db, &record.user_id, fact_id).map(|_| ()),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            // The fact writes are committed; the index must catch up with them.
            tracing::warn!(
                user_id = %record.user_id,
                fact_id = %fact_id,
                error = %e,
                "index update after fact commit failed; rebuilding"
            );
            if let Err(rebuild) = indexer.rebuild(db, &record.user_id) {
                tracing::warn!(user_id = %record.user_id, error = %rebuild, "index rebuild failed");
            }
            return Err(failure(format!("index update for fact {}: {}", fact_id, e)));
        }
    }

    tracing::debug!(
        user_id = %record.user_id,
        record_id = record.id,
        created = outcome.created,
        supported = outcome.supported,
        superseded = outcome.superseded,
        retracted = outcome.retracted,
        "derived facts"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::memory_types::{SourceType, Turn};
    use std::sync::Arc;

    fn record(id: u64, user_text: &str) -> EpisodicRecord {
        EpisodicRecord {
            id,
            user_id: "u1".to_string(),
            turns: vec![Turn::user(user_text), Turn::assistant("Noted.")],
            created_at: "2024-01-01T00:00:00Z".to_string(),
            session_marker: "s".to_string(),
        }
    }

    fn extract(text: &str) -> Vec<CandidateFact> {
        PatternExtractor::new().extract(&record(1, text)).unwrap()
    }

    fn setup() -> (Database, Indexer) {
        (
            Database::open_in_memory().unwrap(),
            Indexer::new(Arc::new(HashEmbedder::default())),
        )
    }

    fn derive(db: &Database, idx: &Indexer, r: &EpisodicRecord, correction: bool) -> DerivationOutcome {
        db.insert_records(std::slice::from_ref(r)).unwrap();
        derive_facts(
            db,
            idx,
            &PatternExtractor::new(),
            FactPolicy {
                prediction_correction: correction,
            },
            r,
        )
        .unwrap()
    }

    #[test]
    fn test_extract_possessive() {
        let facts = extract("My favorite color is blue.");
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].subject, "favorite color");
        assert_eq!(facts[0].value, "blue");
        assert_eq!(facts[0].statement, "User's favorite color is blue.");
        assert_eq!(facts[0].polarity, Polarity::Assert);
    }

    #[test]
    fn test_extract_strips_fillers() {
        let facts = extract("Actually, my favorite color is red");
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].subject, "favorite color");
        assert_eq!(facts[0].value, "red");

        let facts = extract("No, my favorite color is green!");
        assert_eq!(facts[0].value, "green");
    }

    #[test]
    fn test_extract_negated_possessive() {
        let facts = extract("My favorite color isn't blue");
        assert_eq!(facts[0].polarity, Polarity::Retract);
        assert_eq!(facts[0].value, "blue");

        let facts = extract("my favorite color is not blue");
        assert_eq!(facts[0].polarity, Polarity::Retract);
        assert_eq!(facts[0].statement, "User's favorite color is not blue.");
    }

    #[test]
    fn test_extract_other_patterns() {
        assert_eq!(extract("Call me Sam.")[0].statement, "User's name is Sam.");
        assert_eq!(extract("I live in Oslo")[0].subject, "location");
        assert_eq!(extract("I work for Acme Corp.")[0].value, "Acme Corp");
        assert_eq!(extract("I'm a software engineer")[0].statement, "User is a software engineer.");

        let likes = extract("I love jazz music!");
        assert_eq!(likes[0].subject, "likes:jazz music");
        assert_eq!(likes[0].statement, "User likes jazz music.");

        let dislikes = extract("I don't like jazz music anymore");
        assert_eq!(dislikes[0].subject, "likes:jazz music");
        assert_eq!(dislikes[0].polarity, Polarity::Retract);

        assert!(extract("I am going home").is_empty());
    }

    #[test]
    fn test_extract_ignores_assistant_and_chatter() {
        let r = EpisodicRecord {
            turns: vec![
                Turn::user("How are you today?"),
                Turn::assistant("My favorite color is purple."),
            ],
            ..record(1, "")
        };
        assert!(PatternExtractor::new().extract(&r).unwrap().is_empty());
        assert!(extract("I'm fine thanks").is_empty());
        assert!(extract("my").is_empty());
        assert!(extract("my favorite color is").is_empty());
    }

    #[test]
    fn test_extract_multiple_sentences() {
        let facts = extract("My name is Ada. I live in London; I like chess");
        let subjects: Vec<_> = facts.iter().map(|f| f.subject.as_str()).collect();
        assert_eq!(subjects, vec!["name", "location", "likes:chess"]);
    }

    #[test]
    fn test_new_fact_created_and_indexed() {
        let (db, idx) = setup();
        let outcome = derive(&db, &idx, &record(1, "My favorite color is blue."), true);
        assert_eq!(outcome.created, 1);

        let active = db.list_facts("u1", Some(FactStatus::Active)).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].supporting_record_ids, vec![1]);

        let keys = db.entry_keys("u1").unwrap();
        assert_eq!(keys, vec![(SourceType::Semantic, active[0].id.clone())]);
    }

    #[test]
    fn test_restatement_adds_support() {
        let (db, idx) = setup();
        derive(&db, &idx, &record(1, "My favorite color is blue."), true);
        let outcome = derive(&db, &idx, &record(2, "my favorite color is Blue"), true);
        assert_eq!(outcome.supported, 1);

        let active = db.list_facts("u1", Some(FactStatus::Active)).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].supporting_record_ids, vec![1, 2]);
        assert!((active[0].confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_correction_supersedes_with_lineage() {
        let (db, idx) = setup();
        derive(&db, &idx, &record(1, "My favorite color is blue."), true);
        let outcome = derive(&db, &idx, &record(2, "Actually my favorite color is red"), true);
        assert_eq!(outcome.superseded, 1);

        let all = db.list_facts("u1", None).unwrap();
        assert_eq!(all.len(), 2);
        let old = all.iter().find(|f| f.value == "blue").unwrap();
        let new = all.iter().find(|f| f.value == "red").unwrap();

        assert_eq!(old.status, FactStatus::Superseded);
        assert_eq!(old.superseded_by.as_deref(), Some(new.id.as_str()));
        assert_eq!(old.evidence_record, Some(2));
        assert_eq!(new.status, FactStatus::Active);
        assert_eq!(new.supporting_record_ids, vec![1, 2]);

        let keys = db.entry_keys("u1").unwrap();
        assert_eq!(keys, vec![(SourceType::Semantic, new.id.clone())]);
    }

    #[test]
    fn test_correction_disabled_keeps_both_active() {
        let (db, idx) = setup();
        derive(&db, &idx, &record(1, "My favorite color is blue."), false);
        derive(&db, &idx, &record(2, "My favorite color is red."), false);

        let active = db.list_facts("u1", Some(FactStatus::Active)).unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(db.entry_keys("u1").unwrap().len(), 2);
    }

    #[test]
    fn test_retraction() {
        let (db, idx) = setup();
        derive(&db, &idx, &record(1, "I like jazz."), true);
        let outcome = derive(&db, &idx, &record(2, "I no longer like jazz"), true);
        assert_eq!(outcome.retracted, 1);

        let all = db.list_facts("u1", None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, FactStatus::Retracted);
        assert_eq!(all[0].evidence_record, Some(2));
        assert!(db.entry_keys("u1").unwrap().is_empty());
    }

    #[test]
    fn test_retraction_of_other_value_ignored() {
        let (db, idx) = setup();
        derive(&db, &idx, &record(1, "My favorite color is blue."), true);
        let outcome = derive(&db, &idx, &record(2, "My favorite color isn't green"), true);
        assert_eq!(outcome, DerivationOutcome::default());
        assert_eq!(db.list_facts("u1", Some(FactStatus::Active)).unwrap().len(), 1);
    }

    #[test]
    fn test_same_record_change_twice() {
        let (db, idx) = setup();
        let outcome = derive(
            &db,
            &idx,
            &record(1, "My pet is a cat. Sorry, my pet is a dog."),
            true,
        );
        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.superseded, 1);

        let active = db.list_facts("u1", Some(FactStatus::Active)).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].value, "a dog");
    }

    struct Failing;

    impl FactExtractor for Failing {
        fn extract(&self, _record: &EpisodicRecord) -> Result<Vec<CandidateFact>, Error> {
            Err(Error::Inference("model unavailable".to_string()))
        }
    }

    #[test]
    fn test_extractor_error_becomes_extraction_failure() {
        let (db, idx) = setup();
        let r = record(5, "My favorite color is blue.");
        let err = derive_facts(
            &db,
            &idx,
            &Failing,
            FactPolicy {
                prediction_correction: true,
            },
            &r,
        )
        .unwrap_err();
        assert!(matches!(err, Error::ExtractionFailure { record_id: 5, .. }));
    }
}
