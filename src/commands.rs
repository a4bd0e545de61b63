//! Command handlers for the mnemon CLI.

use std::process::ExitCode;

use mnemon::{Error, MemoryEngine, Role, SearchMethod, Turn};

use crate::output::*;

/// Commands supported by the mnemon CLI.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Ingest one batch of turns and wait for fact derivation
    Ingest {
        /// Turns as `role:content` (role is user, assistant or system)
        #[arg(required = true)]
        turns: Vec<String>,
    },
    /// Search episodic and semantic memory
    Search {
        /// Search query text
        query: String,

        /// Search method: hybrid, bm25, vector or vector_norlift
        #[arg(short = 'm', long, default_value = "hybrid", value_parser = parse_method)]
        method: SearchMethod,

        /// Maximum results per source type (default: configured search_limit)
        #[arg(short = 'l', long)]
        limit: Option<usize>,
    },
    /// List derived facts
    Facts {
        /// Include superseded and retracted facts
        #[arg(long)]
        all: bool,
    },
    /// List stored episodic records
    History {
        /// Only records with an id greater than this
        #[arg(long, default_value = "0")]
        since: u64,
    },
    /// Recreate the search index from the stores
    Rebuild,
    /// Show version information
    Version,
}

fn parse_method(s: &str) -> Result<SearchMethod, String> {
    s.parse().map_err(|e: Error| e.to_string())
}

/// Parse `role:content` into a turn.
pub fn parse_turn(arg: &str) -> Result<Turn, Error> {
    let (role, content) = arg
        .split_once(':')
        .ok_or_else(|| Error::InvalidInput(format!("expected role:content, got '{}'", arg)))?;
    let role: Role = role.parse()?;
    Ok(Turn::new(role, content.trim()))
}

/// Execute a CLI command.
pub fn execute(
    command: &Commands,
    engine: &MemoryEngine,
    user_id: &str,
    json: bool,
) -> Result<ExitCode, Error> {
    match command {
        Commands::Ingest { turns } => handle_ingest(engine, user_id, turns, json),
        Commands::Search {
            query,
            method,
            limit,
        } => handle_search(engine, user_id, query, *method, *limit, json),
        Commands::Facts { all } => handle_facts(engine, user_id, *all, json),
        Commands::History { since } => handle_history(engine, user_id, *since, json),
        Commands::Rebuild => handle_rebuild(engine, user_id, json),
        Commands::Version => handle_version(json),
    }
}

fn handle_ingest(
    engine: &MemoryEngine,
    user_id: &str,
    args: &[String],
    json: bool,
) -> Result<ExitCode, Error> {
    let turns = args
        .iter()
        .map(|a| parse_turn(a))
        .collect::<Result<Vec<_>, _>>()?;

    let result = engine.ingest(user_id, turns)?;
    engine.wait_for_settled(user_id, Some(engine.config().settle_timeout()))?;
    let active_facts = engine.active_facts(user_id)?.len();

    if json {
        print_json(&IngestResponse {
            status: "ingested".to_string(),
            record_id: result.record_id,
            accepted_count: result.accepted_count,
            active_facts,
        });
    } else {
        println!(
            "Ingested record {} ({} turns); {} active facts",
            result.record_id, result.accepted_count, active_facts
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn handle_search(
    engine: &MemoryEngine,
    user_id: &str,
    query: &str,
    method: SearchMethod,
    limit: Option<usize>,
    json: bool,
) -> Result<ExitCode, Error> {
    let limit = limit.unwrap_or(engine.config().search_limit);
    let results = engine.search_with_limit(user_id, query, method, limit)?;
    if json {
        print_json(&SearchResponse {
            method: method.as_str(),
            results: &results,
        });
    } else {
        for result in results {
            println!(
                "{} {} [score: {:.4}]\n  {}\n",
                result.source_type.as_str(),
                result.id,
                result.score,
                result.content.replace('\n', "\n  ")
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn handle_facts(engine: &MemoryEngine, user_id: &str, all: bool, json: bool) -> Result<ExitCode, Error> {
    let facts = if all {
        engine.fact_history(user_id)?
    } else {
        engine.active_facts(user_id)?
    };
    if json {
        print_json(&FactsResponse { facts: &facts });
    } else {
        for fact in &facts {
            println!("{}", fact_line(fact));
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn handle_history(engine: &MemoryEngine, user_id: &str, since: u64, json: bool) -> Result<ExitCode, Error> {
    let records = engine
        .scan_since(user_id, since)?
        .collect::<Result<Vec<_>, _>>()?;
    if json {
        print_json(&HistoryResponse { records: &records });
    } else {
        for record in &records {
            println!("#{} {} ({})", record.id, record.created_at, record.session_marker);
            for turn in &record.turns {
                println!("  {}: {}", turn.role, turn.content);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn handle_rebuild(engine: &MemoryEngine, user_id: &str, json: bool) -> Result<ExitCode, Error> {
    let entries = engine.rebuild_index(user_id)?;
    if json {
        print_json(&RebuildResponse {
            status: "rebuilt".to_string(),
            entries,
        });
    } else {
        println!("Rebuilt index: {} entries", entries);
    }
    Ok(ExitCode::SUCCESS)
}

pub fn handle_version(json: bool) -> Result<ExitCode, Error> {
    if json {
        print_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "name": env!("CARGO_PKG_NAME")
        }));
    } else {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    }
    Ok(ExitCode::SUCCESS)
}
