mod commands;
mod output;

use std::process::ExitCode;

use clap::Parser;
use mnemon::{Config, Error, MemoryEngine};
use tracing_subscriber::EnvFilter;

use commands::Commands;

/// mnemon - Episodic and semantic memory for conversational agents
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// User partition (default: configured user_id)
    #[arg(short, long, global = true)]
    user: Option<String>,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "mnemon=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: &Cli) -> Result<ExitCode, Error> {
    if let Commands::Version = cli.command {
        return commands::handle_version(cli.json);
    }

    let config = Config::load()?;
    let user_id = cli.user.clone().unwrap_or_else(|| config.user_id.clone());
    let engine = MemoryEngine::open(config)?;
    let code = commands::execute(&cli.command, &engine, &user_id, cli.json)?;
    engine.close()?;
    Ok(code)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
