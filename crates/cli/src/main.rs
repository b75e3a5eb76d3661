//! Agent Router CLI
//!
//! A thin wrapper around agent-router-core providing the query pages:
//! orchestrated queries (`ask`, `chat`), the direct PDF assistant (`rag`)
//! and knowledge base loading (`ingest`).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use agent_router_core::rag::DEFAULT_SESSION_ID;
use agent_router_core::{
    render_envelope, truncate_history, AgentSystem, ChatTurn, Credentials, Envelope, RouterConfig,
    MAX_HISTORY_TURNS,
};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "agent-router")]
#[command(about = "Route questions to a stock-data SQL agent or a PDF retrieval agent")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to router_config.toml (defaults to the working directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, short = 'v', global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ask one question through the orchestrator
    Ask {
        /// Question in natural language
        query: String,

        /// JSON file with prior turns ([{"role", "content", "timestamp"}])
        #[arg(long)]
        history: Option<PathBuf>,

        /// Print the raw response envelope
        #[arg(long)]
        json: bool,
    },

    /// Interactive session through the orchestrator
    Chat,

    /// Ask the PDF assistant directly
    Rag {
        question: String,

        /// Session id for conversation history
        #[arg(long, default_value = DEFAULT_SESSION_ID)]
        session: String,
    },

    /// Load the PDF into the vector store
    Ingest {
        /// Drop and rebuild the collection
        #[arg(long)]
        recreate: bool,
    },
}

// ============================================================================
// Setup
// ============================================================================

fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "agent_router_core=debug,agent_router=debug,warn"
    } else {
        "warn"
    }
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn load_history(path: &Path) -> Result<Vec<ChatTurn>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read history file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Invalid history JSON in {}", path.display()))
}

/// What gets remembered as the assistant's reply to a query
fn assistant_text(envelope: &Envelope) -> String {
    envelope
        .data
        .result
        .clone()
        .unwrap_or_else(|| envelope.message.clone())
}

fn print_envelope(envelope: &Envelope, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(envelope)?);
        return Ok(());
    }
    let blocks: Vec<String> = render_envelope(envelope)
        .iter()
        .map(|b| b.to_string())
        .collect();
    println!("{}", blocks.join("\n\n"));
    Ok(())
}

// ============================================================================
// Commands
// ============================================================================

fn run_ask(system: &AgentSystem, query: &str, history: Option<&Path>, json: bool) -> Result<()> {
    let history = match history {
        Some(path) => load_history(path)?,
        None => Vec::new(),
    };
    debug!(turns = history.len(), "Loaded history");

    let envelope = system.orchestrator.run(query, &history);
    print_envelope(&envelope, json)
}

fn run_chat(system: &AgentSystem) -> Result<()> {
    let stdin = io::stdin();
    let mut history: Vec<ChatTurn> = Vec::new();

    println!("Ask about stock data or the GPT-4 technical report. Type 'exit' to quit.");
    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let query = line.trim();
        if query.is_empty() {
            continue;
        }
        if matches!(query, "exit" | "quit") {
            break;
        }

        let envelope = system.orchestrator.run(query, &history);
        print_envelope(&envelope, false)?;
        println!();

        history.push(ChatTurn::user(query));
        history.push(ChatTurn::assistant(assistant_text(&envelope)));
        history = truncate_history(&history, MAX_HISTORY_TURNS).to_vec();
    }
    Ok(())
}

fn run_rag(system: &AgentSystem, question: &str, session: &str) -> Result<()> {
    let answer = system.rag.ask_in_session(session, question)?;
    println!("Answer:\n{}", answer);
    Ok(())
}

fn run_ingest(system: &AgentSystem, recreate: bool) -> Result<()> {
    let count = system.knowledge.load(recreate)?;
    if count == 0 {
        println!(
            "Collection '{}' already loaded (use --recreate to rebuild)",
            system.knowledge.collection()
        );
    } else {
        println!(
            "Loaded {} chunks into '{}'",
            count,
            system.knowledge.collection()
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_tracing(args.verbose);

    // Blank questions never reach the models
    match &args.command {
        Command::Ask { query, .. } if query.trim().is_empty() => {
            warn!("Empty query");
            println!("Please enter a question first.");
            return Ok(());
        }
        Command::Rag { question, .. } if question.trim().is_empty() => {
            println!("Please enter a question first.");
            return Ok(());
        }
        _ => {}
    }

    let config = RouterConfig::load(args.config.as_deref());
    let creds = Credentials::from_env();

    let session = match &args.command {
        Command::Rag { session, .. } => session.as_str(),
        _ => DEFAULT_SESSION_ID,
    };
    let system = AgentSystem::build(&config, &creds, session)?;

    match &args.command {
        Command::Ask {
            query,
            history,
            json,
        } => run_ask(&system, query.trim(), history.as_deref(), *json),
        Command::Chat => run_chat(&system),
        Command::Rag { question, session } => run_rag(&system, question.trim(), session),
        Command::Ingest { recreate } => run_ingest(&system, *recreate),
    }
}

// ============================================================================
// Tests
// ============================================================================
