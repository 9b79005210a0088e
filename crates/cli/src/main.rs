mod config;
mod console;
mod error;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use history::{ExecutionStep, StepStore};
use runtime::{
    AnthropicBackend, AutoOperator, EventKind, Operator, Orchestrator, ProviderSupervisor,
    Request, SessionEvent, ToolRegistry,
};
use tracing_subscriber::EnvFilter;

use config::Config;
use console::{ConsoleOperator, Terminal};
use error::{Error, Result};

const DB_FILE: &str = "runs.db";
const READY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "harbor")]
#[command(about = "Drive tool providers with a language model, one confirmed step at a time", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "harbor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a query using the configured tool providers
    Run {
        query: String,
        /// Background fact for the model (repeatable)
        #[arg(short, long = "fact")]
        facts: Vec<String>,
        /// Confirm every step without asking
        #[arg(short, long)]
        yes: bool,
        /// Audit database path (defaults to the data directory)
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Start the providers and list their tools
    Tools,
    /// List recorded runs
    Runs {
        /// Show only the last N runs
        #[arg(short, long, default_value = "10")]
        limit: usize,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Show the steps of a recorded run
    Steps {
        /// Session ID (prefix match supported)
        #[arg(short, long)]
        session: String,
        /// Filter by step type (proposal, tool_result, error, ...)
        #[arg(short, long)]
        kind: Option<String>,
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            query,
            facts,
            yes,
            db,
        } => cmd_run(&cli.config, query, facts, yes, db).await,
        Commands::Tools => cmd_tools(&cli.config).await,
        Commands::Runs { limit, db } => cmd_runs(db, limit),
        Commands::Steps { session, kind, db } => cmd_steps(db, &session, kind.as_deref()),
    }
}

/// Load the config file, or defaults when the default path is absent.
fn load_config(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        Config::load(path)?
    } else {
        Config::default()
    };
    if config.providers.is_empty() {
        return Err(Error::NoProviders {
            path: path.to_path_buf(),
        });
    }
    Ok(config)
}

async fn cmd_run(
    config_path: &Path,
    query: String,
    facts: Vec<String>,
    yes: bool,
    db: Option<PathBuf>,
) -> Result<()> {
    let config = load_config(config_path)?;
    let api_key = config.api_key().ok_or(Error::MissingApiKey)?;
    let backend = AnthropicBackend::builder(api_key, &config.backend.model)
        .max_tokens(config.backend.max_tokens)
        .build();

    let db_path = match db {
        Some(path) => path,
        None => {
            let dir = dirs_data_dir().unwrap_or_else(|| ".harbor".into());
            std::fs::create_dir_all(&dir)?;
            dir.join(DB_FILE)
        }
    };
    let store = StepStore::open(&db_path)?;
    println!("Run stored at: {}", db_path.display());

    let request = facts
        .into_iter()
        .fold(Request::new(query), |request, fact| request.fact(fact))
        .store(store);

    let terminal = Terminal::default();
    if yes {
        execute(&config, backend, AutoOperator, request, &terminal).await
    } else {
        let operator = ConsoleOperator::new(terminal.clone());
        execute(&config, backend, operator, request, &terminal).await
    }
}

async fn execute<O>(
    config: &Config,
    backend: AnthropicBackend,
    operator: O,
    request: Request,
    terminal: &Terminal,
) -> Result<()>
where
    O: Operator + 'static,
{
    let orchestrator = Orchestrator::new(
        config.providers.clone(),
        backend,
        operator,
        config.orchestrator(),
    )?;
    orchestrator.start()?;

    let result = drive(&orchestrator, request, terminal).await;
    orchestrator.shutdown().await;
    result
}

async fn drive<O>(
    orchestrator: &Orchestrator<AnthropicBackend, O>,
    request: Request,
    terminal: &Terminal,
) -> Result<()>
where
    O: Operator + 'static,
{
    orchestrator.wait_until_ready(READY_TIMEOUT).await?;
    for provider in orchestrator.status() {
        println!(
            "Provider {}: {} ({} tools)",
            provider.name,
            provider.lifecycle.as_str(),
            provider.tools
        );
    }
    for conflict in orchestrator.registry().conflicts() {
        eprintln!("warning: {conflict}");
    }

    let session = orchestrator.submit(request)?;
    println!("Session ID: {session}\n");

    let mut events = orchestrator.broker().drain(session)?;
    let mut last = None;
    while let Some(event) = events.recv().await {
        // Events raised while a prompt is open print once it closes.
        let _out = terminal.hold().await;
        print_session_event(&event);
        last = Some(event);
    }

    match last {
        Some(event) if event.kind == EventKind::Error => Err(Error::RunFailed(event.content)),
        _ => Ok(()),
    }
}

fn print_session_event(event: &SessionEvent) {
    let time = Local
        .from_utc_datetime(&event.timestamp.naive_utc())
        .format("%H:%M:%S");
    match event.kind {
        EventKind::Update => println!("[{time}] {}", event.content),
        EventKind::Error => println!("[{time}] ERROR: {}", event.content),
        EventKind::Final => {
            println!("\n=== Result ===\n{}", event.content);
            if let Some(summary) = event
                .data
                .as_ref()
                .and_then(|data| data.get("summary"))
                .and_then(|summary| summary.as_str())
            {
                println!("\n{summary}");
            }
        }
    }
}

async fn cmd_tools(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let settings = config.orchestrator().supervisor;
    let registry = ToolRegistry::new();

    let supervisors: Vec<Arc<ProviderSupervisor>> = config
        .providers
        .iter()
        .cloned()
        .map(|provider| Arc::new(ProviderSupervisor::new(provider, settings.clone())))
        .collect();
    for supervisor in &supervisors {
        supervisor.start()?;
    }

    println!("{:<20}  {:<10}  {:<6}  ERROR", "PROVIDER", "STATE", "TOOLS");
    println!("{}", "-".repeat(60));
    for supervisor in &supervisors {
        let ready = supervisor.wait_until_ready(READY_TIMEOUT).await;
        let status = supervisor.status();
        if ready.is_ok() {
            // A conflict is recorded by the registry and reported below.
            let _ = registry.register(supervisor.name(), status.tools.clone());
        }
        println!(
            "{:<20}  {:<10}  {:<6}  {}",
            supervisor.name(),
            status.lifecycle.as_str(),
            status.tools.len(),
            status.last_error.as_deref().unwrap_or("-"),
        );
    }

    println!("\n{}", registry.describe_all());
    for conflict in registry.conflicts() {
        println!("conflict: {conflict}");
    }

    for supervisor in &supervisors {
        supervisor.stop().await;
    }
    Ok(())
}

fn cmd_runs(db: Option<PathBuf>, limit: usize) -> Result<()> {
    let store = open_store(db)?;
    let runs = store.list_runs()?;

    if runs.is_empty() {
        println!("No runs found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<16}  {:<5}  {:<9}  QUERY",
        "SESSION ID", "STARTED", "STEPS", "OUTCOME"
    );
    println!("{}", "-".repeat(100));

    for run in runs.into_iter().take(limit) {
        let started = Local
            .from_utc_datetime(&run.started_at.naive_utc())
            .format("%Y-%m-%d %H:%M");
        let outcome = run.outcome.map_or("running", |outcome| outcome.as_str());
        println!(
            "{:<36}  {:<16}  {:<5}  {:<9}  {}",
            run.id,
            started,
            run.step_count,
            outcome,
            truncate(&run.query, 40)
        );
    }

    Ok(())
}

fn cmd_steps(db: Option<PathBuf>, session_prefix: &str, step_type: Option<&str>) -> Result<()> {
    let store = open_store(db)?;

    let runs = store.list_runs()?;
    let matching: Vec<_> = runs
        .iter()
        .filter(|run| run.id.to_string().starts_with(session_prefix))
        .collect();

    let run = match matching.as_slice() {
        [] => {
            return Err(Error::SessionNotFound {
                prefix: session_prefix.to_string(),
            });
        }
        [run] => *run,
        _ => {
            return Err(Error::AmbiguousSession {
                prefix: session_prefix.to_string(),
                matches: matching.iter().map(|run| run.id.to_string()).collect(),
            });
        }
    };

    let steps = store.load_steps(run.id, step_type)?;
    println!("Session: {}\nQuery: {}\n", run.id, run.query);

    if steps.is_empty() {
        println!("No steps recorded.");
        return Ok(());
    }
    for step in &steps {
        print_step(step);
    }
    Ok(())
}

fn print_step(step: &ExecutionStep) {
    let time = Local
        .from_utc_datetime(&step.timestamp.naive_utc())
        .format("%H:%M:%S");
    println!(
        "[{time}] #{:<3} {:<18} {}",
        step.step_number,
        step.payload.step_type(),
        truncate(&step.payload.render(), 200)
    );
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}

fn open_store(db: Option<PathBuf>) -> Result<StepStore> {
    let db_path = db.unwrap_or_else(|| {
        dirs_data_dir()
            .unwrap_or_else(|| ".harbor".into())
            .join(DB_FILE)
    });

    if !db_path.exists() {
        return Err(Error::DatabaseNotFound { path: db_path });
    }

    Ok(StepStore::open(&db_path)?)
}

fn dirs_data_dir() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share/harbor"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))
            .map(|p| p.join("harbor"))
    }
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|h| PathBuf::from(h).join("harbor"))
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_on_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééééé", 2), "éé...");
    }

    #[test]
    fn cli_parses_run_with_facts() {
        let cli = Cli::try_parse_from([
            "harbor", "run", "add 1 and 2", "--fact", "a", "-f", "b", "--yes",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("harbor.toml"));
        match cli.command {
            Commands::Run {
                query, facts, yes, ..
            } => {
                assert_eq!(query, "add 1 and 2");
                assert_eq!(facts, ["a", "b"]);
                assert!(yes);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn missing_config_means_no_providers() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(&dir.path().join("harbor.toml")).unwrap_err();
        assert!(matches!(err, Error::NoProviders { .. }));
    }
}
