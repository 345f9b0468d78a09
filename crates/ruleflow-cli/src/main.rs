//! Command-line front end for the workflow engine: loads a definition
//! document and optional configuration, wires up the built-in demo tool
//! registry, and drives the engine to completion (§6).

mod config;
mod tools;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use ruleflow_core::{EngineConfig, RuleflowEngine, RuleflowError, SchedulerReport};
use tracing_subscriber::EnvFilter;

use config::Config;

#[derive(Parser)]
#[command(name = "ruleflow", version, about = "DAG workflow engine with provenance-based freshness")]
struct Cli {
    /// Path to the definition document.
    #[arg(long, short = 'd')]
    definition: PathBuf,

    /// Optional TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Working directory relative file paths resolve against.
    #[arg(long, env = "RULEFLOW_WORKING_DIRECTORY")]
    working_directory: Option<PathBuf>,

    /// Path to the SQLite database file.
    #[arg(long, env = "RULEFLOW_DATABASE")]
    database: Option<PathBuf>,

    /// Number of rules allowed to run concurrently.
    #[arg(long, env = "RULEFLOW_WORKERS")]
    workers: Option<usize>,

    /// Evaluate freshness and report what would run, without running it.
    #[arg(long, env = "RULEFLOW_DRY_RUN")]
    dry_run: bool,

    /// Print the run report as JSON instead of plain text.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the workflow (the default when no subcommand is given).
    Run,
    /// Print the bound workflow's dependency graph as Graphviz DOT.
    Dag,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %err, "ruleflow failed");
            eprintln!("error: {err}");
            exit_code_for(&err)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, RuleflowError> {
    let file_config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let working_directory = cli
        .working_directory
        .or(file_config.working_directory)
        .unwrap_or_else(|| PathBuf::from("."));
    let database_path = cli
        .database
        .or(file_config.database)
        .unwrap_or_else(|| ruleflow_core::engine::default_database_path(&working_directory));
    let worker_count = cli
        .workers
        .or(file_config.worker_count)
        .unwrap_or_else(|| num_cpus::get().max(1));
    let dry_run = cli.dry_run || file_config.dry_run.unwrap_or(false);
    let json = cli.json;

    let definition_text = std::fs::read_to_string(&cli.definition).map_err(|_| RuleflowError::FileNotFound {
        path: cli.definition.clone(),
        rule_name: None,
    })?;

    let engine_config = EngineConfig {
        database_path,
        working_directory,
        worker_count,
        dry_run,
    };
    let engine = RuleflowEngine::new(engine_config, tools::demo_registry());

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let cancellation = ruleflow_core::CancellationToken::new();
            let ctrl_c_token = cancellation.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("received interrupt, cancelling scheduler");
                    ctrl_c_token.cancel();
                }
            });

            let report = engine.run_cancellable(&definition_text, cancellation).await?;
            if json {
                print_report_json(&report);
            } else {
                print_report(&report);
            }
            Ok(match report.status {
                Some(ruleflow_core::model::ExecutionStatus::Done) => ExitCode::from(0),
                Some(ruleflow_core::model::ExecutionStatus::Cancelled) => ExitCode::from(10),
                _ => ExitCode::from(1),
            })
        }
        Command::Dag => {
            let dot = engine.dot(&definition_text).await?;
            println!("{dot}");
            Ok(ExitCode::from(0))
        }
    }
}

/// Same report the plain-text printer shows, serialized for scripts and
/// CI consumers that want to parse it rather than scrape stdout.
fn print_report_json(report: &SchedulerReport) {
    match serde_json::to_string_pretty(report) {
        Ok(json) => println!("{json}"),
        Err(err) => eprintln!("error: failed to serialize report: {err}"),
    }
}

fn print_report(report: &SchedulerReport) {
    for name in &report.executed {
        println!("EXECUTED           {name}");
    }
    for name in &report.already_satisfied {
        println!("ALREADY_SATISFIED  {name}");
    }
    for name in &report.failed {
        println!("FAILED             {name}");
    }
    for name in &report.not_planned {
        println!("NOT_PLANNED        {name}");
    }
}

/// Distinct exit codes per error kind (§6).
fn exit_code_for(err: &RuleflowError) -> ExitCode {
    use RuleflowError::*;
    let code: u8 = match err {
        FileNotFound { .. } => 2,
        GrammarViolation { .. } | DuplicateKey { .. } | DuplicateRule { .. } => 3,
        ToolNotFound { .. } | ToolContract { .. } => 4,
        ContentViolation { .. } => 5,
        UndeclaredAccess { .. } => 6,
        CyclicWorkflow { .. } => 7,
        ExecutionFailure { .. } => 8,
        PersistenceFailure(_) => 9,
    };
    ExitCode::from(code)
}
