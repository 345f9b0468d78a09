//! The top-level facade that wires the definition parser, binder, DAG
//! builder, and scheduler together into the single entry point a front end
//! calls (§2's data flow, end to end).

use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::binder::{self, ToolRegistry};
use crate::dag::Dag;
use crate::error::RuleflowResult;
use crate::parser::parse_definition;
use crate::persistence::SessionFactory;
use crate::scheduler::{CancellationToken, Scheduler, SchedulerReport};

/// Where the engine's persisted state and resolved paths live.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_path: PathBuf,
    pub working_directory: PathBuf,
    pub worker_count: usize,
    pub dry_run: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("ruleflow.db"),
            working_directory: PathBuf::from("."),
            worker_count: num_cpus::get().max(1),
            dry_run: false,
        }
    }
}

/// Runs a definition document end to end against a tool registry.
pub struct RuleflowEngine {
    config: EngineConfig,
    registry: ToolRegistry,
}

impl RuleflowEngine {
    pub fn new(config: EngineConfig, registry: ToolRegistry) -> Self {
        Self { config, registry }
    }

    /// Parse, bind, schedule, and run every rule in `definition_text`.
    pub async fn run(&self, definition_text: &str) -> RuleflowResult<SchedulerReport> {
        self.run_cancellable(definition_text, CancellationToken::new()).await
    }

    /// Same as [`Self::run`], but lets the caller hold a token that cancels
    /// the run in progress (e.g. wired to a Ctrl-C handler).
    pub async fn run_cancellable(
        &self,
        definition_text: &str,
        cancellation: CancellationToken,
    ) -> RuleflowResult<SchedulerReport> {
        let definition = parse_definition(definition_text)?;

        let sessions = SessionFactory::connect(&self.config.database_path).await?;
        let session = sessions.session().await?;
        let execution = session.create_execution(Utc::now()).await?;

        let bound = binder::bind_definition(
            &definition,
            execution.id,
            &self.config.working_directory,
            &self.registry,
            &sessions,
        )
        .await?;

        let dag = Dag::build(bound)?;
        let scheduler = Scheduler::new(dag, sessions, execution.id, self.config.worker_count, self.config.dry_run)
            .with_cancellation(cancellation);
        scheduler.run().await
    }

    /// Parse and bind only, returning the DAG's DOT rendering — used by the
    /// `dag --dot` front-end command without running anything.
    pub async fn dot(&self, definition_text: &str) -> RuleflowResult<String> {
        let definition = parse_definition(definition_text)?;

        let sessions = SessionFactory::connect_in_memory().await?;
        let session = sessions.session().await?;
        let execution = session.create_execution(Utc::now()).await?;

        let bound = binder::bind_definition(
            &definition,
            execution.id,
            &self.config.working_directory,
            &self.registry,
            &sessions,
        )
        .await?;

        let dag = Dag::build(bound)?;
        Ok(dag.to_dot())
    }
}

pub fn default_database_path(working_directory: &Path) -> PathBuf {
    working_directory.join(".ruleflow").join("ruleflow.db")
}
