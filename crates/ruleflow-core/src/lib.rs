//! A DAG workflow engine: rules declare file and table inputs/outputs in a
//! small definition language, get bound against a registry of callback
//! tools, and run through a concurrent scheduler that persists enough
//! provenance to skip re-running work whose inputs have not changed.
//!
//! The crate is organized around the data flow described by its design
//! document: a definition document is parsed and grammar-validated
//! ([`parser`]), bound against a [`binder::ToolRegistry`] into persisted
//! rows ([`binder`], [`persistence`]), assembled into a dependency graph
//! ([`dag`]), and run by a [`scheduler::Scheduler`] that consults
//! [`freshness`] before handing each rule to its tool through a
//! [`runtime::RuleHandle`].

pub mod binder;
pub mod dag;
pub mod engine;
pub mod error;
pub mod freshness;
pub mod model;
pub mod parser;
pub mod persistence;
pub mod runtime;
pub mod scheduler;

pub use binder::{BoundRule, RuleTool, ToolRegistry};
pub use dag::Dag;
pub use engine::{EngineConfig, RuleflowEngine};
pub use error::{RuleflowError, RuleflowResult};
pub use freshness::Freshness;
pub use parser::{parse_definition, ParsedDefinition};
pub use persistence::{Session, SessionFactory};
pub use runtime::RuleHandle;
pub use scheduler::{CancellationToken, Scheduler, SchedulerReport};
