//! Error types for the rule engine.
//!
//! One variant per error kind named in the specification (`§7`). Every
//! variant carries a short cause plus enough context (rule name, offending
//! key, file path) to make the failure actionable without a debugger.

use std::path::PathBuf;

use thiserror::Error;

/// Result type used throughout `ruleflow-core`.
pub type RuleflowResult<T> = Result<T, RuleflowError>;

/// The engine's error kinds.
///
/// The `Display` impl doubles as the "short cause"; the payload fields carry
/// the "longer context" the specification calls for.
#[derive(Error, Debug)]
pub enum RuleflowError {
    /// A declared file does not exist where expected.
    #[error("file not found: {path} (rule {rule_name:?})")]
    FileNotFound {
        path: PathBuf,
        rule_name: Option<String>,
    },

    /// The definition document does not match the workflow grammar.
    #[error("grammar violation in rule {rule_name:?}: {detail}")]
    GrammarViolation {
        rule_name: Option<String>,
        detail: String,
    },

    /// A mapping in the document contains a duplicate key at the same level.
    #[error("duplicate key {key:?} in document")]
    DuplicateKey { key: String },

    /// Two rules in the same definition share a name.
    #[error("duplicate rule name: {rule_name}")]
    DuplicateRule { rule_name: String },

    /// A rule's `tool` identifier does not resolve in the registry.
    #[error("tool not found: {tool_identifier} (rule {rule_name})")]
    ToolNotFound {
        rule_name: String,
        tool_identifier: String,
    },

    /// A registered tool does not satisfy the `RuleTool` contract.
    #[error("tool contract violation for {tool_identifier}: {detail}")]
    ToolContract {
        tool_identifier: String,
        detail: String,
    },

    /// Bound descriptors do not match what the tool declares (I2).
    #[error("content violation in rule {rule_name}: {detail}")]
    ContentViolation { rule_name: String, detail: String },

    /// A rule callback asked for an input/output/option/table it never declared.
    #[error("undeclared access in rule {rule_name}: {name}")]
    UndeclaredAccess { rule_name: String, name: String },

    /// The bound rule graph contains a cycle.
    #[error("cyclic workflow, cycle through: {}", cycle.join(" -> "))]
    CyclicWorkflow { cycle: Vec<String> },

    /// A rule's callback returned an error.
    #[error("execution failure in rule {rule_name}: {detail}")]
    ExecutionFailure { rule_name: String, detail: String },

    /// The persistence layer failed; this aborts the scheduler.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),
}

impl From<sqlx::Error> for RuleflowError {
    fn from(err: sqlx::Error) -> Self {
        RuleflowError::PersistenceFailure(err.to_string())
    }
}
