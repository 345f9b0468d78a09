//! The entities of §3: executions, rules, descriptors, options, and the
//! table-modification freshness ledger.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The two roles a file/table descriptor can hold (I3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Input,
    Output,
}

impl Role {
    pub fn as_db_str(self) -> &'static str {
        match self {
            Role::Input => "input",
            Role::Output => "output",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "input" => Some(Role::Input),
            "output" => Some(Role::Output),
            _ => None,
        }
    }
}

/// Status of the scheduler as a whole (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Init,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            ExecutionStatus::Init => "INIT",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Done => "DONE",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Cancelled => "CANCELLED",
        }
    }
}

/// One workflow invocation (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
}

/// Persisted status of a single rule; progresses only forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleStatus {
    NotExecuted,
    AlreadyExecuted,
    Executed,
    ExecutionError,
    NotPlanned,
}

impl RuleStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            RuleStatus::NotExecuted => "NOT_EXECUTED",
            RuleStatus::AlreadyExecuted => "ALREADY_EXECUTED",
            RuleStatus::Executed => "EXECUTED",
            RuleStatus::ExecutionError => "EXECUTION_ERROR",
            RuleStatus::NotPlanned => "NOT_PLANNED",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        Some(match s {
            "NOT_EXECUTED" => RuleStatus::NotExecuted,
            "ALREADY_EXECUTED" => RuleStatus::AlreadyExecuted,
            "EXECUTED" => RuleStatus::Executed,
            "EXECUTION_ERROR" => RuleStatus::ExecutionError,
            "NOT_PLANNED" => RuleStatus::NotPlanned,
            _ => return None,
        })
    }
}

/// One node in the workflow (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: i64,
    pub execution_id: i64,
    pub rule_name: String,
    pub tool_identifier: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub status: RuleStatus,
}

/// A named file bound to a rule (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub id: i64,
    pub rule_id: i64,
    pub name: String,
    pub path: PathBuf,
    pub role: Role,
    pub mtime_epoch_millis: Option<i64>,
    pub size: Option<i64>,
    pub used_at: Option<i64>,
}

/// A named table bound to a rule (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub id: i64,
    pub rule_id: i64,
    pub logical_name: String,
    pub physical_tablename: String,
    pub model_identifier: String,
    pub role: Role,
    pub used_at: Option<i64>,
}

/// Per physical table, the timestamp its last writer committed at (§3).
///
/// Shared across rules and executions; the system's global freshness ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableModification {
    pub physical_tablename: String,
    pub modified_at: i64,
}

/// A (name, value) pair bound to a rule (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionRow {
    pub id: i64,
    pub rule_id: i64,
    pub name: String,
    pub value: String,
}
