//! Optional TOML configuration (§6). Precedence is CLI flags, then
//! `RULEFLOW_*` environment variables (handled by clap's `env` feature),
//! then this file, then the engine's built-in defaults.

use std::path::{Path, PathBuf};

use ruleflow_core::RuleflowError;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    pub working_directory: Option<PathBuf>,
    pub database: Option<PathBuf>,
    pub worker_count: Option<usize>,
    pub dry_run: Option<bool>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, RuleflowError> {
        let text = std::fs::read_to_string(path).map_err(|_| RuleflowError::FileNotFound {
            path: path.to_path_buf(),
            rule_name: None,
        })?;
        toml::from_str(&text).map_err(|e| RuleflowError::GrammarViolation {
            rule_name: None,
            detail: format!("invalid configuration file: {e}"),
        })
    }
}
