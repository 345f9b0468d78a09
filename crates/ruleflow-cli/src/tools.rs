//! A small built-in tool registry so the binary is runnable end to end
//! without any external plugin crate.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use ruleflow_core::{RuleHandle, RuleTool, RuleflowError, RuleflowResult, ToolRegistry};

/// Counts words at least `min_length` characters long (default 1) in a
/// text file, writing `word\tcount` lines sorted by word.
struct WordCount;

#[async_trait]
impl RuleTool for WordCount {
    fn declared_input_files(&self) -> &[&str] {
        &["corpus"]
    }
    fn declared_output_files(&self) -> &[&str] {
        &["counts"]
    }
    fn declared_params(&self) -> &[(&str, &str)] {
        &[("min_length", "int")]
    }

    async fn run(&self, handle: &RuleHandle) -> RuleflowResult<()> {
        let corpus_path = handle.input_file("corpus")?.to_path_buf();
        let counts_path = handle.output_file("counts")?.to_path_buf();
        let min_length = handle.option_int("min_length").unwrap_or(1);

        let text = std::fs::read_to_string(&corpus_path).map_err(|e| RuleflowError::ExecutionFailure {
            rule_name: handle.rule_name().to_string(),
            detail: format!("reading {}: {e}", corpus_path.display()),
        })?;

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for word in text.split_whitespace() {
            let normalized: String = word.chars().filter(|c| c.is_alphanumeric()).collect::<String>().to_lowercase();
            if !normalized.is_empty() && normalized.len() as i64 >= min_length {
                *counts.entry(normalized).or_insert(0) += 1;
            }
        }

        let mut out = String::new();
        for (word, count) in &counts {
            out.push_str(&format!("{word}\t{count}\n"));
        }

        write_with_parents(&counts_path, &out, handle)
    }
}

/// Copies one file to another, creating the destination's parent
/// directory if needed.
struct CopyFile;

#[async_trait]
impl RuleTool for CopyFile {
    fn declared_input_files(&self) -> &[&str] {
        &["source"]
    }
    fn declared_output_files(&self) -> &[&str] {
        &["destination"]
    }

    async fn run(&self, handle: &RuleHandle) -> RuleflowResult<()> {
        let source = handle.input_file("source")?.to_path_buf();
        let destination = handle.output_file("destination")?.to_path_buf();

        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RuleflowError::ExecutionFailure {
                rule_name: handle.rule_name().to_string(),
                detail: format!("creating {}: {e}", parent.display()),
            })?;
        }
        std::fs::copy(&source, &destination).map_err(|e| RuleflowError::ExecutionFailure {
            rule_name: handle.rule_name().to_string(),
            detail: format!("copying {} to {}: {e}", source.display(), destination.display()),
        })?;
        Ok(())
    }
}

fn write_with_parents(path: &std::path::Path, contents: &str, handle: &RuleHandle) -> RuleflowResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| RuleflowError::ExecutionFailure {
            rule_name: handle.rule_name().to_string(),
            detail: format!("creating {}: {e}", parent.display()),
        })?;
    }
    std::fs::write(path, contents).map_err(|e| RuleflowError::ExecutionFailure {
        rule_name: handle.rule_name().to_string(),
        detail: format!("writing {}: {e}", path.display()),
    })
}

pub fn demo_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register("demo.word_count", Arc::new(WordCount) as Arc<dyn RuleTool>);
    registry.register("demo.copy_file", Arc::new(CopyFile) as Arc<dyn RuleTool>);
    registry
}
