//! The rule runtime facade (§4.6): the handle passed to a tool's `run`
//! callback.
//!
//! Every accessor is scoped to the names a rule actually declared in its
//! `input`/`output`/`params` blocks — reaching for anything else is an
//! [`RuleflowError::UndeclaredAccess`], never a panic, since a tool
//! implementation is untrusted third-party code as far as the engine is
//! concerned.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{RuleflowError, RuleflowResult};
use crate::model::{FileDescriptor, OptionRow, TableDescriptor};
use crate::persistence::Session;

pub struct RuleHandle {
    rule_name: String,
    input_files: HashMap<String, FileDescriptor>,
    output_files: HashMap<String, FileDescriptor>,
    input_tables: HashMap<String, TableDescriptor>,
    output_tables: HashMap<String, TableDescriptor>,
    options: HashMap<String, String>,
    session: Session,
}

impl RuleHandle {
    pub fn new(
        rule_name: String,
        input_files: Vec<FileDescriptor>,
        output_files: Vec<FileDescriptor>,
        input_tables: Vec<TableDescriptor>,
        output_tables: Vec<TableDescriptor>,
        options: Vec<OptionRow>,
        session: Session,
    ) -> Self {
        Self {
            rule_name,
            input_files: index_by(input_files, |d| d.name.clone()),
            output_files: index_by(output_files, |d| d.name.clone()),
            input_tables: index_by(input_tables, |d| d.logical_name.clone()),
            output_tables: index_by(output_tables, |d| d.logical_name.clone()),
            options: options.into_iter().map(|o| (o.name, o.value)).collect(),
            session,
        }
    }

    pub fn rule_name(&self) -> &str {
        &self.rule_name
    }

    pub fn input_file(&self, name: &str) -> RuleflowResult<&Path> {
        self.input_files
            .get(name)
            .map(|d| d.path.as_path())
            .ok_or_else(|| self.undeclared(name))
    }

    pub fn output_file(&self, name: &str) -> RuleflowResult<&Path> {
        self.output_files
            .get(name)
            .map(|d| d.path.as_path())
            .ok_or_else(|| self.undeclared(name))
    }

    pub fn input_table(&self, name: &str) -> RuleflowResult<&TableDescriptor> {
        self.input_tables.get(name).ok_or_else(|| self.undeclared(name))
    }

    pub fn output_table(&self, name: &str) -> RuleflowResult<&TableDescriptor> {
        self.output_tables.get(name).ok_or_else(|| self.undeclared(name))
    }

    pub fn option_str(&self, name: &str) -> RuleflowResult<&str> {
        self.options
            .get(name)
            .map(|s| s.as_str())
            .ok_or_else(|| self.undeclared(name))
    }

    pub fn option_int(&self, name: &str) -> RuleflowResult<i64> {
        self.option_str(name)?
            .parse()
            .map_err(|_| self.not_a(name, "an integer"))
    }

    pub fn option_float(&self, name: &str) -> RuleflowResult<f64> {
        self.option_str(name)?
            .parse()
            .map_err(|_| self.not_a(name, "a float"))
    }

    pub fn option_bool(&self, name: &str) -> RuleflowResult<bool> {
        match self.option_str(name)? {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(self.not_a(name, "a boolean")),
        }
    }

    /// The persistence session bound to this rule's run — used by tools
    /// that write rows directly rather than files (§4.7).
    pub fn session(&self) -> &Session {
        &self.session
    }

    fn undeclared(&self, name: &str) -> RuleflowError {
        RuleflowError::UndeclaredAccess {
            rule_name: self.rule_name.clone(),
            name: name.to_string(),
        }
    }

    fn not_a(&self, name: &str, kind: &str) -> RuleflowError {
        RuleflowError::ContentViolation {
            rule_name: self.rule_name.clone(),
            detail: format!("option '{name}' is not {kind}"),
        }
    }
}

fn index_by<T>(items: Vec<T>, key: impl Fn(&T) -> String) -> HashMap<String, T> {
    items.into_iter().map(|item| (key(&item), item)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;
    use std::path::PathBuf;

    fn session() -> Session {
        // Constructing a real Session requires an async pool; these tests
        // only exercise name-scoping logic, so build one via a blocking
        // connect to an in-memory database.
        tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(async {
                crate::persistence::SessionFactory::connect_in_memory()
                    .await
                    .unwrap()
                    .session()
                    .await
                    .unwrap()
            })
    }

    fn file(name: &str, path: &str, role: Role) -> FileDescriptor {
        FileDescriptor {
            id: 1,
            rule_id: 1,
            name: name.to_string(),
            path: PathBuf::from(path),
            role,
            mtime_epoch_millis: None,
            size: None,
            used_at: None,
        }
    }

    #[test]
    fn exposes_declared_names_and_rejects_others() {
        let handle = RuleHandle::new(
            "r".to_string(),
            vec![file("corpus", "data/c.txt", Role::Input)],
            vec![],
            vec![],
            vec![],
            vec![OptionRow { id: 1, rule_id: 1, name: "min_length".to_string(), value: "3".to_string() }],
            session(),
        );

        assert_eq!(handle.input_file("corpus").unwrap(), Path::new("data/c.txt"));
        assert_eq!(handle.option_int("min_length").unwrap(), 3);
        assert!(matches!(handle.input_file("nope"), Err(RuleflowError::UndeclaredAccess { .. })));
        assert!(matches!(handle.option_str("nope"), Err(RuleflowError::UndeclaredAccess { .. })));
    }
}
