//! The rule binder (§4.2): turns a grammar-valid [`ParsedDefinition`] into
//! persisted rule rows, descriptors, and options, resolving relative file
//! paths against a working directory and checking each tool's declared
//! contract before any rule is allowed to run (I2).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{RuleflowError, RuleflowResult};
use crate::model::{FileDescriptor, OptionRow, Role, Rule, TableDescriptor};
use crate::parser::{IoSpec, ParsedDefinition, RuleSpec};
use crate::persistence::{Session, SessionFactory};
use crate::runtime::RuleHandle;

/// The per-rule callback contract (§6).
///
/// A tool declares the exact file/table names it will access; the binder
/// checks the rule entry's bound names against that declaration before the
/// rule is ever scheduled, and the match is exact in both directions (I2):
/// a tool declaring nothing for a block requires the document bind nothing
/// there either, the same as a tool naming `{"corpus"}` requires exactly
/// `{"corpus"}`, no more and no fewer.
#[async_trait]
pub trait RuleTool: Send + Sync {
    fn declared_input_files(&self) -> &[&str] {
        &[]
    }
    fn declared_output_files(&self) -> &[&str] {
        &[]
    }
    fn declared_input_tables(&self) -> &[&str] {
        &[]
    }
    fn declared_output_tables(&self) -> &[&str] {
        &[]
    }

    /// Declared option names with a pipe-joined type spec drawn from
    /// `{required, int, float, bool, str}` (§6), e.g. `("min_length",
    /// "required|int")`. Exact match applies here too: a tool declaring no
    /// params requires an empty `params:` block.
    fn declared_params(&self) -> &[(&str, &str)] {
        &[]
    }

    /// Run the rule body against its bound handle.
    async fn run(&self, handle: &RuleHandle) -> RuleflowResult<()>;
}

/// Maps a rule's `tool:` identifier to a [`RuleTool`] implementation.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn RuleTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, identifier: impl Into<String>, tool: Arc<dyn RuleTool>) -> &mut Self {
        self.tools.insert(identifier.into(), tool);
        self
    }

    pub fn get(&self, identifier: &str) -> Option<Arc<dyn RuleTool>> {
        self.tools.get(identifier).cloned()
    }
}

/// A rule bound into the running workflow: its persisted row, resolved
/// descriptors, options, and the tool that will run it.
#[derive(Clone)]
pub struct BoundRule {
    pub rule: Rule,
    pub tool: Arc<dyn RuleTool>,
    pub input_files: Vec<FileDescriptor>,
    pub output_files: Vec<FileDescriptor>,
    pub input_tables: Vec<TableDescriptor>,
    pub output_tables: Vec<TableDescriptor>,
    pub options: Vec<OptionRow>,
}

impl BoundRule {
    /// File paths (input and output) this rule declares, in declaration
    /// order — used by the DAG builder to find producer/consumer edges.
    pub fn all_file_paths(&self) -> impl Iterator<Item = (&PathBuf, Role)> {
        self.input_files
            .iter()
            .map(|d| (&d.path, Role::Input))
            .chain(self.output_files.iter().map(|d| (&d.path, Role::Output)))
    }

    /// Table model identifiers this rule declares, with role.
    pub fn all_table_models(&self) -> impl Iterator<Item = (&str, Role)> {
        self.input_tables
            .iter()
            .map(|d| (d.model_identifier.as_str(), Role::Input))
            .chain(self.output_tables.iter().map(|d| (d.model_identifier.as_str(), Role::Output)))
    }
}

/// Bind every rule of a grammar-valid definition, in one transaction-backed
/// pass (§4.2's closing paragraph: a failure at any rule leaves no partial
/// rows in the persisted graph).
pub async fn bind_definition(
    definition: &ParsedDefinition,
    execution_id: i64,
    working_directory: &Path,
    registry: &ToolRegistry,
    sessions: &SessionFactory,
) -> RuleflowResult<Vec<BoundRule>> {
    let session = sessions.session().await?;
    session.execute("BEGIN").await?;

    match bind_all(definition, execution_id, working_directory, registry, &session).await {
        Ok(bound) => {
            session.execute("COMMIT").await?;
            Ok(bound)
        }
        Err(err) => {
            // Best-effort: the binder is already reporting `err`, so a
            // rollback failure must not mask it.
            let _ = session.execute("ROLLBACK").await;
            Err(err)
        }
    }
}

async fn bind_all(
    definition: &ParsedDefinition,
    execution_id: i64,
    working_directory: &Path,
    registry: &ToolRegistry,
    session: &Session,
) -> RuleflowResult<Vec<BoundRule>> {
    let mut bound = Vec::with_capacity(definition.rules.len());

    for spec in &definition.rules {
        let tool = registry.get(&spec.tool).ok_or_else(|| RuleflowError::ToolNotFound {
            rule_name: spec.rule_name.clone(),
            tool_identifier: spec.tool.clone(),
        })?;

        check_contract(spec, tool.as_ref())?;

        let rule = session.insert_rule(execution_id, &spec.rule_name, &spec.tool).await?;

        let input_files = bind_files(session, &rule, &spec.input, Role::Input, working_directory).await?;
        let output_files = bind_files(session, &rule, &spec.output, Role::Output, working_directory).await?;
        let input_tables = bind_tables(session, &rule, &spec.input, Role::Input).await?;
        let output_tables = bind_tables(session, &rule, &spec.output, Role::Output).await?;

        let mut options = Vec::with_capacity(spec.params.len());
        for (name, value) in &spec.params {
            options.push(session.insert_option(rule.id, name, value).await?);
        }

        bound.push(BoundRule {
            rule,
            tool,
            input_files,
            output_files,
            input_tables,
            output_tables,
            options,
        });
    }

    Ok(bound)
}

/// Checks a rule's bound names against its tool's declared contract (I2).
/// The match is exact: a tool that declares no names for a block accepts
/// none bound there either, the same as a tool that declares some names
/// only accepts exactly those.
fn check_contract(spec: &RuleSpec, tool: &dyn RuleTool) -> RuleflowResult<()> {
    check_names(spec, "input.files", &spec.input.files, tool.declared_input_files())?;
    check_names(spec, "output.files", &spec.output.files, tool.declared_output_files())?;
    check_names(spec, "input.tables", &spec.input.tables, tool.declared_input_tables())?;
    check_names(spec, "output.tables", &spec.output.tables, tool.declared_output_tables())?;
    check_params(spec, tool.declared_params())?;
    Ok(())
}

/// Validates `params:` against a tool's declared option spec (I2): unknown
/// option names are rejected, required options must be present, and a
/// present option's value must parse as the type its spec names. A tool
/// declaring no params at all accepts none — the document's `params:`
/// block must then be empty too, the same exact-match rule I2 applies when
/// the tool does declare names.
fn check_params(spec: &RuleSpec, declared: &[(&str, &str)]) -> RuleflowResult<()> {
    for (name, value) in &spec.params {
        let type_spec = declared
            .iter()
            .find(|(opt_name, _)| opt_name == name)
            .map(|(_, spec)| *spec)
            .ok_or_else(|| RuleflowError::ContentViolation {
                rule_name: spec.rule_name.clone(),
                detail: format!(
                    "params names '{}', but its tool only declares {:?}",
                    name,
                    declared.iter().map(|(n, _)| *n).collect::<Vec<_>>()
                ),
            })?;
        check_option_type(spec, name, value, type_spec)?;
    }

    for (name, type_spec) in declared {
        let required = type_spec.split('|').any(|part| part.eq_ignore_ascii_case("required"));
        if required && !spec.params.iter().any(|(n, _)| n == name) {
            return Err(RuleflowError::ContentViolation {
                rule_name: spec.rule_name.clone(),
                detail: format!("option '{name}' has not been provided but it is required"),
            });
        }
    }

    Ok(())
}

fn check_option_type(spec: &RuleSpec, name: &str, value: &str, type_spec: &str) -> RuleflowResult<()> {
    for part in type_spec.split('|') {
        let matches = match part.to_ascii_lowercase().as_str() {
            "required" => true,
            "int" => value.parse::<i64>().is_ok(),
            "float" => value.parse::<f64>().is_ok(),
            "bool" => matches!(value, "true" | "false" | "1" | "0"),
            "str" => true,
            other => {
                return Err(RuleflowError::ToolContract {
                    tool_identifier: spec.tool.clone(),
                    detail: format!("unknown option type '{other}' declared for '{name}'"),
                })
            }
        };
        if !matches {
            return Err(RuleflowError::ContentViolation {
                rule_name: spec.rule_name.clone(),
                detail: format!("option '{name}' value '{value}' does not satisfy type '{part}'"),
            });
        }
    }
    Ok(())
}

/// Exact-match check (I2): every name `bound` declares must be in
/// `declared`, and every name `declared` lists must be in `bound` — a tool
/// declaring an empty set for a block requires the document bind nothing
/// there either.
fn check_names(
    spec: &RuleSpec,
    which: &str,
    bound: &[(String, String)],
    declared: &[&str],
) -> RuleflowResult<()> {
    for (name, _) in bound {
        if !declared.contains(&name.as_str()) {
            return Err(RuleflowError::ContentViolation {
                rule_name: spec.rule_name.clone(),
                detail: format!(
                    "{} names '{}', but its tool only declares {:?}",
                    which, name, declared
                ),
            });
        }
    }
    for want in declared {
        if !bound.iter().any(|(name, _)| name == want) {
            return Err(RuleflowError::ContentViolation {
                rule_name: spec.rule_name.clone(),
                detail: format!("{} is missing required name '{}'", which, want),
            });
        }
    }
    Ok(())
}

async fn bind_files(
    session: &Session,
    rule: &Rule,
    io: &IoSpec,
    role: Role,
    working_directory: &Path,
) -> RuleflowResult<Vec<FileDescriptor>> {
    let mut out = Vec::with_capacity(io.files.len());
    for (name, rel_path) in &io.files {
        let resolved = resolve_path(working_directory, rel_path);
        out.push(session.insert_file_descriptor(rule.id, name, &resolved, role).await?);
    }
    Ok(out)
}

fn resolve_path(working_directory: &Path, raw: &str) -> PathBuf {
    let candidate = Path::new(raw);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        working_directory.join(candidate)
    }
}

async fn bind_tables(
    session: &Session,
    rule: &Rule,
    io: &IoSpec,
    role: Role,
) -> RuleflowResult<Vec<TableDescriptor>> {
    let mut out = Vec::with_capacity(io.tables.len());
    for (logical_name, model_identifier) in &io.tables {
        // No synthetic per-rule table names: the physical table is the
        // model identifier itself, so two rules naming the same model
        // share one freshness-ledger row (I4).
        let physical_tablename = model_identifier.clone();

        // Get-or-create discipline (§4.2 bullet 3): every physical table a
        // descriptor references gets exactly one ledger row, created here
        // if absent so the freshness evaluator never has to distinguish
        // "never bound" from "bound but not yet written".
        session
            .get_or_create_table_modification(&physical_tablename, chrono::Utc::now().timestamp_millis())
            .await?;

        out.push(
            session
                .insert_table_descriptor(rule.id, logical_name, &physical_tablename, model_identifier, role)
                .await?,
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_definition;

    struct EchoTool;

    #[async_trait]
    impl RuleTool for EchoTool {
        fn declared_input_files(&self) -> &[&str] {
            &["corpus"]
        }
        fn declared_output_files(&self) -> &[&str] {
            &["counts"]
        }
        async fn run(&self, _handle: &RuleHandle) -> RuleflowResult<()> {
            Ok(())
        }
    }

    /// Declares nothing at all — under I2's exact-match rule this accepts
    /// a rule binding nothing, not a rule binding anything it likes.
    struct NothingDeclaredTool;

    #[async_trait]
    impl RuleTool for NothingDeclaredTool {
        async fn run(&self, _handle: &RuleHandle) -> RuleflowResult<()> {
            Ok(())
        }
    }

    struct StrictTool;

    #[async_trait]
    impl RuleTool for StrictTool {
        fn declared_input_files(&self) -> &[&str] {
            &["corpus"]
        }
        fn declared_output_files(&self) -> &[&str] {
            &["counts"]
        }
        async fn run(&self, _handle: &RuleHandle) -> RuleflowResult<()> {
            Ok(())
        }
    }

    async fn factory() -> SessionFactory {
        SessionFactory::connect_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn binds_descriptors_and_resolves_paths() {
        let def = parse_definition(
            "rule a:\n  tool: demo.echo\n  input:\n    files:\n      corpus: data/c.txt\n  output:\n    files:\n      counts: data/o.txt\n",
        )
        .unwrap();

        let mut registry = ToolRegistry::new();
        registry.register("demo.echo", Arc::new(EchoTool));

        let sessions = factory().await;
        let session = sessions.session().await.unwrap();
        let execution = session
            .create_execution(chrono::Utc::now())
            .await
            .unwrap();

        let bound = bind_definition(&def, execution.id, Path::new("/work"), &registry, &sessions)
            .await
            .unwrap();

        assert_eq!(bound.len(), 1);
        assert_eq!(bound[0].input_files[0].path, PathBuf::from("/work/data/c.txt"));
        assert_eq!(bound[0].output_files[0].path, PathBuf::from("/work/data/o.txt"));
    }

    #[tokio::test]
    async fn rejects_content_violation_against_tool_contract() {
        let def = parse_definition(
            "rule a:\n  tool: demo.strict\n  input:\n    files:\n      wrong_name: data/c.txt\n",
        )
        .unwrap();

        let mut registry = ToolRegistry::new();
        registry.register("demo.strict", Arc::new(StrictTool));

        let sessions = factory().await;
        let session = sessions.session().await.unwrap();
        let execution = session.create_execution(chrono::Utc::now()).await.unwrap();

        let err = bind_definition(&def, execution.id, Path::new("/work"), &registry, &sessions)
            .await
            .unwrap_err();
        assert!(matches!(err, RuleflowError::ContentViolation { .. }));
    }

    struct ParamTool;

    #[async_trait]
    impl RuleTool for ParamTool {
        fn declared_params(&self) -> &[(&str, &str)] {
            &[("min_length", "required|int")]
        }
        async fn run(&self, _handle: &RuleHandle) -> RuleflowResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn rejects_missing_required_param() {
        let def = parse_definition("rule a:\n  tool: demo.param\n").unwrap();

        let mut registry = ToolRegistry::new();
        registry.register("demo.param", Arc::new(ParamTool));

        let sessions = factory().await;
        let session = sessions.session().await.unwrap();
        let execution = session.create_execution(chrono::Utc::now()).await.unwrap();

        let err = bind_definition(&def, execution.id, Path::new("/work"), &registry, &sessions)
            .await
            .unwrap_err();
        assert!(matches!(err, RuleflowError::ContentViolation { .. }));
    }

    #[tokio::test]
    async fn rejects_param_of_wrong_type() {
        let def = parse_definition("rule a:\n  tool: demo.param\n  params:\n    min_length: not_a_number\n").unwrap();

        let mut registry = ToolRegistry::new();
        registry.register("demo.param", Arc::new(ParamTool));

        let sessions = factory().await;
        let session = sessions.session().await.unwrap();
        let execution = session.create_execution(chrono::Utc::now()).await.unwrap();

        let err = bind_definition(&def, execution.id, Path::new("/work"), &registry, &sessions)
            .await
            .unwrap_err();
        assert!(matches!(err, RuleflowError::ContentViolation { .. }));
    }

    #[tokio::test]
    async fn accepts_valid_required_param() {
        let def = parse_definition("rule a:\n  tool: demo.param\n  params:\n    min_length: 3\n").unwrap();

        let mut registry = ToolRegistry::new();
        registry.register("demo.param", Arc::new(ParamTool));

        let sessions = factory().await;
        let session = sessions.session().await.unwrap();
        let execution = session.create_execution(chrono::Utc::now()).await.unwrap();

        let bound = bind_definition(&def, execution.id, Path::new("/work"), &registry, &sessions)
            .await
            .unwrap();
        assert_eq!(bound[0].options[0].value, "3");
    }

    #[tokio::test]
    async fn rejects_unknown_tool() {
        let def = parse_definition("rule a:\n  tool: demo.missing\n").unwrap();
        let registry = ToolRegistry::new();

        let sessions = factory().await;
        let session = sessions.session().await.unwrap();
        let execution = session.create_execution(chrono::Utc::now()).await.unwrap();

        let err = bind_definition(&def, execution.id, Path::new("/work"), &registry, &sessions)
            .await
            .unwrap_err();
        assert!(matches!(err, RuleflowError::ToolNotFound { .. }));
    }

    #[tokio::test]
    async fn rejects_any_binding_against_a_tool_that_declares_nothing() {
        let def = parse_definition(
            "rule a:\n  tool: demo.nothing\n  input:\n    files:\n      corpus: data/c.txt\n",
        )
        .unwrap();

        let mut registry = ToolRegistry::new();
        registry.register("demo.nothing", Arc::new(NothingDeclaredTool));

        let sessions = factory().await;
        let session = sessions.session().await.unwrap();
        let execution = session.create_execution(chrono::Utc::now()).await.unwrap();

        let err = bind_definition(&def, execution.id, Path::new("/work"), &registry, &sessions)
            .await
            .unwrap_err();
        assert!(matches!(err, RuleflowError::ContentViolation { .. }));
    }

    #[tokio::test]
    async fn accepts_a_tool_that_declares_nothing_when_nothing_is_bound() {
        let def = parse_definition("rule a:\n  tool: demo.nothing\n").unwrap();

        let mut registry = ToolRegistry::new();
        registry.register("demo.nothing", Arc::new(NothingDeclaredTool));

        let sessions = factory().await;
        let session = sessions.session().await.unwrap();
        let execution = session.create_execution(chrono::Utc::now()).await.unwrap();

        let bound = bind_definition(&def, execution.id, Path::new("/work"), &registry, &sessions)
            .await
            .unwrap();
        assert!(bound[0].input_files.is_empty());
    }
}
