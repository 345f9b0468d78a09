//! End-to-end scenarios against [`ruleflow_core::RuleflowEngine`], covering
//! the concrete scenarios of the design document's testable-properties
//! section: diamond ordering, idempotent reruns, dry-run, and cascading
//! NOT_PLANNED on a failed predecessor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ruleflow_core::model::ExecutionStatus;
use ruleflow_core::{EngineConfig, RuleHandle, RuleTool, RuleflowEngine, RuleflowResult, ToolRegistry};

/// Copies its declared input to its declared output, counting invocations
/// so tests can assert a callback was (or was not) actually run.
struct CountingCopy {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl RuleTool for CountingCopy {
    fn declared_input_files(&self) -> &[&str] {
        &["in"]
    }
    fn declared_output_files(&self) -> &[&str] {
        &["out"]
    }

    async fn run(&self, handle: &RuleHandle) -> RuleflowResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let src = handle.input_file("in")?.to_path_buf();
        let dst = handle.output_file("out")?.to_path_buf();
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::copy(&src, &dst).unwrap();
        Ok(())
    }
}

/// Writes a fixed output with no declared inputs at all.
struct SeedWriter;

#[async_trait]
impl RuleTool for SeedWriter {
    fn declared_output_files(&self) -> &[&str] {
        &["out"]
    }

    async fn run(&self, handle: &RuleHandle) -> RuleflowResult<()> {
        let dst = handle.output_file("out")?.to_path_buf();
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&dst, "seeded").unwrap();
        Ok(())
    }
}

struct AlwaysFails;

#[async_trait]
impl RuleTool for AlwaysFails {
    fn declared_output_files(&self) -> &[&str] {
        &["out"]
    }

    async fn run(&self, _handle: &RuleHandle) -> RuleflowResult<()> {
        Err(ruleflow_core::RuleflowError::ExecutionFailure {
            rule_name: "boom".to_string(),
            detail: "simulated failure".to_string(),
        })
    }
}

fn registry_with(calls: Arc<AtomicUsize>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register("demo.copy", Arc::new(CountingCopy { calls }) as Arc<dyn RuleTool>);
    registry.register("demo.fails", Arc::new(AlwaysFails) as Arc<dyn RuleTool>);
    registry.register("demo.seed", Arc::new(SeedWriter) as Arc<dyn RuleTool>);
    registry
}

fn engine_config(dir: &std::path::Path, database: &str) -> EngineConfig {
    EngineConfig {
        database_path: dir.join(database),
        working_directory: dir.to_path_buf(),
        worker_count: 4,
        dry_run: false,
    }
}

#[tokio::test]
async fn diamond_workflow_runs_every_rule_and_orders_the_shared_producer_first() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("seed.txt"), "hello").unwrap();

    let definition = "\
rule a:
  tool: demo.copy
  input:
    files:
      in: seed.txt
  output:
    files:
      out: a.txt
rule b:
  tool: demo.copy
  input:
    files:
      in: a.txt
  output:
    files:
      out: b.txt
rule c:
  tool: demo.copy
  input:
    files:
      in: a.txt
  output:
    files:
      out: c.txt
";

    let calls = Arc::new(AtomicUsize::new(0));
    let engine = RuleflowEngine::new(engine_config(dir.path(), "wf.db"), registry_with(calls.clone()));
    let report = engine.run(definition).await.unwrap();

    assert_eq!(report.status, Some(ExecutionStatus::Done));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(dir.path().join("b.txt").exists());
    assert!(dir.path().join("c.txt").exists());
}

#[tokio::test]
async fn rerun_with_unchanged_inputs_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("seed.txt"), "hello").unwrap();

    let definition = "\
rule a:
  tool: demo.copy
  input:
    files:
      in: seed.txt
  output:
    files:
      out: a.txt
";

    let calls = Arc::new(AtomicUsize::new(0));
    let config = engine_config(dir.path(), "wf.db");
    let engine = RuleflowEngine::new(config.clone(), registry_with(calls.clone()));

    let first = engine.run(definition).await.unwrap();
    assert_eq!(first.status, Some(ExecutionStatus::Done));
    assert_eq!(first.executed, vec!["a".to_string()]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let second = engine.run(definition).await.unwrap();
    assert_eq!(second.status, Some(ExecutionStatus::Done));
    assert_eq!(second.already_satisfied, vec!["a".to_string()]);
    assert!(second.executed.is_empty());
    // The callback was not invoked a second time.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dry_run_does_not_invoke_callbacks_or_touch_the_filesystem() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("seed.txt"), "hello").unwrap();

    let definition = "\
rule a:
  tool: demo.copy
  input:
    files:
      in: seed.txt
  output:
    files:
      out: a.txt
";

    let calls = Arc::new(AtomicUsize::new(0));
    let mut config = engine_config(dir.path(), "wf.db");
    config.dry_run = true;
    let engine = RuleflowEngine::new(config, registry_with(calls.clone()));

    let report = engine.run(definition).await.unwrap();
    assert_eq!(report.status, Some(ExecutionStatus::Done));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(!dir.path().join("a.txt").exists());
}

#[tokio::test]
async fn dry_run_reports_must_run_on_a_missing_input_instead_of_failing() {
    let dir = tempfile::tempdir().unwrap();

    let definition = "\
rule a:
  tool: demo.copy
  input:
    files:
      in: seed.txt
  output:
    files:
      out: a.txt
";

    let calls = Arc::new(AtomicUsize::new(0));
    let mut config = engine_config(dir.path(), "wf.db");
    config.dry_run = true;
    let engine = RuleflowEngine::new(config, registry_with(calls.clone()));

    let report = engine.run(definition).await.unwrap();
    assert_eq!(report.status, Some(ExecutionStatus::Done));
    assert_eq!(report.executed, vec!["a".to_string()]);
    assert!(report.failed.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(!dir.path().join("seed.txt").exists());
    assert!(!dir.path().join("a.txt").exists());
}

#[tokio::test]
async fn failed_predecessor_leaves_dependent_not_planned() {
    let dir = tempfile::tempdir().unwrap();

    let definition = "\
rule a:
  tool: demo.fails
  output:
    files:
      out: a.txt
rule b:
  tool: demo.copy
  input:
    files:
      in: a.txt
  output:
    files:
      out: b.txt
";

    let calls = Arc::new(AtomicUsize::new(0));
    let engine = RuleflowEngine::new(engine_config(dir.path(), "wf.db"), registry_with(calls.clone()));
    let report = engine.run(definition).await.unwrap();

    assert_eq!(report.status, Some(ExecutionStatus::Failed));
    assert_eq!(report.failed, vec!["a".to_string()]);
    assert_eq!(report.not_planned, vec!["b".to_string()]);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn empty_workflow_finishes_done_with_no_rules() {
    let dir = tempfile::tempdir().unwrap();
    let engine = RuleflowEngine::new(engine_config(dir.path(), "wf.db"), ToolRegistry::new());
    let report = engine.run("").await.unwrap();

    assert_eq!(report.status, Some(ExecutionStatus::Done));
    assert!(report.executed.is_empty());
    assert!(report.failed.is_empty());
}

#[tokio::test]
async fn single_rule_with_no_inputs_runs_once() {
    let dir = tempfile::tempdir().unwrap();

    let definition = "\
rule seed:
  tool: demo.seed
  output:
    files:
      out: out.txt
";
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = RuleflowEngine::new(engine_config(dir.path(), "wf.db"), registry_with(calls));
    let report = engine.run(definition).await.unwrap();
    assert_eq!(report.status, Some(ExecutionStatus::Done));
    assert_eq!(report.executed, vec!["seed".to_string()]);
    assert!(dir.path().join("out.txt").exists());
}
