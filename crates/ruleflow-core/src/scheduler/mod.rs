//! The scheduler (§4.5): a single-threaded loop driving a bounded pool of
//! tokio worker tasks over the DAG's dependency order, using a semaphore to
//! cap concurrency and an mpsc channel to collect completions.
//!
//! A rule's predecessors all finishing is what makes it eligible to run; a
//! failed predecessor poisons every rule reachable through it, which are
//! marked NOT_PLANNED without ever being dispatched. `finished_at(r') <=
//! started_at(r)` holds because `r` only reaches the dispatch queue after
//! the loop has processed `r'`'s completion.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tracing::{info, warn};

use crate::dag::Dag;
use crate::error::RuleflowResult;
use crate::freshness::{self, Freshness};
use crate::model::{ExecutionStatus, RuleStatus};
use crate::persistence::{Session, SessionFactory};
use crate::runtime::RuleHandle;

/// A cooperative stop flag (§4.5 point 7, §5): checked by the scheduler
/// loop between dispatches, never inside an in-flight callback. Cloning
/// shares the same underlying flag, so a front end can hold one half and
/// call `cancel()` from a signal handler while the scheduler holds the
/// other and polls `is_cancelled()`.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Summary of one scheduler run, returned to the caller for reporting.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerReport {
    pub executed: Vec<String>,
    pub already_satisfied: Vec<String>,
    pub failed: Vec<String>,
    pub not_planned: Vec<String>,
    pub status: Option<ExecutionStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleOutcome {
    Executed,
    AlreadySatisfied,
}

struct Completion {
    idx: usize,
    outcome: RuleflowResult<RuleOutcome>,
}

pub struct Scheduler {
    dag: Dag,
    sessions: SessionFactory,
    execution_id: i64,
    worker_count: usize,
    dry_run: bool,
    cancellation: CancellationToken,
}

impl Scheduler {
    pub fn new(
        dag: Dag,
        sessions: SessionFactory,
        execution_id: i64,
        worker_count: usize,
        dry_run: bool,
    ) -> Self {
        Self {
            dag,
            sessions,
            execution_id,
            worker_count: worker_count.max(1),
            dry_run,
            cancellation: CancellationToken::new(),
        }
    }

    /// A handle a caller can use to request cancellation of this run from
    /// outside the scheduler loop (e.g. a signal handler).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Use a caller-supplied token in place of the freshly-minted one, so a
    /// front end can hold the other half before the scheduler starts.
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub async fn run(self) -> RuleflowResult<SchedulerReport> {
        let n = self.dag.len();
        let session = self.sessions.session().await?;
        session
            .set_execution_status(self.execution_id, ExecutionStatus::Running)
            .await?;

        let semaphore = Arc::new(Semaphore::new(self.worker_count));
        let (tx, mut rx) = mpsc::channel::<Completion>(n.max(1));

        let mut indegree: Vec<usize> = (0..n).map(|i| self.dag.predecessors(i).len()).collect();
        let mut queue: VecDeque<usize> = indegree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect();

        let mut poisoned: HashSet<usize> = HashSet::new();
        let mut remaining = n;
        let mut in_flight = 0usize;
        let mut report = SchedulerReport::default();
        let mut cancelled = false;

        while remaining > 0 {
            if self.cancellation.is_cancelled() {
                cancelled = true;
            }

            while let Some(idx) = queue.pop_front() {
                let rule = &self.dag.rules()[idx];

                // A cancelled run, like a failed predecessor, never
                // dispatches anything new; in-flight work (tracked by
                // `in_flight`, not `remaining`) still runs to completion —
                // no mid-callback abort (§4.5 point 7, §5).
                let skip = cancelled || self.dag.predecessors(idx).iter().any(|p| poisoned.contains(p));
                if skip {
                    poisoned.insert(idx);
                    session.set_rule_status(rule.rule.id, RuleStatus::NotPlanned).await?;
                    report.not_planned.push(rule.rule.rule_name.clone());
                    remaining -= 1;
                    for &succ in self.dag.successors(idx) {
                        indegree[succ] -= 1;
                        if indegree[succ] == 0 {
                            queue.push_back(succ);
                        }
                    }
                    continue;
                }

                in_flight += 1;
                self.dispatch(idx, Arc::clone(&semaphore), tx.clone()).await?;
            }

            if remaining == 0 {
                break;
            }

            let completion = rx
                .recv()
                .await
                .expect("scheduler channel closed with rules still outstanding");
            in_flight -= 1;
            remaining -= 1;

            let rule = &self.dag.rules()[completion.idx];
            match completion.outcome {
                Ok(RuleOutcome::Executed) => {
                    info!(rule = %rule.rule.rule_name, "executed");
                    report.executed.push(rule.rule.rule_name.clone());
                }
                Ok(RuleOutcome::AlreadySatisfied) => {
                    info!(rule = %rule.rule.rule_name, "already satisfied");
                    report.already_satisfied.push(rule.rule.rule_name.clone());
                }
                Err(err) => {
                    warn!(rule = %rule.rule.rule_name, error = %err, "rule failed");
                    poisoned.insert(completion.idx);
                    report.failed.push(rule.rule.rule_name.clone());
                }
            }

            for &succ in self.dag.successors(completion.idx) {
                indegree[succ] -= 1;
                if indegree[succ] == 0 {
                    queue.push_back(succ);
                }
            }
        }

        debug_assert_eq!(in_flight, 0);

        let status = if cancelled {
            ExecutionStatus::Cancelled
        } else if report.failed.is_empty() {
            ExecutionStatus::Done
        } else {
            ExecutionStatus::Failed
        };
        session.finish_execution(self.execution_id, Utc::now(), status).await?;
        report.status = Some(status);

        Ok(report)
    }

    /// Spawn one rule's evaluation and, if needed, execution as a tokio
    /// task gated by the shared semaphore. The task always sends exactly
    /// one [`Completion`] back, even on a permit-acquire failure.
    async fn dispatch(
        &self,
        idx: usize,
        semaphore: Arc<Semaphore>,
        tx: mpsc::Sender<Completion>,
    ) -> RuleflowResult<()> {
        let rule = self.dag.rules()[idx].clone();
        let session = self.sessions.session().await?;
        let dry_run = self.dry_run;

        tokio::spawn(async move {
            let permit = semaphore.acquire_owned().await;
            let outcome = match permit {
                Ok(_permit) => run_one(&rule, &session, dry_run).await,
                Err(_) => Err(crate::error::RuleflowError::PersistenceFailure(
                    "worker semaphore closed".to_string(),
                )),
            };
            let _ = tx.send(Completion { idx, outcome }).await;
        });
        Ok(())
    }
}

async fn run_one(rule: &crate::binder::BoundRule, session: &Session, dry_run: bool) -> RuleflowResult<RuleOutcome> {
    match freshness::evaluate(rule, session, dry_run).await? {
        Freshness::AlreadySatisfied => {
            session.set_rule_status(rule.rule.id, RuleStatus::AlreadyExecuted).await?;
            Ok(RuleOutcome::AlreadySatisfied)
        }
        Freshness::NotReady => Err(crate::error::RuleflowError::FileNotFound {
            path: rule
                .input_files
                .first()
                .map(|d| d.path.clone())
                .unwrap_or_default(),
            rule_name: Some(rule.rule.rule_name.clone()),
        }),
        Freshness::Ready => {
            if dry_run {
                info!(rule = %rule.rule.rule_name, "dry run: would execute");
                return Ok(RuleOutcome::Executed);
            }
            execute(rule, session).await
        }
    }
}

async fn execute(rule: &crate::binder::BoundRule, session: &Session) -> RuleflowResult<RuleOutcome> {
    let handle = RuleHandle::new(
        rule.rule.rule_name.clone(),
        rule.input_files.clone(),
        rule.output_files.clone(),
        rule.input_tables.clone(),
        rule.output_tables.clone(),
        rule.options.clone(),
        session.clone(),
    );

    let started_at = Utc::now();
    let started_instant = Instant::now();

    let result = rule.tool.run(&handle).await;

    let finished_at = Utc::now();
    let duration_ms = started_instant.elapsed().as_millis() as i64;

    match result {
        Ok(()) => {
            session
                .record_rule_run(rule.rule.id, started_at, finished_at, duration_ms, RuleStatus::Executed)
                .await?;
            persist_provenance(rule, session, finished_at).await?;
            Ok(RuleOutcome::Executed)
        }
        Err(err) => {
            session
                .record_rule_run(rule.rule.id, started_at, finished_at, duration_ms, RuleStatus::ExecutionError)
                .await?;
            Err(crate::error::RuleflowError::ExecutionFailure {
                rule_name: rule.rule.rule_name.clone(),
                detail: err.to_string(),
            })
        }
    }
}

/// After a successful run, record the file stats and table modification
/// timestamps that the next run's provenance comparison (§4.4) will check
/// against.
async fn persist_provenance(
    rule: &crate::binder::BoundRule,
    session: &Session,
    now: chrono::DateTime<Utc>,
) -> RuleflowResult<()> {
    let now_ms = now.timestamp_millis();

    for descriptor in rule.input_files.iter().chain(rule.output_files.iter()) {
        if let Ok(meta) = std::fs::metadata(&descriptor.path) {
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(now_ms);
            session
                .update_file_descriptor_stat(descriptor.id, Some(mtime), Some(meta.len() as i64), Some(mtime))
                .await?;
        }
    }

    for descriptor in &rule.output_tables {
        session.bump_table_modification(&descriptor.physical_tablename, now_ms).await?;
        session.update_table_descriptor_used_at(descriptor.id, Some(now_ms)).await?;
    }
    for descriptor in &rule.input_tables {
        if let Some(modification) = session.get_table_modification(&descriptor.physical_tablename).await? {
            session
                .update_table_descriptor_used_at(descriptor.id, Some(modification.modified_at))
                .await?;
        }
    }

    Ok(())
}
