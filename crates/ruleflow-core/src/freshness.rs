//! The freshness evaluator (§4.4): decides whether a bound rule's inputs
//! are all present, whether its outputs are stale, and whether a prior
//! completed run already satisfies it exactly (ALREADY_SATISFIED) — before
//! the scheduler is ever allowed to hand it to a worker.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::binder::BoundRule;
use crate::error::RuleflowResult;
use crate::model::{Rule, RuleStatus};
use crate::persistence::Session;

/// §3/§4.4's transient readiness states; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Not every declared input exists yet; re-check once a predecessor finishes.
    NotReady,
    /// Inputs present; outputs missing or stale; must run.
    Ready,
    /// `I < O` and the prior successful run's provenance matches exactly;
    /// skip execution and mark ALREADY_EXECUTED.
    AlreadySatisfied,
}

#[derive(Debug, Clone, Copy)]
struct Stat {
    mtime_epoch_millis: i64,
    size: i64,
}

fn stat(path: &Path) -> Option<Stat> {
    let meta = fs::metadata(path).ok()?;
    let modified = meta.modified().ok()?;
    let millis = modified
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    Some(Stat {
        mtime_epoch_millis: millis,
        size: meta.len() as i64,
    })
}

/// Whether the physical table backing `physical_tablename` currently holds
/// at least one row. A table the binder has only get-or-created a ledger
/// row for, but whose model entity no writer has created yet, reads as
/// "no such table" rather than zero rows — both count as empty here.
async fn table_is_nonempty(session: &Session, physical_tablename: &str) -> RuleflowResult<bool> {
    Ok(session
        .physical_table_row_count(physical_tablename)
        .await?
        .map(|count| count > 0)
        .unwrap_or(false))
}

/// Evaluate one rule's freshness against the filesystem and the table
/// modification ledger.
///
/// `dry_run` implements spec.md's tie-break clause: when an input file is
/// missing and the engine is in dry-run mode, that missing file is treated
/// as having a null mtime rather than blocking the rule outright — the
/// freshness test yields "must run" (`Ready`) so the caller's dry-run
/// branch reports it without ever invoking the callback, instead of the
/// hard `NotReady`/`FileNotFound` a live run would raise.
pub async fn evaluate(rule: &BoundRule, session: &Session, dry_run: bool) -> RuleflowResult<Freshness> {
    let mut input_mtimes = Vec::with_capacity(rule.input_files.len());
    for descriptor in &rule.input_files {
        match stat(&descriptor.path) {
            Some(s) => input_mtimes.push(s.mtime_epoch_millis),
            None if dry_run => return Ok(Freshness::Ready),
            None => return Ok(Freshness::NotReady),
        }
    }
    for descriptor in &rule.input_tables {
        // §9's chosen policy: a table is ready only once its ledger row
        // exists *and* actually holds rows — the binder's get-or-create
        // seeds the row before any writer runs, so "row exists" alone
        // would never block on an upstream producer that hasn't run yet.
        match session.get_table_modification(&descriptor.physical_tablename).await? {
            Some(m) if table_is_nonempty(session, &descriptor.physical_tablename).await? => {
                input_mtimes.push(m.modified_at)
            }
            _ => return Ok(Freshness::NotReady),
        }
    }

    let mut output_mtimes = Vec::with_capacity(rule.output_files.len());
    for descriptor in &rule.output_files {
        match stat(&descriptor.path) {
            Some(s) => output_mtimes.push(s.mtime_epoch_millis),
            // A missing output is the common case: the rule has never run.
            None => return Ok(Freshness::Ready),
        }
    }
    for descriptor in &rule.output_tables {
        match session.get_table_modification(&descriptor.physical_tablename).await? {
            Some(m) if table_is_nonempty(session, &descriptor.physical_tablename).await? => {
                output_mtimes.push(m.modified_at)
            }
            // No ledger row yet, or the table exists but has never been
            // written to: the rule's output is not there yet, must run.
            _ => return Ok(Freshness::Ready),
        }
    }

    let (i, o) = match (input_mtimes.into_iter().max(), output_mtimes.into_iter().min()) {
        (Some(i), Some(o)) => (i, o),
        // No inputs and/or no declared outputs: there is nothing to compare,
        // so the rule is never vacuously already-satisfied.
        _ => return Ok(Freshness::Ready),
    };

    if i >= o {
        return Ok(Freshness::Ready);
    }

    match session
        .most_recent_prior_rule(&rule.rule.rule_name, rule.rule.execution_id)
        .await?
    {
        Some(prior)
            if matches!(prior.status, RuleStatus::Executed | RuleStatus::AlreadyExecuted)
                && provenance_matches(rule, &prior, session).await? =>
        {
            Ok(Freshness::AlreadySatisfied)
        }
        _ => Ok(Freshness::Ready),
    }
}

/// Whether `rule`'s current descriptor set and file stats exactly match
/// what was recorded the last time `prior` ran: same paths, same table
/// models, same size/mtime on every declared file (§4.4).
async fn provenance_matches(rule: &BoundRule, prior: &Rule, session: &Session) -> RuleflowResult<bool> {
    let prior_files = session.file_descriptors_for_rule(prior.id).await?;
    let prior_tables = session.table_descriptors_for_rule(prior.id).await?;

    let current_paths: HashSet<_> = rule
        .input_files
        .iter()
        .chain(rule.output_files.iter())
        .map(|d| d.path.clone())
        .collect();
    let prior_paths: HashSet<_> = prior_files.iter().map(|d| d.path.clone()).collect();
    if current_paths != prior_paths {
        return Ok(false);
    }

    let current_models: HashSet<_> = rule
        .input_tables
        .iter()
        .chain(rule.output_tables.iter())
        .map(|d| d.model_identifier.clone())
        .collect();
    let prior_models: HashSet<_> = prior_tables.iter().map(|d| d.model_identifier.clone()).collect();
    if current_models != prior_models {
        return Ok(false);
    }

    for descriptor in rule.input_files.iter().chain(rule.output_files.iter()) {
        let current = match stat(&descriptor.path) {
            Some(s) => s,
            None => return Ok(false),
        };
        let matched = prior_files.iter().any(|p| {
            p.path == descriptor.path
                && p.used_at == Some(current.mtime_epoch_millis)
                && p.size == Some(current.size)
        });
        if !matched {
            return Ok(false);
        }
    }

    Ok(true)
}
