//! The persistence layer (§4.7): a shared session factory whose sessions
//! funnel every statement through one lock guarding one connection, plus
//! the domain-specific operations the binder, freshness evaluator, and
//! scheduler need.
//!
//! The specification's generic `get_or_create(model, defaults, **lookup)`
//! assumes an ORM's runtime model reflection, which Rust's type system does
//! not give us for free. `ruleflow-core` keeps the *behavior* (race-safe
//! get-or-create funneled through one lock) but exposes it as typed,
//! per-entity methods instead of one reflective one — see DESIGN.md.
//!
//! All sessions checked out of one [`SessionFactory`] share the same
//! underlying connection, serialized by one mutex. This is deliberate, not
//! a missed opportunity for a connection pool: it is what makes a
//! multi-statement unit of work (`BEGIN` ... `COMMIT`) actually atomic
//! regardless of which cloned `Session` handle issues each statement, and
//! SQLite only ever allows one writer at a time besides.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqlitePool};
use tokio::sync::Mutex;

use crate::error::{RuleflowError, RuleflowResult};
use crate::model::{
    Execution, ExecutionStatus, FileDescriptor, OptionRow, Role, Rule, RuleStatus, TableDescriptor,
    TableModification,
};

use super::schema::SCHEMA_SQL;

/// Produces [`Session`]s that all share one connection and one lock.
pub struct SessionFactory {
    conn: Arc<Mutex<PoolConnection<Sqlite>>>,
}

impl SessionFactory {
    /// Open (creating if needed) the SQLite database at `path`, run the
    /// schema's `CREATE TABLE IF NOT EXISTS` statements plus the role seed,
    /// and check out the one connection every session will share.
    pub async fn connect(path: &Path) -> RuleflowResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    RuleflowError::PersistenceFailure(format!("creating {}: {e}", parent.display()))
                })?;
            }
        }
        let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
        Self::from_options(options).await
    }

    /// In-memory database, for tests and dry runs that should not touch disk.
    pub async fn connect_in_memory() -> RuleflowResult<Self> {
        let options = SqliteConnectOptions::new().filename(":memory:").create_if_missing(true);
        Self::from_options(options).await
    }

    async fn from_options(options: SqliteConnectOptions) -> RuleflowResult<Self> {
        // A single-connection pool: a second connection to the same
        // `:memory:` database would see an empty schema, and a file-backed
        // database gains nothing from more writers than SQLite allows.
        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await?;
        sqlx::query(SCHEMA_SQL).execute(&pool).await?;
        let conn = pool.acquire().await?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Check out a new session handle. Every handle shares the same
    /// underlying connection and lock.
    pub async fn session(&self) -> RuleflowResult<Session> {
        Ok(Session {
            conn: self.conn.clone(),
        })
    }
}

impl Clone for SessionFactory {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
        }
    }
}

/// One worker's handle onto the shared store. Cheap to clone — it is just
/// another reference to the shared connection and lock.
#[derive(Clone)]
pub struct Session {
    conn: Arc<Mutex<PoolConnection<Sqlite>>>,
}

impl Session {
    /// Run a raw statement under the shared lock.
    pub async fn execute(&self, stmt: &str) -> RuleflowResult<()> {
        let mut conn = self.conn.lock().await;
        sqlx::query(stmt).execute(&mut *conn).await?;
        Ok(())
    }

    // ---- Execution -------------------------------------------------------

    pub async fn create_execution(&self, started_at: DateTime<Utc>) -> RuleflowResult<Execution> {
        let mut conn = self.conn.lock().await;
        let id = sqlx::query("INSERT INTO wom_execution (started_at, status) VALUES (?1, ?2)")
            .bind(started_at)
            .bind(ExecutionStatus::Init.as_db_str())
            .execute(&mut *conn)
            .await?
            .last_insert_rowid();

        Ok(Execution {
            id,
            started_at,
            finished_at: None,
            status: ExecutionStatus::Init,
        })
    }

    pub async fn set_execution_status(&self, id: i64, status: ExecutionStatus) -> RuleflowResult<()> {
        let mut conn = self.conn.lock().await;
        sqlx::query("UPDATE wom_execution SET status = ?1 WHERE id = ?2")
            .bind(status.as_db_str())
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn finish_execution(
        &self,
        id: i64,
        finished_at: DateTime<Utc>,
        status: ExecutionStatus,
    ) -> RuleflowResult<()> {
        let mut conn = self.conn.lock().await;
        sqlx::query("UPDATE wom_execution SET finished_at = ?1, status = ?2 WHERE id = ?3")
            .bind(finished_at)
            .bind(status.as_db_str())
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    // ---- Rule --------------------------------------------------------------

    pub async fn insert_rule(&self, execution_id: i64, rule_name: &str, tool_identifier: &str) -> RuleflowResult<Rule> {
        let mut conn = self.conn.lock().await;
        let id = sqlx::query(
            "INSERT INTO wom_rule (rule_name, tool_identifier, execution_id, status) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(rule_name)
        .bind(tool_identifier)
        .bind(execution_id)
        .bind(RuleStatus::NotExecuted.as_db_str())
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();

        Ok(Rule {
            id,
            execution_id,
            rule_name: rule_name.to_string(),
            tool_identifier: tool_identifier.to_string(),
            started_at: None,
            finished_at: None,
            duration_ms: None,
            status: RuleStatus::NotExecuted,
        })
    }

    pub async fn set_rule_status(&self, rule_id: i64, status: RuleStatus) -> RuleflowResult<()> {
        let mut conn = self.conn.lock().await;
        sqlx::query("UPDATE wom_rule SET status = ?1 WHERE id = ?2")
            .bind(status.as_db_str())
            .bind(rule_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn record_rule_run(
        &self,
        rule_id: i64,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        duration_ms: i64,
        status: RuleStatus,
    ) -> RuleflowResult<()> {
        let mut conn = self.conn.lock().await;
        sqlx::query(
            "UPDATE wom_rule SET started_at = ?1, finished_at = ?2, duration_ms = ?3, status = ?4 WHERE id = ?5",
        )
        .bind(started_at)
        .bind(finished_at)
        .bind(duration_ms)
        .bind(status.as_db_str())
        .bind(rule_id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// The most recent prior rule row with this name, from a different,
    /// already-finished execution — used for provenance comparison (§4.4).
    pub async fn most_recent_prior_rule(&self, rule_name: &str, before_execution_id: i64) -> RuleflowResult<Option<Rule>> {
        let mut conn = self.conn.lock().await;
        let row = sqlx::query(
            "SELECT id, execution_id, rule_name, tool_identifier, started_at, finished_at, duration_ms, status \
             FROM wom_rule WHERE rule_name = ?1 AND execution_id < ?2 AND status IN ('EXECUTED', 'ALREADY_EXECUTED') \
             ORDER BY execution_id DESC LIMIT 1",
        )
        .bind(rule_name)
        .bind(before_execution_id)
        .fetch_optional(&mut *conn)
        .await?;

        row.map(row_to_rule).transpose()
    }

    // ---- File descriptors ----------------------------------------------

    pub async fn insert_file_descriptor(
        &self,
        rule_id: i64,
        name: &str,
        path: &Path,
        role: Role,
    ) -> RuleflowResult<FileDescriptor> {
        let mut conn = self.conn.lock().await;
        let path_str = path.to_string_lossy().to_string();
        let id = sqlx::query("INSERT INTO wom_file_iio (rule_id, name, path, role) VALUES (?1, ?2, ?3, ?4)")
            .bind(rule_id)
            .bind(name)
            .bind(&path_str)
            .bind(role.as_db_str())
            .execute(&mut *conn)
            .await?
            .last_insert_rowid();

        Ok(FileDescriptor {
            id,
            rule_id,
            name: name.to_string(),
            path: PathBuf::from(path_str),
            role,
            mtime_epoch_millis: None,
            size: None,
            used_at: None,
        })
    }

    pub async fn update_file_descriptor_stat(
        &self,
        id: i64,
        mtime_epoch_millis: Option<i64>,
        size: Option<i64>,
        used_at: Option<i64>,
    ) -> RuleflowResult<()> {
        let mut conn = self.conn.lock().await;
        sqlx::query("UPDATE wom_file_iio SET mtime_epoch_millis = ?1, size = ?2, used_at = ?3 WHERE id = ?4")
            .bind(mtime_epoch_millis)
            .bind(size)
            .bind(used_at)
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn file_descriptors_for_rule(&self, rule_id: i64) -> RuleflowResult<Vec<FileDescriptor>> {
        let mut conn = self.conn.lock().await;
        let rows = sqlx::query(
            "SELECT id, rule_id, name, path, role, mtime_epoch_millis, size, used_at FROM wom_file_iio WHERE rule_id = ?1",
        )
        .bind(rule_id)
        .fetch_all(&mut *conn)
        .await?;
        rows.into_iter().map(row_to_file_descriptor).collect()
    }

    // ---- Table descriptors -----------------------------------------------

    pub async fn insert_table_descriptor(
        &self,
        rule_id: i64,
        logical_name: &str,
        physical_tablename: &str,
        model_identifier: &str,
        role: Role,
    ) -> RuleflowResult<TableDescriptor> {
        let mut conn = self.conn.lock().await;
        let id = sqlx::query(
            "INSERT INTO wom_table_iio (rule_id, logical_name, physical_tablename, model_identifier, role) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(rule_id)
        .bind(logical_name)
        .bind(physical_tablename)
        .bind(model_identifier)
        .bind(role.as_db_str())
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();

        Ok(TableDescriptor {
            id,
            rule_id,
            logical_name: logical_name.to_string(),
            physical_tablename: physical_tablename.to_string(),
            model_identifier: model_identifier.to_string(),
            role,
            used_at: None,
        })
    }

    pub async fn update_table_descriptor_used_at(&self, id: i64, used_at: Option<i64>) -> RuleflowResult<()> {
        let mut conn = self.conn.lock().await;
        sqlx::query("UPDATE wom_table_iio SET used_at = ?1 WHERE id = ?2")
            .bind(used_at)
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn table_descriptors_for_rule(&self, rule_id: i64) -> RuleflowResult<Vec<TableDescriptor>> {
        let mut conn = self.conn.lock().await;
        let rows = sqlx::query(
            "SELECT id, rule_id, logical_name, physical_tablename, model_identifier, role, used_at \
             FROM wom_table_iio WHERE rule_id = ?1",
        )
        .bind(rule_id)
        .fetch_all(&mut *conn)
        .await?;
        rows.into_iter().map(row_to_table_descriptor).collect()
    }

    // ---- Options ---------------------------------------------------------

    pub async fn insert_option(&self, rule_id: i64, name: &str, value: &str) -> RuleflowResult<OptionRow> {
        let mut conn = self.conn.lock().await;
        let id = sqlx::query("INSERT INTO wom_option (rule_id, name, value) VALUES (?1, ?2, ?3)")
            .bind(rule_id)
            .bind(name)
            .bind(value)
            .execute(&mut *conn)
            .await?
            .last_insert_rowid();
        Ok(OptionRow {
            id,
            rule_id,
            name: name.to_string(),
            value: value.to_string(),
        })
    }

    pub async fn options_for_rule(&self, rule_id: i64) -> RuleflowResult<Vec<OptionRow>> {
        let mut conn = self.conn.lock().await;
        let rows = sqlx::query("SELECT id, rule_id, name, value FROM wom_option WHERE rule_id = ?1")
            .bind(rule_id)
            .fetch_all(&mut *conn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| OptionRow {
                id: r.get("id"),
                rule_id: r.get("rule_id"),
                name: r.get("name"),
                value: r.get("value"),
            })
            .collect())
    }

    // ---- Table modification ledger ---------------------------------------

    /// Get-or-create the ledger row for `physical_tablename`, defaulting
    /// `modified_at` to `now_ms` if the row does not yet exist (§4.2 bullet
    /// 3). Race-safe: both statements run on the shared connection under
    /// one lock acquisition, and `INSERT OR IGNORE` makes the create
    /// idempotent across concurrent binders (I4).
    pub async fn get_or_create_table_modification(
        &self,
        physical_tablename: &str,
        now_ms: i64,
    ) -> RuleflowResult<(TableModification, bool)> {
        let mut conn = self.conn.lock().await;
        let changes = sqlx::query(
            "INSERT OR IGNORE INTO wom_modification_table (physical_tablename, modified_at) VALUES (?1, ?2)",
        )
        .bind(physical_tablename)
        .bind(now_ms)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        let row = sqlx::query(
            "SELECT physical_tablename, modified_at FROM wom_modification_table WHERE physical_tablename = ?1",
        )
        .bind(physical_tablename)
        .fetch_one(&mut *conn)
        .await?;

        Ok((
            TableModification {
                physical_tablename: row.get("physical_tablename"),
                modified_at: row.get("modified_at"),
            },
            changes > 0,
        ))
    }

    pub async fn get_table_modification(&self, physical_tablename: &str) -> RuleflowResult<Option<TableModification>> {
        let mut conn = self.conn.lock().await;
        let row = sqlx::query(
            "SELECT physical_tablename, modified_at FROM wom_modification_table WHERE physical_tablename = ?1",
        )
        .bind(physical_tablename)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row.map(|r| TableModification {
            physical_tablename: r.get("physical_tablename"),
            modified_at: r.get("modified_at"),
        }))
    }

    pub async fn bump_table_modification(&self, physical_tablename: &str, modified_at: i64) -> RuleflowResult<()> {
        let mut conn = self.conn.lock().await;
        sqlx::query(
            "INSERT INTO wom_modification_table (physical_tablename, modified_at) VALUES (?1, ?2) \
             ON CONFLICT(physical_tablename) DO UPDATE SET modified_at = excluded.modified_at",
        )
        .bind(physical_tablename)
        .bind(modified_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Row count of a user-owned physical table, if it exists.
    ///
    /// The table name cannot be bound as a parameter (SQLite only binds
    /// values, not identifiers), so it is quoted defensively instead.
    pub async fn physical_table_row_count(&self, physical_tablename: &str) -> RuleflowResult<Option<i64>> {
        let mut conn = self.conn.lock().await;
        let quoted = quote_identifier(physical_tablename);
        match sqlx::query(&format!("SELECT COUNT(*) AS c FROM {quoted}"))
            .fetch_one(&mut *conn)
            .await
        {
            Ok(row) => Ok(Some(row.get::<i64, _>("c"))),
            Err(sqlx::Error::Database(e)) if e.message().contains("no such table") => Ok(None),
            Err(e) => Err(RuleflowError::from(e)),
        }
    }
}

fn quote_identifier(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn row_to_rule(row: sqlx::sqlite::SqliteRow) -> RuleflowResult<Rule> {
    let status_str: String = row.get("status");
    let status = RuleStatus::from_db_str(&status_str).ok_or_else(|| {
        RuleflowError::PersistenceFailure(format!("unknown rule status '{status_str}' in database"))
    })?;
    Ok(Rule {
        id: row.get("id"),
        execution_id: row.get("execution_id"),
        rule_name: row.get("rule_name"),
        tool_identifier: row.get("tool_identifier"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        duration_ms: row.get("duration_ms"),
        status,
    })
}

fn row_to_file_descriptor(row: sqlx::sqlite::SqliteRow) -> RuleflowResult<FileDescriptor> {
    let role_str: String = row.get("role");
    let role = Role::from_db_str(&role_str)
        .ok_or_else(|| RuleflowError::PersistenceFailure(format!("unknown role '{role_str}' in database")))?;
    let path: String = row.get("path");
    Ok(FileDescriptor {
        id: row.get("id"),
        rule_id: row.get("rule_id"),
        name: row.get("name"),
        path: PathBuf::from(path),
        role,
        mtime_epoch_millis: row.get("mtime_epoch_millis"),
        size: row.get("size"),
        used_at: row.get("used_at"),
    })
}

fn row_to_table_descriptor(row: sqlx::sqlite::SqliteRow) -> RuleflowResult<TableDescriptor> {
    let role_str: String = row.get("role");
    let role = Role::from_db_str(&role_str)
        .ok_or_else(|| RuleflowError::PersistenceFailure(format!("unknown role '{role_str}' in database")))?;
    Ok(TableDescriptor {
        id: row.get("id"),
        rule_id: row.get("rule_id"),
        logical_name: row.get("logical_name"),
        physical_tablename: row.get("physical_tablename"),
        model_identifier: row.get("model_identifier"),
        role,
        used_at: row.get("used_at"),
    })
}
