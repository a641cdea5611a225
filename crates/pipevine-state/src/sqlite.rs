//! `SQLite`-backed implementation of [`StateStore`].
//!
//! Uses a single `Mutex<Connection>` for thread safety. Run saves are
//! wrapped in a transaction so readers never observe a run's new status
//! alongside stale task rows.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use pipevine_types::{PipelineRun, PluginResult, TaskExecution, Trigger};
use rusqlite::Connection;
use serde_json::Value;

use crate::error::{self, StateError};
use crate::store::StateStore;

/// Fixed-width UTC timestamp format; lexicographic order equals
/// chronological order.
const DATETIME_FMT: &str = "%Y-%m-%dT%H:%M:%S%.9fZ";

/// Idempotent DDL for the ledger and kv tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    pipeline_name TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    trigger_type TEXT NOT NULL,
    trigger_config TEXT NOT NULL,
    error_text TEXT
);

CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    task_id TEXT NOT NULL,
    task_name TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    result_output TEXT,
    result_error TEXT,
    result_metadata TEXT
);

CREATE INDEX IF NOT EXISTS idx_runs_pipeline_name ON runs (pipeline_name);
CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs (started_at);
CREATE INDEX IF NOT EXISTS idx_tasks_run_id ON tasks (run_id);
";

/// `SQLite`-backed state storage.
///
/// Create with [`SqliteStateStore::open`] for file-backed persistence or
/// [`SqliteStateStore::in_memory`] for tests.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Open or create a `SQLite` state database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the parent directory can't be created,
    /// or [`StateError::Sqlite`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Create an in-memory `SQLite` store (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Sqlite`] if the in-memory database can't be
    /// initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> error::Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    fn encode_ts(ts: &DateTime<Utc>) -> String {
        ts.format(DATETIME_FMT).to_string()
    }

    fn decode_ts(raw: &str) -> error::Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                StateError::Sqlite(rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                ))
            })
    }

    fn decode_opt_ts(raw: Option<String>) -> error::Result<Option<DateTime<Utc>>> {
        raw.as_deref().map(Self::decode_ts).transpose()
    }

    fn encode_json(value: &Value) -> error::Result<String> {
        Ok(serde_json::to_string(value)?)
    }

    fn task_rows(conn: &Connection, run_id: &str) -> error::Result<Vec<TaskExecution>> {
        let mut stmt = conn.prepare(
            "SELECT task_id, task_name, status, started_at, completed_at, attempts, \
             result_output, result_error, result_metadata \
             FROM tasks WHERE run_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([run_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, u32>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<String>>(8)?,
            ))
        })?;

        let mut tasks = Vec::new();
        for row in rows {
            let (task_id, task_name, status, started, completed, attempts, output, err, meta) =
                row?;
            let output = output
                .as_deref()
                .map(serde_json::from_str::<Value>)
                .transpose()?;
            let metadata = meta
                .as_deref()
                .map(serde_json::from_str::<Value>)
                .transpose()?;
            let result = if output.is_some() || err.is_some() || metadata.is_some() {
                Some(PluginResult {
                    success: status == "success",
                    output,
                    error: err,
                    metadata,
                })
            } else {
                None
            };
            tasks.push(TaskExecution {
                task_id,
                task_name,
                status: status.parse().map_err(invalid_enum)?,
                started_at: Self::decode_opt_ts(started)?,
                completed_at: Self::decode_opt_ts(completed)?,
                attempts,
                result,
            });
        }
        Ok(tasks)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_from_row(
        conn: &Connection,
        id: String,
        pipeline_name: String,
        status: String,
        started_at: String,
        completed_at: Option<String>,
        trigger_config: String,
        error_text: Option<String>,
    ) -> error::Result<PipelineRun> {
        let trigger: Trigger = serde_json::from_str(&trigger_config)?;
        let tasks = Self::task_rows(conn, &id)?;
        Ok(PipelineRun {
            id,
            pipeline_name,
            status: status.parse().map_err(invalid_enum)?,
            started_at: Self::decode_ts(&started_at)?,
            completed_at: Self::decode_opt_ts(completed_at)?,
            tasks,
            trigger,
            error: error_text,
        })
    }
}

fn invalid_enum(msg: String) -> StateError {
    StateError::Sqlite(rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        msg.into(),
    ))
}

impl StateStore for SqliteStateStore {
    fn get(&self, key: &str) -> error::Result<Option<Value>> {
        let conn = self.lock_conn()?;
        let raw: Option<String> = match conn.query_row(
            "SELECT value FROM kv WHERE key = ?1",
            [key],
            |row| row.get(0),
        ) {
            Ok(value) => Some(value),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };
        raw.as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(Into::into)
    }

    fn set(&self, key: &str, value: &Value) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            rusqlite::params![key, Self::encode_json(value)?, Self::encode_ts(&Utc::now())],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> error::Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT key FROM kv WHERE key LIKE ?1 || '%' ORDER BY key")?;
        let keys = stmt
            .query_map([prefix], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    fn save_pipeline_run(&self, run: &PipelineRun) -> error::Result<()> {
        let conn = self.lock_conn()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO runs \
             (id, pipeline_name, status, started_at, completed_at, trigger_type, trigger_config, error_text) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(id) DO UPDATE SET \
             status = ?3, completed_at = ?5, error_text = ?8",
            rusqlite::params![
                run.id,
                run.pipeline_name,
                run.status.as_str(),
                Self::encode_ts(&run.started_at),
                run.completed_at.as_ref().map(Self::encode_ts),
                run.trigger.kind(),
                serde_json::to_string(&run.trigger)?,
                run.error,
            ],
        )?;
        tx.execute("DELETE FROM tasks WHERE run_id = ?1", [&run.id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO tasks \
                 (run_id, task_id, task_name, status, started_at, completed_at, attempts, \
                  result_output, result_error, result_metadata) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for task in &run.tasks {
                let (output, err, meta) = match &task.result {
                    Some(result) => (
                        result
                            .output
                            .as_ref()
                            .map(Self::encode_json)
                            .transpose()?,
                        result.error.clone(),
                        result
                            .metadata
                            .as_ref()
                            .map(Self::encode_json)
                            .transpose()?,
                    ),
                    None => (None, None, None),
                };
                stmt.execute(rusqlite::params![
                    run.id,
                    task.task_id,
                    task.task_name,
                    task.status.as_str(),
                    task.started_at.as_ref().map(Self::encode_ts),
                    task.completed_at.as_ref().map(Self::encode_ts),
                    task.attempts,
                    output,
                    err,
                    meta,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn get_pipeline_run(&self, id: &str) -> error::Result<Option<PipelineRun>> {
        let conn = self.lock_conn()?;
        let row = match conn.query_row(
            "SELECT id, pipeline_name, status, started_at, completed_at, trigger_config, error_text \
             FROM runs WHERE id = ?1",
            [id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            },
        ) {
            Ok(row) => row,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let (id, name, status, started, completed, trigger, error) = row;
        Self::run_from_row(&conn, id, name, status, started, completed, trigger, error).map(Some)
    }

    fn get_pipeline_runs(
        &self,
        pipeline_name: &str,
        limit: usize,
    ) -> error::Result<Vec<PipelineRun>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, pipeline_name, status, started_at, completed_at, trigger_config, error_text \
             FROM runs WHERE pipeline_name = ?1 ORDER BY started_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(
                rusqlite::params![pipeline_name, limit as i64],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<String>>(6)?,
                    ))
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        let mut runs = Vec::with_capacity(rows.len());
        for (id, name, status, started, completed, trigger, error) in rows {
            runs.push(Self::run_from_row(
                &conn, id, name, status, started, completed, trigger, error,
            )?);
        }
        Ok(runs)
    }

    fn cleanup_old_runs(&self, retention_days: u32) -> error::Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let conn = self.lock_conn()?;
        let deleted = conn.execute(
            "DELETE FROM runs WHERE started_at < ?1",
            [Self::encode_ts(&cutoff)],
        )?;
        Ok(deleted as u64)
    }
}
