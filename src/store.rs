//! Append-only performance store and scratch store.
//!
//! Both are SQLite files in WAL mode: any number of readers see rows as soon
//! as a writer commits, and concurrent writers queue on the busy timeout.

use crate::error::{FarmError, Result};
use crate::memory::humansize;
use rusqlite::{Connection, OpenFlags, OptionalExtension, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ops::{Bound, RangeBounds};
use std::path::Path;
use std::time::Duration;
use tracing::instrument;

/// Default timeout for SQLite busy handler (in seconds).
const DEFAULT_BUSY_TIMEOUT_SECS: u64 = 5;

/// Current schema version.
const SCHEMA_VERSION: u32 = 1;

/// Longest operation or task name stored, in bytes.
pub const MAX_NAME_BYTES: usize = 50;

/// Truncate to at most [`MAX_NAME_BYTES`] without splitting a character.
pub fn truncate_name(name: &str) -> &str {
    if name.len() <= MAX_NAME_BYTES {
        return name;
    }
    let mut end = MAX_NAME_BYTES;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Time and memory accumulated by one monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerfRecord {
    pub operation: String,
    pub time_sec: f64,
    pub memory_mb: f64,
    pub counts: i64,
    /// Task that produced the record, -1 outside of tasks.
    pub task_no: i16,
}

/// One completed task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskInfo {
    pub taskname: String,
    pub task_no: u32,
    pub weight: f32,
    pub duration: f32,
    /// Size of the serialized result in bytes.
    pub received: i64,
    pub mem_gb: f32,
}

/// Per-operation aggregate of the performance data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerfSummary {
    pub operation: String,
    pub time_sec: f64,
    pub memory_mb: f64,
    pub counts: i64,
}

fn check_not_dir(path: &Path) -> Result<()> {
    if path.is_dir() {
        return Err(FarmError::InvalidPath(format!(
            "'{}' is a directory, not a file. Expected a path like '{}/perf.db'",
            path.display(),
            path.display().to_string().trim_end_matches('/')
        )));
    }
    Ok(())
}

fn open_writer(path: &Path) -> Result<Connection> {
    check_not_dir(path)?;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(DEFAULT_BUSY_TIMEOUT_SECS))?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA wal_autocheckpoint = 1000;
        "#,
    )?;
    Ok(conn)
}

/// Telemetry written by monitors and Starmap.
pub struct PerfStore {
    conn: Connection,
}

impl PerfStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let store = Self {
            conn: open_writer(path.as_ref())?,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an existing store for reading while writers keep appending.
    pub fn open_readonly<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(FarmError::InvalidPath(format!(
                "no performance store at '{}'",
                path.display()
            )));
        }
        check_not_dir(path)?;
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        conn.busy_timeout(Duration::from_secs(DEFAULT_BUSY_TIMEOUT_SECS))?;
        Ok(Self { conn })
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS performance_data (
                id INTEGER PRIMARY KEY,
                operation TEXT NOT NULL,
                time_sec REAL NOT NULL,
                memory_mb REAL NOT NULL,
                counts INTEGER NOT NULL,
                task_no INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS task_info (
                id INTEGER PRIMARY KEY,
                taskname TEXT NOT NULL,
                task_no INTEGER NOT NULL,
                weight REAL NOT NULL,
                duration REAL NOT NULL,
                received INTEGER NOT NULL,
                mem_gb REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_task_info_name ON task_info(taskname);

            CREATE TABLE IF NOT EXISTS task_sent (
                id INTEGER PRIMARY KEY,
                info TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        )?;

        if self.get_meta("schema_version")?.is_none() {
            self.set_meta("schema_version", &SCHEMA_VERSION.to_string())?;
            self.set_meta("version", crate::version::full_version())?;
            self.set_meta("hostname", &crate::paths::hostname())?;
            self.set_meta("created_at", &chrono::Utc::now().to_rfc3339())?;
        }
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row("SELECT value FROM meta WHERE key = ?", [key], |row| {
                row.get(0)
            })
            .optional()?)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
            [key, value],
        )?;
        Ok(())
    }

    /// Append performance rows in one transaction.
    #[instrument(skip(self, records), fields(rows = records.len()))]
    pub fn append_perf(&self, records: &[PerfRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO performance_data (operation, time_sec, memory_mb, counts, task_no)
                 VALUES (?, ?, ?, ?, ?)",
            )?;
            for rec in records {
                stmt.execute(params![
                    truncate_name(&rec.operation),
                    rec.time_sec,
                    rec.memory_mb,
                    rec.counts,
                    rec.task_no,
                ])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    /// Append task rows in one transaction.
    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    pub fn append_task_info(&self, rows: &[TaskInfo]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO task_info (taskname, task_no, weight, duration, received, mem_gb)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )?;
            for row in rows {
                stmt.execute(params![
                    truncate_name(&row.taskname),
                    row.task_no,
                    f64::from(row.weight),
                    f64::from(row.duration),
                    row.received,
                    f64::from(row.mem_gb),
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    /// Record what a batch dispatched, for later diagnosis.
    pub fn append_task_sent(&self, info: &Value) -> Result<()> {
        self.conn.execute(
            "INSERT INTO task_sent (info, created_at) VALUES (?, ?)",
            params![info.to_string(), chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn performance_data(&self) -> Result<Vec<PerfRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT operation, time_sec, memory_mb, counts, task_no
             FROM performance_data ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PerfRecord {
                operation: row.get(0)?,
                time_sec: row.get(1)?,
                memory_mb: row.get(2)?,
                counts: row.get(3)?,
                task_no: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Task rows, optionally for a single task name, in insertion order.
    pub fn task_info(&self, name: Option<&str>) -> Result<Vec<TaskInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT taskname, task_no, weight, duration, received, mem_gb
             FROM task_info WHERE (?1 IS NULL OR taskname = ?1) ORDER BY id",
        )?;
        let rows = stmt.query_map(params![name], task_info_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Time, peak memory and counts per operation, slowest first.
    pub fn performance_view(&self) -> Result<Vec<PerfSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT operation, SUM(time_sec), MAX(memory_mb), SUM(counts)
             FROM performance_data GROUP BY operation ORDER BY SUM(time_sec) DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PerfSummary {
                operation: row.get(0)?,
                time_sec: row.get(1)?,
                memory_mb: row.get(2)?,
                counts: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Tasks lasting more than `factor` times the mean of their task name.
    pub fn slow_tasks(&self, name: Option<&str>, factor: f64) -> Result<Vec<TaskInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT t.taskname, t.task_no, t.weight, t.duration, t.received, t.mem_gb
             FROM task_info t
             WHERE (?1 IS NULL OR t.taskname = ?1)
               AND t.duration > ?2 * (SELECT AVG(s.duration) FROM task_info s
                                      WHERE s.taskname = t.taskname)
             ORDER BY t.duration DESC",
        )?;
        let rows = stmt.query_map(params![name, factor], task_info_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn task_sent(&self) -> Result<Vec<Value>> {
        let mut stmt = self
            .conn
            .prepare("SELECT info FROM task_sent ORDER BY id")?;
        let texts = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        texts
            .iter()
            .map(|t| Ok(serde_json::from_str(t)?))
            .collect()
    }

    /// Log the totals of the task_info rows of one task name.
    pub fn log_task_totals(&self, name: &str) -> Result<()> {
        let (count, received): (i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(received), 0) FROM task_info WHERE taskname = ?",
            [truncate_name(name)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        tracing::info!(
            task = name,
            tasks = count,
            "{} tasks stored, {} received",
            count,
            humansize(received.max(0) as u64)
        );
        Ok(())
    }
}

fn task_info_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskInfo> {
    Ok(TaskInfo {
        taskname: row.get(0)?,
        task_no: row.get(1)?,
        weight: row.get::<_, f64>(2)? as f32,
        duration: row.get::<_, f64>(3)? as f32,
        received: row.get(4)?,
        mem_gb: row.get::<_, f64>(5)? as f32,
    })
}

/// Staging area for large intermediate values.
///
/// Arrays are stored one row per element so a slice can be read back
/// without loading the whole value.
pub struct ScratchStore {
    conn: Connection,
}

impl ScratchStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = open_writer(path.as_ref())?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS scratch_keys (
                key TEXT PRIMARY KEY,
                len INTEGER NOT NULL,
                scalar INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS scratch_items (
                key TEXT NOT NULL,
                idx INTEGER NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (key, idx)
            );
            "#,
        )?;
        Ok(Self { conn })
    }

    /// Store `value` under `key` unless the key exists.
    ///
    /// Returns false, leaving the first value in place, if it does.
    pub fn save(&mut self, key: &str, value: &Value) -> Result<bool> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let (items, scalar) = match value {
            Value::Array(items) => (items.iter().collect::<Vec<_>>(), false),
            other => (vec![other], true),
        };
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO scratch_keys (key, len, scalar) VALUES (?, ?, ?)",
            params![key, items.len() as i64, scalar],
        )?;
        if inserted == 0 {
            return Ok(false);
        }
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO scratch_items (key, idx, value) VALUES (?, ?, ?)",
            )?;
            for (idx, item) in items.iter().enumerate() {
                stmt.execute(params![key, idx as i64, item.to_string()])?;
            }
        }
        tx.commit()?;
        Ok(true)
    }

    /// Read the elements of `key` within `range`; a non-array value is
    /// returned whole.
    pub fn read<R: RangeBounds<usize>>(&self, key: &str, range: R) -> Result<Value> {
        let scalar: Option<bool> = self
            .conn
            .query_row(
                "SELECT scalar FROM scratch_keys WHERE key = ?",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        let scalar = scalar.ok_or_else(|| FarmError::ScratchKey(key.to_string()))?;

        let start = match range.start_bound() {
            Bound::Included(&n) => n as i64,
            Bound::Excluded(&n) => n as i64 + 1,
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(&n) => n as i64 + 1,
            Bound::Excluded(&n) => n as i64,
            Bound::Unbounded => i64::MAX,
        };

        let mut stmt = self.conn.prepare(
            "SELECT value FROM scratch_items WHERE key = ? AND idx >= ? AND idx < ? ORDER BY idx",
        )?;
        let items = stmt
            .query_map(params![key, start, end], |row| row.get::<_, String>(0))?
            .map(|text| Ok(serde_json::from_str(&text?)?))
            .collect::<Result<Vec<Value>>>()?;

        if scalar {
            return Ok(items.into_iter().next().unwrap_or(Value::Null));
        }
        Ok(Value::Array(items))
    }
}
