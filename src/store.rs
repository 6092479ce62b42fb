//! SQLite-backed system of record.
//!
//! Holds buffered history, discovery and autoregistration rows (each with a
//! monotonically increasing surrogate id), the per-stream checkpoints, host
//! availability and the remote task table.

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::{ProxyError, Result};
use crate::history::{CachedValue, HistoryValue, LogValue, Timespec, Value, ValueType};
use crate::protocol::{
    AutoRegistrationRecord, AvailabilityRecord, DiscoveryRecord, HistoryRecord, TaskRecord,
    TaskType,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS proxy_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    itemid INTEGER NOT NULL,
    clock INTEGER NOT NULL,
    ns INTEGER NOT NULL DEFAULT 0,
    value_type INTEGER NOT NULL,
    value TEXT NOT NULL,
    timestamp INTEGER NOT NULL DEFAULT 0,
    source TEXT NOT NULL DEFAULT '',
    severity INTEGER NOT NULL DEFAULT 0,
    logeventid INTEGER NOT NULL DEFAULT 0,
    state INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_proxy_history_item_clock ON proxy_history(itemid, clock);
CREATE INDEX IF NOT EXISTS idx_proxy_history_clock ON proxy_history(clock);

CREATE TABLE IF NOT EXISTS proxy_dhistory (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    clock INTEGER NOT NULL,
    druleid INTEGER NOT NULL,
    dcheckid INTEGER NOT NULL,
    ip TEXT NOT NULL,
    dns TEXT NOT NULL DEFAULT '',
    port INTEGER NOT NULL DEFAULT 0,
    value TEXT NOT NULL DEFAULT '',
    status INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_proxy_dhistory_clock ON proxy_dhistory(clock);

CREATE TABLE IF NOT EXISTS proxy_autoreg_host (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    clock INTEGER NOT NULL,
    host TEXT NOT NULL,
    listen_ip TEXT NOT NULL DEFAULT '',
    listen_dns TEXT NOT NULL DEFAULT '',
    listen_port INTEGER NOT NULL DEFAULT 0,
    host_metadata TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_proxy_autoreg_host_clock ON proxy_autoreg_host(clock);

CREATE TABLE IF NOT EXISTS checkpoints (
    stream TEXT PRIMARY KEY,
    lastid INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS host_availability (
    hostid INTEGER PRIMARY KEY,
    available INTEGER NOT NULL,
    error TEXT NOT NULL DEFAULT '',
    clock INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS task (
    taskid INTEGER PRIMARY KEY AUTOINCREMENT,
    parent_taskid INTEGER,
    type INTEGER NOT NULL,
    status INTEGER NOT NULL,
    clock INTEGER NOT NULL,
    ttl INTEGER NOT NULL DEFAULT 0,
    payload TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_task_parent ON task(parent_taskid);
";

/// Independently checkpointed data streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stream {
    History,
    Discovery,
    AutoRegistration,
}

impl Stream {
    pub const ALL: [Stream; 3] = [Stream::History, Stream::Discovery, Stream::AutoRegistration];

    /// Checkpoint key.
    pub fn name(self) -> &'static str {
        match self {
            Stream::History => "history",
            Stream::Discovery => "discovery",
            Stream::AutoRegistration => "autoregistration",
        }
    }

    /// Backing table.
    pub fn table(self) -> &'static str {
        match self {
            Stream::History => "proxy_history",
            Stream::Discovery => "proxy_dhistory",
            Stream::AutoRegistration => "proxy_autoreg_host",
        }
    }
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Remote task lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    New,
    Sent,
    Done,
    Expired,
}

impl TaskStatus {
    fn code(self) -> i64 {
        match self {
            TaskStatus::New => 1,
            TaskStatus::Sent => 2,
            TaskStatus::Done => 3,
            TaskStatus::Expired => 4,
        }
    }

    fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(TaskStatus::New),
            2 => Some(TaskStatus::Sent),
            3 => Some(TaskStatus::Done),
            4 => Some(TaskStatus::Expired),
            _ => None,
        }
    }
}

/// Cut-off parameters of one housekeeping delete.
#[derive(Debug, Clone, Copy)]
pub struct PurgeWindow {
    pub now: i64,
    pub offline_buffer_secs: i64,
    pub local_buffer_secs: i64,
    pub period_secs: i64,
    pub max_periods: i64,
}

/// Result of one stream purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeOutcome {
    pub deleted: usize,
    pub max_id: i64,
    pub min_clock: i64,
}

/// Result of one full housekeeping purge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeSummary {
    pub streams: Vec<(Stream, PurgeOutcome)>,
    pub tasks: usize,
}

impl PurgeSummary {
    pub fn deleted(&self, stream: Stream) -> usize {
        self.streams
            .iter()
            .find(|(s, _)| *s == stream)
            .map_or(0, |(_, o)| o.deleted)
    }
}

/// Connection wrapper; all access is serialized through one mutex.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Opens (and initialises) a database file.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ProxyError::Storage(format!("cannot create {}: {}", parent.display(), e)))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;
        info!("Opened database {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `f` with the raw connection (maintenance and tests).
    pub fn with_connection<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&Connection) -> R,
    {
        let conn = self.lock();
        f(&conn)
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    /// Inserts a batch of values in one transaction. Returns the assigned ids.
    pub fn insert_history(&self, values: &[HistoryValue]) -> Result<Vec<i64>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut ids = Vec::with_capacity(values.len());
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO proxy_history
                    (itemid, clock, ns, value_type, value, timestamp, source, severity, logeventid)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for hv in values {
                let (timestamp, source, severity, logeventid) = match &hv.value {
                    Value::Log(l) => (
                        l.timestamp,
                        l.source.clone().unwrap_or_default(),
                        l.severity,
                        l.logeventid,
                    ),
                    _ => (0, String::new(), 0, 0),
                };
                stmt.execute(params![
                    hv.itemid as i64,
                    hv.ts.sec,
                    hv.ts.ns,
                    hv.value.value_type().code(),
                    hv.value.as_text(),
                    timestamp,
                    source,
                    severity,
                    logeventid,
                ])?;
                ids.push(tx.last_insert_rowid());
            }
        }
        tx.commit()?;
        debug!("Inserted {} history rows", ids.len());
        Ok(ids)
    }

    /// History values of one item with `clock >= from`, ascending.
    pub fn history_since(&self, itemid: u64, from: i64) -> Result<Vec<CachedValue>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT clock, ns, value_type, value, timestamp, source, severity, logeventid
             FROM proxy_history WHERE itemid = ?1 AND clock >= ?2
             ORDER BY clock, ns, id",
        )?;
        let rows = stmt.query_map(params![itemid as i64, from], row_to_cached)?;
        collect_values(rows)
    }

    /// The newest `count` values of one item with `clock < before`, extended
    /// to every value sharing the oldest returned second. Ascending.
    pub fn history_last(
        &self,
        itemid: u64,
        count: usize,
        before: Option<i64>,
    ) -> Result<Vec<CachedValue>> {
        let before = before.unwrap_or(i64::MAX);
        let conn = self.lock();
        let mut values = {
            let mut stmt = conn.prepare_cached(
                "SELECT clock, ns, value_type, value, timestamp, source, severity, logeventid
                 FROM proxy_history WHERE itemid = ?1 AND clock < ?2
                 ORDER BY clock DESC, ns DESC, id DESC LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![itemid as i64, before, count as i64], row_to_cached)?;
            collect_values(rows)?
        };

        if values.len() == count && count > 0 {
            // Complete the oldest second so the cached range has no partial second.
            let oldest = values[values.len() - 1].ts;
            let mut stmt = conn.prepare_cached(
                "SELECT clock, ns, value_type, value, timestamp, source, severity, logeventid
                 FROM proxy_history WHERE itemid = ?1 AND clock = ?2
                 ORDER BY ns DESC, id DESC",
            )?;
            let rows = stmt.query_map(params![itemid as i64, oldest.sec], row_to_cached)?;
            let same_second = collect_values(rows)?;
            values.retain(|v| v.ts.sec != oldest.sec);
            values.extend(same_second);
        }

        values.reverse();
        Ok(values)
    }

    /// History rows after `after_id`, ordered by id.
    pub fn history_records(&self, after_id: i64, limit: usize) -> Result<Vec<HistoryRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, itemid, clock, ns, value_type, value, timestamp, source, severity, logeventid, state
             FROM proxy_history WHERE id > ?1 ORDER BY id LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![after_id, limit as i64], |row| {
            let value_type: i64 = row.get(4)?;
            let is_log = ValueType::from_code(value_type) == Some(ValueType::Log);
            let source: String = row.get(7)?;
            Ok(HistoryRecord {
                id: row.get(0)?,
                itemid: row.get::<_, i64>(1)? as u64,
                clock: row.get(2)?,
                ns: row.get(3)?,
                value: row.get(5)?,
                timestamp: if is_log { Some(row.get(6)?) } else { None },
                source: if is_log && !source.is_empty() {
                    Some(source)
                } else {
                    None
                },
                severity: if is_log { Some(row.get(8)?) } else { None },
                logeventid: if is_log { Some(row.get(9)?) } else { None },
                state: row.get(10)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ------------------------------------------------------------------
    // Discovery / autoregistration
    // ------------------------------------------------------------------

    pub fn insert_discovery(&self, rec: &DiscoveryRecord) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO proxy_dhistory (clock, druleid, dcheckid, ip, dns, port, value, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                rec.clock,
                rec.druleid as i64,
                rec.dcheckid as i64,
                rec.ip,
                rec.dns,
                rec.port,
                rec.value,
                rec.status
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn discovery_records(&self, after_id: i64, limit: usize) -> Result<Vec<DiscoveryRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, clock, druleid, dcheckid, ip, dns, port, value, status
             FROM proxy_dhistory WHERE id > ?1 ORDER BY id LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![after_id, limit as i64], |row| {
            Ok(DiscoveryRecord {
                id: row.get(0)?,
                clock: row.get(1)?,
                druleid: row.get::<_, i64>(2)? as u64,
                dcheckid: row.get::<_, i64>(3)? as u64,
                ip: row.get(4)?,
                dns: row.get(5)?,
                port: row.get(6)?,
                value: row.get(7)?,
                status: row.get(8)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn insert_autoregistration(&self, rec: &AutoRegistrationRecord) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO proxy_autoreg_host (clock, host, listen_ip, listen_dns, listen_port, host_metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![rec.clock, rec.host, rec.ip, rec.dns, rec.port, rec.host_metadata],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn autoregistration_records(
        &self,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<AutoRegistrationRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, clock, host, listen_ip, listen_dns, listen_port, host_metadata
             FROM proxy_autoreg_host WHERE id > ?1 ORDER BY id LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![after_id, limit as i64], |row| {
            Ok(AutoRegistrationRecord {
                id: row.get(0)?,
                clock: row.get(1)?,
                host: row.get(2)?,
                ip: row.get(3)?,
                dns: row.get(4)?,
                port: row.get(5)?,
                host_metadata: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Highest id currently stored for a stream (0 if empty).
    pub fn max_id(&self, stream: Stream) -> Result<i64> {
        let conn = self.lock();
        let sql = format!("SELECT COALESCE(MAX(id), 0) FROM {}", stream.table());
        Ok(conn.query_row(&sql, [], |row| row.get(0))?)
    }

    /// Number of rows currently stored for a stream.
    pub fn row_count(&self, stream: Stream) -> Result<i64> {
        let conn = self.lock();
        let sql = format!("SELECT COUNT(*) FROM {}", stream.table());
        Ok(conn.query_row(&sql, [], |row| row.get(0))?)
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    /// Last acknowledged id of a stream (0 if never advanced).
    pub fn checkpoint(&self, stream: Stream) -> Result<i64> {
        let conn = self.lock();
        read_checkpoint(&conn, stream)
    }

    /// Advances checkpoints and marks sent tasks in one transaction.
    pub fn commit_delivery(&self, checkpoints: &[(Stream, i64)], sent_tasks: &[i64]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for (stream, lastid) in checkpoints {
            tx.execute(
                "INSERT INTO checkpoints (stream, lastid) VALUES (?1, ?2)
                 ON CONFLICT(stream) DO UPDATE SET lastid = excluded.lastid",
                params![stream.name(), lastid],
            )?;
        }
        for taskid in sent_tasks {
            tx.execute(
                "UPDATE task SET status = ?1 WHERE taskid = ?2 AND status = ?3",
                params![TaskStatus::Sent.code(), taskid, TaskStatus::New.code()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Host availability
    // ------------------------------------------------------------------

    pub fn upsert_availability(&self, rec: &AvailabilityRecord, clock: i64) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO host_availability (hostid, available, error, clock) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(hostid) DO UPDATE SET available = excluded.available,
                error = excluded.error, clock = excluded.clock",
            params![rec.hostid as i64, rec.available, rec.error, clock],
        )?;
        Ok(())
    }

    pub fn availability(&self) -> Result<Vec<AvailabilityRecord>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare_cached("SELECT hostid, available, error FROM host_availability ORDER BY hostid")?;
        let rows = stmt.query_map([], |row| {
            Ok(AvailabilityRecord {
                hostid: row.get::<_, i64>(0)? as u64,
                available: row.get(1)?,
                error: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ------------------------------------------------------------------
    // Remote tasks
    // ------------------------------------------------------------------

    /// Creates a new task and returns its id.
    pub fn insert_task(
        &self,
        task_type: TaskType,
        parent_taskid: Option<i64>,
        clock: i64,
        ttl: i64,
        payload: &str,
    ) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO task (parent_taskid, type, status, clock, ttl, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                parent_taskid,
                i32::from(task_type),
                TaskStatus::New.code(),
                clock,
                ttl,
                payload
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Writes the result row answering `parent_taskid` and closes the parent.
    pub fn insert_task_result(&self, parent_taskid: i64, clock: i64, payload: &str) -> Result<i64> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let parent_type: Option<i32> = tx
            .query_row(
                "SELECT type FROM task WHERE taskid = ?1",
                params![parent_taskid],
                |row| row.get(0),
            )
            .optional()?;
        let parent_type = parent_type
            .ok_or_else(|| ProxyError::Storage(format!("task {} not found", parent_taskid)))?;
        let result_type = TaskType::try_from(parent_type)
            .ok()
            .and_then(TaskType::result_type)
            .ok_or_else(|| ProxyError::Storage(format!("task {} takes no result", parent_taskid)))?;

        tx.execute(
            "INSERT INTO task (parent_taskid, type, status, clock, ttl, payload)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![
                parent_taskid,
                i32::from(result_type),
                TaskStatus::New.code(),
                clock,
                payload
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE task SET status = ?1 WHERE taskid = ?2",
            params![TaskStatus::Done.code(), parent_taskid],
        )?;
        tx.commit()?;
        Ok(id)
    }

    /// Result row for a parent task, if it arrived.
    pub fn task_result(&self, parent_taskid: i64) -> Result<Option<TaskRecord>> {
        let conn = self.lock();
        let rec = conn
            .query_row(
                "SELECT taskid, parent_taskid, type, clock, ttl, payload FROM task
                 WHERE parent_taskid = ?1 ORDER BY taskid LIMIT 1",
                params![parent_taskid],
                row_to_task,
            )
            .optional()?;
        Ok(rec)
    }

    pub fn task_status(&self, taskid: i64) -> Result<Option<TaskStatus>> {
        let conn = self.lock();
        let code: Option<i64> = conn
            .query_row(
                "SELECT status FROM task WHERE taskid = ?1",
                params![taskid],
                |row| row.get(0),
            )
            .optional()?;
        Ok(code.and_then(TaskStatus::from_code))
    }

    /// Expires overdue tasks, then returns the outstanding ones to send.
    pub fn pending_tasks(&self, now: i64, limit: usize) -> Result<Vec<TaskRecord>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let expired = tx.execute(
            "UPDATE task SET status = ?1
             WHERE status IN (?2, ?3) AND ttl > 0 AND clock + ttl < ?4",
            params![
                TaskStatus::Expired.code(),
                TaskStatus::New.code(),
                TaskStatus::Sent.code(),
                now
            ],
        )?;
        if expired > 0 {
            debug!("Expired {} remote tasks", expired);
        }
        let tasks = {
            let mut stmt = tx.prepare_cached(
                "SELECT taskid, parent_taskid, type, clock, ttl, payload FROM task
                 WHERE status = ?1 ORDER BY taskid LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![TaskStatus::New.code(), limit as i64], row_to_task)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.commit()?;
        Ok(tasks)
    }

    /// Stores tasks received from the server. They are already known upstream,
    /// so they are recorded as `Sent` and only their results travel back.
    pub fn accept_server_tasks(&self, tasks: &[TaskRecord]) -> Result<usize> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for t in tasks {
            tx.execute(
                "INSERT OR IGNORE INTO task (taskid, parent_taskid, type, status, clock, ttl, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    t.taskid,
                    t.parent_taskid,
                    i32::from(t.task_type),
                    TaskStatus::Sent.code(),
                    t.clock,
                    t.ttl,
                    t.payload
                ],
            )?;
        }
        tx.commit()?;
        Ok(tasks.len())
    }

    // ------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------

    /// Purges every stream table and finished tasks older than
    /// `tasks_before` in one transaction. Any failure rolls back the lot.
    ///
    /// Rows qualify when `id < max_id` and either older than the offline
    /// buffer or both acknowledged and older than the local buffer. Both
    /// clock cut-offs are capped at `min_clock + max_periods * period`.
    pub fn purge_all(&self, window: &PurgeWindow, tasks_before: i64) -> Result<PurgeSummary> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut summary = PurgeSummary::default();
        for stream in Stream::ALL {
            let outcome = purge_in_tx(&tx, stream, window)?;
            summary.streams.push((stream, outcome));
        }
        summary.tasks = purge_tasks_in_tx(&tx, tasks_before)?;
        tx.commit()?;
        Ok(summary)
    }
}

/// Removes finished tasks older than `before`.
fn purge_tasks_in_tx(conn: &Connection, before: i64) -> Result<usize> {
    let n = conn.execute(
        "DELETE FROM task WHERE status IN (?1, ?2, ?3) AND clock < ?4",
        params![
            TaskStatus::Sent.code(),
            TaskStatus::Done.code(),
            TaskStatus::Expired.code(),
            before
        ],
    )?;
    Ok(n)
}

fn purge_in_tx(tx: &Transaction<'_>, stream: Stream, w: &PurgeWindow) -> Result<PurgeOutcome> {
    let table = stream.table();
    let lastid = read_checkpoint(tx, stream)?;

    let min_clock: Option<i64> =
        tx.query_row(&format!("SELECT MIN(clock) FROM {}", table), [], |row| row.get(0))?;
    let max_id: Option<i64> =
        tx.query_row(&format!("SELECT MAX(id) FROM {}", table), [], |row| row.get(0))?;

    let (Some(min_clock), Some(max_id)) = (min_clock, max_id) else {
        return Ok(PurgeOutcome::default());
    };

    let cap = min_clock.saturating_add(w.max_periods.saturating_mul(w.period_secs));
    let offline_cut = (w.now - w.offline_buffer_secs).min(cap);
    let local_cut = (w.now - w.local_buffer_secs).min(cap);

    let deleted = tx.execute(
        &format!(
            "DELETE FROM {} WHERE id < ?1 AND (clock < ?2 OR (id <= ?3 AND clock < ?4))",
            table
        ),
        params![max_id, offline_cut, lastid, local_cut],
    )?;

    Ok(PurgeOutcome {
        deleted,
        max_id,
        min_clock,
    })
}

fn read_checkpoint(conn: &Connection, stream: Stream) -> Result<i64> {
    let lastid: Option<i64> = conn
        .query_row(
            "SELECT lastid FROM checkpoints WHERE stream = ?1",
            params![stream.name()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(lastid.unwrap_or(0))
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    let code: i32 = row.get(2)?;
    let task_type = TaskType::try_from(code).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Integer,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })?;
    Ok(TaskRecord {
        taskid: row.get(0)?,
        parent_taskid: row.get(1)?,
        task_type,
        clock: row.get(3)?,
        ttl: row.get(4)?,
        payload: row.get(5)?,
    })
}

/// Raw history row before type decoding.
struct RawValue {
    ts: Timespec,
    value_type: i64,
    text: String,
    timestamp: i64,
    source: String,
    severity: i32,
    logeventid: i64,
}

fn row_to_cached(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawValue> {
    Ok(RawValue {
        ts: Timespec::new(row.get(0)?, row.get(1)?),
        value_type: row.get(2)?,
        text: row.get(3)?,
        timestamp: row.get(4)?,
        source: row.get(5)?,
        severity: row.get(6)?,
        logeventid: row.get(7)?,
    })
}

fn collect_values<I>(rows: I) -> Result<Vec<CachedValue>>
where
    I: Iterator<Item = rusqlite::Result<RawValue>>,
{
    let mut out = Vec::new();
    for row in rows {
        let raw = row?;
        let value_type = ValueType::from_code(raw.value_type).ok_or_else(|| {
            ProxyError::Storage(format!("unknown value type {}", raw.value_type))
        })?;
        let value = match value_type {
            ValueType::Log => Value::Log(LogValue {
                value: raw.text,
                timestamp: raw.timestamp,
                source: if raw.source.is_empty() {
                    None
                } else {
                    Some(raw.source)
                },
                severity: raw.severity,
                logeventid: raw.logeventid,
            }),
            vt => Value::parse(vt, &raw.text).ok_or_else(|| {
                ProxyError::Storage(format!("cannot parse stored value '{}'", raw.text))
            })?,
        };
        out.push(CachedValue { ts: raw.ts, value });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uint(itemid: u64, sec: i64, ns: i32, v: u64) -> HistoryValue {
        HistoryValue::new(itemid, Timespec::new(sec, ns), Value::Uint(v))
    }

    #[test]
    fn test_insert_and_read_history() {
        let store = Store::open_in_memory().unwrap();
        let ids = store
            .insert_history(&[uint(1, 100, 0, 1), uint(1, 101, 0, 2), uint(2, 100, 0, 3)])
            .unwrap();
        assert_eq!(ids, vec![1, 2, 3]);

        let values = store.history_since(1, 101).unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].value, Value::Uint(2));

        let records = store.history_records(1, 10).unwrap();
        assert_eq!(records.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(records[0].value, "2");
        assert!(records[0].timestamp.is_none());
    }

    #[test]
    fn test_history_last_completes_oldest_second() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_history(&[
                uint(1, 100, 1, 1),
                uint(1, 100, 2, 2),
                uint(1, 101, 0, 3),
                uint(1, 102, 0, 4),
            ])
            .unwrap();

        // Two newest are 102 and 101; nothing shares second 101.
        let last = store.history_last(1, 2, None).unwrap();
        assert_eq!(last.len(), 2);
        assert_eq!(last[0].ts.sec, 101);

        // Three newest end inside second 100, so all of second 100 is returned.
        let last = store.history_last(1, 3, None).unwrap();
        assert_eq!(last.len(), 4);
        assert_eq!(last[0].ts, Timespec::new(100, 1));
        assert_eq!(last[3].ts.sec, 102);

        let before = store.history_last(1, 10, Some(102)).unwrap();
        assert_eq!(before.len(), 3);
    }

    #[test]
    fn test_log_values_keep_metadata() {
        let store = Store::open_in_memory().unwrap();
        let log = Value::Log(LogValue {
            value: "disk full".into(),
            timestamp: 99,
            source: Some("kernel".into()),
            severity: 4,
            logeventid: 12,
        });
        store
            .insert_history(&[HistoryValue::new(5, Timespec::new(100, 0), log.clone())])
            .unwrap();

        let values = store.history_since(5, 0).unwrap();
        assert_eq!(values[0].value, log);

        let rec = &store.history_records(0, 1).unwrap()[0];
        assert_eq!(rec.source.as_deref(), Some("kernel"));
        assert_eq!(rec.severity, Some(4));
    }

    #[test]
    fn test_checkpoints_and_tasks_commit_together() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.checkpoint(Stream::History).unwrap(), 0);

        let parent = store.insert_task(TaskType::RemoteCommand, None, 100, 0, "uptime").unwrap();
        let result = store.insert_task_result(parent, 101, "up 3 days").unwrap();
        assert_eq!(store.task_status(parent).unwrap(), Some(TaskStatus::Done));

        let pending = store.pending_tasks(102, 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].taskid, result);
        assert_eq!(pending[0].parent_taskid, Some(parent));

        store
            .commit_delivery(&[(Stream::History, 42), (Stream::Discovery, 7)], &[result])
            .unwrap();
        assert_eq!(store.checkpoint(Stream::History).unwrap(), 42);
        assert_eq!(store.checkpoint(Stream::Discovery).unwrap(), 7);
        assert_eq!(store.task_status(result).unwrap(), Some(TaskStatus::Sent));
        assert!(store.pending_tasks(103, 10).unwrap().is_empty());
    }

    #[test]
    fn test_task_expiry() {
        let store = Store::open_in_memory().unwrap();
        let id = store.insert_task(TaskType::CheckNow, None, 100, 10, "").unwrap();
        assert_eq!(store.pending_tasks(105, 10).unwrap().len(), 1);
        assert!(store.pending_tasks(111, 10).unwrap().is_empty());
        assert_eq!(store.task_status(id).unwrap(), Some(TaskStatus::Expired));
    }

    #[test]
    fn test_server_tasks_are_not_echoed() {
        let store = Store::open_in_memory().unwrap();
        let task = TaskRecord {
            taskid: 500,
            parent_taskid: None,
            task_type: TaskType::RemoteCommand,
            clock: 100,
            ttl: 0,
            payload: "uptime".into(),
        };
        store.accept_server_tasks(&[task]).unwrap();
        assert!(store.pending_tasks(101, 10).unwrap().is_empty());

        store.insert_task_result(500, 102, "up").unwrap();
        let pending = store.pending_tasks(103, 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_type, TaskType::RemoteCommandResult);
    }

    #[test]
    fn test_result_requires_known_parent() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            store.insert_task_result(999, 0, "x"),
            Err(ProxyError::Storage(_))
        ));
        let check = store.insert_task(TaskType::CheckNow, None, 0, 0, "").unwrap();
        assert!(store.insert_task_result(check, 0, "x").is_err());
    }

    #[test]
    fn test_purge_empty_table_is_noop() {
        let store = Store::open_in_memory().unwrap();
        let window = PurgeWindow {
            now: 10_000,
            offline_buffer_secs: 3600,
            local_buffer_secs: 0,
            period_secs: 3600,
            max_periods: 4,
        };
        let summary = store.purge_all(&window, 0).unwrap();
        assert_eq!(summary.streams.len(), Stream::ALL.len());
        assert!(summary.streams.iter().all(|(_, o)| *o == PurgeOutcome::default()));
        assert_eq!(summary.tasks, 0);
    }

    #[test]
    fn test_availability_upsert() {
        let store = Store::open_in_memory().unwrap();
        let mut rec = AvailabilityRecord {
            hostid: 1,
            available: 1,
            error: String::new(),
        };
        store.upsert_availability(&rec, 100).unwrap();
        rec.available = 2;
        rec.error = "timeout".into();
        store.upsert_availability(&rec, 101).unwrap();

        let all = store.availability().unwrap();
        assert_eq!(all, vec![rec]);
    }
}
