//! Embedded log storage on SQLite
//!
//! One writer, many readers. The batcher's writer thread is the only code
//! path that inserts; queries go through a small r2d2 pool of read
//! connections, which WAL mode allows to run concurrently with the writer.
//!
//! # Architecture
//!
//! ```text
//! Batcher writer thread ──→ Store::insert_batch ──→ logs (+ FTS triggers)
//! Gateway / API         ──→ Store::search et al ──→ r2d2 reader pool
//! ```
//!
//! # Schema hard reset
//!
//! There is no migration ladder. `open` hashes the schema SQL and compares
//! it against the signature recorded in the database; on mismatch the
//! store file (and its WAL sidecars) is deleted and recreated. The store
//! is a tail-log, not a system of record, so this trades old data for
//! zero migration code. The reset is logged as a distinguished warning.

mod query;

pub use query::{SearchMode, SearchQuery, DEFAULT_LIMIT, MAX_LIMIT};

use crate::record::LogRecord;
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, ErrorCode, OpenFlags};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Tunables applied at open time. WAL is on unless configuration says
/// otherwise; the remaining pragmas are fixed.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub wal_enabled: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self { wal_enabled: true }
    }
}

/// Errors surfaced by store operations.
#[derive(Debug)]
pub enum StoreError {
    /// Transient condition (lock timeout, I/O blip); safe to retry.
    Retryable(String),
    /// Constraint violation or corruption; `index` identifies the
    /// offending row of the batch that produced it (0 for non-batch ops).
    Permanent { index: usize, message: String },
    /// The structured-data predicate cannot be translated to SQL.
    UnsupportedPredicate(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Retryable(msg) => write!(f, "retryable store error: {msg}"),
            StoreError::Permanent { index, message } => {
                write!(f, "permanent store error at row {index}: {message}")
            }
            StoreError::UnsupportedPredicate(expr) => {
                write!(f, "unsupported structured-data predicate: {expr:?}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// Map a rusqlite failure onto the retryable/permanent split. Busy and
/// locked are WAL contention; I/O failures are worth one more attempt.
fn classify(err: rusqlite::Error, index: usize) -> StoreError {
    if let rusqlite::Error::SqliteFailure(code, _) = &err {
        match code.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::SystemIoFailure => {
                return StoreError::Retryable(err.to_string());
            }
            _ => {}
        }
    }
    StoreError::Permanent {
        index,
        message: err.to_string(),
    }
}

/// Fixed-width RFC3339 (UTC, microseconds) so text ordering is
/// chronological and range predicates can use the btree index.
pub(crate) fn format_ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Logical schema. Changing anything here changes the signature and
/// triggers the hard reset on the next open.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    priority INTEGER NOT NULL CHECK (priority BETWEEN 0 AND 191),
    facility INTEGER NOT NULL,
    severity INTEGER NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    timestamp TEXT NOT NULL,
    hostname TEXT NOT NULL DEFAULT '',
    app_name TEXT NOT NULL DEFAULT '',
    proc_id TEXT NOT NULL DEFAULT '',
    msg_id TEXT NOT NULL DEFAULT '',
    structured_data TEXT NOT NULL DEFAULT '{}',
    message TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);
CREATE INDEX IF NOT EXISTS idx_logs_facility ON logs(facility);
CREATE INDEX IF NOT EXISTS idx_logs_severity ON logs(severity);
CREATE INDEX IF NOT EXISTS idx_logs_hostname ON logs(hostname);
CREATE INDEX IF NOT EXISTS idx_logs_app_name ON logs(app_name);
CREATE INDEX IF NOT EXISTS idx_logs_proc_id ON logs(proc_id);
CREATE INDEX IF NOT EXISTS idx_logs_msg_id ON logs(msg_id);
CREATE INDEX IF NOT EXISTS idx_logs_priority ON logs(priority);
CREATE INDEX IF NOT EXISTS idx_logs_created_at ON logs(created_at);
CREATE INDEX IF NOT EXISTS idx_logs_facility_severity ON logs(facility, severity);
CREATE INDEX IF NOT EXISTS idx_logs_hostname_app ON logs(hostname, app_name);
CREATE INDEX IF NOT EXISTS idx_logs_timestamp_severity ON logs(timestamp, severity);

-- Full-text search over message (external content mode: the text lives
-- once in logs, the FTS table only indexes it, keyed by id)
CREATE VIRTUAL TABLE IF NOT EXISTS logs_fts USING fts5(
    message,
    content=logs,
    content_rowid=id,
    tokenize='porter unicode61'
);

-- Sync triggers keep logs_fts consistent with the base table. They fire
-- per row inside the same transaction, so batched deletes cannot leave
-- dangling index entries.
CREATE TRIGGER IF NOT EXISTS logs_fts_insert AFTER INSERT ON logs BEGIN
    INSERT INTO logs_fts(rowid, message) VALUES (new.id, new.message);
END;
CREATE TRIGGER IF NOT EXISTS logs_fts_delete AFTER DELETE ON logs BEGIN
    INSERT INTO logs_fts(logs_fts, rowid, message) VALUES ('delete', old.id, old.message);
END;
CREATE TRIGGER IF NOT EXISTS logs_fts_update AFTER UPDATE OF message ON logs BEGIN
    INSERT INTO logs_fts(logs_fts, rowid, message) VALUES ('delete', old.id, old.message);
    INSERT INTO logs_fts(rowid, message) VALUES (new.id, new.message);
END;

CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT
);
"#;

const INSERT_SQL: &str = "INSERT INTO logs \
    (priority, facility, severity, version, timestamp, hostname, app_name, \
     proc_id, msg_id, structured_data, message, created_at) \
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)";

/// Hex SHA-256 of the schema SQL; stored in metadata on create and
/// compared on every open.
fn schema_signature() -> String {
    let digest = Sha256::digest(SCHEMA_SQL.as_bytes());
    format!("{digest:x}")
}

/// Number of read connections; WAL allows them alongside the one writer.
const READ_POOL_SIZE: u32 = 4;

pub struct Store {
    path: PathBuf,
    writer: Mutex<Connection>,
    readers: Pool<SqliteConnectionManager>,
}

impl Store {
    /// Open (or create) the store at `path`, hard-resetting it if the
    /// recorded schema signature does not match this build's schema.
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating store directory {}", parent.display()))?;
        }

        let expected = schema_signature();
        if path.exists() {
            match read_signature(&path) {
                Some(found) if found == expected => {
                    tracing::debug!("store schema signature matches, reusing {}", path.display());
                }
                found => {
                    // Distinguished event: the operator must be able to see
                    // that data was discarded, and why.
                    tracing::warn!(
                        path = %path.display(),
                        found = found.as_deref().unwrap_or("<none>"),
                        "store schema signature mismatch, deleting and recreating the store"
                    );
                    remove_store_files(&path)?;
                }
            }
        }

        let writer = Connection::open(&path)
            .with_context(|| format!("opening store {}", path.display()))?;

        let journal_mode = if options.wal_enabled { "WAL" } else { "DELETE" };
        writer
            .execute_batch(&format!(
                "PRAGMA journal_mode={journal_mode};\n\
                 PRAGMA synchronous=NORMAL;\n\
                 PRAGMA busy_timeout=5000;\n\
                 PRAGMA wal_autocheckpoint=1000;\n\
                 PRAGMA cache_size=-64000;"
            ))
            .context("applying store pragmas")?;

        writer
            .execute_batch(SCHEMA_SQL)
            .context("creating store schema")?;
        writer
            .execute(
                "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_signature', ?1)",
                params![expected],
            )
            .context("recording schema signature")?;

        let manager = SqliteConnectionManager::file(&path)
            .with_init(|conn| conn.execute_batch("PRAGMA busy_timeout=5000;"));
        let readers = Pool::builder()
            .max_size(READ_POOL_SIZE)
            .build(manager)
            .context("building reader pool")?;

        // Verify the read path before declaring the store open
        readers
            .get()
            .context("checking out a reader connection")?
            .query_row("SELECT 1", [], |_| Ok(()))
            .context("probing reader connection")?;

        tracing::info!("store open at {} (journal={})", path.display(), journal_mode);

        Ok(Self {
            path,
            writer: Mutex::new(writer),
            readers,
        })
    }

    #[allow(dead_code)] // Reserved for admin/introspection surfaces
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_conn(&self) -> MutexGuard<'_, Connection> {
        // Recover the connection if a previous holder panicked; SQLite's
        // transaction state is rolled back on its own.
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn read_conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StoreError> {
        self.readers
            .get()
            .map_err(|e| StoreError::Retryable(e.to_string()))
    }

    /// Insert every record in one transaction. Either all rows commit and
    /// their assigned ids come back in input order, or none do.
    pub fn insert_batch<'a, I>(&self, records: I) -> Result<Vec<i64>, StoreError>
    where
        I: IntoIterator<Item = &'a LogRecord>,
    {
        let conn = self.write_conn();
        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| classify(e, 0))?;

        match insert_all(&conn, records) {
            Ok(ids) => match conn.execute_batch("COMMIT") {
                Ok(()) => Ok(ids),
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    Err(classify(e, 0))
                }
            },
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Delete records whose commit instant is older than the retention
    /// window. `retention_days == 0` disables cleanup. The FTS sync
    /// triggers prune the index rows inside the same transaction.
    pub fn cleanup(&self, retention_days: u32) -> Result<u64, StoreError> {
        if retention_days == 0 {
            return Ok(0);
        }
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let conn = self.write_conn();
        let deleted = conn
            .execute(
                "DELETE FROM logs WHERE created_at < ?1",
                params![format_ts(&cutoff)],
            )
            .map_err(|e| classify(e, 0))? as u64;
        if deleted > 0 {
            tracing::info!(
                "retention cleanup: deleted {} records older than {} days",
                deleted,
                retention_days
            );
        }
        Ok(deleted)
    }

    /// Hold the writer connection hostage so tests can observe the queue
    /// backing up behind a stalled flush.
    #[cfg(test)]
    pub(crate) fn block_writes_for_test(&self) -> MutexGuard<'_, Connection> {
        self.write_conn()
    }

    /// Total committed records; used by the health probe.
    pub fn count(&self) -> Result<i64, StoreError> {
        let conn = self.read_conn()?;
        conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
            .map_err(|e| classify(e, 0))
    }
}

fn insert_all<'a, I>(conn: &Connection, records: I) -> Result<Vec<i64>, StoreError>
where
    I: IntoIterator<Item = &'a LogRecord>,
{
    let created_at = format_ts(&Utc::now());
    let mut stmt = conn
        .prepare_cached(INSERT_SQL)
        .map_err(|e| classify(e, 0))?;
    let mut ids = Vec::new();
    for (index, record) in records.into_iter().enumerate() {
        stmt.execute(params![
            record.priority,
            record.facility,
            record.severity,
            record.version,
            format_ts(&record.timestamp),
            record.hostname,
            record.app_name,
            record.proc_id,
            record.msg_id,
            record.structured_data.to_canonical_json(),
            record.message,
            created_at,
        ])
        .map_err(|e| classify(e, index))?;
        ids.push(conn.last_insert_rowid());
    }
    Ok(ids)
}

fn read_signature(path: &Path) -> Option<String> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY).ok()?;
    conn.query_row(
        "SELECT value FROM metadata WHERE key = 'schema_signature'",
        [],
        |row| row.get(0),
    )
    .ok()
}

fn remove_store_files(path: &Path) -> Result<()> {
    std::fs::remove_file(path)
        .with_context(|| format!("removing stale store {}", path.display()))?;
    // WAL sidecars, if the previous run left them behind
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(suffix);
        let sidecar = PathBuf::from(sidecar);
        if sidecar.exists() {
            let _ = std::fs::remove_file(&sidecar);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;

    fn open_temp() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("logs.db"), StoreOptions::default()).unwrap();
        (dir, store)
    }

    fn sample(n: usize) -> Vec<LogRecord> {
        (0..n)
            .map(|i| {
                parser::parse(&format!(
                    "<165>1 2023-10-15T14:30:{:02}Z web01 nginx 1234 access - request {i}",
                    i % 60
                ))
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_insert_batch_assigns_increasing_ids() {
        let (_dir, store) = open_temp();
        let records = sample(5);
        let ids = store.insert_batch(&records).unwrap();
        assert_eq!(ids.len(), 5);
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1], "ids must be strictly increasing");
        }

        let more = store.insert_batch(&sample(3)).unwrap();
        assert!(more[0] > ids[4], "ids keep increasing across batches");
    }

    #[test]
    fn test_empty_batch_is_a_noop() {
        let (_dir, store) = open_temp();
        let ids = store.insert_batch(&Vec::<LogRecord>::new()).unwrap();
        assert!(ids.is_empty());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_batch_is_atomic_on_constraint_violation() {
        let (_dir, store) = open_temp();
        let mut records = sample(3);
        records[1].priority = 200; // violates the CHECK constraint

        let err = store.insert_batch(&records).unwrap_err();
        match err {
            StoreError::Permanent { index, .. } => assert_eq!(index, 1),
            other => panic!("expected permanent error, got {other}"),
        }

        // No row from the failed batch is visible
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_schema_signature_mismatch_resets_store() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("logs.db");

        {
            let store = Store::open(&db, StoreOptions::default()).unwrap();
            store.insert_batch(&sample(4)).unwrap();
            assert_eq!(store.count().unwrap(), 4);
        }

        // Simulate an older build's schema
        {
            let conn = Connection::open(&db).unwrap();
            conn.execute(
                "UPDATE metadata SET value = 'stale' WHERE key = 'schema_signature'",
                [],
            )
            .unwrap();
        }

        let store = Store::open(&db, StoreOptions::default()).unwrap();
        assert_eq!(store.count().unwrap(), 0, "store must be recreated empty");
    }

    #[test]
    fn test_matching_signature_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("logs.db");

        {
            let store = Store::open(&db, StoreOptions::default()).unwrap();
            store.insert_batch(&sample(4)).unwrap();
        }
        let store = Store::open(&db, StoreOptions::default()).unwrap();
        assert_eq!(store.count().unwrap(), 4);
    }

    #[test]
    fn test_cleanup_prunes_rows_and_fts_index() {
        let (_dir, store) = open_temp();
        store.insert_batch(&sample(6)).unwrap();

        // Nothing old enough yet
        assert_eq!(store.cleanup(7).unwrap(), 0);
        // Retention disabled
        assert_eq!(store.cleanup(0).unwrap(), 0);

        // Backdate everything past the window
        {
            let conn = store.write_conn();
            conn.execute(
                "UPDATE logs SET created_at = '2020-01-01T00:00:00.000000Z'",
                [],
            )
            .unwrap();
        }
        assert_eq!(store.cleanup(7).unwrap(), 6);
        assert_eq!(store.count().unwrap(), 0);

        // The FTS sidecar holds no dangling entries
        let conn = store.read_conn().unwrap();
        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM logs_fts WHERE logs_fts MATCH 'request'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 0);
    }
}
