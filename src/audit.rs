//! # Audit Store
//!
//! ## Responsibility
//! Append-only SQLite log of request outcomes and worker lifecycle events.
//! Request bodies are not retained anywhere else after a response is
//! delivered, so this store is both the debugging aid and the only forensic
//! trail.
//!
//! ## Guarantees
//! - Append-only: no update or delete operations exist on either relation
//! - Concurrent-safe: writes are serialized by an internal lock
//! - Crash-consistent at entry granularity (losing the last entry is
//!   acceptable)
//!
//! ## NOT Responsible For
//! - Deciding whether a request succeeded (services set `status`)
//! - Retention/rotation (operator concern)

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Audit store errors.
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One row of the `requests` relation.
///
/// Written exactly once per handler invocation; redelivered messages may
/// produce duplicate rows for the same `req_id`, which is acceptable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestRecord {
    /// Unix timestamp (seconds, fractional) when handling started.
    pub ts: f64,
    pub trace_id: String,
    pub req_id: String,
    pub worker_id: String,
    /// Where the request entered: `nats.<subject>` or `http.<path>`.
    pub source: String,
    pub reply_to: String,
    pub raw_input: String,
    pub formatted_input: String,
    pub response_text: String,
    pub input_len: i64,
    pub params_json: String,
    pub grammar_used: String,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub duration_ms: f64,
    /// `ok`, `error`, or `panic`.
    pub status: String,
    pub error: String,
}

/// Append-only audit store backed by SQLite.
pub struct AuditStore {
    conn: Mutex<Connection>,
}

impl AuditStore {
    /// Open (or create) the audit database at `path`.
    ///
    /// Parent directories are created as needed. Failure here is a fatal
    /// startup condition for the worker.
    pub fn open(path: &str) -> Result<Self, AuditError> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self, AuditError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), AuditError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts REAL,
                level TEXT,
                code TEXT,
                msg TEXT,
                meta TEXT
            );
            CREATE TABLE IF NOT EXISTS requests(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts REAL,
                trace_id TEXT,
                req_id TEXT,
                worker_id TEXT,
                source TEXT,
                reply_to TEXT,
                raw_input TEXT,
                formatted_input TEXT,
                input_len INTEGER,
                params_json TEXT,
                grammar_used TEXT,
                response_text TEXT,
                tokens_in INTEGER,
                tokens_out INTEGER,
                duration_ms REAL,
                status TEXT,
                error TEXT
            );",
        )?;
        Ok(())
    }

    /// Append a lifecycle event. Failures are logged, never propagated:
    /// observability must not take down request handling.
    pub fn record_event(&self, level: &str, code: &str, msg: &str, meta: serde_json::Value) {
        let ts = crate::unix_timestamp_ms() as f64 / 1000.0;
        let meta_json = meta.to_string();
        let conn = self.conn.lock();
        if let Err(e) = conn.execute(
            "INSERT INTO events(ts, level, code, msg, meta) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![ts, level, code, msg, meta_json],
        ) {
            warn!(code = code, error = %e, "failed to record audit event");
        }
    }

    /// Append a request outcome. Failures are logged, never propagated.
    pub fn record_request(&self, rec: &RequestRecord) {
        let conn = self.conn.lock();
        if let Err(e) = conn.execute(
            "INSERT INTO requests(
                ts, trace_id, req_id, worker_id, source, reply_to,
                raw_input, formatted_input, input_len, params_json, grammar_used,
                response_text, tokens_in, tokens_out, duration_ms, status, error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                rec.ts,
                rec.trace_id,
                rec.req_id,
                rec.worker_id,
                rec.source,
                rec.reply_to,
                rec.raw_input,
                rec.formatted_input,
                rec.input_len,
                rec.params_json,
                rec.grammar_used,
                rec.response_text,
                rec.tokens_in,
                rec.tokens_out,
                rec.duration_ms,
                rec.status,
                rec.error,
            ],
        ) {
            warn!(req_id = %rec.req_id, error = %e, "failed to record audit request");
        }
    }

    /// Read back the most recent request rows, newest first.
    pub fn recent_requests(&self, limit: usize) -> Result<Vec<RequestRecord>, AuditError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT ts, trace_id, req_id, worker_id, source, reply_to,
                    raw_input, formatted_input, input_len, params_json, grammar_used,
                    response_text, tokens_in, tokens_out, duration_ms, status, error
             FROM requests ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(RequestRecord {
                ts: row.get(0)?,
                trace_id: row.get(1)?,
                req_id: row.get(2)?,
                worker_id: row.get(3)?,
                source: row.get(4)?,
                reply_to: row.get(5)?,
                raw_input: row.get(6)?,
                formatted_input: row.get(7)?,
                input_len: row.get(8)?,
                params_json: row.get(9)?,
                grammar_used: row.get(10)?,
                response_text: row.get(11)?,
                tokens_in: row.get(12)?,
                tokens_out: row.get(13)?,
                duration_ms: row.get(14)?,
                status: row.get(15)?,
                error: row.get(16)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Count request rows for a given `req_id` (test/diagnostic helper).
    pub fn count_requests(&self, req_id: &str) -> Result<i64, AuditError> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM requests WHERE req_id = ?1",
            params![req_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(req_id: &str) -> RequestRecord {
        RequestRecord {
            ts: 1_700_000_000.5,
            trace_id: format!("trace-{req_id}"),
            req_id: req_id.to_string(),
            worker_id: "worker-1-abcd1234".to_string(),
            source: "nats.inference.request.test".to_string(),
            reply_to: "x.reply".to_string(),
            raw_input: "2+2?".to_string(),
            formatted_input: "User: 2+2?\nAssistant: ".to_string(),
            response_text: "4".to_string(),
            input_len: 4,
            params_json: "{}".to_string(),
            grammar_used: "none".to_string(),
            tokens_in: 3,
            tokens_out: 1,
            duration_ms: 12.0,
            status: "ok".to_string(),
            error: String::new(),
        }
    }

    #[test]
    fn test_record_and_read_back_single_request() {
        let store = AuditStore::in_memory().unwrap();
        store.record_request(&sample_record("r1"));

        let rows = store.recent_requests(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].req_id, "r1");
        assert_eq!(rows[0].status, "ok");
        assert_eq!(rows[0].tokens_in, 3);
        assert_eq!(rows[0].grammar_used, "none");
    }

    #[test]
    fn test_recent_requests_newest_first() {
        let store = AuditStore::in_memory().unwrap();
        store.record_request(&sample_record("old"));
        store.record_request(&sample_record("new"));

        let rows = store.recent_requests(10).unwrap();
        assert_eq!(rows[0].req_id, "new");
        assert_eq!(rows[1].req_id, "old");
    }

    #[test]
    fn test_recent_requests_honours_limit() {
        let store = AuditStore::in_memory().unwrap();
        for i in 0..5 {
            store.record_request(&sample_record(&format!("r{i}")));
        }
        let rows = store.recent_requests(2).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_count_requests_counts_duplicates() {
        let store = AuditStore::in_memory().unwrap();
        store.record_request(&sample_record("dup"));
        store.record_request(&sample_record("dup"));
        assert_eq!(store.count_requests("dup").unwrap(), 2);
        assert_eq!(store.count_requests("absent").unwrap(), 0);
    }

    #[test]
    fn test_record_event_does_not_panic() {
        let store = AuditStore::in_memory().unwrap();
        store.record_event(
            "info",
            "startup",
            "worker starting",
            serde_json::json!({"model_name": "test"}),
        );
    }

    #[test]
    fn test_open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("audit.sqlite");
        let store = AuditStore::open(path.to_str().unwrap());
        assert!(store.is_ok());
        assert!(path.exists());
    }
}
