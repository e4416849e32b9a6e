//! SQLite-backed persistence for the engine.
//!
//! One [`Store`] owns one `rusqlite::Connection`; every write serializes
//! through it. [`StoreHandle`] wraps the store behind `Arc<Mutex>` and runs
//! all access on tokio's blocking thread pool via `spawn_blocking`, so
//! synchronous SQLite I/O never ties up async worker threads.
//!
//! WAL journaling permits concurrent readers while writes serialize.
//! Read-then-write flows (intent acquisition, task updates) fetch all data
//! they need before opening their transaction.

mod audit;
mod cost_deltas;
mod events;
mod intents;
mod scorecards;
mod snapshots;
mod tasks;
mod workers;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;

use crate::errors::{EngineError, EngineResult};

/// Initial schema, created idempotently at startup.
const SCHEMA: &str = r#"
PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;
PRAGMA foreign_keys=ON;

CREATE TABLE IF NOT EXISTS tasks (
    task_id          TEXT PRIMARY KEY,
    current_phase    TEXT NOT NULL DEFAULT 'A',
    status           TEXT NOT NULL DEFAULT 'running',
    state_version    INTEGER NOT NULL DEFAULT 1,
    round            INTEGER NOT NULL DEFAULT 0,
    budget_used_usd  REAL NOT NULL DEFAULT 0.0,
    budget_cap_usd   REAL NOT NULL DEFAULT 0.0,
    last_event_seq   INTEGER NOT NULL DEFAULT 0,
    updated_at_unix  INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS workflow_events (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id      TEXT NOT NULL,
    seq_no       INTEGER NOT NULL,
    phase        TEXT NOT NULL,
    event_type   TEXT NOT NULL,
    payload_json TEXT NOT NULL DEFAULT '{}',
    created_at   INTEGER NOT NULL,
    UNIQUE(task_id, seq_no)
);
CREATE INDEX IF NOT EXISTS idx_events_task_seq ON workflow_events(task_id, seq_no);

CREATE TABLE IF NOT EXISTS phase_snapshots (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id       TEXT NOT NULL,
    phase         TEXT NOT NULL,
    round         INTEGER NOT NULL DEFAULT 0,
    snapshot_json TEXT NOT NULL DEFAULT '{}',
    checksum      TEXT NOT NULL DEFAULT '',
    created_at    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_snapshots_task_phase ON phase_snapshots(task_id, phase);

CREATE TABLE IF NOT EXISTS audit_records (
    id            TEXT PRIMARY KEY,
    task_id       TEXT NOT NULL,
    category      TEXT NOT NULL,
    actor         TEXT NOT NULL DEFAULT '',
    action        TEXT NOT NULL,
    request_json  TEXT NOT NULL DEFAULT '{}',
    decision_json TEXT NOT NULL DEFAULT '{}',
    severity      TEXT NOT NULL DEFAULT 'info',
    created_at    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_task ON audit_records(task_id);

CREATE TABLE IF NOT EXISTS intent_logs (
    intent_id    TEXT PRIMARY KEY,
    task_id      TEXT NOT NULL,
    worker_id    TEXT NOT NULL DEFAULT '',
    target_file  TEXT NOT NULL,
    operation    TEXT NOT NULL,
    status       TEXT NOT NULL DEFAULT 'pending',
    pre_hash     TEXT NOT NULL DEFAULT '',
    post_hash    TEXT NOT NULL DEFAULT '',
    payload_hash TEXT NOT NULL DEFAULT '',
    lease_until  INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_intents_task_status ON intent_logs(task_id, status);

CREATE TABLE IF NOT EXISTS workers (
    worker_id        TEXT PRIMARY KEY,
    task_id          TEXT NOT NULL,
    phase            TEXT NOT NULL,
    role             TEXT NOT NULL DEFAULT '',
    state            TEXT NOT NULL DEFAULT 'created',
    file_ownership   TEXT NOT NULL DEFAULT '[]',
    soft_timeout_sec INTEGER NOT NULL DEFAULT 300,
    hard_timeout_sec INTEGER NOT NULL DEFAULT 600,
    last_heartbeat   INTEGER NOT NULL DEFAULT 0,
    created_at_unix  INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_workers_task ON workers(task_id, state);

CREATE TABLE IF NOT EXISTS score_cards (
    review_id         TEXT PRIMARY KEY,
    task_id           TEXT NOT NULL,
    reviewer          TEXT NOT NULL,
    correctness       INTEGER NOT NULL DEFAULT 0,
    security          INTEGER NOT NULL DEFAULT 0,
    maintainability   INTEGER NOT NULL DEFAULT 0,
    cost              INTEGER NOT NULL DEFAULT 0,
    delivery_risk     INTEGER NOT NULL DEFAULT 0,
    issues_json       TEXT NOT NULL DEFAULT '[]',
    alternatives_json TEXT NOT NULL DEFAULT '[]',
    verdict           TEXT NOT NULL DEFAULT '',
    created_at        INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_score_cards_task ON score_cards(task_id);

CREATE TABLE IF NOT EXISTS cost_deltas (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id       TEXT NOT NULL,
    input_tokens  INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    amount_usd    REAL NOT NULL DEFAULT 0.0,
    provider      TEXT NOT NULL DEFAULT '',
    phase         TEXT NOT NULL DEFAULT '',
    created_at    INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_cost_deltas_task ON cost_deltas(task_id);
"#;

/// The single-writer relational store.
pub struct Store {
    pub(crate) conn: Connection,
}

impl Store {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path) -> EngineResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| EngineError::SchemaMigration(format!("open database: {e}")))?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))
            .map_err(|e| EngineError::SchemaMigration(format!("set busy timeout: {e}")))?;
        let store = Store { conn };
        store.migrate()?;
        Ok(store)
    }

    /// Open an in-memory database. Used by tests.
    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EngineError::SchemaMigration(format!("open in-memory database: {e}")))?;
        let store = Store { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> EngineResult<()> {
        self.conn
            .execute_batch(SCHEMA)
            .map_err(|e| EngineError::SchemaMigration(e.to_string()))
    }
}

/// True when a rusqlite error is a UNIQUE/PRIMARY KEY constraint violation.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Maps any other rusqlite error to the store-write taxonomy entry.
pub(crate) fn store_err(err: rusqlite::Error) -> EngineError {
    EngineError::StoreWrite(err.to_string())
}

/// Cloneable async handle to the store.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<Mutex<Store>>,
}

impl StoreHandle {
    pub fn new(store: Store) -> Self {
        StoreHandle {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    /// Run a closure against the store on a blocking thread. All data moved
    /// into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> EngineResult<R>
    where
        F: FnOnce(&mut Store) -> EngineResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = inner
                .lock()
                .map_err(|_| EngineError::StoreWrite("store lock poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| EngineError::StoreWrite(format!("store task panicked: {e}")))?
    }

    /// Acquire the store mutex synchronously. For startup initialization and
    /// tests only; never call from a hot async path.
    pub fn lock_sync(&self) -> EngineResult<MutexGuard<'_, Store>> {
        self.inner
            .lock()
            .map_err(|_| EngineError::StoreWrite("store lock poisoned".into()))
    }
}
