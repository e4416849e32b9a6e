//! Worker record persistence. File ownership is stored as a JSON array.

use rusqlite::{params, Row};

use super::{store_err, Store};
use crate::domain::{Phase, WorkerRef, WorkerState};
use crate::errors::{EngineError, EngineResult};

const WORKER_COLUMNS: &str = "worker_id, task_id, phase, role, state, file_ownership, soft_timeout_sec, hard_timeout_sec, last_heartbeat, created_at_unix";

fn scan_worker(row: &Row<'_>) -> rusqlite::Result<(WorkerRef, String, String, String)> {
    let phase: String = row.get(2)?;
    let state: String = row.get(4)?;
    let ownership_json: String = row.get(5)?;
    let worker = WorkerRef {
        worker_id: row.get(0)?,
        task_id: row.get(1)?,
        phase: Phase::A,
        role: row.get(3)?,
        state: WorkerState::Created,
        file_ownership: Vec::new(),
        soft_timeout_sec: row.get(6)?,
        hard_timeout_sec: row.get(7)?,
        last_heartbeat: row.get(8)?,
        created_at_unix: row.get(9)?,
    };
    Ok((worker, phase, state, ownership_json))
}

fn decode_worker(
    mut worker: WorkerRef,
    phase: String,
    state: String,
    ownership_json: String,
) -> EngineResult<WorkerRef> {
    worker.phase = Phase::parse(&phase)
        .ok_or_else(|| EngineError::StoreWrite(format!("unknown phase value: {phase}")))?;
    worker.state = WorkerState::parse(&state)
        .ok_or_else(|| EngineError::StoreWrite(format!("unknown worker state: {state}")))?;
    worker.file_ownership = serde_json::from_str(&ownership_json)
        .map_err(|e| EngineError::StoreWrite(format!("decode file_ownership: {e}")))?;
    Ok(worker)
}

impl Store {
    /// Insert a new worker record.
    pub fn create_worker(&self, worker: &WorkerRef) -> EngineResult<()> {
        let ownership = serde_json::to_string(&worker.file_ownership)
            .map_err(|e| EngineError::StoreWrite(format!("encode file_ownership: {e}")))?;
        self.conn
            .execute(
                "INSERT INTO workers (worker_id, task_id, phase, role, state, file_ownership, soft_timeout_sec, hard_timeout_sec, last_heartbeat, created_at_unix)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    worker.worker_id,
                    worker.task_id,
                    worker.phase.as_str(),
                    worker.role,
                    worker.state.as_str(),
                    ownership,
                    worker.soft_timeout_sec,
                    worker.hard_timeout_sec,
                    worker.last_heartbeat,
                    worker.created_at_unix,
                ],
            )
            .map_err(store_err)?;
        Ok(())
    }

    /// Retrieve a worker by id, or `worker_not_found`.
    pub fn get_worker(&self, worker_id: &str) -> EngineResult<WorkerRef> {
        let res = self.conn.query_row(
            &format!("SELECT {WORKER_COLUMNS} FROM workers WHERE worker_id = ?1"),
            params![worker_id],
            scan_worker,
        );
        match res {
            Ok((worker, phase, state, ownership)) => decode_worker(worker, phase, state, ownership),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                Err(EngineError::WorkerNotFound(worker_id.to_string()))
            }
            Err(e) => Err(store_err(e)),
        }
    }

    /// Change the state of a worker, or `worker_not_found`.
    pub fn update_worker_state(&self, worker_id: &str, state: WorkerState) -> EngineResult<()> {
        let n = self
            .conn
            .execute(
                "UPDATE workers SET state = ?1 WHERE worker_id = ?2",
                params![state.as_str(), worker_id],
            )
            .map_err(store_err)?;
        if n == 0 {
            return Err(EngineError::WorkerNotFound(worker_id.to_string()));
        }
        Ok(())
    }

    /// Refresh a worker's heartbeat timestamp, or `worker_not_found`.
    pub fn update_worker_heartbeat(&self, worker_id: &str, ts: i64) -> EngineResult<()> {
        let n = self
            .conn
            .execute(
                "UPDATE workers SET last_heartbeat = ?1 WHERE worker_id = ?2",
                params![ts, worker_id],
            )
            .map_err(store_err)?;
        if n == 0 {
            return Err(EngineError::WorkerNotFound(worker_id.to_string()));
        }
        Ok(())
    }

    fn query_workers(&self, sql: &str, task_id: &str) -> EngineResult<Vec<WorkerRef>> {
        let mut stmt = self.conn.prepare(sql).map_err(store_err)?;
        let rows = stmt
            .query_map(params![task_id], scan_worker)
            .map_err(store_err)?;
        let mut workers = Vec::new();
        for row in rows {
            let (worker, phase, state, ownership) = row.map_err(store_err)?;
            workers.push(decode_worker(worker, phase, state, ownership)?);
        }
        Ok(workers)
    }

    /// Workers in `created` or `running` state for a task.
    pub fn list_active_workers(&self, task_id: &str) -> EngineResult<Vec<WorkerRef>> {
        self.query_workers(
            &format!(
                "SELECT {WORKER_COLUMNS} FROM workers
                 WHERE task_id = ?1 AND state IN ('created', 'running')
                 ORDER BY created_at_unix ASC"
            ),
            task_id,
        )
    }

    /// All workers for a task regardless of state.
    pub fn list_workers(&self, task_id: &str) -> EngineResult<Vec<WorkerRef>> {
        self.query_workers(
            &format!(
                "SELECT {WORKER_COLUMNS} FROM workers
                 WHERE task_id = ?1
                 ORDER BY created_at_unix ASC"
            ),
            task_id,
        )
    }

    /// Number of active (`created` or `running`) workers for a task.
    pub fn count_active_workers(&self, task_id: &str) -> EngineResult<usize> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM workers WHERE task_id = ?1 AND state IN ('created', 'running')",
                params![task_id],
                |row| row.get(0),
            )
            .map_err(store_err)?;
        Ok(count as usize)
    }
}
