//! Task (flow state) persistence with optimistic locking.

use rusqlite::{params, Transaction};

use super::{is_unique_violation, store_err, Store};
use crate::domain::{FlowState, FlowStatus, Phase};
use crate::errors::{EngineError, EngineResult};

fn row_to_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<(FlowState, String, String)> {
    let phase: String = row.get(1)?;
    let status: String = row.get(2)?;
    let state = FlowState {
        task_id: row.get(0)?,
        current_phase: Phase::A,
        status: FlowStatus::Running,
        state_version: row.get(3)?,
        round: row.get(4)?,
        budget_used_usd: row.get(5)?,
        budget_cap_usd: row.get(6)?,
        last_event_seq: row.get(7)?,
        updated_at_unix: row.get(8)?,
    };
    Ok((state, phase, status))
}

fn decode_state(state: FlowState, phase: String, status: String) -> EngineResult<FlowState> {
    let current_phase = Phase::parse(&phase)
        .ok_or_else(|| EngineError::StoreWrite(format!("unknown phase value: {phase}")))?;
    let status = FlowStatus::parse(&status)
        .ok_or_else(|| EngineError::StoreWrite(format!("unknown status value: {status}")))?;
    Ok(FlowState {
        current_phase,
        status,
        ..state
    })
}

impl Store {
    /// Insert a new task inside an existing transaction. A primary-key
    /// violation surfaces as `duplicate_task`.
    pub fn create_task_tx(tx: &Transaction<'_>, state: &FlowState) -> EngineResult<()> {
        let res = tx.execute(
            "INSERT INTO tasks (task_id, current_phase, status, state_version, round, budget_used_usd, budget_cap_usd, last_event_seq, updated_at_unix)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                state.task_id,
                state.current_phase.as_str(),
                state.status.as_str(),
                state.state_version,
                state.round,
                state.budget_used_usd,
                state.budget_cap_usd,
                state.last_event_seq,
                state.updated_at_unix,
            ],
        );
        match res {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(EngineError::DuplicateTask(state.task_id.clone()))
            }
            Err(e) => Err(store_err(e)),
        }
    }

    /// Update a task inside a transaction using optimistic locking. The
    /// write is predicated on `state_version` matching the version the
    /// caller read; on success the version increments by one. A zero-row
    /// result surfaces as `optimistic_lock`.
    pub fn update_task_with_version_tx(tx: &Transaction<'_>, state: &FlowState) -> EngineResult<()> {
        let n = tx
            .execute(
                "UPDATE tasks SET
                    current_phase = ?1,
                    status = ?2,
                    state_version = state_version + 1,
                    round = ?3,
                    budget_used_usd = ?4,
                    budget_cap_usd = ?5,
                    last_event_seq = ?6,
                    updated_at_unix = ?7
                 WHERE task_id = ?8 AND state_version = ?9",
                params![
                    state.current_phase.as_str(),
                    state.status.as_str(),
                    state.round,
                    state.budget_used_usd,
                    state.budget_cap_usd,
                    state.last_event_seq,
                    state.updated_at_unix,
                    state.task_id,
                    state.state_version,
                ],
            )
            .map_err(store_err)?;
        if n == 0 {
            return Err(EngineError::OptimisticLock);
        }
        Ok(())
    }

    /// All tasks whose status is `running`, ordered by id. Used to resume
    /// supervision after a restart.
    pub fn list_running_tasks(&self) -> EngineResult<Vec<FlowState>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT task_id, current_phase, status, state_version, round, budget_used_usd, budget_cap_usd, last_event_seq, updated_at_unix
                 FROM tasks WHERE status = 'running' ORDER BY task_id ASC",
            )
            .map_err(store_err)?;
        let rows = stmt.query_map([], row_to_state).map_err(store_err)?;
        let mut tasks = Vec::new();
        for row in rows {
            let (state, phase, status) = row.map_err(store_err)?;
            tasks.push(decode_state(state, phase, status)?);
        }
        Ok(tasks)
    }

    /// Retrieve a task by id, or `flow_not_found`.
    pub fn get_task(&self, task_id: &str) -> EngineResult<FlowState> {
        let res = self.conn.query_row(
            "SELECT task_id, current_phase, status, state_version, round, budget_used_usd, budget_cap_usd, last_event_seq, updated_at_unix
             FROM tasks WHERE task_id = ?1",
            params![task_id],
            row_to_state,
        );
        match res {
            Ok((state, phase, status)) => decode_state(state, phase, status),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                Err(EngineError::FlowNotFound(task_id.to_string()))
            }
            Err(e) => Err(store_err(e)),
        }
    }
}
