//! Append-only workflow event log.

use rusqlite::{params, Transaction};

use super::{is_unique_violation, store_err, Store};
use crate::domain::{Phase, WorkflowEvent};
use crate::errors::{EngineError, EngineResult};

impl Store {
    /// Append an event inside an existing transaction. A `(task_id, seq_no)`
    /// uniqueness violation surfaces as `duplicate_event`.
    pub fn append_event_tx(tx: &Transaction<'_>, event: &WorkflowEvent) -> EngineResult<()> {
        let res = tx.execute(
            "INSERT INTO workflow_events (task_id, seq_no, phase, event_type, payload_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.task_id,
                event.seq_no,
                event.phase.as_str(),
                event.event_type,
                event.payload_json,
                event.created_at,
            ],
        );
        match res {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(EngineError::DuplicateEvent {
                task_id: event.task_id.clone(),
                seq_no: event.seq_no,
            }),
            Err(e) => Err(store_err(e)),
        }
    }

    /// Events for a task with `seq_no > since_seq`, ordered ascending.
    pub fn list_events_since(
        &self,
        task_id: &str,
        since_seq: i64,
    ) -> EngineResult<Vec<WorkflowEvent>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, task_id, seq_no, phase, event_type, payload_json, created_at
                 FROM workflow_events
                 WHERE task_id = ?1 AND seq_no > ?2
                 ORDER BY seq_no ASC",
            )
            .map_err(store_err)?;

        let rows = stmt
            .query_map(params![task_id, since_seq], |row| {
                let phase: String = row.get(3)?;
                Ok((
                    WorkflowEvent {
                        id: row.get(0)?,
                        task_id: row.get(1)?,
                        seq_no: row.get(2)?,
                        phase: Phase::A,
                        event_type: row.get(4)?,
                        payload_json: row.get(5)?,
                        created_at: row.get(6)?,
                    },
                    phase,
                ))
            })
            .map_err(store_err)?;

        let mut events = Vec::new();
        for row in rows {
            let (mut event, phase) = row.map_err(store_err)?;
            event.phase = Phase::parse(&phase)
                .ok_or_else(|| EngineError::StoreWrite(format!("unknown phase value: {phase}")))?;
            events.push(event);
        }
        Ok(events)
    }
}
