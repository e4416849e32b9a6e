//! Phase boundary snapshots. Latest-wins semantics on read.

use rusqlite::{params, Transaction};

use super::{store_err, Store};
use crate::domain::{Phase, PhaseSnapshot};
use crate::errors::{EngineError, EngineResult};

impl Store {
    /// Save a snapshot inside an existing transaction.
    pub fn save_snapshot_tx(tx: &Transaction<'_>, snap: &PhaseSnapshot) -> EngineResult<()> {
        tx.execute(
            "INSERT INTO phase_snapshots (task_id, phase, round, snapshot_json, checksum, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                snap.task_id,
                snap.phase.as_str(),
                snap.round,
                snap.snapshot_json,
                snap.checksum,
                snap.created_at,
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    /// Latest snapshot for `(task_id, phase)`, or `None` if never captured.
    pub fn latest_snapshot(
        &self,
        task_id: &str,
        phase: Phase,
    ) -> EngineResult<Option<PhaseSnapshot>> {
        let res = self.conn.query_row(
            "SELECT id, task_id, phase, round, snapshot_json, checksum, created_at
             FROM phase_snapshots
             WHERE task_id = ?1 AND phase = ?2
             ORDER BY created_at DESC, id DESC
             LIMIT 1",
            params![task_id, phase.as_str()],
            |row| {
                let phase_str: String = row.get(2)?;
                Ok((
                    PhaseSnapshot {
                        id: row.get(0)?,
                        task_id: row.get(1)?,
                        phase: Phase::A,
                        round: row.get(3)?,
                        snapshot_json: row.get(4)?,
                        checksum: row.get(5)?,
                        created_at: row.get(6)?,
                    },
                    phase_str,
                ))
            },
        );
        match res {
            Ok((mut snap, phase_str)) => {
                snap.phase = Phase::parse(&phase_str).ok_or_else(|| {
                    EngineError::StoreWrite(format!("unknown phase value: {phase_str}"))
                })?;
                Ok(Some(snap))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(store_err(e)),
        }
    }
}
