//! Intent lock persistence. Intents are keyed by id and upserted; the
//! active-per-file invariant is enforced by the resolver's read-then-write
//! sequence, not by the schema.

use rusqlite::{params, Row, Transaction};

use super::{store_err, Store};
use crate::domain::Intent;
use crate::errors::{EngineError, EngineResult};

const INTENT_COLUMNS: &str = "intent_id, task_id, worker_id, target_file, operation, status, pre_hash, post_hash, payload_hash, lease_until";

fn scan_intent(row: &Row<'_>) -> rusqlite::Result<Intent> {
    Ok(Intent {
        intent_id: row.get(0)?,
        task_id: row.get(1)?,
        worker_id: row.get(2)?,
        target_file: row.get(3)?,
        operation: row.get(4)?,
        status: row.get(5)?,
        pre_hash: row.get(6)?,
        post_hash: row.get(7)?,
        payload_hash: row.get(8)?,
        lease_until: row.get(9)?,
    })
}

impl Store {
    /// Insert or update an intent by id inside an existing transaction.
    pub fn upsert_intent_tx(tx: &Transaction<'_>, intent: &Intent) -> EngineResult<()> {
        tx.execute(
            "INSERT INTO intent_logs (intent_id, task_id, worker_id, target_file, operation, status, pre_hash, post_hash, payload_hash, lease_until)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(intent_id) DO UPDATE SET
                worker_id = excluded.worker_id,
                target_file = excluded.target_file,
                operation = excluded.operation,
                status = excluded.status,
                pre_hash = excluded.pre_hash,
                post_hash = excluded.post_hash,
                payload_hash = excluded.payload_hash,
                lease_until = excluded.lease_until",
            params![
                intent.intent_id,
                intent.task_id,
                intent.worker_id,
                intent.target_file,
                intent.operation,
                intent.status,
                intent.pre_hash,
                intent.post_hash,
                intent.payload_hash,
                intent.lease_until,
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    /// Retrieve an intent by id, or `intent_not_found`.
    pub fn get_intent(&self, intent_id: &str) -> EngineResult<Intent> {
        let res = self.conn.query_row(
            &format!("SELECT {INTENT_COLUMNS} FROM intent_logs WHERE intent_id = ?1"),
            params![intent_id],
            scan_intent,
        );
        match res {
            Ok(intent) => Ok(intent),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                Err(EngineError::IntentNotFound(intent_id.to_string()))
            }
            Err(e) => Err(store_err(e)),
        }
    }

    /// Intents for `(task_id, target_file)` whose status is pending or
    /// running.
    pub fn find_active_intents_by_file(
        &self,
        task_id: &str,
        target_file: &str,
    ) -> EngineResult<Vec<Intent>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {INTENT_COLUMNS} FROM intent_logs
                 WHERE task_id = ?1 AND target_file = ?2 AND status IN ('pending', 'running')
                 ORDER BY intent_id ASC"
            ))
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![task_id, target_file], scan_intent)
            .map_err(store_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(store_err)
    }

    /// Intents for a task filtered by status.
    pub fn list_intents_by_status(&self, task_id: &str, status: &str) -> EngineResult<Vec<Intent>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {INTENT_COLUMNS} FROM intent_logs
                 WHERE task_id = ?1 AND status = ?2
                 ORDER BY intent_id ASC"
            ))
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![task_id, status], scan_intent)
            .map_err(store_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(store_err)
    }

    /// Mark an intent done with its post-operation hash inside a
    /// transaction, or `intent_not_found`.
    pub fn mark_intent_done_tx(
        tx: &Transaction<'_>,
        intent_id: &str,
        post_hash: &str,
    ) -> EngineResult<()> {
        let n = tx
            .execute(
                "UPDATE intent_logs SET status = 'done', post_hash = ?1 WHERE intent_id = ?2",
                params![post_hash, intent_id],
            )
            .map_err(store_err)?;
        if n == 0 {
            return Err(EngineError::IntentNotFound(intent_id.to_string()));
        }
        Ok(())
    }
}
