//! Immutable audit trail.

use rusqlite::{params, Row};

use super::{store_err, Store};
use crate::domain::AuditRecord;
use crate::errors::EngineResult;

fn scan_audit(row: &Row<'_>) -> rusqlite::Result<AuditRecord> {
    Ok(AuditRecord {
        id: row.get(0)?,
        task_id: row.get(1)?,
        category: row.get(2)?,
        actor: row.get(3)?,
        action: row.get(4)?,
        request_json: row.get(5)?,
        decision_json: row.get(6)?,
        severity: row.get(7)?,
        created_at: row.get(8)?,
    })
}

impl Store {
    /// Record an audit entry.
    pub fn record_audit(&self, record: &AuditRecord) -> EngineResult<()> {
        self.conn
            .execute(
                "INSERT INTO audit_records (id, task_id, category, actor, action, request_json, decision_json, severity, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.id,
                    record.task_id,
                    record.category,
                    record.actor,
                    record.action,
                    record.request_json,
                    record.decision_json,
                    record.severity,
                    record.created_at,
                ],
            )
            .map_err(store_err)?;
        Ok(())
    }

    /// All audit entries for a task, oldest first.
    pub fn list_audit(&self, task_id: &str) -> EngineResult<Vec<AuditRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, task_id, category, actor, action, request_json, decision_json, severity, created_at
                 FROM audit_records WHERE task_id = ?1 ORDER BY created_at ASC, id ASC",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![task_id], scan_audit)
            .map_err(store_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(store_err)
    }
}
