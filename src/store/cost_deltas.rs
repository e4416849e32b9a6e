//! Append-only cost delta log.

use rusqlite::params;

use super::{store_err, Store};
use crate::domain::CostDelta;
use crate::errors::EngineResult;

impl Store {
    /// Append a cost delta for a task.
    pub fn create_cost_delta(&self, task_id: &str, delta: &CostDelta) -> EngineResult<()> {
        self.conn
            .execute(
                "INSERT INTO cost_deltas (task_id, input_tokens, output_tokens, amount_usd, provider, phase, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    task_id,
                    delta.input_tokens,
                    delta.output_tokens,
                    delta.amount_usd,
                    delta.provider,
                    delta.phase,
                    delta.created_at,
                ],
            )
            .map_err(store_err)?;
        Ok(())
    }

    /// All cost deltas for a task, oldest first.
    pub fn list_cost_deltas(&self, task_id: &str) -> EngineResult<Vec<CostDelta>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT input_tokens, output_tokens, amount_usd, provider, phase, created_at
                 FROM cost_deltas WHERE task_id = ?1 ORDER BY id ASC",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![task_id], |row| {
                Ok(CostDelta {
                    input_tokens: row.get(0)?,
                    output_tokens: row.get(1)?,
                    amount_usd: row.get(2)?,
                    provider: row.get(3)?,
                    phase: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })
            .map_err(store_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(store_err)
    }
}
