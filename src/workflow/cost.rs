//! Budget governance: per-task cost accumulation and warn/halt thresholds.

use crate::domain::{CostAction, CostDelta, FlowState};
use crate::errors::EngineResult;
use crate::store::{store_err, Store, StoreHandle};

/// Enforces budget limits for workflow tasks.
///
/// `warn_ratio` and `halt_ratio` are fractions of the budget cap; a cap of
/// zero or less disables enforcement entirely.
#[derive(Clone)]
pub struct BudgetGovernor {
    store: StoreHandle,
    pub warn_ratio: f64,
    pub halt_ratio: f64,
}

impl BudgetGovernor {
    /// Governor with the standard thresholds (warn 0.8, halt 1.0).
    pub fn new(store: StoreHandle) -> Self {
        BudgetGovernor {
            store,
            warn_ratio: 0.8,
            halt_ratio: 1.0,
        }
    }

    /// Add a cost delta to the task's budget under optimistic lock and
    /// return the resulting action.
    pub async fn record_usage(&self, task_id: &str, delta: &CostDelta) -> EngineResult<CostAction> {
        let task_id = task_id.to_string();
        let amount = delta.amount_usd;
        let (used, cap) = self
            .store
            .call(move |store| {
                let mut state = store.get_task(&task_id)?;
                state.budget_used_usd += amount;

                let tx = store.conn.transaction().map_err(store_err)?;
                Store::update_task_with_version_tx(&tx, &state)?;
                tx.commit().map_err(store_err)?;

                Ok((state.budget_used_usd, state.budget_cap_usd))
            })
            .await?;
        Ok(self.evaluate(used, cap))
    }

    /// Evaluate the budget status of an already-loaded state.
    pub fn check_budget(&self, state: &FlowState) -> CostAction {
        self.evaluate(state.budget_used_usd, state.budget_cap_usd)
    }

    /// Pure threshold evaluation. A non-positive cap always continues.
    pub fn evaluate(&self, used: f64, cap: f64) -> CostAction {
        if cap <= 0.0 {
            return CostAction::Continue;
        }
        let ratio = used / cap;
        if ratio >= self.halt_ratio {
            CostAction::Halt
        } else if ratio >= self.warn_ratio {
            CostAction::Warn
        } else {
            CostAction::Continue
        }
    }
}
