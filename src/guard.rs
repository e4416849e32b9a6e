//! Composite request-time guard: budget, permission, rate limit, rounds.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::domain::{now_unix, CapabilitySheet, CostAction};
use crate::errors::{EngineError, EngineResult};
use crate::store::StoreHandle;
use crate::team::permission::PermissionBroker;
use crate::workflow::cost::BudgetGovernor;

/// Sliding rate-limit window in seconds.
const RATE_WINDOW_SECS: i64 = 60;

/// Rate and round limits.
#[derive(Debug, Clone, Copy)]
pub struct GuardConfig {
    pub max_rounds: i64,
    pub rate_limit_per_minute: u32,
}

struct RateBucket {
    count: u32,
    window_start: i64,
}

/// Runs the fixed request-time check order: budget, permission, rate
/// limit, round cap. Rate state is process-local by design; it is not
/// durable and not shared across instances.
pub struct Guard {
    governor: BudgetGovernor,
    broker: PermissionBroker,
    store: StoreHandle,
    pub config: GuardConfig,
    rate_counts: Mutex<HashMap<String, RateBucket>>,
}

impl Guard {
    pub fn new(
        store: StoreHandle,
        governor: BudgetGovernor,
        broker: PermissionBroker,
        config: GuardConfig,
    ) -> Self {
        Guard {
            governor,
            broker,
            store,
            config,
            rate_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Run all checks in order, returning the first failure.
    pub async fn check_all(
        &self,
        task_id: &str,
        path: &str,
        command: &str,
        sheet: &CapabilitySheet,
    ) -> EngineResult<()> {
        if self.check_budget(task_id).await? == CostAction::Halt {
            return Err(EngineError::BudgetExceeded(task_id.to_string()));
        }

        if !self.broker.check_permission(sheet, path, command).await? {
            return Err(EngineError::PermissionDenied(format!(
                "path {path:?} command {command:?}"
            )));
        }

        self.check_rate_limit(task_id)?;
        self.check_rounds(task_id).await?;

        Ok(())
    }

    /// Load the task and evaluate its budget status.
    pub async fn check_budget(&self, task_id: &str) -> EngineResult<CostAction> {
        let id = task_id.to_string();
        let state = self.store.call(move |store| store.get_task(&id)).await?;
        Ok(self.governor.check_budget(&state))
    }

    /// Per-task sliding-window rate limit. The window resets lazily on the
    /// first check after it elapses.
    pub fn check_rate_limit(&self, task_id: &str) -> EngineResult<()> {
        let mut counts = self
            .rate_counts
            .lock()
            .map_err(|_| EngineError::StoreWrite("rate limiter lock poisoned".into()))?;

        let now = now_unix();
        let bucket = counts.entry(task_id.to_string()).or_insert(RateBucket {
            count: 0,
            window_start: now,
        });

        if now - bucket.window_start > RATE_WINDOW_SECS {
            bucket.count = 1;
            bucket.window_start = now;
            return Ok(());
        }

        if bucket.count >= self.config.rate_limit_per_minute {
            return Err(EngineError::RateLimitExceeded(task_id.to_string()));
        }

        bucket.count += 1;
        Ok(())
    }

    /// Fail once a task's round count reaches the configured maximum.
    pub async fn check_rounds(&self, task_id: &str) -> EngineResult<()> {
        let id = task_id.to_string();
        let state = self.store.call(move |store| store.get_task(&id)).await?;
        if state.round >= self.config.max_rounds {
            return Err(EngineError::MaxRoundsExceeded {
                round: state.round,
                max: self.config.max_rounds,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FlowState, FlowStatus, Phase};
    use crate::store::{store_err, Store};

    async fn setup(budget_used: f64, round: i64) -> Guard {
        let store = StoreHandle::new(Store::open_in_memory().unwrap());
        store
            .call(move |s| {
                let state = FlowState {
                    task_id: "t1".into(),
                    current_phase: Phase::C,
                    status: FlowStatus::Running,
                    state_version: 1,
                    round,
                    budget_used_usd: budget_used,
                    budget_cap_usd: 100.0,
                    last_event_seq: 1,
                    updated_at_unix: now_unix(),
                };
                let tx = s.conn.transaction().map_err(store_err)?;
                Store::create_task_tx(&tx, &state)?;
                tx.commit().map_err(store_err)
            })
            .await
            .unwrap();

        let governor = BudgetGovernor::new(store.clone());
        let broker = PermissionBroker::new(store.clone());
        Guard::new(
            store,
            governor,
            broker,
            GuardConfig {
                max_rounds: 3,
                rate_limit_per_minute: 5,
            },
        )
    }

    fn sheet() -> CapabilitySheet {
        CapabilitySheet {
            task_id: "t1".into(),
            allowed_paths: vec!["/workspace/".into()],
            allowed_commands: vec!["cargo build".into()],
            denied_patterns: vec![".env".into()],
            created_at_unix: 0,
        }
    }

    #[tokio::test]
    async fn test_check_all_passes_within_limits() {
        let guard = setup(0.0, 0).await;
        guard
            .check_all("t1", "/workspace/src/main.rs", "cargo build", &sheet())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_budget_halt_fails_first() {
        let guard = setup(100.0, 0).await;
        let err = guard
            .check_all("t1", "/workspace/src/main.rs", "cargo build", &sheet())
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::BudgetExceeded("t1".into()));
    }

    #[tokio::test]
    async fn test_permission_denied_surfaces() {
        let guard = setup(0.0, 0).await;
        let err = guard
            .check_all("t1", "/etc/passwd", "cargo build", &sheet())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_rate_limit_boundary() {
        let guard = setup(0.0, 0).await;
        // Exactly `limit` checks succeed within the window.
        for _ in 0..5 {
            guard.check_rate_limit("t1").unwrap();
        }
        let err = guard.check_rate_limit("t1").unwrap_err();
        assert_eq!(err, EngineError::RateLimitExceeded("t1".into()));

        // Other tasks have independent windows.
        guard.check_rate_limit("t2").unwrap();
    }

    #[tokio::test]
    async fn test_budget_warn_does_not_block() {
        // 80% of cap is a warning, not a halt; check_all still passes.
        let guard = setup(80.0, 0).await;
        assert_eq!(guard.check_budget("t1").await.unwrap(), CostAction::Warn);
        guard
            .check_all("t1", "/workspace/src/main.rs", "cargo build", &sheet())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rate_window_resets_after_elapsing() {
        let guard = setup(0.0, 0).await;
        for _ in 0..5 {
            guard.check_rate_limit("t1").unwrap();
        }
        assert!(guard.check_rate_limit("t1").is_err());

        // Age the window past its span; the next check starts a new one.
        {
            let mut counts = guard.rate_counts.lock().unwrap();
            counts.get_mut("t1").unwrap().window_start -= RATE_WINDOW_SECS + 1;
        }
        guard.check_rate_limit("t1").unwrap();
    }

    #[tokio::test]
    async fn test_round_cap() {
        let guard = setup(0.0, 3).await;
        let err = guard.check_rounds("t1").await.unwrap_err();
        assert_eq!(err, EngineError::MaxRoundsExceeded { round: 3, max: 3 });

        let guard = setup(0.0, 2).await;
        guard.check_rounds("t1").await.unwrap();
    }
}
