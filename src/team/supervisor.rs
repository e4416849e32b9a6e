//! Heartbeat supervision and worker timeout handling.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::{now_unix, AuditRecord, WorkerState};
use crate::errors::EngineResult;
use crate::store::StoreHandle;
use crate::team::lifecycle::WorkerManager;

/// Tunable parameters for the supervisor loop. Zero-valued fields fall
/// back to defaults when constructing the supervisor.
#[derive(Debug, Clone, Copy, Default)]
pub struct SupervisorConfig {
    pub check_interval_sec: u64,
    pub heartbeat_max_age: i64,
}

/// Kind of timeout action taken against a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Soft,
    Hard,
}

/// A timeout action recorded by [`Supervisor::check_timeouts`].
#[derive(Debug, Clone)]
pub struct TimeoutAction {
    pub worker_id: String,
    pub kind: TimeoutKind,
}

/// Monitors worker heartbeats, escalating soft and hard timeouts.
///
/// A soft timeout only signals (state change + audit); a hard timeout also
/// replaces the worker immediately. Each supervisor owns exactly one stop
/// signal; [`Supervisor::stop_monitoring`] is safe to call any number of
/// times.
pub struct Supervisor {
    store: StoreHandle,
    manager: WorkerManager,
    pub config: SupervisorConfig,
    stop: CancellationToken,
    monitored: Mutex<HashSet<String>>,
}

impl Supervisor {
    pub fn new(store: StoreHandle, manager: WorkerManager, mut config: SupervisorConfig) -> Self {
        if config.check_interval_sec == 0 {
            config.check_interval_sec = 10;
        }
        if config.heartbeat_max_age == 0 {
            config.heartbeat_max_age = 30;
        }
        Supervisor {
            store,
            manager,
            config,
            stop: CancellationToken::new(),
            monitored: Mutex::new(HashSet::new()),
        }
    }

    /// Refresh a worker's heartbeat, or `worker_not_found`.
    pub async fn heartbeat(&self, worker_id: &str) -> EngineResult<()> {
        let id = worker_id.to_string();
        let now = now_unix();
        self.store
            .call(move |store| store.update_worker_heartbeat(&id, now))
            .await
    }

    /// Inspect all active workers for a task and act on any whose heartbeat
    /// age exceeds its soft or hard threshold. Hard timeouts win when both
    /// thresholds are crossed.
    pub async fn check_timeouts(
        &self,
        task_id: &str,
        now_unix: i64,
    ) -> EngineResult<Vec<TimeoutAction>> {
        let id = task_id.to_string();
        let workers = self
            .store
            .call(move |store| store.list_active_workers(&id))
            .await?;

        let mut actions = Vec::new();
        for worker in workers {
            let age = now_unix - worker.last_heartbeat;

            if worker.hard_timeout_sec > 0 && age > worker.hard_timeout_sec {
                let _ = self
                    .manager
                    .update_state(&worker.worker_id, WorkerState::HardTimeout)
                    .await;
                let _ = self.manager.replace(&worker.worker_id).await;
                actions.push(TimeoutAction {
                    worker_id: worker.worker_id.clone(),
                    kind: TimeoutKind::Hard,
                });
                self.audit_timeout(&worker.task_id, "hard_timeout").await;
            } else if worker.soft_timeout_sec > 0 && age > worker.soft_timeout_sec {
                let _ = self
                    .manager
                    .update_state(&worker.worker_id, WorkerState::SoftTimeout)
                    .await;
                actions.push(TimeoutAction {
                    worker_id: worker.worker_id.clone(),
                    kind: TimeoutKind::Soft,
                });
                self.audit_timeout(&worker.task_id, "soft_timeout").await;
            }
        }
        Ok(actions)
    }

    /// Spawn the background loop that periodically checks timeouts for a
    /// task. At most one loop runs per task; repeated calls for the same
    /// task are no-ops. The loop exits when `stop_monitoring` is called or
    /// the ambient cancellation fires.
    pub fn start_monitoring(self: &Arc<Self>, task_id: String, ambient: CancellationToken) {
        {
            let Ok(mut monitored) = self.monitored.lock() else {
                return;
            };
            if !monitored.insert(task_id.clone()) {
                return;
            }
        }

        let supervisor = Arc::clone(self);
        let interval = Duration::from_secs(self.config.check_interval_sec);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; consume it so checks start
            // one full interval after spawn.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = supervisor.stop.cancelled() => return,
                    _ = ambient.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(err) = supervisor.check_timeouts(&task_id, now_unix()).await {
                            tracing::warn!(task_id = %task_id, error = %err, "timeout check failed");
                        }
                    }
                }
            }
        });
    }

    /// Signal the monitoring loop to stop. Idempotent.
    pub fn stop_monitoring(&self) {
        self.stop.cancel();
    }

    async fn audit_timeout(&self, task_id: &str, action: &str) {
        let record = AuditRecord {
            id: format!("aud-{}", Uuid::new_v4()),
            task_id: task_id.to_string(),
            category: "supervisor".into(),
            actor: "system".into(),
            action: action.to_string(),
            request_json: "{}".into(),
            decision_json: "{}".into(),
            severity: "warning".into(),
            created_at: now_unix(),
        };
        let _ = self
            .store
            .call(move |store| store.record_audit(&record))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Phase, WorkerSpec};
    use crate::store::Store;

    fn setup() -> (Arc<Supervisor>, WorkerManager, StoreHandle) {
        let store = StoreHandle::new(Store::open_in_memory().unwrap());
        let manager = WorkerManager::new(store.clone(), 10);
        let supervisor = Arc::new(Supervisor::new(
            store.clone(),
            manager.clone(),
            SupervisorConfig::default(),
        ));
        (supervisor, manager, store)
    }

    fn spec(soft: i64, hard: i64) -> WorkerSpec {
        WorkerSpec {
            task_id: "t1".into(),
            phase: Phase::C,
            role: "builder".into(),
            file_ownership: vec!["src/main.rs".into()],
            soft_timeout_sec: soft,
            hard_timeout_sec: hard,
        }
    }

    #[test]
    fn test_config_defaults_applied() {
        let store = StoreHandle::new(Store::open_in_memory().unwrap());
        let manager = WorkerManager::new(store.clone(), 10);
        let supervisor = Supervisor::new(store, manager, SupervisorConfig::default());
        assert_eq!(supervisor.config.check_interval_sec, 10);
        assert_eq!(supervisor.config.heartbeat_max_age, 30);
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_worker() {
        let (supervisor, _manager, _store) = setup();
        let err = supervisor.heartbeat("ghost").await.unwrap_err();
        assert_eq!(err, crate::errors::EngineError::WorkerNotFound("ghost".into()));
    }

    #[tokio::test]
    async fn test_hard_timeout_replaces_worker() {
        let (supervisor, manager, store) = setup();
        let worker = manager.spawn(&spec(10, 30)).await.unwrap();

        let actions = supervisor
            .check_timeouts("t1", worker.last_heartbeat + 35)
            .await
            .unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, TimeoutKind::Hard);
        assert_eq!(actions[0].worker_id, worker.worker_id);

        let timed_out_id = worker.worker_id.clone();
        let timed_out = store.call(move |s| s.get_worker(&timed_out_id)).await.unwrap();
        assert_eq!(timed_out.state, WorkerState::HardTimeout);

        // A replacement with identical role and ownership exists.
        let active = manager.list_active("t1").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_ne!(active[0].worker_id, worker.worker_id);
        assert_eq!(active[0].role, worker.role);
        assert_eq!(active[0].file_ownership, worker.file_ownership);

        let audits = store.call(|s| s.list_audit("t1")).await.unwrap();
        assert!(audits.iter().any(|a| a.action == "hard_timeout" && a.severity == "warning"));
    }

    #[tokio::test]
    async fn test_soft_timeout_signals_without_replacing() {
        let (supervisor, manager, store) = setup();
        let worker = manager.spawn(&spec(10, 100)).await.unwrap();

        let actions = supervisor
            .check_timeouts("t1", worker.last_heartbeat + 15)
            .await
            .unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, TimeoutKind::Soft);

        let id = worker.worker_id.clone();
        let soft = store.call(move |s| s.get_worker(&id)).await.unwrap();
        assert_eq!(soft.state, WorkerState::SoftTimeout);

        // Soft-timed-out workers are no longer active; no replacement spawned.
        assert!(manager.list_active("t1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mixed_timeouts_handled_in_one_pass() {
        let (supervisor, manager, _store) = setup();
        let slow = manager.spawn(&spec(10, 30)).await.unwrap();
        let slower = manager.spawn(&spec(10, 12)).await.unwrap();

        // 15s of silence: first worker is only soft, second crossed hard.
        let actions = supervisor
            .check_timeouts("t1", slow.last_heartbeat + 15)
            .await
            .unwrap();
        assert_eq!(actions.len(), 2);

        let soft = actions.iter().find(|a| a.worker_id == slow.worker_id).unwrap();
        assert_eq!(soft.kind, TimeoutKind::Soft);
        let hard = actions.iter().find(|a| a.worker_id == slower.worker_id).unwrap();
        assert_eq!(hard.kind, TimeoutKind::Hard);
    }

    #[tokio::test]
    async fn test_fresh_heartbeat_avoids_timeout() {
        let (supervisor, manager, _store) = setup();
        let worker = manager.spawn(&spec(10, 30)).await.unwrap();

        let actions = supervisor
            .check_timeouts("t1", worker.last_heartbeat + 5)
            .await
            .unwrap();
        assert!(actions.is_empty());
    }

    #[tokio::test]
    async fn test_zero_thresholds_disable_timeouts() {
        let (supervisor, manager, _store) = setup();
        let worker = manager.spawn(&spec(0, 0)).await.unwrap();

        let actions = supervisor
            .check_timeouts("t1", worker.last_heartbeat + 1_000_000)
            .await
            .unwrap();
        assert!(actions.is_empty());
    }

    #[tokio::test]
    async fn test_stop_monitoring_is_idempotent() {
        let (supervisor, _manager, _store) = setup();
        supervisor.start_monitoring("t1".into(), CancellationToken::new());
        supervisor.stop_monitoring();
        supervisor.stop_monitoring();
        supervisor.stop_monitoring();
    }

    #[tokio::test]
    async fn test_one_monitoring_loop_per_task() {
        let (supervisor, _manager, _store) = setup();
        let ambient = CancellationToken::new();
        supervisor.start_monitoring("t1".into(), ambient.clone());
        supervisor.start_monitoring("t1".into(), ambient.clone());
        supervisor.start_monitoring("t2".into(), ambient);

        assert_eq!(supervisor.monitored.lock().unwrap().len(), 2);
        supervisor.stop_monitoring();
    }
}
