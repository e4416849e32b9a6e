//! Worker lifecycle: spawn, state changes, replacement, shutdown.

use std::sync::atomic::{AtomicI64, Ordering};

use uuid::Uuid;

use crate::domain::{now_nanos, now_unix, AuditRecord, WorkerRef, WorkerSpec, WorkerState};
use crate::errors::{EngineError, EngineResult};
use crate::store::StoreHandle;

/// Process-wide monotonic counter disambiguating worker ids minted within
/// the same nanosecond.
static WORKER_SEQ: AtomicI64 = AtomicI64::new(0);

/// Spawns, replaces, and shuts down ephemeral workers.
#[derive(Clone)]
pub struct WorkerManager {
    store: StoreHandle,
    pub max_workers: usize,
}

impl WorkerManager {
    pub fn new(store: StoreHandle, max_workers: usize) -> Self {
        WorkerManager { store, max_workers }
    }

    /// Create a new worker from the spec, enforcing the per-task active
    /// worker limit.
    pub async fn spawn(&self, spec: &WorkerSpec) -> EngineResult<WorkerRef> {
        let task_id = spec.task_id.clone();
        let count = self
            .store
            .call(move |store| store.count_active_workers(&task_id))
            .await?;
        if count >= self.max_workers {
            return Err(EngineError::WorkerLimitReached {
                limit: self.max_workers,
            });
        }

        let now = now_unix();
        let seq = WORKER_SEQ.fetch_add(1, Ordering::SeqCst) + 1;
        let worker = WorkerRef {
            worker_id: format!("w-{}-{}", now_nanos(), seq),
            task_id: spec.task_id.clone(),
            phase: spec.phase,
            role: spec.role.clone(),
            state: WorkerState::Created,
            file_ownership: spec.file_ownership.clone(),
            soft_timeout_sec: spec.soft_timeout_sec,
            hard_timeout_sec: spec.hard_timeout_sec,
            last_heartbeat: now,
            created_at_unix: now,
        };

        let persisted = worker.clone();
        self.store
            .call(move |store| store.create_worker(&persisted))
            .await?;

        self.audit(&worker.task_id, "worker_spawned").await;
        Ok(worker)
    }

    /// Change a worker's state. Transitions out of terminal states are
    /// rejected with `worker_already_done`.
    pub async fn update_state(&self, worker_id: &str, state: WorkerState) -> EngineResult<()> {
        let id = worker_id.to_string();
        self.store
            .call(move |store| {
                let existing = store.get_worker(&id)?;
                if existing.state.is_terminal() {
                    return Err(EngineError::WorkerAlreadyDone(id.clone()));
                }
                store.update_worker_state(&id, state)
            })
            .await
    }

    /// Mark a worker as replaced and spawn a fresh one with the same spec.
    pub async fn replace(&self, worker_id: &str) -> EngineResult<WorkerRef> {
        let id = worker_id.to_string();
        let old = self
            .store
            .call(move |store| {
                let old = store.get_worker(&id)?;
                store.update_worker_state(&id, WorkerState::Replaced)?;
                Ok(old)
            })
            .await?;

        let spec = WorkerSpec {
            task_id: old.task_id,
            phase: old.phase,
            role: old.role,
            file_ownership: old.file_ownership,
            soft_timeout_sec: old.soft_timeout_sec,
            hard_timeout_sec: old.hard_timeout_sec,
        };
        self.spawn(&spec).await
    }

    /// Mark a worker as done.
    pub async fn shutdown(&self, worker_id: &str) -> EngineResult<()> {
        let id = worker_id.to_string();
        let task_id = self
            .store
            .call(move |store| {
                let existing = store.get_worker(&id)?;
                store.update_worker_state(&id, WorkerState::Done)?;
                Ok(existing.task_id)
            })
            .await?;

        self.audit(&task_id, "worker_shutdown").await;
        Ok(())
    }

    /// Active workers for a task.
    pub async fn list_active(&self, task_id: &str) -> EngineResult<Vec<WorkerRef>> {
        let task_id = task_id.to_string();
        self.store
            .call(move |store| store.list_active_workers(&task_id))
            .await
    }

    // Audit failures are non-fatal for lifecycle operations.
    async fn audit(&self, task_id: &str, action: &str) {
        let record = AuditRecord {
            id: format!("aud-{}", Uuid::new_v4()),
            task_id: task_id.to_string(),
            category: "worker".into(),
            actor: "system".into(),
            action: action.to_string(),
            request_json: "{}".into(),
            decision_json: "{}".into(),
            severity: "info".into(),
            created_at: now_unix(),
        };
        let _ = self
            .store
            .call(move |store| store.record_audit(&record))
            .await;
    }
}
