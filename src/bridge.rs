//! Integration layer between the workflow engine and code agent sessions.
//!
//! The bridge prechecks budget before a session starts, folds cost events
//! back into the budget governor and the persistent delta log, and audits
//! session lifecycle decisions. Cost events are recorded before they are
//! forwarded, so any downstream observer sees the cost already applied.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::{
    now_unix, AuditRecord, CostAction, CostDelta, NormalizedEvent, SessionConfig, WorkerRef,
};
use crate::errors::{EngineError, EngineResult};
use crate::guard::Guard;
use crate::session::manager::SessionManager;
use crate::store::StoreHandle;
use crate::workflow::cost::BudgetGovernor;

/// Marries sessions to the engine.
pub struct Bridge {
    sessions: Arc<SessionManager>,
    guard: Arc<Guard>,
    governor: BudgetGovernor,
    store: StoreHandle,
}

impl Bridge {
    pub fn new(
        sessions: Arc<SessionManager>,
        guard: Arc<Guard>,
        governor: BudgetGovernor,
        store: StoreHandle,
    ) -> Self {
        Bridge {
            sessions,
            guard,
            governor,
            store,
        }
    }

    /// Check the budget, create a session for the worker's role, and audit.
    pub async fn start_session(
        &self,
        worker: &WorkerRef,
        config: SessionConfig,
    ) -> EngineResult<String> {
        if self.guard.check_budget(&worker.task_id).await? == CostAction::Halt {
            return Err(EngineError::BudgetExceeded(worker.task_id.clone()));
        }

        let session_id = self.sessions.create(&worker.role, config).await?;

        self.audit(
            &worker.task_id,
            "start_session",
            json!({
                "session_id": session_id,
                "worker_id": worker.worker_id,
                "role": worker.role,
            }),
            json!({"result": "started"}),
        )
        .await;

        Ok(session_id)
    }

    /// Stop a session and audit. Kill errors are ignored; the session is
    /// removed from the manager regardless.
    pub async fn stop_session(&self, session_id: &str) -> EngineResult<()> {
        let session = self.sessions.get(session_id)?;
        let task_id = session.config.task_id.clone();

        let _ = self.sessions.stop(session_id).await;

        self.audit(
            &task_id,
            "stop_session",
            json!({"session_id": session_id}),
            json!({"result": "stopped"}),
        )
        .await;

        Ok(())
    }

    /// Forward a session's events to the returned channel.
    ///
    /// Events of type `cost` are decoded as [`CostDelta`] and recorded via
    /// the governor and the cost delta log before being forwarded. The
    /// forwarder exits when the session's channel closes or `cancel` fires,
    /// closing the output channel on the way out.
    pub async fn stream_events(
        &self,
        session_id: &str,
        cancel: CancellationToken,
    ) -> EngineResult<mpsc::Receiver<NormalizedEvent>> {
        let session = self.sessions.get(session_id)?;
        let mut events = session.take_events().ok_or_else(|| {
            EngineError::SessionNotFound(format!("event stream for {session_id} already taken"))
        })?;
        let task_id = session.config.task_id.clone();

        let (out_tx, out_rx) = mpsc::channel(64);
        let governor = self.governor.clone();
        let store = self.store.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = events.recv() => {
                        let Some(event) = event else { return };
                        if event.event_type == "cost" {
                            process_cost_event(&governor, &store, &task_id, &event).await;
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            res = out_tx.send(event) => {
                                if res.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        });

        Ok(out_rx)
    }

    async fn audit(
        &self,
        task_id: &str,
        action: &str,
        request: serde_json::Value,
        decision: serde_json::Value,
    ) {
        let record = AuditRecord {
            id: format!("aud-{}", Uuid::new_v4()),
            task_id: task_id.to_string(),
            category: "session".into(),
            actor: "bridge".into(),
            action: action.to_string(),
            request_json: request.to_string(),
            decision_json: decision.to_string(),
            severity: "info".into(),
            created_at: now_unix(),
        };
        let _ = self
            .store
            .call(move |store| store.record_audit(&record))
            .await;
    }
}

/// Decode and record a cost event. Undecodable payloads are dropped; the
/// event itself is still forwarded by the caller.
async fn process_cost_event(
    governor: &BudgetGovernor,
    store: &StoreHandle,
    task_id: &str,
    event: &NormalizedEvent,
) {
    let Ok(mut delta) = serde_json::from_str::<CostDelta>(&event.payload) else {
        return;
    };
    delta.provider = event.provider.clone();
    delta.created_at = now_unix();

    let _ = governor.record_usage(task_id, &delta).await;

    let task_id = task_id.to_string();
    let _ = store
        .call(move |s| s.create_cost_delta(&task_id, &delta))
        .await;
}
