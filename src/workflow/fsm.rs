//! The FSM engine owning the seven-phase lifecycle.
//!
//! Phase graph, with two explicit back-edges:
//!
//! ```text
//! A → B → C → D → E → F → G
//!           ↑   ↓
//!           └───┘  (D → C rollback)
//!               E ←──── F  (rework)
//! ```
//!
//! Every accepted transition is written atomically: one event append, one
//! boundary snapshot, one optimistically-locked state update.

use std::sync::Arc;

use serde_json::json;

use crate::domain::{
    now_unix, FlowState, FlowStatus, Phase, PhaseSnapshot, TransitionTrigger, WorkflowEvent,
};
use crate::errors::{EngineError, EngineResult};
use crate::store::{store_err, Store, StoreHandle};
use crate::workflow::gate::GateRegistry;

/// True iff `(from, to)` is a legal edge of the phase graph.
pub fn is_valid_transition(from: Phase, to: Phase) -> bool {
    matches!(
        (from, to),
        (Phase::A, Phase::B)
            | (Phase::B, Phase::C)
            | (Phase::C, Phase::D)
            | (Phase::D, Phase::E)
            | (Phase::D, Phase::C)
            | (Phase::E, Phase::F)
            | (Phase::F, Phase::G)
            | (Phase::F, Phase::E)
    )
}

/// Resolve the target phase for a trigger action from the current phase.
fn resolve_next_phase(current: Phase, action: &str) -> EngineResult<Phase> {
    match action {
        "advance" => current.next_forward().ok_or_else(|| {
            EngineError::InvalidTransition(format!("no forward transition from phase {current}"))
        }),
        "rollback" => {
            if current == Phase::D {
                Ok(Phase::C)
            } else {
                Err(EngineError::InvalidTransition(format!(
                    "rollback not allowed from phase {current}"
                )))
            }
        }
        "rework" => {
            if current == Phase::F {
                Ok(Phase::E)
            } else {
                Err(EngineError::InvalidTransition(format!(
                    "rework not allowed from phase {current}"
                )))
            }
        }
        other => Err(EngineError::InvalidTransition(format!(
            "unknown action: {other}"
        ))),
    }
}

/// The workflow state machine.
#[derive(Clone)]
pub struct Engine {
    store: StoreHandle,
    gates: Arc<GateRegistry>,
}

impl Engine {
    pub fn new(store: StoreHandle, gates: Arc<GateRegistry>) -> Self {
        Engine { store, gates }
    }

    /// Create a new workflow at phase A with the given budget cap. The
    /// mandatory `flow_started` event takes sequence number 1.
    pub async fn start_flow(&self, task_id: &str, budget_cap_usd: f64) -> EngineResult<()> {
        let task_id = task_id.to_string();
        self.store
            .call(move |store| {
                let now = now_unix();
                let state = FlowState {
                    task_id: task_id.clone(),
                    current_phase: Phase::A,
                    status: FlowStatus::Running,
                    state_version: 1,
                    round: 0,
                    budget_used_usd: 0.0,
                    budget_cap_usd,
                    last_event_seq: 1,
                    updated_at_unix: now,
                };
                let event = WorkflowEvent {
                    id: 0,
                    task_id: task_id.clone(),
                    seq_no: 1,
                    phase: Phase::A,
                    event_type: "flow_started".into(),
                    payload_json: "{}".into(),
                    created_at: now,
                };

                let tx = store.conn.transaction().map_err(store_err)?;
                Store::create_task_tx(&tx, &state)?;
                Store::append_event_tx(&tx, &event)?;
                tx.commit().map_err(store_err)
            })
            .await
    }

    /// Move a workflow to its next phase according to the trigger.
    ///
    /// The gate for the current phase is evaluated first; a blocked gate
    /// fails with `phase_gate_failed` carrying the blockers. The transition
    /// itself commits in a single transaction under optimistic lock; on an
    /// `optimistic_lock` miss the caller retries from the top.
    pub async fn advance(&self, task_id: &str, trigger: &TransitionTrigger) -> EngineResult<()> {
        let state = self.get_state(task_id).await?;

        if state.status == FlowStatus::Completed {
            return Err(EngineError::FlowAlreadyDone(task_id.to_string()));
        }

        let gate = self.gates.get(state.current_phase)?;
        let decision = gate.evaluate(&state).await?;
        if !decision.allow {
            return Err(EngineError::PhaseGateFailed {
                blockers: decision.blockers,
            });
        }

        let next_phase = resolve_next_phase(state.current_phase, &trigger.action)?;
        if !is_valid_transition(state.current_phase, next_phase) {
            return Err(EngineError::InvalidTransition(format!(
                "illegal transition {} -> {}",
                state.current_phase, next_phase
            )));
        }

        let trigger = trigger.clone();
        self.store
            .call(move |store| {
                let now = now_unix();
                let new_seq = state.last_event_seq + 1;

                let event = WorkflowEvent {
                    id: 0,
                    task_id: state.task_id.clone(),
                    seq_no: new_seq,
                    phase: next_phase,
                    event_type: "phase_transition".into(),
                    payload_json: json!({
                        "from": state.current_phase,
                        "to": next_phase,
                        "action": trigger.action,
                        "actor": trigger.actor,
                    })
                    .to_string(),
                    created_at: now,
                };

                let snapshot = PhaseSnapshot {
                    id: 0,
                    task_id: state.task_id.clone(),
                    phase: next_phase,
                    round: state.round,
                    snapshot_json: json!({
                        "from_phase": state.current_phase,
                        "to_phase": next_phase,
                        "trigger": trigger.action,
                    })
                    .to_string(),
                    checksum: String::new(),
                    created_at: now,
                };

                let mut updated = state.clone();
                updated.current_phase = next_phase;
                updated.last_event_seq = new_seq;
                updated.updated_at_unix = now;
                if next_phase == Phase::G {
                    updated.status = FlowStatus::Completed;
                }
                // Back-edge traversals count as rounds.
                if (state.current_phase == Phase::D && next_phase == Phase::C)
                    || (state.current_phase == Phase::F && next_phase == Phase::E)
                {
                    updated.round = state.round + 1;
                }

                let tx = store.conn.transaction().map_err(store_err)?;
                Store::append_event_tx(&tx, &event)?;
                Store::save_snapshot_tx(&tx, &snapshot)?;
                Store::update_task_with_version_tx(&tx, &updated)?;
                tx.commit().map_err(store_err)
            })
            .await
    }

    /// Current state of a workflow.
    pub async fn get_state(&self, task_id: &str) -> EngineResult<FlowState> {
        let task_id = task_id.to_string();
        self.store.call(move |store| store.get_task(&task_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::cost::BudgetGovernor;

    fn engine() -> (Engine, StoreHandle) {
        let store = StoreHandle::new(Store::open_in_memory().unwrap());
        let gates = Arc::new(GateRegistry::with_default(BudgetGovernor::new(
            store.clone(),
        )));
        (Engine::new(store.clone(), gates), store)
    }

    fn advance_trigger(action: &str) -> TransitionTrigger {
        TransitionTrigger {
            action: action.into(),
            actor: "test".into(),
        }
    }

    // =========================================
    // Transition table
    // =========================================

    #[test]
    fn test_transition_table() {
        assert!(is_valid_transition(Phase::A, Phase::B));
        assert!(is_valid_transition(Phase::B, Phase::C));
        assert!(is_valid_transition(Phase::C, Phase::D));
        assert!(is_valid_transition(Phase::D, Phase::E));
        assert!(is_valid_transition(Phase::D, Phase::C));
        assert!(is_valid_transition(Phase::E, Phase::F));
        assert!(is_valid_transition(Phase::F, Phase::G));
        assert!(is_valid_transition(Phase::F, Phase::E));

        assert!(!is_valid_transition(Phase::A, Phase::C));
        assert!(!is_valid_transition(Phase::B, Phase::A));
        assert!(!is_valid_transition(Phase::G, Phase::A));
        assert!(!is_valid_transition(Phase::C, Phase::B));
    }

    #[test]
    fn test_resolve_next_phase_actions() {
        assert_eq!(resolve_next_phase(Phase::A, "advance").unwrap(), Phase::B);
        assert_eq!(resolve_next_phase(Phase::D, "rollback").unwrap(), Phase::C);
        assert_eq!(resolve_next_phase(Phase::F, "rework").unwrap(), Phase::E);

        assert!(matches!(
            resolve_next_phase(Phase::G, "advance"),
            Err(EngineError::InvalidTransition(_))
        ));
        assert!(matches!(
            resolve_next_phase(Phase::C, "rollback"),
            Err(EngineError::InvalidTransition(_))
        ));
        assert!(matches!(
            resolve_next_phase(Phase::D, "rework"),
            Err(EngineError::InvalidTransition(_))
        ));
        assert!(matches!(
            resolve_next_phase(Phase::A, "jump"),
            Err(EngineError::InvalidTransition(_))
        ));
    }

    // =========================================
    // Flow lifecycle
    // =========================================

    #[tokio::test]
    async fn test_start_flow_writes_initial_state_and_event() {
        let (engine, store) = engine();
        engine.start_flow("t1", 100.0).await.unwrap();

        let state = engine.get_state("t1").await.unwrap();
        assert_eq!(state.current_phase, Phase::A);
        assert_eq!(state.status, FlowStatus::Running);
        assert_eq!(state.state_version, 1);
        assert_eq!(state.last_event_seq, 1);

        let events = store
            .call(|s| s.list_events_since("t1", 0))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "flow_started");
        assert_eq!(events[0].seq_no, 1);
    }

    #[tokio::test]
    async fn test_duplicate_start_flow_fails_and_preserves_state() {
        let (engine, _store) = engine();
        engine.start_flow("t1", 100.0).await.unwrap();
        engine.advance("t1", &advance_trigger("advance")).await.unwrap();

        let err = engine.start_flow("t1", 50.0).await.unwrap_err();
        assert_eq!(err, EngineError::DuplicateTask("t1".into()));

        // First flow's state is unchanged by the failed duplicate.
        let state = engine.get_state("t1").await.unwrap();
        assert_eq!(state.current_phase, Phase::B);
        assert_eq!(state.budget_cap_usd, 100.0);
    }

    #[tokio::test]
    async fn test_advance_appends_event_snapshot_and_updates_state() {
        let (engine, store) = engine();
        engine.start_flow("t1", 100.0).await.unwrap();
        engine.advance("t1", &advance_trigger("advance")).await.unwrap();

        let state = engine.get_state("t1").await.unwrap();
        assert_eq!(state.current_phase, Phase::B);
        assert_eq!(state.state_version, 2);
        assert_eq!(state.last_event_seq, 2);

        let events = store.call(|s| s.list_events_since("t1", 0)).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_type, "phase_transition");
        let payload: serde_json::Value = serde_json::from_str(&events[1].payload_json).unwrap();
        assert_eq!(payload["from"], "A");
        assert_eq!(payload["to"], "B");

        let snap = store
            .call(|s| s.latest_snapshot("t1", Phase::B))
            .await
            .unwrap();
        assert!(snap.is_some());
    }

    #[tokio::test]
    async fn test_advance_unknown_task_is_flow_not_found() {
        let (engine, _store) = engine();
        let err = engine.advance("ghost", &advance_trigger("advance")).await.unwrap_err();
        assert_eq!(err, EngineError::FlowNotFound("ghost".into()));
    }

    #[tokio::test]
    async fn test_completed_flow_rejects_advance() {
        let (engine, _store) = engine();
        engine.start_flow("t1", 100.0).await.unwrap();
        for _ in 0..6 {
            engine.advance("t1", &advance_trigger("advance")).await.unwrap();
        }

        let state = engine.get_state("t1").await.unwrap();
        assert_eq!(state.current_phase, Phase::G);
        assert_eq!(state.status, FlowStatus::Completed);

        let err = engine.advance("t1", &advance_trigger("advance")).await.unwrap_err();
        assert_eq!(err, EngineError::FlowAlreadyDone("t1".into()));
    }

    #[tokio::test]
    async fn test_rollback_from_d_increments_round() {
        let (engine, _store) = engine();
        engine.start_flow("t1", 100.0).await.unwrap();
        for _ in 0..3 {
            engine.advance("t1", &advance_trigger("advance")).await.unwrap();
        }

        engine.advance("t1", &advance_trigger("rollback")).await.unwrap();
        let state = engine.get_state("t1").await.unwrap();
        assert_eq!(state.current_phase, Phase::C);
        assert_eq!(state.round, 1);
        assert_eq!(state.last_event_seq, 5);
    }

    #[tokio::test]
    async fn test_illegal_rework_leaves_state_unchanged() {
        let (engine, _store) = engine();
        engine.start_flow("t1", 100.0).await.unwrap();
        for _ in 0..3 {
            engine.advance("t1", &advance_trigger("advance")).await.unwrap();
        }

        let before = engine.get_state("t1").await.unwrap();
        let err = engine.advance("t1", &advance_trigger("rework")).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition(_)));

        let after = engine.get_state("t1").await.unwrap();
        assert_eq!(before, after);
    }
}
