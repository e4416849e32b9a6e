//! End-to-end scenarios exercising the full engine stack against a real
//! (in-memory) store.

use std::sync::Arc;

use crucible::domain::{
    CostDelta, FlowStatus, Intent, Phase, Scores, ScoreCard, TransitionTrigger, WorkerSpec,
    WorkerState,
};
use crucible::errors::EngineError;
use crucible::review::{BlockerChecker, ConsensusEngine};
use crucible::store::{Store, StoreHandle};
use crucible::team::{IntentResolver, Supervisor, SupervisorConfig, TimeoutKind, WorkerManager};
use crucible::workflow::{BudgetGovernor, Engine, GateRegistry};

struct Harness {
    engine: Engine,
    governor: BudgetGovernor,
    store: StoreHandle,
}

fn harness() -> Harness {
    let store = StoreHandle::new(Store::open_in_memory().unwrap());
    let governor = BudgetGovernor::new(store.clone());
    let gates = Arc::new(GateRegistry::with_default(governor.clone()));
    Harness {
        engine: Engine::new(store.clone(), gates),
        governor,
        store,
    }
}

fn trigger(action: &str) -> TransitionTrigger {
    TransitionTrigger {
        action: action.into(),
        actor: "test".into(),
    }
}

// =========================================
// Scenario 1: happy path A through G
// =========================================

#[tokio::test]
async fn happy_path_runs_all_seven_phases() {
    let h = harness();
    h.engine.start_flow("t1", 100.0).await.unwrap();

    let expected = [Phase::B, Phase::C, Phase::D, Phase::E, Phase::F, Phase::G];
    for phase in expected {
        h.engine.advance("t1", &trigger("advance")).await.unwrap();
        let state = h.engine.get_state("t1").await.unwrap();
        assert_eq!(state.current_phase, phase);
    }

    let state = h.engine.get_state("t1").await.unwrap();
    assert_eq!(state.status, FlowStatus::Completed);
    assert_eq!(state.round, 0);
    assert_eq!(state.last_event_seq, 7);

    // Exactly seven events, densely numbered from 1 with no gaps.
    let events = h.store.call(|s| s.list_events_since("t1", 0)).await.unwrap();
    assert_eq!(events.len(), 7);
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.seq_no, i as i64 + 1);
    }
    assert_eq!(events[0].event_type, "flow_started");

    // Exactly six snapshots, one per transition target.
    for phase in expected {
        let snap = h
            .store
            .call(move |s| s.latest_snapshot("t1", phase))
            .await
            .unwrap();
        assert!(snap.is_some(), "missing snapshot for {phase}");
    }
    assert!(h
        .store
        .call(|s| s.latest_snapshot("t1", Phase::A))
        .await
        .unwrap()
        .is_none());
}

// =========================================
// Scenario 2: rollback at D
// =========================================

#[tokio::test]
async fn rollback_at_d_returns_to_c_and_counts_a_round() {
    let h = harness();
    h.engine.start_flow("t1", 100.0).await.unwrap();
    for _ in 0..3 {
        h.engine.advance("t1", &trigger("advance")).await.unwrap();
    }

    h.engine.advance("t1", &trigger("rollback")).await.unwrap();

    let state = h.engine.get_state("t1").await.unwrap();
    assert_eq!(state.current_phase, Phase::C);
    assert_eq!(state.round, 1);

    let events = h.store.call(|s| s.list_events_since("t1", 0)).await.unwrap();
    assert_eq!(events.len(), 5);

    // The flow is still running; the next advance from C is allowed.
    h.engine.advance("t1", &trigger("advance")).await.unwrap();
    assert_eq!(h.engine.get_state("t1").await.unwrap().current_phase, Phase::D);
}

// =========================================
// Scenario 3: rework at F
// =========================================

#[tokio::test]
async fn rework_at_f_returns_to_e() {
    let h = harness();
    h.engine.start_flow("t1", 100.0).await.unwrap();
    for _ in 0..5 {
        h.engine.advance("t1", &trigger("advance")).await.unwrap();
    }
    assert_eq!(h.engine.get_state("t1").await.unwrap().current_phase, Phase::F);

    h.engine.advance("t1", &trigger("rework")).await.unwrap();

    let state = h.engine.get_state("t1").await.unwrap();
    assert_eq!(state.current_phase, Phase::E);
    assert_eq!(state.round, 1);
}

// =========================================
// Scenario 4: illegal rework from D
// =========================================

#[tokio::test]
async fn rework_from_d_is_rejected_without_side_effects() {
    let h = harness();
    h.engine.start_flow("t1", 100.0).await.unwrap();
    for _ in 0..3 {
        h.engine.advance("t1", &trigger("advance")).await.unwrap();
    }

    let before = h.engine.get_state("t1").await.unwrap();
    let err = h.engine.advance("t1", &trigger("rework")).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition(_)));

    let after = h.engine.get_state("t1").await.unwrap();
    assert_eq!(before, after);
}

// =========================================
// Scenario 5: budget halt blocks the gate
// =========================================

#[tokio::test]
async fn budget_halt_blocks_subsequent_advance() {
    let h = harness();
    h.engine.start_flow("t2", 10.0).await.unwrap();

    let delta = CostDelta {
        amount_usd: 10.0,
        ..Default::default()
    };
    let action = h.governor.record_usage("t2", &delta).await.unwrap();
    assert_eq!(action, crucible::domain::CostAction::Halt);

    let err = h.engine.advance("t2", &trigger("advance")).await.unwrap_err();
    match err {
        EngineError::PhaseGateFailed { blockers } => {
            assert!(blockers.iter().any(|b| b.contains("budget limit exceeded")));
        }
        other => panic!("expected PhaseGateFailed, got {other:?}"),
    }
}

// =========================================
// Scenario 6: intent conflict between two workers
// =========================================

#[tokio::test]
async fn intent_conflict_resolves_after_cancellation() {
    let h = harness();
    let manager = WorkerManager::new(h.store.clone(), 5);
    let resolver = IntentResolver::new(h.store.clone());

    let spec = |_n: &str| WorkerSpec {
        task_id: "t1".into(),
        phase: Phase::C,
        role: "builder".into(),
        file_ownership: vec!["main.rs".into()],
        soft_timeout_sec: 300,
        hard_timeout_sec: 600,
    };
    let w1 = manager.spawn(&spec("w1")).await.unwrap();
    let w2 = manager.spawn(&spec("w2")).await.unwrap();

    let intent = |id: &str, worker: &str| Intent {
        intent_id: id.into(),
        task_id: "t1".into(),
        worker_id: worker.into(),
        target_file: "main.rs".into(),
        operation: "write".into(),
        ..Default::default()
    };

    resolver
        .acquire_lock(&intent("i1", &w1.worker_id), 60)
        .await
        .unwrap();

    let err = resolver
        .acquire_lock(&intent("i2", &w2.worker_id), 60)
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::IntentConflict("main.rs".into()));

    resolver.release_lock("i1").await.unwrap();
    resolver
        .acquire_lock(&intent("i2", &w2.worker_id), 60)
        .await
        .unwrap();
}

// =========================================
// Scenario 7: hard timeout replaces the worker
// =========================================

#[tokio::test]
async fn hard_timeout_replaces_worker_with_same_spec() {
    let h = harness();
    let manager = WorkerManager::new(h.store.clone(), 5);
    let supervisor = Supervisor::new(h.store.clone(), manager.clone(), SupervisorConfig::default());

    let worker = manager
        .spawn(&WorkerSpec {
            task_id: "t1".into(),
            phase: Phase::C,
            role: "builder".into(),
            file_ownership: vec!["main.rs".into()],
            soft_timeout_sec: 10,
            hard_timeout_sec: 30,
        })
        .await
        .unwrap();

    // Clock advanced 35 seconds past the last heartbeat.
    let actions = supervisor
        .check_timeouts("t1", worker.last_heartbeat + 35)
        .await
        .unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].kind, TimeoutKind::Hard);

    let timed_out_id = worker.worker_id.clone();
    let timed_out = h
        .store
        .call(move |s| s.get_worker(&timed_out_id))
        .await
        .unwrap();
    assert_eq!(timed_out.state, WorkerState::HardTimeout);

    let replacements = manager.list_active("t1").await.unwrap();
    assert_eq!(replacements.len(), 1);
    assert_eq!(replacements[0].role, worker.role);
    assert_eq!(replacements[0].file_ownership, worker.file_ownership);
}

// =========================================
// Scenario 8: consensus and blockers
// =========================================

#[tokio::test]
async fn consensus_passes_then_security_regression_blocks() {
    fn card(reviewer: &str, score: i64) -> ScoreCard {
        ScoreCard {
            review_id: format!("r-{reviewer}"),
            task_id: "t1".into(),
            reviewer: reviewer.into(),
            scores: Scores {
                correctness: score,
                security: score,
                maintainability: score,
                cost: score,
                delivery_risk: score,
            },
            issues: vec![],
            alternatives: vec![],
            verdict: "pass".into(),
            created_at: 0,
        }
    }

    let mut cards = vec![card("primary", 5), card("secondary", 3), card("lead", 4)];

    let result = ConsensusEngine::default().evaluate(&cards).unwrap();
    assert!((result.weighted_score - 4.2).abs() < 1e-9);
    assert_eq!(result.final_verdict, "pass");

    let (blocking, _) = BlockerChecker.check(&cards);
    assert!(!blocking);

    cards[0].scores.security = 1;
    let (blocking, reasons) = BlockerChecker.check(&cards);
    assert!(blocking);
    assert!(reasons.iter().any(|r| r.contains("security score 1")));
}

// =========================================
// Cross-cutting invariants
// =========================================

#[tokio::test]
async fn state_version_increments_by_one_per_transition() {
    let h = harness();
    h.engine.start_flow("t1", 100.0).await.unwrap();

    let mut previous = h.engine.get_state("t1").await.unwrap().state_version;
    for _ in 0..6 {
        h.engine.advance("t1", &trigger("advance")).await.unwrap();
        let version = h.engine.get_state("t1").await.unwrap().state_version;
        assert_eq!(version, previous + 1);
        previous = version;
    }
}

#[tokio::test]
async fn cost_recording_is_reflected_in_budget_used() {
    let h = harness();
    h.engine.start_flow("t1", 100.0).await.unwrap();

    let delta = CostDelta {
        amount_usd: 2.5,
        ..Default::default()
    };
    h.governor.record_usage("t1", &delta).await.unwrap();
    h.governor.record_usage("t1", &delta).await.unwrap();

    let state = h.engine.get_state("t1").await.unwrap();
    assert_eq!(state.budget_used_usd, 5.0);
}

#[tokio::test]
async fn on_disk_store_persists_flow_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.db");

    {
        let store = StoreHandle::new(Store::open(&path).unwrap());
        let governor = BudgetGovernor::new(store.clone());
        let gates = Arc::new(GateRegistry::with_default(governor));
        let engine = Engine::new(store, gates);
        engine.start_flow("t1", 25.0).await.unwrap();
        engine.advance("t1", &trigger("advance")).await.unwrap();
    }

    // Reopen the same database file; state survives.
    let store = StoreHandle::new(Store::open(&path).unwrap());
    let state = store.call(|s| s.get_task("t1")).await.unwrap();
    assert_eq!(state.current_phase, Phase::B);
    assert_eq!(state.budget_cap_usd, 25.0);

    let events = store.call(|s| s.list_events_since("t1", 0)).await.unwrap();
    assert_eq!(events.len(), 2);
}
