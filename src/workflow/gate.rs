//! Composable phase exit gates.
//!
//! A gate is a predicate on task state deciding whether the workflow may
//! leave its current phase. The registry maps each phase to one gate
//! instance; wrappers compose richer policies around a base gate.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{CompactionSlots, CostAction, FlowState, FlowStatus, GateDecision, Phase};
use crate::errors::{EngineError, EngineResult};
use crate::team::compaction::CompactionValidator;
use crate::workflow::cost::BudgetGovernor;

/// A phase exit predicate.
#[async_trait]
pub trait Gate: Send + Sync {
    fn name(&self) -> &'static str;
    async fn evaluate(&self, state: &FlowState) -> EngineResult<GateDecision>;
}

/// Source of compaction slots for a task, consulted by [`CompactionGate`].
#[async_trait]
pub trait SlotsSource: Send + Sync {
    async fn slots(&self, state: &FlowState) -> EngineResult<CompactionSlots>;
}

/// Source of unresolved review blockers, consulted by [`ReviewGate`].
#[async_trait]
pub trait BlockerSource: Send + Sync {
    async fn blockers(&self, state: &FlowState) -> EngineResult<Vec<String>>;
}

/// Basic gate: allows only while the flow is running and within budget.
pub struct DefaultGate {
    pub governor: BudgetGovernor,
}

#[async_trait]
impl Gate for DefaultGate {
    fn name(&self) -> &'static str {
        "default"
    }

    async fn evaluate(&self, state: &FlowState) -> EngineResult<GateDecision> {
        if state.status != FlowStatus::Running {
            return Ok(GateDecision::blocked(vec![format!(
                "flow is not running (status={})",
                state.status.as_str()
            )]));
        }
        if self.governor.check_budget(state) == CostAction::Halt {
            return Ok(GateDecision::blocked(vec![
                "budget limit exceeded".to_string()
            ]));
        }
        Ok(GateDecision::allowed())
    }
}

/// Wraps an inner gate and validates compaction slots when it allows.
/// The slots source is not consulted while the inner gate blocks.
pub struct CompactionGate {
    pub inner: Arc<dyn Gate>,
    pub validator: CompactionValidator,
    pub slots: Arc<dyn SlotsSource>,
}

#[async_trait]
impl Gate for CompactionGate {
    fn name(&self) -> &'static str {
        "compaction"
    }

    async fn evaluate(&self, state: &FlowState) -> EngineResult<GateDecision> {
        let inner = self.inner.evaluate(state).await?;
        if !inner.allow {
            return Ok(inner);
        }

        let slots = self.slots.slots(state).await?;
        if let Err(err) = self.validator.validate(&slots) {
            return Ok(GateDecision::blocked(vec![err.to_string()]));
        }
        Ok(inner)
    }
}

/// Wraps an inner gate and blocks while unresolved review blockers exist.
pub struct ReviewGate {
    pub inner: Arc<dyn Gate>,
    pub blockers: Arc<dyn BlockerSource>,
}

#[async_trait]
impl Gate for ReviewGate {
    fn name(&self) -> &'static str {
        "review"
    }

    async fn evaluate(&self, state: &FlowState) -> EngineResult<GateDecision> {
        let inner = self.inner.evaluate(state).await?;
        if !inner.allow {
            return Ok(inner);
        }

        let blockers = self.blockers.blockers(state).await?;
        if !blockers.is_empty() {
            return Ok(GateDecision::blocked(blockers));
        }
        Ok(inner)
    }
}

/// Evaluates all children; allows only if every child allows. Blockers are
/// concatenated in child order.
pub struct CompositeGate {
    pub gates: Vec<Arc<dyn Gate>>,
}

#[async_trait]
impl Gate for CompositeGate {
    fn name(&self) -> &'static str {
        "composite"
    }

    async fn evaluate(&self, state: &FlowState) -> EngineResult<GateDecision> {
        let mut result = GateDecision::allowed();
        for gate in &self.gates {
            let decision = gate.evaluate(state).await?;
            if !decision.allow {
                result.allow = false;
                result.blockers.extend(decision.blockers);
            }
        }
        Ok(result)
    }
}

/// Maps each phase to its gate. Populated at startup.
pub struct GateRegistry {
    gates: HashMap<Phase, Arc<dyn Gate>>,
}

impl GateRegistry {
    /// Registry with a [`DefaultGate`] registered for every phase.
    pub fn with_default(governor: BudgetGovernor) -> Self {
        let default: Arc<dyn Gate> = Arc::new(DefaultGate { governor });
        let mut gates: HashMap<Phase, Arc<dyn Gate>> = HashMap::new();
        for phase in [
            Phase::A,
            Phase::B,
            Phase::C,
            Phase::D,
            Phase::E,
            Phase::F,
            Phase::G,
        ] {
            gates.insert(phase, default.clone());
        }
        GateRegistry { gates }
    }

    /// Replace the gate for a phase.
    pub fn register(&mut self, phase: Phase, gate: Arc<dyn Gate>) {
        self.gates.insert(phase, gate);
    }

    /// The gate for a phase, or `gate_not_registered`.
    pub fn get(&self, phase: Phase) -> EngineResult<Arc<dyn Gate>> {
        self.gates
            .get(&phase)
            .cloned()
            .ok_or_else(|| EngineError::GateNotRegistered(phase.to_string()))
    }
}
