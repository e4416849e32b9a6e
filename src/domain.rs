//! Core data model shared by every subsystem.
//!
//! These types mirror the persisted schema and the wire shapes exchanged
//! with code agent providers. JSON field names are camelCase to match the
//! event log contract consumed by external observers.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Current unix timestamp in seconds.
pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}

/// Current unix timestamp in nanoseconds. Used for minting unique ids.
pub fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// Workflow phases A through G.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    A,
    B,
    C,
    D,
    E,
    F,
    G,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::A => "A",
            Phase::B => "B",
            Phase::C => "C",
            Phase::D => "D",
            Phase::E => "E",
            Phase::F => "F",
            Phase::G => "G",
        }
    }

    /// Parse a stored phase string. Returns `None` for unknown values.
    pub fn parse(s: &str) -> Option<Phase> {
        match s {
            "A" => Some(Phase::A),
            "B" => Some(Phase::B),
            "C" => Some(Phase::C),
            "D" => Some(Phase::D),
            "E" => Some(Phase::E),
            "F" => Some(Phase::F),
            "G" => Some(Phase::G),
            _ => None,
        }
    }

    /// The next phase on the standard forward path, or `None` from G.
    pub fn next_forward(&self) -> Option<Phase> {
        match self {
            Phase::A => Some(Phase::B),
            Phase::B => Some(Phase::C),
            Phase::C => Some(Phase::D),
            Phase::D => Some(Phase::E),
            Phase::E => Some(Phase::F),
            Phase::F => Some(Phase::G),
            Phase::G => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for Phase {
    fn default() -> Self {
        Phase::A
    }
}

/// Status of a workflow task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    Running,
    Blocked,
    Failed,
    Completed,
}

impl FlowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowStatus::Running => "running",
            FlowStatus::Blocked => "blocked",
            FlowStatus::Failed => "failed",
            FlowStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<FlowStatus> {
        match s {
            "running" => Some(FlowStatus::Running),
            "blocked" => Some(FlowStatus::Blocked),
            "failed" => Some(FlowStatus::Failed),
            "completed" => Some(FlowStatus::Completed),
            _ => None,
        }
    }
}

/// Current state of a workflow task. `state_version` is the optimistic
/// concurrency token: every successful update increments it by one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowState {
    pub task_id: String,
    pub current_phase: Phase,
    pub status: FlowStatus,
    pub state_version: i64,
    pub round: i64,
    pub budget_used_usd: f64,
    pub budget_cap_usd: f64,
    pub last_event_seq: i64,
    pub updated_at_unix: i64,
}

/// Trigger for a phase transition: `advance`, `rollback`, or `rework`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionTrigger {
    pub action: String,
    pub actor: String,
}

/// Result of evaluating a phase exit gate.
#[derive(Debug, Clone, Default)]
pub struct GateDecision {
    pub allow: bool,
    pub blockers: Vec<String>,
}

impl GateDecision {
    pub fn allowed() -> Self {
        GateDecision {
            allow: true,
            blockers: Vec::new(),
        }
    }

    pub fn blocked(blockers: Vec<String>) -> Self {
        GateDecision {
            allow: false,
            blockers,
        }
    }
}

/// Lifecycle state of a worker. `Done`, `Replaced`, and `HardTimeout` are
/// terminal: no transition out of them is permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Created,
    Running,
    SoftTimeout,
    HardTimeout,
    Replaced,
    Done,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Created => "created",
            WorkerState::Running => "running",
            WorkerState::SoftTimeout => "soft_timeout",
            WorkerState::HardTimeout => "hard_timeout",
            WorkerState::Replaced => "replaced",
            WorkerState::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<WorkerState> {
        match s {
            "created" => Some(WorkerState::Created),
            "running" => Some(WorkerState::Running),
            "soft_timeout" => Some(WorkerState::SoftTimeout),
            "hard_timeout" => Some(WorkerState::HardTimeout),
            "replaced" => Some(WorkerState::Replaced),
            "done" => Some(WorkerState::Done),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerState::Done | WorkerState::Replaced | WorkerState::HardTimeout
        )
    }
}

/// Parameters for spawning a worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerSpec {
    pub task_id: String,
    pub phase: Phase,
    pub role: String,
    pub file_ownership: Vec<String>,
    pub soft_timeout_sec: i64,
    pub hard_timeout_sec: i64,
}

/// A tracked worker instance. File ownership is advisory and consulted by
/// the intent resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRef {
    pub worker_id: String,
    pub task_id: String,
    pub phase: Phase,
    pub role: String,
    pub state: WorkerState,
    pub file_ownership: Vec<String>,
    pub soft_timeout_sec: i64,
    pub hard_timeout_sec: i64,
    pub last_heartbeat: i64,
    pub created_at_unix: i64,
}

/// A planned file operation by a worker, with a lease and pre/post hashes
/// for conflict detection. At most one non-terminal intent may exist per
/// `(task_id, target_file)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intent {
    pub intent_id: String,
    pub task_id: String,
    pub worker_id: String,
    pub target_file: String,
    pub operation: String,
    pub status: String,
    pub pre_hash: String,
    pub post_hash: String,
    pub payload_hash: String,
    pub lease_until: i64,
}

/// Pointer to a versioned artifact in the task workspace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRef {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
    pub version: i64,
    pub hash: String,
}

/// Soft and hard time limits rendered for worker context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Deadline {
    pub soft: String,
    pub hard: String,
}

/// Lightweight context index handed to a worker at spawn time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextDigest {
    pub task_id: String,
    pub phase_id: String,
    pub objective: String,
    pub constraints: Vec<String>,
    pub file_ownership: Vec<String>,
    pub deadline: Deadline,
    pub artifact_refs: Vec<ArtifactRef>,
    pub coding_standards: String,
}

/// The nine semantic slots that must survive context compaction across a
/// phase boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionSlots {
    pub task_spec: String,
    pub acceptance_criteria: String,
    pub current_phase: String,
    pub open_risks: Vec<String>,
    pub active_constraints: Vec<String>,
    pub file_ownership: Vec<String>,
    pub artifact_refs: Vec<ArtifactRef>,
    pub pending_intents: Vec<String>,
    pub next_phase_reqs: Vec<String>,
}

/// An entry in the append-only workflow event log. `(task_id, seq_no)` is
/// unique and densely numbered from 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEvent {
    pub id: i64,
    pub task_id: String,
    pub seq_no: i64,
    pub phase: Phase,
    pub event_type: String,
    pub payload_json: String,
    pub created_at: i64,
}

/// State captured at a phase boundary. Latest-wins per `(task, phase)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseSnapshot {
    pub id: i64,
    pub task_id: String,
    pub phase: Phase,
    pub round: i64,
    pub snapshot_json: String,
    pub checksum: String,
    pub created_at: i64,
}

/// Immutable record of a significant decision: permission denial, timeout,
/// session start/stop, intent acquisition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: String,
    pub task_id: String,
    pub category: String,
    pub actor: String,
    pub action: String,
    pub request_json: String,
    pub decision_json: String,
    pub severity: String,
    pub created_at: i64,
}

/// The five review dimensions, each scored 1-5.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scores {
    pub correctness: i64,
    pub security: i64,
    pub maintainability: i64,
    pub cost: i64,
    pub delivery_risk: i64,
}

impl Scores {
    /// Mean of the five dimensions.
    pub fn average(&self) -> f64 {
        (self.correctness + self.security + self.maintainability + self.cost + self.delivery_risk)
            as f64
            / 5.0
    }
}

/// A problem found during review.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub severity: String,
    pub location: String,
    pub description: String,
    pub suggestion: String,
    pub evidence: String,
}

/// Structured review output from a single reviewer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreCard {
    pub review_id: String,
    pub task_id: String,
    pub reviewer: String,
    pub scores: Scores,
    pub issues: Vec<Issue>,
    pub alternatives: Vec<String>,
    pub verdict: String,
    pub created_at: i64,
}

/// Aggregated review decision across all score cards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusResult {
    pub weighted_score: f64,
    pub blocking: bool,
    pub block_reasons: Vec<String>,
    pub final_verdict: String,
}

/// Identifies a code agent provider (e.g. "claude", "codex").
pub type Provider = String;

/// Configuration for a single code agent session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub task_id: String,
    pub role: String,
    pub workspace: String,
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
    pub timeout_sec: i64,
    pub context_file: String,
}

/// Provider-agnostic event parsed from one line of a session's stdout.
/// `payload` is an independent copy of the source line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub provider: Provider,
    pub session_id: String,
    pub payload: String,
}

/// A single cost increment attributed to a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostDelta {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub amount_usd: f64,
    #[serde(default)]
    pub provider: Provider,
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub created_at: i64,
}

/// Per-task allowlist of paths and commands, with deny-pattern overrides.
/// Deny always takes precedence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitySheet {
    pub task_id: String,
    pub allowed_paths: Vec<String>,
    pub allowed_commands: Vec<String>,
    pub denied_patterns: Vec<String>,
    pub created_at_unix: i64,
}

/// Decision from the budget governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostAction {
    Continue,
    Warn,
    Halt,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_forward_chain() {
        assert_eq!(Phase::A.next_forward(), Some(Phase::B));
        assert_eq!(Phase::F.next_forward(), Some(Phase::G));
        assert_eq!(Phase::G.next_forward(), None);
    }

    #[test]
    fn test_phase_round_trips_through_str() {
        for p in [
            Phase::A,
            Phase::B,
            Phase::C,
            Phase::D,
            Phase::E,
            Phase::F,
            Phase::G,
        ] {
            assert_eq!(Phase::parse(p.as_str()), Some(p));
        }
        assert_eq!(Phase::parse("H"), None);
    }

    #[test]
    fn test_worker_terminal_states() {
        assert!(WorkerState::Done.is_terminal());
        assert!(WorkerState::Replaced.is_terminal());
        assert!(WorkerState::HardTimeout.is_terminal());
        assert!(!WorkerState::Created.is_terminal());
        assert!(!WorkerState::Running.is_terminal());
        assert!(!WorkerState::SoftTimeout.is_terminal());
    }

    #[test]
    fn test_flow_status_round_trips() {
        for s in [
            FlowStatus::Running,
            FlowStatus::Blocked,
            FlowStatus::Failed,
            FlowStatus::Completed,
        ] {
            assert_eq!(FlowStatus::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn test_scores_average() {
        let scores = Scores {
            correctness: 5,
            security: 4,
            maintainability: 4,
            cost: 3,
            delivery_risk: 4,
        };
        assert!((scores.average() - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cost_delta_decodes_with_missing_fields() {
        // Provider payloads may omit fields; they default to zero/empty.
        let delta: CostDelta = serde_json::from_str(r#"{"amountUsd": 1.25}"#).unwrap();
        assert_eq!(delta.amount_usd, 1.25);
        assert_eq!(delta.input_tokens, 0);
        assert!(delta.provider.is_empty());
    }

    #[test]
    fn test_flow_state_serializes_camel_case() {
        let state = FlowState {
            task_id: "t1".into(),
            current_phase: Phase::A,
            status: FlowStatus::Running,
            state_version: 1,
            round: 0,
            budget_used_usd: 0.0,
            budget_cap_usd: 100.0,
            last_event_seq: 1,
            updated_at_unix: 0,
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"taskId\""));
        assert!(json.contains("\"currentPhase\""));
        assert!(json.contains("\"status\":\"running\""));
    }
}
