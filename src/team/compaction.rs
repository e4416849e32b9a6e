//! Validation of the semantic slots preserved across phase boundaries.

use crate::domain::CompactionSlots;
use crate::errors::{EngineError, EngineResult};

/// Validates that the required compaction slots are populated before a
/// worker is spawned across a phase boundary.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactionValidator;

impl CompactionValidator {
    /// Checks the required slots: task spec, acceptance criteria, current
    /// phase, and artifact refs. Returns a structured error listing every
    /// missing slot. Richer per-phase policies may wrap this with stricter
    /// checks.
    pub fn validate(&self, slots: &CompactionSlots) -> EngineResult<()> {
        let mut missing = Vec::new();

        if slots.task_spec.trim().is_empty() {
            missing.push("TaskSpec".to_string());
        }
        if slots.acceptance_criteria.trim().is_empty() {
            missing.push("AcceptanceCriteria".to_string());
        }
        if slots.current_phase.trim().is_empty() {
            missing.push("CurrentPhase".to_string());
        }
        if slots.artifact_refs.is_empty() {
            missing.push("ArtifactRefs".to_string());
        }

        if !missing.is_empty() {
            return Err(EngineError::CompactionInvalid { missing });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ArtifactRef;

    fn full_slots() -> CompactionSlots {
        CompactionSlots {
            task_spec: "implement the lexer".into(),
            acceptance_criteria: "tokenizes all fixtures".into(),
            current_phase: "C".into(),
            open_risks: vec!["unicode handling".into()],
            active_constraints: vec!["no new deps".into()],
            file_ownership: vec!["src/lexer.rs".into()],
            artifact_refs: vec![ArtifactRef {
                id: "a1".into(),
                kind: "write".into(),
                path: "src/lexer.rs".into(),
                version: 1,
                hash: String::new(),
            }],
            pending_intents: vec![],
            next_phase_reqs: vec!["review checklist".into()],
        }
    }

    #[test]
    fn test_full_slots_validate() {
        assert!(CompactionValidator.validate(&full_slots()).is_ok());
    }

    #[test]
    fn test_empty_slots_list_all_required() {
        let err = CompactionValidator
            .validate(&CompactionSlots::default())
            .unwrap_err();
        match err {
            EngineError::CompactionInvalid { missing } => {
                assert_eq!(
                    missing,
                    vec!["TaskSpec", "AcceptanceCriteria", "CurrentPhase", "ArtifactRefs"]
                );
            }
            other => panic!("expected CompactionInvalid, got {other:?}"),
        }
    }

    #[test]
    fn test_whitespace_only_slot_is_missing() {
        let mut slots = full_slots();
        slots.task_spec = "   ".into();
        let err = CompactionValidator.validate(&slots).unwrap_err();
        assert!(err.to_string().contains("TaskSpec"));
        assert!(!err.to_string().contains("AcceptanceCriteria"));
    }

    #[test]
    fn test_optional_slots_may_be_empty() {
        let mut slots = full_slots();
        slots.open_risks.clear();
        slots.pending_intents.clear();
        slots.next_phase_reqs.clear();
        assert!(CompactionValidator.validate(&slots).is_ok());
    }
}
