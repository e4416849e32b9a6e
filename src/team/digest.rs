//! Construction of the lightweight context digest handed to workers.

use crate::domain::{ArtifactRef, ContextDigest, Deadline, Phase, WorkerSpec};
use crate::errors::EngineResult;
use crate::store::StoreHandle;

/// Builds a [`ContextDigest`] from task state, the latest phase snapshot,
/// and pending intents.
#[derive(Clone)]
pub struct DigestBuilder {
    store: StoreHandle,
}

impl DigestBuilder {
    pub fn new(store: StoreHandle) -> Self {
        DigestBuilder { store }
    }

    pub async fn build(
        &self,
        task_id: &str,
        phase: Phase,
        spec: &WorkerSpec,
    ) -> EngineResult<ContextDigest> {
        let id = task_id.to_string();
        let (task, snapshot, intents) = self
            .store
            .call(move |store| {
                let task = store.get_task(&id)?;
                let snapshot = store.latest_snapshot(&id, phase)?;
                let intents = store.list_intents_by_status(&id, "pending")?;
                Ok((task, snapshot, intents))
            })
            .await?;

        let mut constraints = vec![
            format!("budget_used={:.2}", task.budget_used_usd),
            format!("budget_cap={:.2}", task.budget_cap_usd),
            format!("phase={}", task.current_phase),
        ];
        if let Some(snap) = &snapshot {
            constraints.push(format!("snapshot_round={}", snap.round));
        }

        let artifact_refs = intents
            .iter()
            .enumerate()
            .map(|(i, intent)| ArtifactRef {
                id: intent.intent_id.clone(),
                kind: intent.operation.clone(),
                path: intent.target_file.clone(),
                version: i as i64 + 1,
                hash: String::new(),
            })
            .collect();

        Ok(ContextDigest {
            task_id: task_id.to_string(),
            phase_id: phase.to_string(),
            objective: format!("[{}] worker in phase {}", spec.role, phase),
            constraints,
            file_ownership: spec.file_ownership.clone(),
            deadline: Deadline {
                soft: format!("{}s", spec.soft_timeout_sec),
                hard: format!("{}s", spec.hard_timeout_sec),
            },
            artifact_refs,
            coding_standards: String::new(),
        })
    }
}
