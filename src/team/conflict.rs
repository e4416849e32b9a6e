//! Detection and classification of intent conflicts on the same file.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::Intent;
use crate::errors::{EngineError, EngineResult};
use crate::store::StoreHandle;

/// Kind of file conflict between two intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictType {
    Overlap,
    Delete,
    Create,
}

/// A conflict between two intents targeting the same file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileConflict {
    pub file: String,
    pub intent_a: Intent,
    pub intent_b: Intent,
    pub conflict_type: ConflictType,
}

/// Finds and classifies conflicts between active intents.
#[derive(Clone)]
pub struct ConflictDetector {
    store: StoreHandle,
}

impl ConflictDetector {
    pub fn new(store: StoreHandle) -> Self {
        ConflictDetector { store }
    }

    /// Scan all pending and running intents for a task and return every
    /// pairwise conflict on a shared file.
    pub async fn detect(&self, task_id: &str) -> EngineResult<Vec<FileConflict>> {
        let id = task_id.to_string();
        let all = self
            .store
            .call(move |store| {
                let mut pending = store.list_intents_by_status(&id, "pending")?;
                let running = store.list_intents_by_status(&id, "running")?;
                pending.extend(running);
                Ok(pending)
            })
            .await?;

        let mut by_file: HashMap<String, Vec<Intent>> = HashMap::new();
        for intent in all {
            by_file.entry(intent.target_file.clone()).or_default().push(intent);
        }

        let mut conflicts = Vec::new();
        for intents in by_file.values() {
            if intents.len() < 2 {
                continue;
            }
            for i in 0..intents.len() {
                for j in (i + 1)..intents.len() {
                    if let Some(conflict) = Self::detect_between(&intents[i], &intents[j]) {
                        conflicts.push(conflict);
                    }
                }
            }
        }
        Ok(conflicts)
    }

    /// Classify the conflict between two intents, or `None` when they
    /// target different files.
    pub fn detect_between(a: &Intent, b: &Intent) -> Option<FileConflict> {
        if a.target_file != b.target_file {
            return None;
        }

        let conflict_type = if a.operation == "delete" || b.operation == "delete" {
            ConflictType::Delete
        } else if a.operation == "create" && b.operation == "create" {
            ConflictType::Create
        } else {
            ConflictType::Overlap
        };

        Some(FileConflict {
            file: a.target_file.clone(),
            intent_a: a.clone(),
            intent_b: b.clone(),
            conflict_type,
        })
    }

    /// Conflict resolution is not implemented in the core; conflicts
    /// surface to a higher-level decision authority.
    pub fn resolve(&self, conflict: &FileConflict) -> EngineResult<()> {
        Err(EngineError::IntentConflict(conflict.file.clone()))
    }
}
