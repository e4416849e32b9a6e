//! Capability sheets and request-time permission checks.

use std::path::Path;

use glob::Pattern;
use serde_json::json;
use uuid::Uuid;

use crate::domain::{now_unix, AuditRecord, CapabilitySheet};
use crate::errors::{EngineError, EngineResult};
use crate::store::StoreHandle;

/// File patterns denied for every task regardless of its allowlist.
const DEFAULT_DENIED_PATTERNS: &[&str] = &[".env", "*.key", ".git/*"];

/// Builds capability sheets and evaluates path/command permissions.
/// Deny patterns take precedence over the allowlist; every denial is
/// audited with `warning` severity.
#[derive(Clone)]
pub struct PermissionBroker {
    store: StoreHandle,
}

impl PermissionBroker {
    pub fn new(store: StoreHandle) -> Self {
        PermissionBroker { store }
    }

    /// A capability sheet for the task with the standard denied patterns.
    pub fn build_capability_sheet(
        &self,
        task_id: &str,
        paths: Vec<String>,
        commands: Vec<String>,
    ) -> CapabilitySheet {
        CapabilitySheet {
            task_id: task_id.to_string(),
            allowed_paths: paths,
            allowed_commands: commands,
            denied_patterns: DEFAULT_DENIED_PATTERNS.iter().map(|p| p.to_string()).collect(),
            created_at_unix: now_unix(),
        }
    }

    /// Whether `path` and `command` are allowed by the sheet. Checks run
    /// in order: denied patterns, path prefix, exact command.
    pub async fn check_permission(
        &self,
        sheet: &CapabilitySheet,
        path: &str,
        command: &str,
    ) -> EngineResult<bool> {
        for pattern in &sheet.denied_patterns {
            if matches_pattern(pattern, path)? {
                self.audit_denial(&sheet.task_id, path, command, &format!("denied by pattern: {pattern}"))
                    .await;
                return Ok(false);
            }
        }

        if !sheet.allowed_paths.iter().any(|allowed| path.starts_with(allowed)) {
            self.audit_denial(&sheet.task_id, path, command, "path not in allowed list")
                .await;
            return Ok(false);
        }

        if !sheet.allowed_commands.iter().any(|allowed| command == allowed) {
            self.audit_denial(&sheet.task_id, path, command, "command not in allowed list")
                .await;
            return Ok(false);
        }

        Ok(true)
    }

    async fn audit_denial(&self, task_id: &str, path: &str, command: &str, reason: &str) {
        let record = AuditRecord {
            id: format!("aud-perm-{}", Uuid::new_v4()),
            task_id: task_id.to_string(),
            category: "permission".into(),
            actor: "system".into(),
            action: "permission_denied".into(),
            request_json: json!({"path": path, "command": command}).to_string(),
            decision_json: json!({"reason": reason}).to_string(),
            severity: "warning".into(),
            created_at: now_unix(),
        };
        let _ = self
            .store
            .call(move |store| store.record_audit(&record))
            .await;
    }
}

/// Whether a path matches a denied pattern: exact match, base-name match,
/// glob on the full path, or glob on the base name.
fn matches_pattern(pattern: &str, path: &str) -> EngineResult<bool> {
    if path == pattern {
        return Ok(true);
    }

    let base = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if base == pattern {
        return Ok(true);
    }

    let glob = Pattern::new(pattern).map_err(|e| EngineError::ConfigInvalid {
        problems: vec![format!("bad denied pattern {pattern:?}: {e}")],
    })?;
    Ok(glob.matches(path) || glob.matches(&base))
}
