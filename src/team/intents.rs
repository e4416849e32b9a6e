//! File-scoped intent leases: acquire, release, execute.
//!
//! All reads happen before the write transaction opens; the store's single
//! write connection must never be held across lookups.

use uuid::Uuid;

use crate::domain::{now_unix, AuditRecord, Intent};
use crate::errors::{EngineError, EngineResult};
use crate::store::{store_err, Store, StoreHandle};

/// Arbitrates per-file write locks with leases and ownership checks.
#[derive(Clone)]
pub struct IntentResolver {
    store: StoreHandle,
}

impl IntentResolver {
    pub fn new(store: StoreHandle) -> Self {
        IntentResolver { store }
    }

    /// Claim an intent lock on a file.
    ///
    /// Fails with `intent_conflict` if any active intent already targets
    /// the file, and with `file_ownership` if the worker does not own it.
    /// On success the intent is persisted as `pending` with a lease of
    /// `lease_duration_sec` from now.
    pub async fn acquire_lock(&self, intent: &Intent, lease_duration_sec: i64) -> EngineResult<()> {
        let mut intent = intent.clone();
        let worker_id = intent.worker_id.clone();
        let actor = intent.worker_id.clone();
        let task_id = intent.task_id.clone();

        self.store
            .call(move |store| {
                // Reads first: conflict scan, then ownership.
                let active =
                    store.find_active_intents_by_file(&intent.task_id, &intent.target_file)?;
                if !active.is_empty() {
                    return Err(EngineError::IntentConflict(intent.target_file.clone()));
                }

                let worker = store.get_worker(&worker_id)?;
                if !worker.file_ownership.contains(&intent.target_file) {
                    return Err(EngineError::FileOwnership(intent.target_file.clone()));
                }

                intent.status = "pending".into();
                intent.lease_until = now_unix() + lease_duration_sec;

                let tx = store.conn.transaction().map_err(store_err)?;
                Store::upsert_intent_tx(&tx, &intent)?;
                tx.commit().map_err(store_err)
            })
            .await?;

        self.audit(&task_id, &actor, "lock_acquired").await;
        Ok(())
    }

    /// Cancel an existing intent lock.
    pub async fn release_lock(&self, intent_id: &str) -> EngineResult<()> {
        let id = intent_id.to_string();
        let (task_id, actor) = self
            .store
            .call(move |store| {
                let mut existing = store.get_intent(&id)?;
                existing.status = "cancelled".into();

                let task_id = existing.task_id.clone();
                let actor = existing.worker_id.clone();

                let tx = store.conn.transaction().map_err(store_err)?;
                Store::upsert_intent_tx(&tx, &existing)?;
                tx.commit().map_err(store_err)?;
                Ok((task_id, actor))
            })
            .await?;

        self.audit(&task_id, &actor, "lock_released").await;
        Ok(())
    }

    /// Complete an intent: verify the lease is still live and the pre-hash
    /// matches the file's current hash, then mark it done with `post_hash`.
    pub async fn execute(
        &self,
        intent_id: &str,
        current_hash: &str,
        post_hash: &str,
    ) -> EngineResult<()> {
        let id = intent_id.to_string();
        let current_hash = current_hash.to_string();
        let post_hash = post_hash.to_string();
        let (task_id, actor) = self
            .store
            .call(move |store| {
                let existing = store.get_intent(&id)?;

                if existing.lease_until < now_unix() {
                    return Err(EngineError::LeaseExpired(id.clone()));
                }
                if existing.pre_hash != current_hash {
                    return Err(EngineError::IntentHashMismatch(id.clone()));
                }

                let tx = store.conn.transaction().map_err(store_err)?;
                Store::mark_intent_done_tx(&tx, &id, &post_hash)?;
                tx.commit().map_err(store_err)?;
                Ok((existing.task_id, existing.worker_id))
            })
            .await?;

        self.audit(&task_id, &actor, "intent_executed").await;
        Ok(())
    }

    async fn audit(&self, task_id: &str, actor: &str, action: &str) {
        let record = AuditRecord {
            id: format!("aud-{}", Uuid::new_v4()),
            task_id: task_id.to_string(),
            category: "intent".into(),
            actor: actor.to_string(),
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
