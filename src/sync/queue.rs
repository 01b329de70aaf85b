//! Persistent mutation queue
//!
//! Every local change the remote store has not acknowledged lives here as a
//! [`Mutation`]. The queue owns ordering (per-target FIFO), retry
//! scheduling, and the dead-letter state. Dispatch itself happens in the
//! engine.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::mutation::{
    ChecklistPatch, DeadReason, Mutation, MutationId, MutationPayload, MutationStatus,
    QueueCounts, ResultPatch,
};
use super::retry::RetryPolicy;
use crate::error::{FailureClass, QueueError, StoreError};
use crate::model::{AuditResultMirror, ChecklistMirror, Collection, EntityMirror};
use crate::storage::{entities, queue, Lane, LocalStore};

/// Result of an optimistic local write
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    /// Local write and queue entry committed together
    Queued { mutation_id: MutationId },
    /// Local write committed, queue entry deferred to dirty recovery
    LocalOnly { reason: String },
}

/// What happened to a mutation after a failed dispatch
#[derive(Debug, Clone, PartialEq)]
pub enum Settled {
    Retrying { attempts: u32, retry_in: Duration },
    Dead(DeadReason),
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Snapshot of the editable fields of a result
pub fn result_patch(result: &AuditResultMirror) -> ResultPatch {
    ResultPatch {
        status: result.status,
        comment: result.comment.clone(),
        photos: result.photos.clone(),
        quantitative: result.quantitative.clone().map(|q| q.recomputed()),
    }
}

/// Every editable field of a checklist
pub fn checklist_patch(checklist: &ChecklistMirror) -> ChecklistPatch {
    ChecklistPatch {
        status: Some(checklist.status.clone()),
        name: Some(checklist.name.clone()),
        system_name: checklist.system_name.clone(),
    }
}

fn with_dirty(entity: &EntityMirror, dirty: bool) -> EntityMirror {
    let mut entity = entity.clone();
    match &mut entity {
        EntityMirror::Checklist(c) => c.dirty = dirty,
        EntityMirror::AuditResult(r) => r.dirty = dirty,
        EntityMirror::Project(_) => {}
    }
    entity
}

pub struct MutationQueue {
    store: Arc<LocalStore>,
    policy: RetryPolicy,
}

impl MutationQueue {
    pub fn new(store: Arc<LocalStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Append a mutation with no accompanying local write
    pub fn enqueue(&self, target_id: &str, payload: &MutationPayload) -> Result<Mutation, StoreError> {
        let mutation = self
            .store
            .with_conn(|conn| queue::insert_mutation(conn, target_id, payload, now_ms()))?;
        debug!(
            id = %mutation.id,
            target = %target_id,
            kind = mutation.mutation_type.as_str(),
            "Mutation enqueued"
        );
        Ok(mutation)
    }

    /// Optimistic write: upsert the mirror and enqueue its mutation.
    ///
    /// Both steps share one transaction. The mirror is written with the
    /// dirty flag set and the enqueue runs in a savepoint that also clears
    /// the flag, so if only the enqueue fails the local write still commits
    /// and [`MutationQueue::recover_dirty`] enqueues it later.
    pub fn apply_and_enqueue(
        &self,
        local: &EntityMirror,
        payload: &MutationPayload,
    ) -> Result<EnqueueOutcome, StoreError> {
        let collection = local.collection();
        let target_id = local.id().to_string();
        let dirty = with_dirty(local, true);

        let outcome = self.store.with_tx(|tx| {
            entities::put_entity(tx, &dirty)?;

            let sp = tx.savepoint()?;
            let queued = queue::insert_mutation(&sp, &target_id, payload, now_ms()).and_then(|m| {
                entities::set_dirty(&sp, collection, &target_id, false)?;
                Ok(m)
            });
            match queued {
                Ok(mutation) => {
                    sp.commit()?;
                    Ok(EnqueueOutcome::Queued { mutation_id: mutation.id })
                }
                // Dropping the savepoint rolls back only the enqueue
                Err(e) => Ok(EnqueueOutcome::LocalOnly { reason: e.to_string() }),
            }
        })?;

        match &outcome {
            EnqueueOutcome::Queued { mutation_id } => {
                debug!(id = %mutation_id, target = %target_id, "Local write queued")
            }
            EnqueueOutcome::LocalOnly { reason } => {
                warn!(target = %target_id, error = %reason, "Enqueue failed, local write kept as dirty")
            }
        }
        Ok(outcome)
    }

    /// Enqueue mutations for mirrors whose queue entry was never written
    pub fn recover_dirty(&self) -> Result<usize, StoreError> {
        let results = self.store.with_conn(entities::dirty_results)?;
        let checklists = self.store.with_conn(entities::dirty_checklists)?;
        if results.is_empty() && checklists.is_empty() {
            return Ok(0);
        }

        let recovered = self.store.with_tx(|tx| {
            let mut count = 0;
            for result in &results {
                let payload = MutationPayload::UpdateResult(result_patch(result));
                queue::insert_mutation(tx, &result.id, &payload, now_ms())?;
                entities::set_dirty(tx, Collection::AuditResults, &result.id, false)?;
                count += 1;
            }
            for checklist in &checklists {
                let payload = MutationPayload::UpdateChecklist(checklist_patch(checklist));
                queue::insert_mutation(tx, &checklist.id, &payload, now_ms())?;
                entities::set_dirty(tx, Collection::Checklists, &checklist.id, false)?;
                count += 1;
            }
            Ok(count)
        })?;

        info!(recovered, "Recovered dirty local writes into the queue");
        Ok(recovered)
    }

    /// Return mutations left in flight by a crash to the pending state
    pub fn recover_in_flight(&self) -> Result<usize, StoreError> {
        let reset = self.store.with_conn(queue::reset_in_flight)?;
        if reset > 0 {
            info!(reset, "Reset interrupted in-flight mutations");
        }
        Ok(reset)
    }

    /// Claim up to `limit` dispatchable heads in `lane`, marking them in flight
    pub fn next_batch(&self, lane: Lane, limit: usize) -> Result<Vec<Mutation>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.store.with_tx(|tx| {
            let mut heads = queue::ready_heads(tx, now_ms(), lane, limit)?;
            for mutation in &mut heads {
                queue::mark_in_flight(tx, mutation.id)?;
                mutation.status = MutationStatus::InFlight;
            }
            Ok(heads)
        })
    }

    /// Remove an acknowledged mutation
    pub fn complete(&self, id: MutationId) -> Result<(), StoreError> {
        self.store.with_conn(|conn| queue::delete_mutation(conn, id))?;
        Ok(())
    }

    /// Apply the retry policy to a failed dispatch
    pub fn fail(
        &self,
        mutation: &Mutation,
        class: FailureClass,
        message: &str,
    ) -> Result<Settled, StoreError> {
        let attempts = mutation.attempts + 1;
        let settled = match class {
            FailureClass::Transient if !self.policy.exhausted(attempts) => {
                let retry_in = self.policy.delay_for(attempts);
                let next_at = now_ms() + retry_in.as_millis() as i64;
                self.store.with_conn(|conn| {
                    queue::record_failure(conn, mutation.id, attempts, next_at, message)
                })?;
                Settled::Retrying { attempts, retry_in }
            }
            FailureClass::Transient => Settled::Dead(DeadReason::RetriesExhausted),
            FailureClass::Permanent => Settled::Dead(DeadReason::Validation),
            FailureClass::Conflict => Settled::Dead(DeadReason::Conflict),
        };

        if let Settled::Dead(reason) = settled {
            self.kill(mutation, attempts, reason, message)?;
        }
        Ok(settled)
    }

    /// Move a mutation straight to the dead state
    pub fn kill(
        &self,
        mutation: &Mutation,
        attempts: u32,
        reason: DeadReason,
        message: &str,
    ) -> Result<(), StoreError> {
        self.store
            .with_conn(|conn| queue::mark_dead(conn, mutation.id, attempts, reason, message))?;
        warn!(
            id = %mutation.id,
            target = %mutation.target_id,
            kind = mutation.mutation_type.as_str(),
            reason = reason.as_str(),
            error = %message,
            "Mutation is dead"
        );
        Ok(())
    }

    pub fn get(&self, id: MutationId) -> Result<Option<Mutation>, StoreError> {
        self.store.with_conn(|conn| queue::get_mutation(conn, id))
    }

    pub fn dead(&self) -> Result<Vec<Mutation>, StoreError> {
        self.store
            .with_conn(|conn| queue::list_by_status(conn, MutationStatus::Dead))
    }

    pub fn counts(&self) -> Result<QueueCounts, StoreError> {
        self.store.with_conn(queue::counts)
    }

    pub fn has_unsettled(&self, target_id: &str) -> Result<bool, StoreError> {
        self.store.with_conn(|conn| queue::has_unsettled(conn, target_id))
    }

    /// Re-queue a dead mutation at the tail of its target's queue.
    ///
    /// Structured updates are rebuilt from the current mirror so a retry
    /// never pushes a snapshot older than what the user has since written.
    pub fn retry_dead(&self, id: MutationId) -> Result<Mutation, QueueError> {
        let retried = self.store.with_tx(|tx| {
            let Some(dead) = queue::get_mutation(tx, id)? else {
                return Ok(Err(QueueError::NotFound(id.0)));
            };
            if dead.status != MutationStatus::Dead {
                return Ok(Err(QueueError::NotDead(id.0)));
            }

            let payload = match &dead.payload {
                MutationPayload::UpdateResult(_) => entities::get_result(tx, &dead.target_id)?
                    .map(|r| MutationPayload::UpdateResult(result_patch(&r))),
                MutationPayload::UpdateChecklist(_) => {
                    entities::get_checklist(tx, &dead.target_id)?
                        .map(|c| MutationPayload::UpdateChecklist(checklist_patch(&c)))
                }
                MutationPayload::UploadImage(_) => None,
            }
            .unwrap_or_else(|| dead.payload.clone());

            queue::delete_mutation(tx, id)?;
            Ok(Ok(queue::insert_mutation(tx, &dead.target_id, &payload, now_ms())?))
        })??;

        info!(old = %id, new = %retried.id, target = %retried.target_id, "Dead mutation re-queued");
        Ok(retried)
    }

    /// Drop a dead mutation; its change will never reach the remote store
    pub fn discard_dead(&self, id: MutationId) -> Result<Mutation, QueueError> {
        let discarded = self.store.with_tx(|tx| {
            let Some(dead) = queue::get_mutation(tx, id)? else {
                return Ok(Err(QueueError::NotFound(id.0)));
            };
            if dead.status != MutationStatus::Dead {
                return Ok(Err(QueueError::NotDead(id.0)));
            }
            queue::delete_mutation(tx, id)?;
            Ok(Ok(dead))
        })??;

        warn!(
            id = %id,
            target = %discarded.target_id,
            kind = discarded.mutation_type.as_str(),
            "Dead mutation discarded by operator"
        );
        Ok(discarded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResultStatus;

    fn queue() -> MutationQueue {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let policy = RetryPolicy {
            max_attempts: 3,
            base: Duration::from_millis(0),
            max: Duration::from_millis(0),
            jitter: false,
        };
        MutationQueue::new(store, policy)
    }

    fn result(id: &str, status: ResultStatus) -> AuditResultMirror {
        AuditResultMirror {
            id: id.to_string(),
            checklist_id: "c1".into(),
            requirement_id: "req-1".into(),
            status,
            comment: None,
            photos: vec![],
            requirement_content: None,
            requirement_clause: None,
            quantitative: None,
            updated_at: None,
            stale: false,
            dirty: false,
        }
    }

    fn write(q: &MutationQueue, r: &AuditResultMirror) -> EnqueueOutcome {
        q.apply_and_enqueue(
            &EntityMirror::AuditResult(r.clone()),
            &MutationPayload::UpdateResult(result_patch(r)),
        )
        .unwrap()
    }

    #[test]
    fn test_apply_and_enqueue_is_clean_on_success() {
        let q = queue();
        let outcome = write(&q, &result("r1", ResultStatus::Ok));
        assert!(matches!(outcome, EnqueueOutcome::Queued { .. }));

        let mirror = q.store().get_result("r1").unwrap().unwrap();
        assert!(!mirror.dirty);
        assert_eq!(q.counts().unwrap().pending, 1);
    }

    #[test]
    fn test_recover_dirty_enqueues_once() {
        let q = queue();
        let mut r = result("r1", ResultStatus::Defect);
        r.dirty = true;
        q.store().put(&EntityMirror::AuditResult(r)).unwrap();

        assert_eq!(q.recover_dirty().unwrap(), 1);
        assert_eq!(q.recover_dirty().unwrap(), 0);

        let batch = q.next_batch(Lane::Structured, 10).unwrap();
        assert_eq!(batch.len(), 1);
        match &batch[0].payload {
            MutationPayload::UpdateResult(patch) => assert_eq!(patch.status, ResultStatus::Defect),
            other => panic!("unexpected payload: {:?}", other),
        }
        assert!(!q.store().get_result("r1").unwrap().unwrap().dirty);
    }

    #[test]
    fn test_transient_failures_exhaust_to_dead() {
        let q = queue();
        write(&q, &result("r1", ResultStatus::Ok));

        for expected in 1..3 {
            let m = q.next_batch(Lane::Structured, 1).unwrap().remove(0);
            let settled = q.fail(&m, FailureClass::Transient, "503").unwrap();
            assert_eq!(
                settled,
                Settled::Retrying { attempts: expected, retry_in: Duration::from_millis(0) }
            );
        }

        let m = q.next_batch(Lane::Structured, 1).unwrap().remove(0);
        assert_eq!(m.attempts, 2);
        let settled = q.fail(&m, FailureClass::Transient, "503").unwrap();
        assert_eq!(settled, Settled::Dead(DeadReason::RetriesExhausted));

        let dead = q.dead().unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 3);
    }

    #[test]
    fn test_validation_goes_dead_immediately() {
        let q = queue();
        write(&q, &result("r1", ResultStatus::Ok));
        let m = q.next_batch(Lane::Structured, 1).unwrap().remove(0);
        let settled = q.fail(&m, FailureClass::Permanent, "bad status").unwrap();
        assert_eq!(settled, Settled::Dead(DeadReason::Validation));
        assert_eq!(q.counts().unwrap().dead, 1);
        assert!(!q.has_unsettled("r1").unwrap());
    }

    #[test]
    fn test_retry_dead_uses_current_mirror() {
        let q = queue();
        write(&q, &result("r1", ResultStatus::Ok));
        let m = q.next_batch(Lane::Structured, 1).unwrap().remove(0);
        q.fail(&m, FailureClass::Permanent, "rejected").unwrap();

        // Mirror moved on after the mutation died
        let mut newer = result("r1", ResultStatus::Warning);
        newer.comment = Some("rechecked".into());
        q.store().put(&EntityMirror::AuditResult(newer)).unwrap();

        let retried = q.retry_dead(m.id).unwrap();
        assert_ne!(retried.id, m.id);
        assert!(retried.enqueued_at > m.enqueued_at);
        match retried.payload {
            MutationPayload::UpdateResult(patch) => {
                assert_eq!(patch.status, ResultStatus::Warning);
                assert_eq!(patch.comment.as_deref(), Some("rechecked"));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
        assert!(q.dead().unwrap().is_empty());
    }

    #[test]
    fn test_operator_actions_require_dead() {
        let q = queue();
        let outcome = write(&q, &result("r1", ResultStatus::Ok));
        let EnqueueOutcome::Queued { mutation_id } = outcome else {
            panic!("expected queued");
        };
        assert!(matches!(q.retry_dead(mutation_id), Err(QueueError::NotDead(_))));
        assert!(matches!(q.discard_dead(MutationId(999)), Err(QueueError::NotFound(999))));
    }

    #[test]
    fn test_discard_dead_removes_entry() {
        let q = queue();
        write(&q, &result("r1", ResultStatus::Ok));
        let m = q.next_batch(Lane::Structured, 1).unwrap().remove(0);
        q.fail(&m, FailureClass::Conflict, "gone").unwrap();

        let discarded = q.discard_dead(m.id).unwrap();
        assert_eq!(discarded.dead_reason, Some(DeadReason::Conflict));
        assert_eq!(q.counts().unwrap(), QueueCounts::default());
    }

    #[test]
    fn test_recover_in_flight() {
        let q = queue();
        write(&q, &result("r1", ResultStatus::Ok));
        let claimed = q.next_batch(Lane::Structured, 10).unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(q.next_batch(Lane::Structured, 10).unwrap().is_empty());

        assert_eq!(q.recover_in_flight().unwrap(), 1);
        assert_eq!(q.next_batch(Lane::Structured, 10).unwrap().len(), 1);
    }
}
