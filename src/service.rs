//! Evaluation entry point: one change event in, one outcome out
//!
//! Each change event is processed as an independent, synchronous unit of
//! work. Evaluations for different entities may run concurrently; all
//! read-modify-write steps touching one entity's delivery and approval
//! state are serialized behind an exclusive per-entity lock held from
//! before the entity load until every write is durable.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use super::accept::AcceptanceFilter;
use super::cascade::{CascadeConfig, CascadeOutcome, RuleCascadeExecutor, SledAuditTrail, StepContext};
use super::diff::ChangeDetector;
use super::error::CascadeError;
use super::fingerprint::{FieldPolicy, FingerprintBuilder};
use super::snapshot::{SnapshotLocator, SnapshotStore};

/// An external event naming the entity and where its two captures live.
/// `old` is absent on the first-ever evaluation of an entity.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub entity_id: String,
    pub user: String,
    pub old: Option<SnapshotLocator>,
    pub new: SnapshotLocator,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationOutcome {
    /// The acceptance filter declined the snapshot; nothing ran.
    Rejected,
    /// No watched field materially changed, or no step fired.
    NoChange,
    /// The entity was deleted between capture and lock acquisition.
    EntityVanished,
    /// The cascade ran and these steps fired, in order.
    Completed { fired_steps: Vec<String> },
}

/// Registry of per-entity locks, keyed by the entity's natural key.
/// Entries are pruned once released so the map does not grow one entry
/// per distinct entity for the life of the process.
#[derive(Default)]
struct EntityLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl EntityLocks {
    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(key.to_string()).or_default().clone()
    }

    /// Drop the entry once the registry holds the only remaining clone.
    /// A concurrent holder keeps the strong count above one, so an entry
    /// still in use is never removed out from under it.
    fn release(&self, key: &str) {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if map.get(key).is_some_and(|entry| Arc::strong_count(entry) == 1) {
            map.remove(key);
        }
    }
}

pub struct CascadeService {
    db: Arc<sled::Db>,
    store: Arc<dyn SnapshotStore>,
    filter: Box<dyn AcceptanceFilter>,
    policy: FieldPolicy,
    config: CascadeConfig,
    audit: Arc<SledAuditTrail>,
    locks: EntityLocks,
}

impl CascadeService {
    pub fn new(
        db: Arc<sled::Db>,
        store: Arc<dyn SnapshotStore>,
        filter: Box<dyn AcceptanceFilter>,
        policy: FieldPolicy,
        config: CascadeConfig,
    ) -> Self {
        let audit = Arc::new(SledAuditTrail::new(db.clone()));
        Self {
            db,
            store,
            filter,
            policy,
            config,
            audit,
            locks: EntityLocks::default(),
        }
    }

    pub fn audit_trail(&self) -> &SledAuditTrail {
        &self.audit
    }

    /// Evaluate one change event end to end. Re-delivering the same event
    /// is safe: the entity lock plus fingerprint dedup ensure no duplicate
    /// downstream sends and no duplicate audit rows for a no-op re-run.
    pub fn evaluate(&self, event: &ChangeEvent) -> anyhow::Result<EvaluationOutcome> {
        info!(entity_id = %event.entity_id, "evaluating change event");

        let new_snapshot = self.store.resolve(&event.new)?.ok_or_else(|| {
            CascadeError::MissingSnapshot {
                bucket: event.new.bucket.clone(),
                path: event.new.path.clone(),
                version: event.new.version,
            }
        })?;
        new_snapshot.validate()?;

        if !self.filter.accepts(&new_snapshot) {
            debug!(entity_id = %event.entity_id, "snapshot rejected by acceptance filter");
            return Ok(EvaluationOutcome::Rejected);
        }

        let old_snapshot = match &event.old {
            Some(locator) => self.store.resolve(locator)?,
            None => None,
        };

        // cheap fingerprint gate before any locking or entity loads
        if let Some(old) = &old_snapshot {
            let builder = FingerprintBuilder::new(self.policy.clone());
            if builder.build(old) == builder.build(&new_snapshot) {
                debug!(entity_id = %event.entity_id, "fingerprints equal, nothing relevant changed");
                return Ok(EvaluationOutcome::NoChange);
            }
        }

        let detector = ChangeDetector::new(self.policy.clone());
        let changes = detector.diff(old_snapshot.as_ref(), &new_snapshot);
        if changes.is_empty() {
            return Ok(EvaluationOutcome::NoChange);
        }

        // exclusive per-entity section: entity load through audit write.
        // The guard drops and the registry entry is released on every
        // exit path, including step failure.
        let lock = self.locks.lock_for(&event.entity_id);
        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

            let ctx = StepContext {
                old: old_snapshot,
                new: new_snapshot,
                changes,
                user: event.user.clone(),
            };
            let executor =
                RuleCascadeExecutor::new(self.db.clone(), &self.config, self.audit.clone());
            executor
                .run(&event.entity_id, &ctx)
                .and_then(|outcome| match outcome {
                    CascadeOutcome::EntityVanished => Ok(EvaluationOutcome::EntityVanished),
                    CascadeOutcome::NothingFired => Ok(EvaluationOutcome::NoChange),
                    CascadeOutcome::Fired(fired_steps) => {
                        self.db.flush()?;
                        Ok(EvaluationOutcome::Completed { fired_steps })
                    }
                })
        };
        drop(lock);
        self.locks.release(&event.entity_id);

        let outcome = result?;
        info!(entity_id = %event.entity_id, ?outcome, "evaluation finished");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_lock_entries_are_pruned() {
        let locks = EntityLocks::default();

        let lock = locks.lock_for("SHP-1");
        drop(lock.lock().unwrap());
        drop(lock);
        locks.release("SHP-1");

        let map = locks.inner.lock().unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn entries_still_held_elsewhere_survive_release() {
        let locks = EntityLocks::default();

        let first = locks.lock_for("SHP-1");
        let second = locks.lock_for("SHP-1");
        drop(first);
        locks.release("SHP-1");

        let map = locks.inner.lock().unwrap();
        assert_eq!(map.len(), 1);
        drop(map);
        drop(second);
    }
}
