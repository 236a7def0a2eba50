//! Ordered rule cascade over one qualifying change event
//!
//! Step ordering is significant and fixed: later steps may read state
//! written by earlier steps in the same execution. A step that raises
//! aborts the remaining steps with no audit entry written; the whole
//! evaluation is expected to be re-deliverable by re-sending the same
//! change event.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tracing::debug;

use super::diff::ChangeSet;
use super::entity::Entity;
use super::snapshot::Snapshot;
use super::time::TimeStamp;

/// Everything a step may consult besides the current entity state: the
/// two data snapshots and the structured diff between them.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub old: Option<Snapshot>,
    pub new: Snapshot,
    pub changes: ChangeSet,
    pub user: String,
}

/// One named, ordered unit of cascade logic. Returning `true` reports a
/// mutation (or a documented side effect such as an outbound send) and
/// puts the step's name into the consolidated audit description.
pub trait LogicStep: Send + Sync {
    fn name(&self) -> &str;

    /// Approval-reset steps can be globally disabled via configuration;
    /// disabled steps are removed from the ordered list entirely.
    fn is_approval_reset(&self) -> bool {
        false
    }

    fn run(&self, entity: &mut Entity, ctx: &StepContext) -> anyhow::Result<bool>;
}

/// Ordered step list plus the approval-reset toggle. Constructed once per
/// deployment or config load, read-only thereafter.
pub struct CascadeConfig {
    steps: Vec<Box<dyn LogicStep>>,
    approval_resets_enabled: bool,
}

impl CascadeConfig {
    pub fn new(steps: Vec<Box<dyn LogicStep>>) -> Self {
        Self {
            steps,
            approval_resets_enabled: true,
        }
    }

    pub fn with_approval_resets(mut self, enabled: bool) -> Self {
        self.approval_resets_enabled = enabled;
        self
    }

    /// The effective ordered list: disabled approval-reset steps neither
    /// fire nor appear in the audit trail.
    pub fn active_steps(&self) -> impl Iterator<Item = &dyn LogicStep> {
        self.steps
            .iter()
            .filter(|s| self.approval_resets_enabled || !s.is_approval_reset())
            .map(|s| s.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct AuditEntry {
    #[n(0)]
    pub entity_ref: String,
    #[n(1)]
    pub user: String,
    #[n(2)]
    pub description: String,
    #[n(3)]
    pub at: TimeStamp<Utc>,
}

pub trait AuditTrail: Send + Sync {
    fn record_event(&self, entity: &Entity, user: &str, description: &str) -> anyhow::Result<()>;
}

pub struct SledAuditTrail {
    db: Arc<sled::Db>,
}

impl SledAuditTrail {
    pub fn new(db: Arc<sled::Db>) -> Self {
        Self { db }
    }

    pub fn entries_for(&self, entity_ref: &str) -> anyhow::Result<Vec<AuditEntry>> {
        let prefix = format!("audit/{entity_ref}/");
        let mut entries = Vec::new();
        for item in self.db.scan_prefix(prefix.as_bytes()) {
            let (_, raw) = item?;
            entries.push(minicbor::decode(&raw)?);
        }
        Ok(entries)
    }
}

impl AuditTrail for SledAuditTrail {
    fn record_event(&self, entity: &Entity, user: &str, description: &str) -> anyhow::Result<()> {
        let entry = AuditEntry {
            entity_ref: entity.external_ref.clone(),
            user: user.to_string(),
            description: description.to_string(),
            at: TimeStamp::new(),
        };
        // monotonic ids keep entries ordered under scan_prefix
        let key = format!("audit/{}/{:020}", entity.external_ref, self.db.generate_id()?);
        self.db.insert(key.as_bytes(), minicbor::to_vec(&entry)?)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CascadeOutcome {
    /// The entity could no longer be found; the evaluation is a no-op.
    EntityVanished,
    /// Every step reported no change; nothing was written.
    NothingFired,
    /// The named steps fired, in execution order.
    Fired(Vec<String>),
}

pub struct RuleCascadeExecutor<'a> {
    db: Arc<sled::Db>,
    config: &'a CascadeConfig,
    audit: Arc<dyn AuditTrail>,
}

impl<'a> RuleCascadeExecutor<'a> {
    pub fn new(db: Arc<sled::Db>, config: &'a CascadeConfig, audit: Arc<dyn AuditTrail>) -> Self {
        Self { db, config, audit }
    }

    /// Resolve the target entity immediately before execution and run the
    /// ordered steps against it. One consolidated audit entry names every
    /// firing step, slash-joined; no entry is written when nothing fires.
    pub fn run(&self, entity_id: &str, ctx: &StepContext) -> anyhow::Result<CascadeOutcome> {
        let Some(mut entity) = Entity::load_from_db(&self.db, entity_id)? else {
            debug!(entity_id, "entity vanished before cascade, skipping");
            return Ok(CascadeOutcome::EntityVanished);
        };

        let mut fired = Vec::new();
        for step in self.config.active_steps() {
            let changed = step.run(&mut entity, ctx).with_context(|| {
                format!("logic step '{}' failed for entity {entity_id}", step.name())
            })?;
            if changed {
                debug!(entity_id, step = step.name(), "step reported a change");
                fired.push(step.name().to_string());
            }
        }

        if fired.is_empty() {
            return Ok(CascadeOutcome::NothingFired);
        }

        entity.save_to_db(&self.db)?;
        self.audit.record_event(&entity, &ctx.user, &fired.join("/"))?;
        Ok(CascadeOutcome::Fired(fired))
    }
}
