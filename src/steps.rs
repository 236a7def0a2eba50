//! Stock logic steps used by shipment rule-sets
//!
//! Each step compares against the *current* persisted entity state in
//! addition to the snapshots, so an entity already advanced by a previous
//! unrelated evaluation does not re-fire the step.

use std::collections::BTreeMap;
use std::sync::Arc;

use rust_decimal::Decimal;

use super::allocation::{AllocationLine, FinancialAllocator};
use super::cascade::{LogicStep, StepContext};
use super::entity::Entity;
use super::snapshot::Value;
use super::sync::{DeliveryDeduplicator, OutboundTransfer};

/// Copies changed watched scalar values from the new snapshot onto the
/// entity. Reports a change only for fields whose entity value actually
/// moved.
pub struct SyncDefaultsStep {
    watched: Vec<String>,
}

impl SyncDefaultsStep {
    pub fn new(watched: &[&str]) -> Self {
        Self {
            watched: watched.iter().map(|f| f.to_string()).collect(),
        }
    }
}

impl LogicStep for SyncDefaultsStep {
    fn name(&self) -> &str {
        "update_defaults"
    }

    fn run(&self, entity: &mut Entity, ctx: &StepContext) -> anyhow::Result<bool> {
        let mut changed = false;
        for field in &self.watched {
            if !ctx.changes.scalar_changed(field) {
                continue;
            }
            let Some(new_value) = ctx.changes.scalar_new_value(field) else {
                continue;
            };
            let current_matches = entity
                .field(field)
                .is_some_and(|v| v.canonical() == new_value.canonical());
            if !current_matches {
                entity.set_field(field, new_value.clone());
                changed = true;
            }
        }
        Ok(changed)
    }
}

/// Resets downstream approval state back to pending whenever any watched
/// change arrived. Subject to the global approval-reset toggle.
pub struct ApprovalResetStep {
    approval_field: String,
    pending_marker: String,
}

impl ApprovalResetStep {
    pub fn new(approval_field: &str, pending_marker: &str) -> Self {
        Self {
            approval_field: approval_field.to_string(),
            pending_marker: pending_marker.to_string(),
        }
    }
}

impl LogicStep for ApprovalResetStep {
    fn name(&self) -> &str {
        "reset_approval"
    }

    fn is_approval_reset(&self) -> bool {
        true
    }

    fn run(&self, entity: &mut Entity, ctx: &StepContext) -> anyhow::Result<bool> {
        if ctx.changes.is_empty() {
            return Ok(false);
        }
        let already_pending = entity
            .field(&self.approval_field)
            .is_some_and(|v| v.canonical() == self.pending_marker);
        if already_pending {
            return Ok(false);
        }
        entity.set_field(&self.approval_field, Value::text(&self.pending_marker));
        Ok(true)
    }
}

/// Splits the shared charge totals found on the new snapshot across its
/// child lines in proportion to each line's weight, writing the per-line
/// results onto the entity. Lines without a usable weight are skipped;
/// an unusable weight basis surfaces as an allocation error.
pub struct AllocateChargesStep {
    charge_fields: Vec<String>,
    weight_field: String,
    line_key_field: String,
    allocator: FinancialAllocator,
}

impl AllocateChargesStep {
    pub fn new(
        charge_fields: &[&str],
        weight_field: &str,
        line_key_field: &str,
        precision: u32,
    ) -> Self {
        Self {
            charge_fields: charge_fields.iter().map(|f| f.to_string()).collect(),
            weight_field: weight_field.to_string(),
            line_key_field: line_key_field.to_string(),
            allocator: FinancialAllocator::new(precision),
        }
    }
}

impl LogicStep for AllocateChargesStep {
    fn name(&self) -> &str {
        "allocate_charges"
    }

    fn run(&self, entity: &mut Entity, ctx: &StepContext) -> anyhow::Result<bool> {
        let mut totals = BTreeMap::new();
        for field in &self.charge_fields {
            if let Some(amount) = ctx.new.field(field).and_then(Value::as_decimal) {
                totals.insert(field.clone(), amount);
            }
        }
        if totals.is_empty() || ctx.new.children.is_empty() {
            return Ok(false);
        }

        let mut lines = Vec::new();
        let mut keys = Vec::new();
        for child in &ctx.new.children {
            let weight = child
                .field(&self.weight_field)
                .and_then(Value::as_decimal)
                .unwrap_or(Decimal::ZERO);
            let key = child
                .field(&self.line_key_field)
                .map(|v| v.canonical())
                .unwrap_or_else(|| child.record_id.clone());
            lines.push(AllocationLine::new(lines.len() as u32 + 1, weight));
            keys.push(key);
        }

        let basis: Decimal = lines.iter().map(|l| l.weight).sum();
        self.allocator
            .allocate_with_redistribution(&totals, basis, &mut lines)?;

        let mut changed = false;
        for (line, key) in lines.iter().zip(&keys) {
            for (charge_code, amount) in &line.allocated {
                let field = format!("{charge_code}_line_{key}");
                let value = Value::Number(*amount);
                if entity.field(&field) != Some(&value) {
                    entity.set_field(&field, value);
                    changed = true;
                }
            }
        }
        Ok(changed)
    }
}

/// Builds an opaque outbound document and sends it to one trading
/// partner, guarded by fingerprint dedup. The payload body is produced by
/// the injected builder; this step only transports and deduplicates it.
pub struct OutboundDocumentStep {
    partner_id: String,
    trigger_field: Option<String>,
    dedup: DeliveryDeduplicator,
    transfer: Arc<dyn OutboundTransfer>,
    builder: Box<dyn Fn(&Entity, &StepContext) -> Vec<u8> + Send + Sync>,
}

impl OutboundDocumentStep {
    pub fn new(
        partner_id: &str,
        dedup: DeliveryDeduplicator,
        transfer: Arc<dyn OutboundTransfer>,
        builder: Box<dyn Fn(&Entity, &StepContext) -> Vec<u8> + Send + Sync>,
    ) -> Self {
        Self {
            partner_id: partner_id.to_string(),
            trigger_field: None,
            dedup,
            transfer,
            builder,
        }
    }

    /// Only emit when this watched field is among the changes.
    pub fn triggered_by(mut self, field: &str) -> Self {
        self.trigger_field = Some(field.to_string());
        self
    }
}

impl LogicStep for OutboundDocumentStep {
    fn name(&self) -> &str {
        "send_outbound_document"
    }

    fn run(&self, entity: &mut Entity, ctx: &StepContext) -> anyhow::Result<bool> {
        if let Some(trigger) = &self.trigger_field {
            if !ctx.changes.scalar_changed(trigger) {
                return Ok(false);
            }
        }

        let content = (self.builder)(entity, ctx);
        let fingerprint = sha256::digest(&content);

        if !self
            .dedup
            .should_send(&entity.external_ref, &self.partner_id, &fingerprint)?
        {
            return Ok(false);
        }

        // the record turns durable only after the transfer succeeds, so a
        // failed send stays re-deliverable instead of being suppressed
        let record = self
            .dedup
            .prepare_send(&entity.external_ref, &self.partner_id, &fingerprint)?;
        self.transfer.send(&content, &record)?;
        self.dedup.commit_send(&record)?;
        Ok(true)
    }
}
