//! Canonical fingerprints over a named subset of snapshot fields
//!
//! Two snapshots that differ only in fields outside the policy, or only in
//! insignificant whitespace inside watched text fields, produce equal
//! fingerprints. Child records are keyed by a stable child key (typically
//! a line number); a key present on one side only is a structural
//! difference even when the child carries no scalar values yet.

use std::collections::BTreeMap;

use super::snapshot::Snapshot;

/// Which fields of a snapshot a rule-set cares about.
#[derive(Debug, Clone, Default)]
pub struct FieldPolicy {
    pub scalar_fields: Vec<String>,
    pub child_fields: Vec<String>,
    pub child_key_field: String,
}

impl FieldPolicy {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn watch_scalar(mut self, field: &str) -> Self {
        self.scalar_fields.push(field.to_string());
        self
    }
    pub fn watch_child_scalar(mut self, field: &str) -> Self {
        self.child_fields.push(field.to_string());
        self
    }
    pub fn key_children_by(mut self, field: &str) -> Self {
        self.child_key_field = field.to_string();
        self
    }

    /// Stable key for a child record; falls back to the child's own
    /// record id when the key field is absent (freshly-added lines may
    /// carry no field values at all).
    pub fn child_key(&self, child: &Snapshot) -> String {
        child
            .field(&self.child_key_field)
            .map(|v| v.canonical())
            .unwrap_or_else(|| child.record_id.clone())
    }
}

/// Canonical projection of a snapshot over one field policy, plus its
/// sha256 digest. Equality is digest equality.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    pub canonical: String,
    pub digest: String,
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}
impl Eq for Fingerprint {}

pub struct FingerprintBuilder {
    policy: FieldPolicy,
}

impl FingerprintBuilder {
    pub fn new(policy: FieldPolicy) -> Self {
        Self { policy }
    }

    /// Pure and deterministic for a given policy and snapshot.
    pub fn build(&self, snapshot: &Snapshot) -> Fingerprint {
        let mut canonical = String::new();
        canonical.push_str(&snapshot.entity_type);
        canonical.push('|');
        canonical.push_str(&snapshot.record_id);
        canonical.push('\n');

        for field in &self.policy.scalar_fields {
            if let Some(value) = snapshot.field(field) {
                if !value.is_blank() {
                    canonical.push_str(field);
                    canonical.push('=');
                    canonical.push_str(&value.canonical());
                    canonical.push('\n');
                }
            }
        }

        // children ordered by key so input order never matters
        let mut by_key: BTreeMap<String, &Snapshot> = BTreeMap::new();
        for child in &snapshot.children {
            by_key.insert(self.policy.child_key(child), child);
        }
        for (key, child) in by_key {
            canonical.push_str("child:");
            canonical.push_str(&key);
            canonical.push('\n');
            for field in &self.policy.child_fields {
                if let Some(value) = child.field(field) {
                    if !value.is_blank() {
                        canonical.push_str("  ");
                        canonical.push_str(field);
                        canonical.push('=');
                        canonical.push_str(&value.canonical());
                        canonical.push('\n');
                    }
                }
            }
        }

        let digest = sha256::digest(&canonical);
        Fingerprint { canonical, digest }
    }
}
