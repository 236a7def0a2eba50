//! Structured diffing of two snapshots over a field policy

use std::collections::BTreeMap;

use super::fingerprint::FieldPolicy;
use super::snapshot::{Snapshot, Value};

/// One watched scalar field whose normalized value differs between the
/// old and new captures.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarDiff {
    pub field: String,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

/// A child present in both captures with at least one differing watched
/// field. Only the differing fields are reported, not the whole child.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildDiff {
    pub key: String,
    pub scalar_diffs: Vec<ScalarDiff>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub scalar_diffs: Vec<ScalarDiff>,
    pub children_added: Vec<String>,
    pub children_removed: Vec<String>,
    pub children_modified: Vec<ChildDiff>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.scalar_diffs.is_empty()
            && self.children_added.is_empty()
            && self.children_removed.is_empty()
            && self.children_modified.is_empty()
    }

    pub fn scalar_changed(&self, field: &str) -> bool {
        self.scalar_diffs.iter().any(|d| d.field == field)
    }

    pub fn scalar_new_value(&self, field: &str) -> Option<&Value> {
        self.scalar_diffs
            .iter()
            .find(|d| d.field == field)
            .and_then(|d| d.new.as_ref())
    }
}

pub struct ChangeDetector {
    policy: FieldPolicy,
}

impl ChangeDetector {
    pub fn new(policy: FieldPolicy) -> Self {
        Self { policy }
    }

    /// Reports only watched fields whose normalized values differ. A field
    /// that is blank on both sides is never a diff, regardless of how the
    /// blankness is spelled.
    pub fn diff_scalars(
        old_fields: &BTreeMap<String, Value>,
        new_fields: &BTreeMap<String, Value>,
        watched: &[String],
    ) -> Vec<ScalarDiff> {
        let mut diffs = Vec::new();
        for field in watched {
            let old = old_fields.get(field);
            let new = new_fields.get(field);
            if materially_equal(old, new) {
                continue;
            }
            diffs.push(ScalarDiff {
                field: field.clone(),
                old: old.cloned(),
                new: new.cloned(),
            });
        }
        diffs
    }

    /// Keys only in new are added, only in old removed, in both with any
    /// differing watched scalar modified.
    pub fn diff_children(&self, old_children: &[Snapshot], new_children: &[Snapshot]) -> ChangeSet {
        let old_by_key = self.children_by_key(old_children);
        let new_by_key = self.children_by_key(new_children);

        let mut changes = ChangeSet::default();
        for (key, new_child) in &new_by_key {
            match old_by_key.get(key) {
                None => changes.children_added.push(key.clone()),
                Some(old_child) => {
                    let diffs = Self::diff_scalars(
                        &old_child.fields,
                        &new_child.fields,
                        &self.policy.child_fields,
                    );
                    if !diffs.is_empty() {
                        changes.children_modified.push(ChildDiff {
                            key: key.clone(),
                            scalar_diffs: diffs,
                        });
                    }
                }
            }
        }
        for key in old_by_key.keys() {
            if !new_by_key.contains_key(key) {
                changes.children_removed.push(key.clone());
            }
        }
        changes
    }

    /// Whole-snapshot diff. An absent old snapshot means the first-ever
    /// evaluation of this entity: everything relevant is reported as
    /// changed so that first-run logic steps still fire.
    pub fn diff(&self, old: Option<&Snapshot>, new: &Snapshot) -> ChangeSet {
        let Some(old) = old else {
            return self.first_run_changes(new);
        };

        let mut changes = self.diff_children(&old.children, &new.children);
        changes.scalar_diffs =
            Self::diff_scalars(&old.fields, &new.fields, &self.policy.scalar_fields);
        changes
    }

    fn first_run_changes(&self, new: &Snapshot) -> ChangeSet {
        let mut changes = ChangeSet::default();
        for field in &self.policy.scalar_fields {
            if let Some(value) = new.field(field) {
                if !value.is_blank() {
                    changes.scalar_diffs.push(ScalarDiff {
                        field: field.clone(),
                        old: None,
                        new: Some(value.clone()),
                    });
                }
            }
        }
        for child in &new.children {
            changes.children_added.push(self.policy.child_key(child));
        }
        changes.children_added.sort();
        changes
    }

    fn children_by_key<'a>(&self, children: &'a [Snapshot]) -> BTreeMap<String, &'a Snapshot> {
        children
            .iter()
            .map(|child| (self.policy.child_key(child), child))
            .collect()
    }
}

fn materially_equal(old: Option<&Value>, new: Option<&Value>) -> bool {
    let old_blank = old.map_or(true, Value::is_blank);
    let new_blank = new.map_or(true, Value::is_blank);
    if old_blank && new_blank {
        return true;
    }
    match (old, new) {
        (Some(a), Some(b)) => a.canonical() == b.canonical(),
        _ => false,
    }
}
