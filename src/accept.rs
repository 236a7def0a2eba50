//! Eligibility gating before any diffing happens
//!
//! A filter is purely a function of the inbound snapshot and never loads
//! additional state. A false verdict means the change detector and the
//! rule cascade are never invoked for this event.

use super::snapshot::Snapshot;

pub trait AcceptanceFilter: Send + Sync {
    fn accepts(&self, snapshot: &Snapshot) -> bool;
}

/// Entity is of the expected type.
pub struct EntityTypeFilter {
    expected: String,
}

impl EntityTypeFilter {
    pub fn new(expected: &str) -> Self {
        Self {
            expected: expected.to_string(),
        }
    }
}

impl AcceptanceFilter for EntityTypeFilter {
    fn accepts(&self, snapshot: &Snapshot) -> bool {
        snapshot.entity_type == self.expected
    }
}

/// The monitored field is populated with a non-blank value.
pub struct RequiredFieldFilter {
    field: String,
}

impl RequiredFieldFilter {
    pub fn new(field: &str) -> Self {
        Self {
            field: field.to_string(),
        }
    }
}

impl AcceptanceFilter for RequiredFieldFilter {
    fn accepts(&self, snapshot: &Snapshot) -> bool {
        snapshot.field(&self.field).is_some_and(|v| !v.is_blank())
    }
}

/// Entity is not in a cancelled state.
pub struct NotCancelledFilter {
    status_field: String,
    cancelled_marker: String,
}

impl NotCancelledFilter {
    pub fn new(status_field: &str, cancelled_marker: &str) -> Self {
        Self {
            status_field: status_field.to_string(),
            cancelled_marker: cancelled_marker.to_string(),
        }
    }
}

impl AcceptanceFilter for NotCancelledFilter {
    fn accepts(&self, snapshot: &Snapshot) -> bool {
        snapshot
            .field(&self.status_field)
            .map_or(true, |v| v.canonical() != self.cancelled_marker)
    }
}

/// All inner filters must accept.
pub struct AllOf {
    filters: Vec<Box<dyn AcceptanceFilter>>,
}

impl AllOf {
    pub fn new(filters: Vec<Box<dyn AcceptanceFilter>>) -> Self {
        Self { filters }
    }
}

impl AcceptanceFilter for AllOf {
    fn accepts(&self, snapshot: &Snapshot) -> bool {
        self.filters.iter().all(|f| f.accepts(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Value;

    #[test]
    fn required_field_rejects_blank_value() {
        let filter = RequiredFieldFilter::new("booking_received_date");

        let populated = Snapshot::new("shipment", "SHP-1")
            .with_field("booking_received_date", Value::text("2018-01-29"));
        let blank =
            Snapshot::new("shipment", "SHP-1").with_field("booking_received_date", Value::text("  "));

        assert!(filter.accepts(&populated));
        assert!(!filter.accepts(&blank));
    }

    #[test]
    fn not_cancelled_accepts_missing_status() {
        let filter = NotCancelledFilter::new("status", "CANCELLED");

        let no_status = Snapshot::new("shipment", "SHP-1");
        let cancelled =
            Snapshot::new("shipment", "SHP-1").with_field("status", Value::text("CANCELLED"));

        assert!(filter.accepts(&no_status));
        assert!(!filter.accepts(&cancelled));
    }
}
