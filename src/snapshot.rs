//! Typed snapshot tree and the store it is resolved from
//!
//! A [`Snapshot`] captures one entity and its child records at a point in
//! time. It is constructed once at the boundary and never mutated, so all
//! downstream comparison code works over typed values rather than dynamic
//! lookups into a serialized blob.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::Utc;
use rust_decimal::Decimal;

use super::error::CascadeError;
use super::time::TimeStamp;

/// A single scalar field value on a snapshot or an entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Number(Decimal),
    Date(TimeStamp<Utc>),
    Flag(bool),
}

impl Value {
    pub fn text(value: &str) -> Self {
        Value::Text(value.to_string())
    }
    pub fn number(value: Decimal) -> Self {
        Value::Number(value)
    }

    /// Comparison-stable rendering of the value. Whitespace runs inside
    /// text collapse to single spaces and leading/trailing whitespace is
    /// dropped, so insignificant formatting differences never register as
    /// a change.
    pub fn canonical(&self) -> String {
        match self {
            Value::Text(s) => normalize_whitespace(s),
            Value::Number(d) => d.normalize().to_string(),
            Value::Date(t) => t.to_datetime_utc().to_rfc3339(),
            Value::Flag(b) => b.to_string(),
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            Value::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Numeric reading of the value, tolerating decimals entered as text.
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Value::Number(d) => Some(*d),
            Value::Text(s) => Decimal::from_str(s.trim()).ok(),
            _ => None,
        }
    }
}

pub fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl<C> minicbor::Encode<C> for Value {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        match self {
            Value::Text(s) => e.array(2)?.u32(0)?.str(s)?.ok(),
            // decimals travel as strings to keep scale intact
            Value::Number(d) => e.array(2)?.u32(1)?.str(&d.to_string())?.ok(),
            Value::Date(t) => {
                e.array(2)?.u32(2)?;
                minicbor::Encode::encode(t, e, ctx)
            }
            Value::Flag(b) => e.array(2)?.u32(3)?.bool(*b)?.ok(),
        }
    }
}

impl<'b, C> minicbor::Decode<'b, C> for Value {
    fn decode(d: &mut minicbor::Decoder<'b>, ctx: &mut C) -> Result<Self, minicbor::decode::Error> {
        let _len = d.array()?;
        match d.u32()? {
            0 => Ok(Value::Text(d.str()?.to_string())),
            1 => {
                let raw = d.str()?;
                Decimal::from_str(raw)
                    .map(Value::Number)
                    .map_err(|_| minicbor::decode::Error::message("invalid decimal value"))
            }
            2 => Ok(Value::Date(
                <TimeStamp<Utc> as minicbor::Decode<'b, C>>::decode(d, ctx)?,
            )),
            3 => Ok(Value::Flag(d.bool()?)),
            _ => Err(minicbor::decode::Error::message("unknown value tag")),
        }
    }
}

/// Immutable point-in-time capture of one entity and its children.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub entity_type: String,
    pub record_id: String,
    pub fields: BTreeMap<String, Value>,
    pub children: Vec<Snapshot>,
}

impl Snapshot {
    pub fn new(entity_type: &str, record_id: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            record_id: record_id.to_string(),
            fields: BTreeMap::new(),
            children: Vec::new(),
        }
    }
    pub fn with_field(mut self, field: &str, value: Value) -> Self {
        self.fields.insert(field.to_string(), value);
        self
    }
    pub fn with_child(mut self, child: Snapshot) -> Self {
        self.children.push(child);
        self
    }

    pub fn field(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// A snapshot that cannot even identify its entity is unusable for
    /// any evaluation.
    pub fn validate(&self) -> Result<(), CascadeError> {
        if self.record_id.trim().is_empty() {
            return Err(CascadeError::MalformedSnapshot {
                entity_id: self.record_id.clone(),
                field: "record_id",
            });
        }
        if self.entity_type.trim().is_empty() {
            return Err(CascadeError::MalformedSnapshot {
                entity_id: self.record_id.clone(),
                field: "entity_type",
            });
        }
        Ok(())
    }
}

/// Where a snapshot lives in the external snapshot store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotLocator {
    pub bucket: String,
    pub path: String,
    pub version: u64,
}

impl SnapshotLocator {
    pub fn new(bucket: &str, path: &str, version: u64) -> Self {
        Self {
            bucket: bucket.to_string(),
            path: path.to_string(),
            version,
        }
    }
}

/// External snapshot store. `None` is a valid result meaning "no prior
/// snapshot exists" (first-ever evaluation of an entity).
pub trait SnapshotStore: Send + Sync {
    fn resolve(&self, locator: &SnapshotLocator) -> anyhow::Result<Option<Snapshot>>;
}

/// In-memory store used by tests and local wiring.
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: std::sync::Mutex<std::collections::HashMap<SnapshotLocator, Snapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn insert(&self, locator: SnapshotLocator, snapshot: Snapshot) {
        let mut map = self
            .snapshots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        map.insert(locator, snapshot);
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn resolve(&self, locator: &SnapshotLocator) -> anyhow::Result<Option<Snapshot>> {
        let map = self
            .snapshots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(map.get(locator).cloned())
    }
}
