//! Snapshot change detection and cascading business-rule execution for
//! trade compliance records.
//!
//! Given two point-in-time captures of a business entity and its child
//! records, the engine determines exactly what changed and runs an ordered
//! set of idempotent logic steps once per change event. Steps may mutate
//! entity state, emit an outbound document (guarded against duplicate
//! sends), or reset downstream approval state. A proportional financial
//! allocator with remainder redistribution is available to steps that
//! split shared charges across line items.

pub mod accept;
pub mod allocation;
pub mod cascade;
pub mod diff;
pub mod entity;
pub mod error;
pub mod fingerprint;
pub mod service;
pub mod snapshot;
pub mod steps;
pub mod sync;
pub mod time;
pub mod utils;
