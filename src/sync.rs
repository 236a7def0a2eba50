//! Delivery tracking and duplicate-send suppression
//!
//! One [`SyncRecord`] exists per (entity, partner) pair. It is created on
//! the first send and updated in place afterwards, never duplicated. The
//! stored content fingerprint lets a later evaluation skip re-sending
//! byte-identical content; clearing it requests a manual resend.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use super::time::TimeStamp;

// synchronous-delivery convention: confirmation is assumed one minute
// after the send rather than waiting for a real acknowledgement
const CONFIRMATION_OFFSET_MINUTES: i64 = 1;

fn sync_key(entity_ref: &str, partner_id: &str) -> String {
    format!("sync/{entity_ref}/{partner_id}")
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct SyncRecord {
    #[n(0)]
    pub entity_ref: String,
    #[n(1)]
    pub partner_id: String,
    #[n(2)]
    pub fingerprint: Option<String>,
    #[n(3)]
    pub sent_at: Option<TimeStamp<Utc>>,
    #[n(4)]
    pub confirmed_at: Option<TimeStamp<Utc>>,
}

/// Outbound delivery mechanics (file transfer, email). Destination
/// selection is a function of environment configuration owned by the
/// implementation, not of this core.
pub trait OutboundTransfer: Send + Sync {
    fn send(&self, content: &[u8], record: &SyncRecord) -> anyhow::Result<()>;
}

/// In-memory transfer that records every send, for tests and dry runs.
#[derive(Default)]
pub struct MemoryTransfer {
    sent: std::sync::Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemoryTransfer {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn sent_count(&self) -> usize {
        self.sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

impl OutboundTransfer for MemoryTransfer {
    fn send(&self, content: &[u8], record: &SyncRecord) -> anyhow::Result<()> {
        let mut sent = self
            .sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        sent.push((record.partner_id.clone(), content.to_vec()));
        Ok(())
    }
}

#[derive(Clone)]
pub struct DeliveryDeduplicator {
    db: Arc<sled::Db>,
}

impl DeliveryDeduplicator {
    pub fn new(db: Arc<sled::Db>) -> Self {
        Self { db }
    }

    pub fn load(&self, entity_ref: &str, partner_id: &str) -> anyhow::Result<Option<SyncRecord>> {
        match self.db.get(sync_key(entity_ref, partner_id).as_bytes())? {
            Some(raw) => Ok(Some(minicbor::decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// True unless a record already exists for this pair carrying the same
    /// fingerprint with `sent_at` populated. Suppression is a normal
    /// control-flow outcome, not an error.
    pub fn should_send(
        &self,
        entity_ref: &str,
        partner_id: &str,
        fingerprint: &str,
    ) -> anyhow::Result<bool> {
        let Some(record) = self.load(entity_ref, partner_id)? else {
            return Ok(true);
        };
        let already_sent =
            record.sent_at.is_some() && record.fingerprint.as_deref() == Some(fingerprint);
        if already_sent {
            debug!(entity_ref, partner_id, "suppressing duplicate send");
        }
        Ok(!already_sent)
    }

    /// Stamp the delivery record for this pair without persisting it.
    /// An existing row is reused in place, even when its fingerprint
    /// differs or was cleared by a manual resend request. The record only
    /// becomes durable via [`commit_send`](Self::commit_send), so a
    /// transfer that raises in between never claims the content was sent.
    pub fn prepare_send(
        &self,
        entity_ref: &str,
        partner_id: &str,
        fingerprint: &str,
    ) -> anyhow::Result<SyncRecord> {
        let sent_at = TimeStamp::new();
        let confirmed_at = sent_at.plus_minutes(CONFIRMATION_OFFSET_MINUTES);

        let record = match self.load(entity_ref, partner_id)? {
            Some(mut existing) => {
                existing.fingerprint = Some(fingerprint.to_string());
                existing.sent_at = Some(sent_at);
                existing.confirmed_at = Some(confirmed_at);
                existing
            }
            None => SyncRecord {
                entity_ref: entity_ref.to_string(),
                partner_id: partner_id.to_string(),
                fingerprint: Some(fingerprint.to_string()),
                sent_at: Some(sent_at),
                confirmed_at: Some(confirmed_at),
            },
        };
        Ok(record)
    }

    /// Persist a prepared record once its send went through.
    pub fn commit_send(&self, record: &SyncRecord) -> anyhow::Result<()> {
        self.db.insert(
            sync_key(&record.entity_ref, &record.partner_id).as_bytes(),
            minicbor::to_vec(record)?,
        )?;
        Ok(())
    }

    /// Prepare and commit in one go, for callers whose delivery already
    /// happened or needs no guarding.
    pub fn record_send(
        &self,
        entity_ref: &str,
        partner_id: &str,
        fingerprint: &str,
    ) -> anyhow::Result<SyncRecord> {
        let record = self.prepare_send(entity_ref, partner_id, fingerprint)?;
        self.commit_send(&record)?;
        Ok(record)
    }

    /// Clear the stored fingerprint so the next evaluation sends again
    /// even if the content is unchanged.
    pub fn request_resend(&self, entity_ref: &str, partner_id: &str) -> anyhow::Result<()> {
        if let Some(mut record) = self.load(entity_ref, partner_id)? {
            record.fingerprint = None;
            self.db.insert(
                sync_key(entity_ref, partner_id).as_bytes(),
                minicbor::to_vec(&record)?,
            )?;
        }
        Ok(())
    }

    /// All delivery records for one entity, across partners.
    pub fn records_for(&self, entity_ref: &str) -> anyhow::Result<Vec<SyncRecord>> {
        let prefix = format!("sync/{entity_ref}/");
        let mut records = Vec::new();
        for item in self.db.scan_prefix(prefix.as_bytes()) {
            let (_, raw) = item?;
            records.push(minicbor::decode(&raw)?);
        }
        Ok(records)
    }
}
