//! Idempotency keys and the claim protocol that keeps deliveries at most one
//! per key, no matter how many sweep workers race for the same row.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use notarydrip_core::error::Result;
use sha2::{Digest, Sha256};

use crate::model::{ScheduledSend, SendStatus};
use crate::persistence::SequenceDb;

/// Deterministic key for one (subject, sequence, step, occurrence).
pub fn idempotency_key(subject_id: &str, sequence_id: &str, step_id: &str, occurrence_id: &str) -> String {
    let material = format!("{subject_id}|{sequence_id}|{step_id}|{occurrence_id}");
    format!("{:x}", Sha256::digest(material.as_bytes()))
}

/// SHA-256 of rendered content, recorded on delivery records.
pub fn content_hash(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

/// `hostname:pid`, used when no worker id is configured.
pub fn default_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".into());
    format!("{host}:{}", std::process::id())
}

/// Outcome of trying to take ownership of a send.
#[derive(Debug)]
pub enum Claim {
    /// This worker owns the send and it is still pending and due.
    Acquired(ScheduledSend),
    /// Another worker holds the key.
    Held,
    /// Claimed, but the row moved on; the claim was released.
    Stale,
}

/// Claims on idempotency keys, held per worker under a lease.
#[derive(Clone)]
pub struct DedupStore {
    db: Arc<SequenceDb>,
    worker_id: String,
    lease: TimeDelta,
}

impl DedupStore {
    pub fn new(db: Arc<SequenceDb>, worker_id: impl Into<String>, lease: std::time::Duration) -> Self {
        Self {
            db,
            worker_id: worker_id.into(),
            lease: TimeDelta::from_std(lease).unwrap_or(TimeDelta::MAX),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn lease(&self) -> TimeDelta {
        self.lease
    }

    /// Atomic conditional write. True for exactly one caller per key, or
    /// for the first caller after a pending send's lease has lapsed.
    pub fn try_claim(&self, key: &str, now: DateTime<Utc>) -> Result<bool> {
        self.db.try_claim(key, &self.worker_id, now, self.lease)
    }

    pub fn release(&self, key: &str) -> Result<()> {
        self.db.release_claim(key)
    }

    /// Claim the send's key, then re-read the row to confirm it is still
    /// pending and due. A stale row releases the claim.
    pub fn acquire(&self, send: &ScheduledSend, now: DateTime<Utc>) -> Result<Claim> {
        if !self.try_claim(&send.idempotency_key, now)? {
            tracing::debug!("🔒 Duplicate claim absorbed: {}", send.idempotency_key);
            return Ok(Claim::Held);
        }
        match self.db.get_scheduled_send(&send.id)? {
            Some(fresh) if fresh.status == SendStatus::Pending && fresh.is_due(now) => {
                Ok(Claim::Acquired(fresh))
            }
            _ => {
                self.release(&send.idempotency_key)?;
                tracing::debug!("🔓 Claim released, row no longer due: {}", send.id);
                Ok(Claim::Stale)
            }
        }
    }
}
