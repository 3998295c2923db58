//! Capability traits at the engine's boundaries.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Result;
use crate::funnel::FunnelStatus;
use crate::types::{Channel, Subject};

/// A fully rendered message ready for a transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: Channel,
    pub recipient: String,
    /// Email only.
    pub subject: Option<String>,
    pub body: String,
    /// Passed through so transports that support it can dedupe too.
    pub idempotency_key: String,
}

/// Transport acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportReceipt {
    pub message_id: String,
}

/// Why a transport could not deliver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Network trouble, timeouts, 5xx, rate limits. Worth retrying.
    #[error("transient: {0}")]
    Transient(String),
    /// Explicit rejection (bad address, auth refused, 4xx). Never retried.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }

    /// Classify an HTTP status the way every HTTP-based provider here does:
    /// 408, 429 and 5xx are transient, everything else non-2xx is permanent.
    pub fn from_http_status(status: u16, body: &str) -> Self {
        let msg = format!("HTTP {status}: {}", body.chars().take(300).collect::<String>());
        if status == 408 || status == 429 || status >= 500 {
            TransportError::Transient(msg)
        } else {
            TransportError::Permanent(msg)
        }
    }
}

/// One delivery channel implementation (email API, SMTP, SMS API, ...).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short provider name recorded on delivery records.
    fn name(&self) -> &str;

    /// The channel this transport delivers on.
    fn channel(&self) -> Channel;

    async fn send(
        &self,
        message: &OutboundMessage,
    ) -> std::result::Result<TransportReceipt, TransportError>;
}

/// Read/write access to subjects owned by the upstream business process.
#[async_trait]
pub trait SubjectStore: Send + Sync {
    async fn get(&self, subject_id: &str) -> Result<Option<Subject>>;

    /// Write `proposed` only if it is further down the funnel than the stored
    /// status. Returns whether the status changed. Proposing the current
    /// status is a no-op, not an error.
    async fn propose_status(&self, subject_id: &str, proposed: FunnelStatus) -> Result<bool>;

    /// Create or replace a subject's contact details and variables. The funnel
    /// status of an existing subject is only ever advanced, never lowered.
    async fn upsert(&self, subject: &Subject) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_classification() {
        assert!(TransportError::from_http_status(503, "down").is_transient());
        assert!(TransportError::from_http_status(429, "slow down").is_transient());
        assert!(TransportError::from_http_status(408, "").is_transient());
        assert!(!TransportError::from_http_status(400, "bad email").is_transient());
        assert!(!TransportError::from_http_status(401, "").is_transient());
    }
}
