//! Dry-run transport: logs the message instead of delivering it.
//!
//! Used when no provider is configured and for local previews. Keeps the last
//! 100 messages in memory so they can be inspected.

use async_trait::async_trait;
use notarydrip_core::traits::{OutboundMessage, Transport, TransportError, TransportReceipt};
use notarydrip_core::types::Channel;
use std::sync::Mutex;

pub struct LogTransport {
    channel: Channel,
    sent: Mutex<Vec<OutboundMessage>>,
}

impl LogTransport {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Messages "sent" so far, oldest first.
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Transport for LogTransport {
    fn name(&self) -> &str {
        "log"
    }

    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(&self, message: &OutboundMessage) -> Result<TransportReceipt, TransportError> {
        tracing::info!(
            "📝 [dry-run {}] to={} subject={:?} ({} bytes)",
            self.channel,
            message.recipient,
            message.subject,
            message.body.len()
        );
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(message.clone());
            if sent.len() > 100 {
                sent.remove(0);
            }
        }
        Ok(TransportReceipt {
            message_id: format!("log-{}", message.idempotency_key),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_messages() {
        let t = LogTransport::new(Channel::Sms);
        let msg = OutboundMessage {
            channel: Channel::Sms,
            recipient: "+15550100".into(),
            subject: None,
            body: "Reminder".into(),
            idempotency_key: "abc".into(),
        };
        let receipt = t.send(&msg).await.unwrap();
        assert_eq!(receipt.message_id, "log-abc");
        assert_eq!(t.sent().len(), 1);
    }
}
