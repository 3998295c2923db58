//! SMS transport: Twilio-compatible Messages API.

use async_trait::async_trait;
use notarydrip_core::config::SmsConfig;
use notarydrip_core::traits::{OutboundMessage, Transport, TransportError, TransportReceipt};
use notarydrip_core::types::Channel;
use std::time::Duration;

/// SMS over `POST /2010-04-01/Accounts/{sid}/Messages.json`.
pub struct HttpSmsTransport {
    client: reqwest::Client,
    config: SmsConfig,
}

impl HttpSmsTransport {
    pub fn new(config: &SmsConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config: config.clone(),
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.config.api_base.trim_end_matches('/'),
            self.config.account_sid
        )
    }
}

/// Loose E.164 check: leading `+`, 8 to 15 digits.
pub fn looks_like_e164(number: &str) -> bool {
    let Some(digits) = number.strip_prefix('+') else {
        return false;
    };
    (8..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit())
}

#[async_trait]
impl Transport for HttpSmsTransport {
    fn name(&self) -> &str {
        "twilio"
    }

    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(&self, message: &OutboundMessage) -> Result<TransportReceipt, TransportError> {
        if self.config.account_sid.is_empty() || self.config.auth_token.is_empty() {
            return Err(TransportError::Permanent("SMS credentials not configured".into()));
        }
        if !looks_like_e164(&message.recipient) {
            return Err(TransportError::Permanent(format!(
                "Invalid phone number: {}",
                message.recipient
            )));
        }

        let resp = self
            .client
            .post(self.endpoint())
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&[
                ("To", message.recipient.as_str()),
                ("From", self.config.from_number.as_str()),
                ("Body", message.body.as_str()),
            ])
            .timeout(Duration::from_secs(15))
            .send()
            .await
            .map_err(|e| TransportError::Transient(format!("SMS request failed: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            let json: serde_json::Value = resp.json().await.unwrap_or_default();
            let message_id = json["sid"]
                .as_str()
                .map(String::from)
                .unwrap_or_else(|| message.idempotency_key.clone());
            tracing::info!("📱 SMS queued for {} ({message_id})", message.recipient);
            Ok(TransportReceipt { message_id })
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(TransportError::from_http_status(status.as_u16(), &body))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_e164() {
        assert!(looks_like_e164("+15555550100"));
        assert!(!looks_like_e164("5555550100"));
        assert!(!looks_like_e164("+1 555 555"));
        assert!(!looks_like_e164("+12"));
    }

    #[test]
    fn test_endpoint() {
        let t = HttpSmsTransport::new(&SmsConfig {
            account_sid: "AC123".into(),
            api_base: "https://api.twilio.com/".into(),
            ..Default::default()
        });
        assert_eq!(
            t.endpoint(),
            "https://api.twilio.com/2010-04-01/Accounts/AC123/Messages.json"
        );
    }

    #[tokio::test]
    async fn test_invalid_number_is_permanent() {
        let t = HttpSmsTransport::new(&SmsConfig {
            account_sid: "AC123".into(),
            auth_token: "tok".into(),
            from_number: "+15550000000".into(),
            ..Default::default()
        });
        let msg = OutboundMessage {
            channel: Channel::Sms,
            recipient: "call me".into(),
            subject: None,
            body: "hi".into(),
            idempotency_key: "k".into(),
        };
        assert!(matches!(t.send(&msg).await, Err(TransportError::Permanent(_))));
    }
}
