//! Email transports: HTTP mail API (SendGrid v3 compatible) and SMTP.
//!
//! Both deliver an HTML body. The HTTP transport is the production default;
//! SMTP (async lettre) covers self-hosted relays.

use async_trait::async_trait;
use notarydrip_core::config::EmailConfig;
use notarydrip_core::traits::{OutboundMessage, Transport, TransportError, TransportReceipt};
use notarydrip_core::types::Channel;
use std::time::Duration;

/// Transactional email over an HTTP mail API (`POST /v3/mail/send`).
pub struct HttpEmailTransport {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    from_email: String,
    from_name: Option<String>,
}

impl HttpEmailTransport {
    pub fn new(config: &EmailConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            from_email: config.from_email.clone(),
            from_name: config.from_name.clone(),
        }
    }

    fn payload(&self, message: &OutboundMessage) -> serde_json::Value {
        let mut from = serde_json::json!({ "email": self.from_email });
        if let Some(name) = &self.from_name {
            from["name"] = serde_json::Value::String(name.clone());
        }
        serde_json::json!({
            "personalizations": [{ "to": [{ "email": message.recipient }] }],
            "from": from,
            "subject": message.subject.clone().unwrap_or_default(),
            "content": [{ "type": "text/html", "value": message.body }],
            "custom_args": { "idempotency_key": message.idempotency_key },
        })
    }
}

#[async_trait]
impl Transport for HttpEmailTransport {
    fn name(&self) -> &str {
        "sendgrid"
    }

    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, message: &OutboundMessage) -> Result<TransportReceipt, TransportError> {
        if self.api_key.is_empty() {
            return Err(TransportError::Permanent("email API key not configured".into()));
        }

        let resp = self
            .client
            .post(format!("{}/v3/mail/send", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&self.payload(message))
            .timeout(Duration::from_secs(20))
            .send()
            .await
            .map_err(|e| TransportError::Transient(format!("Email API request failed: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            let message_id = resp
                .headers()
                .get("X-Message-Id")
                .and_then(|v| v.to_str().ok())
                .map(String::from)
                .unwrap_or_else(|| message.idempotency_key.clone());
            tracing::info!("📤 Email accepted for {} ({message_id})", message.recipient);
            Ok(TransportReceipt { message_id })
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(TransportError::from_http_status(status.as_u16(), &body))
        }
    }
}

/// Email over an SMTP relay with STARTTLS.
pub struct SmtpEmailTransport {
    config: EmailConfig,
}

impl SmtpEmailTransport {
    pub fn new(config: &EmailConfig) -> Self {
        Self { config: config.clone() }
    }

    fn message_domain(&self) -> &str {
        self.config
            .from_email
            .rsplit_once('@')
            .map(|(_, d)| d)
            .unwrap_or("localhost")
    }
}

#[async_trait]
impl Transport for SmtpEmailTransport {
    fn name(&self) -> &str {
        "smtp"
    }

    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, message: &OutboundMessage) -> Result<TransportReceipt, TransportError> {
        use lettre::{
            AsyncSmtpTransport, AsyncTransport, Message as LettreMessage, message::Mailbox,
            message::header::ContentType, transport::smtp::authentication::Credentials,
        };

        let from_name = self.config.from_name.as_deref().unwrap_or("NotaryDrip");
        let from_mailbox: Mailbox = format!("{from_name} <{}>", self.config.from_email)
            .parse()
            .map_err(|e| TransportError::Permanent(format!("Invalid from: {e}")))?;
        let to_mailbox: Mailbox = message
            .recipient
            .parse()
            .map_err(|e| TransportError::Permanent(format!("Invalid to: {e}")))?;

        let message_id = format!("<{}@{}>", uuid::Uuid::new_v4(), self.message_domain());
        let email = LettreMessage::builder()
            .from(from_mailbox)
            .to(to_mailbox)
            .subject(message.subject.clone().unwrap_or_default())
            .message_id(Some(message_id.clone()))
            .header(ContentType::TEXT_HTML)
            .body(message.body.clone())
            .map_err(|e| TransportError::Permanent(format!("Build email: {e}")))?;

        let creds = Credentials::new(
            self.config.smtp_username.clone(),
            self.config.smtp_password.clone(),
        );
        let mailer =
            AsyncSmtpTransport::<lettre::Tokio1Executor>::starttls_relay(&self.config.smtp_host)
                .map_err(|e| TransportError::Permanent(format!("SMTP relay: {e}")))?
                .port(self.config.smtp_port)
                .credentials(creds)
                .timeout(Some(Duration::from_secs(20)))
                .build();

        match mailer.send(email).await {
            Ok(_) => {
                tracing::info!("📤 Email sent via SMTP to: {}", message.recipient);
                Ok(TransportReceipt { message_id })
            }
            Err(e) if e.is_permanent() => {
                Err(TransportError::Permanent(format!("SMTP send: {e}")))
            }
            Err(e) => Err(TransportError::Transient(format!("SMTP send: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> OutboundMessage {
        OutboundMessage {
            channel: Channel::Email,
            recipient: "ada@example.com".into(),
            subject: Some("Welcome".into()),
            body: "<p>Hi</p>".into(),
            idempotency_key: "key-1".into(),
        }
    }

    #[test]
    fn test_http_payload_shape() {
        let cfg = EmailConfig {
            from_email: "no-reply@example.com".into(),
            from_name: Some("Example Notary".into()),
            api_key: "k".into(),
            ..Default::default()
        };
        let t = HttpEmailTransport::new(&cfg);
        let p = t.payload(&message());
        assert_eq!(p["personalizations"][0]["to"][0]["email"], "ada@example.com");
        assert_eq!(p["from"]["name"], "Example Notary");
        assert_eq!(p["content"][0]["type"], "text/html");
        assert_eq!(p["custom_args"]["idempotency_key"], "key-1");
    }

    #[tokio::test]
    async fn test_missing_api_key_is_permanent() {
        let t = HttpEmailTransport::new(&EmailConfig::default());
        let err = t.send(&message()).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_smtp_bad_recipient_is_permanent() {
        let cfg = EmailConfig {
            from_email: "no-reply@example.com".into(),
            smtp_host: "localhost".into(),
            ..Default::default()
        };
        let t = SmtpEmailTransport::new(&cfg);
        let mut m = message();
        m.recipient = "not an address".into();
        let err = t.send(&m).await.unwrap_err();
        assert!(matches!(err, TransportError::Permanent(_)));
    }
}
