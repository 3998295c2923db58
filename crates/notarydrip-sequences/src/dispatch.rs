//! Dispatcher: renders a due send and delivers it through the channel's
//! transport, then records the outcome.
//!
//! Success writes the delivery record and flips the row to `sent` in one
//! transaction. Transient failures leave the row pending with a retry time
//! until the retry policy runs out; permanent failures and exhaustion mark it
//! `failed` and go on the failure feed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use notarydrip_channels::ChannelSet;
use notarydrip_core::config::TemplateConfig;
use notarydrip_core::error::Result;
use notarydrip_core::template;
use notarydrip_core::traits::{OutboundMessage, TransportError};
use notarydrip_core::types::{Channel, Subject};
use serde::Serialize;

use crate::dedup::content_hash;
use crate::feed::{FailureEvent, FailureFeed, FailureKind};
use crate::model::{DeliveryRecord, ScheduledSend, Step};
use crate::persistence::{NewDeliveryRecord, SequenceDb};
use crate::retry::{RetryDecision, RetryPolicy};

/// Result of one delivery attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Sent(DeliveryRecord),
    Retrying {
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
        error: String,
    },
    Failed {
        attempt: u32,
        kind: FailureKind,
        error: String,
    },
}

/// Variables for one send, later layers winning:
/// config defaults < event snapshot < subject bag < subject contact details.
pub fn merge_variables(
    defaults: &HashMap<String, String>,
    send_vars: &HashMap<String, String>,
    subject: &Subject,
) -> HashMap<String, String> {
    let mut vars = defaults.clone();
    vars.extend(send_vars.iter().map(|(k, v)| (k.clone(), v.clone())));
    vars.extend(subject.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
    if let Some(email) = subject.address(Channel::Email) {
        vars.insert("email".into(), email.to_string());
    }
    if let Some(phone) = subject.address(Channel::Sms) {
        vars.insert("phone_number".into(), phone.to_string());
    }
    vars
}

/// Channel-polymorphic delivery.
pub struct Dispatcher {
    db: Arc<SequenceDb>,
    channels: ChannelSet,
    retry: RetryPolicy,
    feed: Arc<FailureFeed>,
    template: TemplateConfig,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        db: Arc<SequenceDb>,
        channels: ChannelSet,
        retry: RetryPolicy,
        feed: Arc<FailureFeed>,
        template: TemplateConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            db,
            channels,
            retry,
            feed,
            template,
            timeout,
        }
    }

    /// Render the message for a send. A subject without an address for the
    /// step's channel is a permanent failure.
    pub fn render(
        &self,
        send: &ScheduledSend,
        step: &Step,
        subject: &Subject,
    ) -> std::result::Result<OutboundMessage, TransportError> {
        let recipient = subject.address(step.channel).ok_or_else(|| {
            TransportError::Permanent(format!(
                "subject '{}' has no {} address",
                subject.id, step.channel
            ))
        })?;

        let vars = merge_variables(&self.template.defaults(), &send.variables, subject);
        let body = template::render(&step.body, &vars);

        let (subject_line, body) = match step.channel {
            Channel::Email => {
                let line = template::render(step.subject.as_deref().unwrap_or_default(), &vars);
                let html = match &self.template.email_layout {
                    Some(layout) => template::compose_html(layout, &line, &body, &vars),
                    None => body,
                };
                (Some(line), html)
            }
            Channel::Sms => (None, body),
        };

        Ok(OutboundMessage {
            channel: step.channel,
            recipient: recipient.to_string(),
            subject: subject_line,
            body,
            idempotency_key: send.idempotency_key.clone(),
        })
    }

    /// Attempt delivery once and record the outcome. The caller holds the
    /// idempotency claim.
    pub async fn send(
        &self,
        send: &ScheduledSend,
        step: &Step,
        subject: &Subject,
    ) -> Result<DeliveryOutcome> {
        let attempt = send.attempt_count + 1;
        let transport = self.channels.select(step.channel);

        let result = match self.render(send, step, subject) {
            Ok(message) => match tokio::time::timeout(self.timeout, transport.send(&message)).await {
                Ok(Ok(receipt)) => Ok((message, receipt)),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(TransportError::Transient(format!(
                    "timed out after {}s",
                    self.timeout.as_secs()
                ))),
            },
            Err(e) => Err(e),
        };
        let now = Utc::now();

        match result {
            Ok((message, receipt)) => {
                let record = NewDeliveryRecord {
                    recipient: message.recipient.clone(),
                    channel: message.channel,
                    subject: message.subject.clone(),
                    content_hash: content_hash(&message.body),
                    transport: transport.name().to_string(),
                    transport_message_id: receipt.message_id,
                };
                let record = self.db.complete_delivery(send, attempt, &record, now)?;
                tracing::info!(
                    "✅ Delivered step {} of {} to {} via {} (attempt {})",
                    step.order_index,
                    send.sequence_id,
                    record.recipient,
                    record.transport,
                    attempt
                );
                Ok(DeliveryOutcome::Sent(record))
            }
            Err(TransportError::Transient(error)) => match self.retry.decide(attempt, now) {
                RetryDecision::RetryAt(next_attempt_at) => {
                    self.db.record_retry(&send.id, attempt, &error, next_attempt_at, now)?;
                    tracing::warn!(
                        "⚠️ Transient failure for {} (attempt {}/{}): {}, retry at {}",
                        send.id,
                        attempt,
                        self.retry.max_attempts(),
                        error,
                        next_attempt_at
                    );
                    Ok(DeliveryOutcome::Retrying {
                        attempt,
                        next_attempt_at,
                        error,
                    })
                }
                RetryDecision::Exhausted => {
                    self.fail(send, attempt, FailureKind::RetriesExhausted, error, now)
                }
            },
            Err(TransportError::Permanent(error)) => {
                self.fail(send, attempt, FailureKind::PermanentDispatch, error, now)
            }
        }
    }

    fn fail(
        &self,
        send: &ScheduledSend,
        attempt: u32,
        kind: FailureKind,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<DeliveryOutcome> {
        self.db.mark_failed(&send.id, attempt, &error, now)?;
        self.feed.publish(FailureEvent {
            scheduled_send_id: Some(send.id.clone()),
            subject_id: send.subject_id.clone(),
            sequence_id: send.sequence_id.clone(),
            step_id: Some(send.step_id.clone()),
            kind,
            attempt_count: attempt,
            detail: error.clone(),
            timestamp: now,
        });
        Ok(DeliveryOutcome::Failed {
            attempt,
            kind,
            error,
        })
    }
}
