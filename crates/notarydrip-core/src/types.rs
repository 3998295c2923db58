//! Shared domain types: channels, trigger events, inbound domain events and subjects.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::funnel::FunnelStatus;

/// Delivery channel for a sequence or step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "email" => Some(Channel::Email),
            "sms" => Some(Channel::Sms),
            _ => None,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Business events a sequence can be triggered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEvent {
    SubmissionCreated,
    PaymentFailed,
    PaymentCompleted,
    DocumentUploaded,
    AppointmentScheduled,
    CartAbandoned,
    SubmissionCompleted,
}

impl TriggerEvent {
    pub const ALL: [TriggerEvent; 7] = [
        TriggerEvent::SubmissionCreated,
        TriggerEvent::PaymentFailed,
        TriggerEvent::PaymentCompleted,
        TriggerEvent::DocumentUploaded,
        TriggerEvent::AppointmentScheduled,
        TriggerEvent::CartAbandoned,
        TriggerEvent::SubmissionCompleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerEvent::SubmissionCreated => "submission_created",
            TriggerEvent::PaymentFailed => "payment_failed",
            TriggerEvent::PaymentCompleted => "payment_completed",
            TriggerEvent::DocumentUploaded => "document_uploaded",
            TriggerEvent::AppointmentScheduled => "appointment_scheduled",
            TriggerEvent::CartAbandoned => "cart_abandoned",
            TriggerEvent::SubmissionCompleted => "submission_completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|e| e.as_str() == s)
    }
}

impl std::fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An inbound business event.
///
/// `occurrence_id` identifies one firing of the event upstream. Redelivery of
/// the same firing must carry the same occurrence id; the idempotency key is
/// derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_type: TriggerEvent,
    pub subject_id: String,
    pub occurrence_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

impl DomainEvent {
    pub fn new(
        event_type: TriggerEvent,
        subject_id: &str,
        occurrence_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type,
            subject_id: subject_id.to_string(),
            occurrence_id: occurrence_id.to_string(),
            timestamp,
            variables: HashMap::new(),
        }
    }

    pub fn with_var(mut self, key: &str, value: &str) -> Self {
        self.variables.insert(key.to_string(), value.to_string());
        self
    }
}

/// The entity a campaign targets (a client or a submission).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subject {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default = "default_status")]
    pub funnel_status: FunnelStatus,
    #[serde(default)]
    pub unsubscribed: bool,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

fn default_status() -> FunnelStatus {
    FunnelStatus::Started
}

impl Subject {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            email: None,
            phone: None,
            funnel_status: FunnelStatus::Started,
            unsubscribed: false,
            variables: HashMap::new(),
        }
    }

    pub fn with_email(mut self, email: &str) -> Self {
        self.email = Some(email.to_string());
        self
    }

    pub fn with_phone(mut self, phone: &str) -> Self {
        self.phone = Some(phone.to_string());
        self
    }

    pub fn with_status(mut self, status: FunnelStatus) -> Self {
        self.funnel_status = status;
        self
    }

    /// Address for the given channel, if the subject has one.
    pub fn address(&self, channel: Channel) -> Option<&str> {
        let addr = match channel {
            Channel::Email => self.email.as_deref(),
            Channel::Sms => self.phone.as_deref(),
        };
        addr.filter(|a| !a.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_from_json() {
        let json = r#"{
            "event_type": "cart_abandoned",
            "subject_id": "client-42",
            "occurrence_id": "evt-1",
            "timestamp": "2026-03-01T10:00:00Z",
            "variables": {"first_name": "Ada"}
        }"#;
        let ev: DomainEvent = serde_json::from_str(json).unwrap();
        assert_eq!(ev.event_type, TriggerEvent::CartAbandoned);
        assert_eq!(ev.variables["first_name"], "Ada");
    }

    #[test]
    fn test_subject_address_ignores_blank() {
        let s = Subject::new("s1").with_email("  ").with_phone("+15550100");
        assert_eq!(s.address(Channel::Email), None);
        assert_eq!(s.address(Channel::Sms), Some("+15550100"));
    }

    #[test]
    fn test_trigger_parse() {
        for ev in TriggerEvent::ALL {
            assert_eq!(TriggerEvent::parse(ev.as_str()), Some(ev));
        }
        assert_eq!(TriggerEvent::parse("nope"), None);
    }
}
