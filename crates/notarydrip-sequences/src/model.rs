//! Campaign data model: sequences, steps, scheduled sends and delivery records.

use chrono::{DateTime, Utc};
use notarydrip_core::funnel::{FunnelStatus, StatusGate};
use notarydrip_core::types::{Channel, TriggerEvent};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A named drip campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub id: String,
    pub name: String,
    pub active: bool,
    pub channel: Channel,
    pub trigger_event: TriggerEvent,
    /// Campaign only applies while the subject satisfies this status.
    pub required_status: Option<FunnelStatus>,
    #[serde(default)]
    pub status_gate: StatusGate,
    /// Ordered by `order_index`.
    #[serde(default)]
    pub steps: Vec<Step>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Sequence {
    /// Active steps in order.
    pub fn active_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| s.active)
    }

    /// Whether a subject at `status` satisfies this sequence's status gate.
    pub fn admits(&self, status: FunnelStatus) -> bool {
        match self.required_status {
            None => true,
            Some(required) => self.status_gate.admits(required, status),
        }
    }
}

/// Longest delay a step may carry.
pub const MAX_DELAY_DAYS: i64 = 365;

/// Unit of a step delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayUnit {
    Minutes,
    Hours,
    Days,
}

impl DelayUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            DelayUnit::Minutes => "minutes",
            DelayUnit::Hours => "hours",
            DelayUnit::Days => "days",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "minutes" => Some(DelayUnit::Minutes),
            "hours" => Some(DelayUnit::Hours),
            "days" => Some(DelayUnit::Days),
            _ => None,
        }
    }
}

/// Offset from the triggering event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delay {
    pub value: i64,
    pub unit: DelayUnit,
}

impl Delay {
    pub fn zero() -> Self {
        Self { value: 0, unit: DelayUnit::Minutes }
    }

    pub fn minutes(value: i64) -> Self {
        Self { value, unit: DelayUnit::Minutes }
    }

    pub fn hours(value: i64) -> Self {
        Self { value, unit: DelayUnit::Hours }
    }

    pub fn days(value: i64) -> Self {
        Self { value, unit: DelayUnit::Days }
    }

    /// None when the value does not fit in a `TimeDelta`.
    pub fn to_duration(&self) -> Option<chrono::TimeDelta> {
        match self.unit {
            DelayUnit::Minutes => chrono::TimeDelta::try_minutes(self.value),
            DelayUnit::Hours => chrono::TimeDelta::try_hours(self.value),
            DelayUnit::Days => chrono::TimeDelta::try_days(self.value),
        }
    }

    /// True when the delay is longer than `MAX_DELAY_DAYS`.
    pub fn exceeds_max(&self) -> bool {
        self.to_duration()
            .is_none_or(|d| d > chrono::TimeDelta::days(MAX_DELAY_DAYS))
    }
}

/// Allowed hour-of-day range `[start, end)` in the reference timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendWindow {
    pub start_hour: u8,
    pub end_hour: u8,
}

impl SendWindow {
    pub fn new(start_hour: u8, end_hour: u8) -> Self {
        Self { start_hour, end_hour }
    }
}

/// One timed message within a sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub sequence_id: String,
    pub order_index: u32,
    pub delay: Delay,
    #[serde(default)]
    pub window: Option<SendWindow>,
    pub channel: Channel,
    pub template_key: String,
    /// Email only.
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
    pub active: bool,
}

/// Input for creating a sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSequence {
    pub name: String,
    pub channel: Channel,
    pub trigger_event: TriggerEvent,
    #[serde(default)]
    pub required_status: Option<FunnelStatus>,
    #[serde(default)]
    pub status_gate: StatusGate,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub steps: Vec<NewStep>,
}

/// Input for creating a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStep {
    pub order_index: u32,
    pub delay: Delay,
    #[serde(default)]
    pub window: Option<SendWindow>,
    /// Defaults to the sequence channel.
    #[serde(default)]
    pub channel: Option<Channel>,
    pub template_key: String,
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

/// Lifecycle state of a scheduled send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    Pending,
    Sent,
    Skipped,
    Failed,
}

impl SendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendStatus::Pending => "pending",
            SendStatus::Sent => "sent",
            SendStatus::Skipped => "skipped",
            SendStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "sent" => SendStatus::Sent,
            "skipped" => SendStatus::Skipped,
            "failed" => SendStatus::Failed,
            _ => SendStatus::Pending,
        }
    }
}

/// An obligation to deliver one step to one subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledSend {
    pub id: String,
    pub idempotency_key: String,
    pub subject_id: String,
    pub sequence_id: String,
    pub step_id: String,
    pub occurrence_id: String,
    pub trigger_at: DateTime<Utc>,
    pub fire_at: DateTime<Utc>,
    /// Set after a transient failure; takes precedence over `fire_at`.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub status: SendStatus,
    pub skip_reason: Option<String>,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Variable snapshot carried by the triggering event.
    pub variables: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl ScheduledSend {
    /// When the sweep should next look at this row.
    pub fn due_at(&self) -> DateTime<Utc> {
        self.next_attempt_at.unwrap_or(self.fire_at)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == SendStatus::Pending && self.due_at() <= now
    }
}

/// Append-only audit row for one successful delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: i64,
    pub scheduled_send_id: String,
    pub idempotency_key: String,
    pub recipient: String,
    pub channel: Channel,
    pub subject: Option<String>,
    /// SHA-256 of the rendered body.
    pub content_hash: String,
    pub transport: String,
    pub transport_message_id: String,
    pub delivered_at: DateTime<Utc>,
}

/// Per-sequence delivery counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceStats {
    pub sequence_id: String,
    pub pending: u64,
    pub sent: u64,
    pub skipped: u64,
    pub failed: u64,
}
