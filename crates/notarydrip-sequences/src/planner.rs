//! Step Scheduler: turns a matched sequence into pending scheduled sends.
//!
//! Each active step gets one row keyed by its idempotency key; redelivered
//! events for the same occurrence land on the existing row and create nothing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use notarydrip_core::error::Result;
use notarydrip_core::types::DomainEvent;
use serde::Serialize;

use crate::dedup::idempotency_key;
use crate::feed::{FailureEvent, FailureFeed, FailureKind};
use crate::model::{ScheduledSend, SendStatus, Sequence, Step};
use crate::persistence::SequenceDb;
use crate::window;

/// What scheduling one sequence for one event produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScheduleOutcome {
    pub created: usize,
    /// Steps that already had a row for this occurrence.
    pub duplicates: usize,
}

/// Build the pending row for one step. Pure.
pub fn plan_send(
    event: &DomainEvent,
    seq: &Sequence,
    step: &Step,
    tz: Tz,
    now: DateTime<Utc>,
) -> Result<ScheduledSend> {
    Ok(ScheduledSend {
        id: uuid::Uuid::new_v4().to_string(),
        idempotency_key: idempotency_key(&event.subject_id, &seq.id, &step.id, &event.occurrence_id),
        subject_id: event.subject_id.clone(),
        sequence_id: seq.id.clone(),
        step_id: step.id.clone(),
        occurrence_id: event.occurrence_id.clone(),
        trigger_at: event.timestamp,
        fire_at: window::fire_at(event.timestamp, step.delay, step.window, tz)?,
        next_attempt_at: None,
        status: SendStatus::Pending,
        skip_reason: None,
        attempt_count: 0,
        last_attempt_at: None,
        last_error: None,
        variables: event.variables.clone(),
        created_at: now,
    })
}

/// Persists pending sends for matched sequences.
#[derive(Clone)]
pub struct StepScheduler {
    db: Arc<SequenceDb>,
    feed: Arc<FailureFeed>,
    tz: Tz,
}

impl StepScheduler {
    pub fn new(db: Arc<SequenceDb>, feed: Arc<FailureFeed>, tz: Tz) -> Self {
        Self { db, feed, tz }
    }

    /// Upsert one pending send per active step, in order.
    pub fn schedule(&self, event: &DomainEvent, seq: &Sequence) -> Result<ScheduleOutcome> {
        let now = Utc::now();
        let mut outcome = ScheduleOutcome::default();

        let steps: Vec<&Step> = seq.active_steps().collect();
        if steps.is_empty() {
            self.feed.publish(FailureEvent {
                scheduled_send_id: None,
                subject_id: event.subject_id.clone(),
                sequence_id: seq.id.clone(),
                step_id: None,
                kind: FailureKind::NoActiveSteps,
                attempt_count: 0,
                detail: format!("sequence '{}' matched but has no active steps", seq.name),
                timestamp: now,
            });
            return Ok(outcome);
        }

        // Plan every step before writing so a bad step leaves no partial schedule.
        let planned = steps
            .into_iter()
            .map(|step| plan_send(event, seq, step, self.tz, now).map(|send| (step, send)))
            .collect::<Result<Vec<_>>>()?;

        for (step, send) in planned {
            if self.db.insert_scheduled_send(&send)? {
                tracing::info!(
                    "📅 Scheduled '{}' step {} for {} at {}",
                    seq.name,
                    step.order_index,
                    event.subject_id,
                    send.fire_at
                );
                outcome.created += 1;
            } else {
                tracing::debug!(
                    "♻️ Already scheduled: '{}' step {} for {} ({})",
                    seq.name,
                    step.order_index,
                    event.subject_id,
                    event.occurrence_id
                );
                outcome.duplicates += 1;
            }
        }
        Ok(outcome)
    }
}
