//! Sequence Catalog: validated CRUD over sequences and their steps.
//!
//! Writes are validated before they touch the database and the first broken
//! rule is reported. Activation flips a flag; in-flight sends notice it at
//! their next evaluation.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use notarydrip_core::error::{DripError, Result, ValidationError};
use notarydrip_core::funnel::{FunnelStatus, StatusGate};
use notarydrip_core::types::{Channel, TriggerEvent};
use serde::{Deserialize, Serialize};

use crate::model::{Delay, NewSequence, NewStep, SendWindow, Sequence, SequenceStats, Step};
use crate::persistence::SequenceDb;

/// Partial update of a sequence's own fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SequenceUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub channel: Option<Channel>,
    #[serde(default)]
    pub trigger_event: Option<TriggerEvent>,
    #[serde(default)]
    pub required_status: Option<FunnelStatus>,
    /// Remove the required status.
    #[serde(default)]
    pub clear_required_status: bool,
    #[serde(default)]
    pub status_gate: Option<StatusGate>,
    #[serde(default)]
    pub active: Option<bool>,
}

/// Check one step's fields. Rules are checked in a fixed order.
pub fn validate_step_fields(
    channel: Channel,
    delay: Delay,
    window: Option<SendWindow>,
    template_key: &str,
    subject: Option<&str>,
    body: &str,
) -> std::result::Result<(), ValidationError> {
    if delay.value < 0 {
        return Err(ValidationError::NegativeDelay(delay.value));
    }
    if delay.exceeds_max() {
        return Err(ValidationError::DelayTooLarge {
            value: delay.value,
            unit: delay.unit.as_str(),
        });
    }
    if let Some(w) = window {
        if w.start_hour > 23 || w.end_hour == 0 || w.end_hour > 24 {
            return Err(ValidationError::WindowHourOutOfRange {
                start: Some(w.start_hour),
                end: Some(w.end_hour),
            });
        }
        if w.start_hour >= w.end_hour {
            return Err(ValidationError::InvertedWindow {
                start: w.start_hour,
                end: w.end_hour,
            });
        }
    }
    if template_key.trim().is_empty() {
        return Err(ValidationError::EmptyTemplateKey);
    }
    if body.trim().is_empty() {
        return Err(ValidationError::MissingBody);
    }
    if channel == Channel::Email && subject.is_none_or(|s| s.trim().is_empty()) {
        return Err(ValidationError::MissingSubject);
    }
    Ok(())
}

fn validate_new_step(default_channel: Channel, step: &NewStep) -> std::result::Result<(), ValidationError> {
    validate_step_fields(
        step.channel.unwrap_or(default_channel),
        step.delay,
        step.window,
        &step.template_key,
        step.subject.as_deref(),
        &step.body,
    )
}

/// Validate a whole new sequence, steps included.
pub fn validate_new_sequence(seq: &NewSequence) -> std::result::Result<(), ValidationError> {
    if seq.name.trim().is_empty() {
        return Err(ValidationError::EmptyName);
    }
    let mut seen = HashSet::new();
    for step in &seq.steps {
        validate_new_step(seq.channel, step)?;
        if !seen.insert(step.order_index) {
            return Err(ValidationError::DuplicateOrderIndex(step.order_index));
        }
    }
    Ok(())
}

/// Validate a stored sequence record (used by catalog import).
pub fn validate_sequence(seq: &Sequence) -> std::result::Result<(), ValidationError> {
    if seq.name.trim().is_empty() {
        return Err(ValidationError::EmptyName);
    }
    let mut seen = HashSet::new();
    for step in &seq.steps {
        validate_step_fields(
            step.channel,
            step.delay,
            step.window,
            &step.template_key,
            step.subject.as_deref(),
            &step.body,
        )?;
        if !seen.insert(step.order_index) {
            return Err(ValidationError::DuplicateOrderIndex(step.order_index));
        }
    }
    Ok(())
}

fn build_step(sequence_id: &str, default_channel: Channel, new: NewStep) -> Step {
    Step {
        id: uuid::Uuid::new_v4().to_string(),
        sequence_id: sequence_id.to_string(),
        order_index: new.order_index,
        delay: new.delay,
        window: new.window,
        channel: new.channel.unwrap_or(default_channel),
        template_key: new.template_key.trim().to_string(),
        subject: new.subject,
        body: new.body,
        active: new.active,
    }
}

/// Campaign configuration store.
#[derive(Clone)]
pub struct Catalog {
    db: Arc<SequenceDb>,
}

impl Catalog {
    pub fn new(db: Arc<SequenceDb>) -> Self {
        Self { db }
    }

    pub fn create_sequence(&self, new: NewSequence) -> Result<Sequence> {
        validate_new_sequence(&new)?;
        let now = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();
        let mut steps: Vec<Step> = new
            .steps
            .into_iter()
            .map(|s| build_step(&id, new.channel, s))
            .collect();
        steps.sort_by_key(|s| s.order_index);

        let seq = Sequence {
            id,
            name: new.name.trim().to_string(),
            active: new.active,
            channel: new.channel,
            trigger_event: new.trigger_event,
            required_status: new.required_status,
            status_gate: new.status_gate,
            steps,
            created_at: now,
            updated_at: now,
        };
        self.db.insert_sequence(&seq)?;
        tracing::info!(
            "📋 Sequence created: '{}' ({}) on {} with {} steps",
            seq.name,
            seq.id,
            seq.trigger_event.as_str(),
            seq.steps.len()
        );
        Ok(seq)
    }

    pub fn get(&self, id: &str) -> Result<Sequence> {
        self.db
            .get_sequence(id)?
            .ok_or_else(|| DripError::NotFound(format!("sequence '{id}'")))
    }

    pub fn list(&self) -> Result<Vec<Sequence>> {
        self.db.list_sequences()
    }

    pub fn update_sequence(&self, id: &str, update: SequenceUpdate) -> Result<Sequence> {
        let mut seq = self.get(id)?;
        if let Some(name) = update.name {
            if name.trim().is_empty() {
                return Err(ValidationError::EmptyName.into());
            }
            seq.name = name.trim().to_string();
        }
        if let Some(channel) = update.channel {
            seq.channel = channel;
        }
        if let Some(trigger) = update.trigger_event {
            seq.trigger_event = trigger;
        }
        if update.clear_required_status {
            seq.required_status = None;
        } else if let Some(status) = update.required_status {
            seq.required_status = Some(status);
        }
        if let Some(gate) = update.status_gate {
            seq.status_gate = gate;
        }
        if let Some(active) = update.active {
            seq.active = active;
        }
        seq.updated_at = Utc::now();
        self.db.update_sequence(&seq)?;
        tracing::info!("✏️ Sequence updated: '{}' ({})", seq.name, seq.id);
        Ok(seq)
    }

    /// Flip the active flag. No cascade: already scheduled sends are
    /// re-checked when they come due.
    pub fn set_active(&self, id: &str, active: bool) -> Result<()> {
        if !self.db.set_sequence_active(id, active, Utc::now())? {
            return Err(DripError::NotFound(format!("sequence '{id}'")));
        }
        tracing::info!(
            "{} Sequence {}: {}",
            if active { "▶️" } else { "⏸️" },
            if active { "activated" } else { "deactivated" },
            id
        );
        Ok(())
    }

    /// Delete a sequence and its steps. Returns how many pending sends were
    /// skipped.
    pub fn delete_sequence(&self, id: &str) -> Result<usize> {
        let skipped = self
            .db
            .delete_sequence(id, Utc::now())?
            .ok_or_else(|| DripError::NotFound(format!("sequence '{id}'")))?;
        tracing::info!("🗑️ Sequence deleted: {id} ({skipped} pending sends skipped)");
        Ok(skipped)
    }

    fn ensure_order_free(&self, seq: &Sequence, order_index: u32, except: Option<&str>) -> Result<()> {
        let taken = seq
            .steps
            .iter()
            .any(|s| s.order_index == order_index && Some(s.id.as_str()) != except);
        if taken {
            return Err(ValidationError::DuplicateOrderIndex(order_index).into());
        }
        Ok(())
    }

    pub fn add_step(&self, sequence_id: &str, new: NewStep) -> Result<Step> {
        let seq = self.get(sequence_id)?;
        validate_new_step(seq.channel, &new)?;
        self.ensure_order_free(&seq, new.order_index, None)?;

        let step = build_step(&seq.id, seq.channel, new);
        self.db.insert_step(&step)?;
        tracing::info!(
            "➕ Step {} added to '{}' ({})",
            step.order_index,
            seq.name,
            step.template_key
        );
        Ok(step)
    }

    pub fn get_step(&self, step_id: &str) -> Result<Step> {
        self.db
            .get_step(step_id)?
            .ok_or_else(|| DripError::NotFound(format!("step '{step_id}'")))
    }

    /// Replace a step's fields, keeping its id and sequence.
    pub fn update_step(&self, step_id: &str, new: NewStep) -> Result<Step> {
        let current = self.get_step(step_id)?;
        let seq = self.get(&current.sequence_id)?;
        validate_new_step(current.channel, &new)?;
        self.ensure_order_free(&seq, new.order_index, Some(step_id))?;

        let mut step = build_step(&seq.id, current.channel, new);
        step.id = current.id;
        self.db.update_step(&step)?;
        tracing::info!("✏️ Step updated: {}", step.id);
        Ok(step)
    }

    pub fn set_step_active(&self, step_id: &str, active: bool) -> Result<()> {
        if !self.db.set_step_active(step_id, active)? {
            return Err(DripError::NotFound(format!("step '{step_id}'")));
        }
        tracing::info!("🔁 Step {step_id} active={active}");
        Ok(())
    }

    pub fn delete_step(&self, step_id: &str) -> Result<usize> {
        let skipped = self
            .db
            .delete_step(step_id, Utc::now())?
            .ok_or_else(|| DripError::NotFound(format!("step '{step_id}'")))?;
        tracing::info!("🗑️ Step deleted: {step_id} ({skipped} pending sends skipped)");
        Ok(skipped)
    }

    pub fn stats(&self, sequence_id: &str) -> Result<SequenceStats> {
        self.get(sequence_id)?;
        self.db.sequence_stats(sequence_id)
    }

    /// Stats for every sequence.
    pub fn all_stats(&self) -> Result<Vec<(Sequence, SequenceStats)>> {
        let mut out = Vec::new();
        for seq in self.list()? {
            let stats = self.db.sequence_stats(&seq.id)?;
            out.push((seq, stats));
        }
        Ok(out)
    }
}
