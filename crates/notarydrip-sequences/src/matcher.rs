//! Trigger Matcher: which sequences apply to an inbound domain event.
//!
//! Selection only: nothing is written here. A sequence matches when it is
//! active, listens for the event's type, and its status gate admits the
//! subject's funnel status at match time.

use std::sync::Arc;

use notarydrip_core::error::Result;
use notarydrip_core::funnel::FunnelStatus;
use notarydrip_core::types::{DomainEvent, TriggerEvent};

use crate::model::Sequence;
use crate::persistence::SequenceDb;

/// Whether a single sequence applies.
pub fn matches(seq: &Sequence, event_type: TriggerEvent, status: FunnelStatus) -> bool {
    seq.active && seq.trigger_event == event_type && seq.admits(status)
}

/// Evaluates events against the stored catalog.
#[derive(Clone)]
pub struct TriggerMatcher {
    db: Arc<SequenceDb>,
}

impl TriggerMatcher {
    pub fn new(db: Arc<SequenceDb>) -> Self {
        Self { db }
    }

    /// Every matching sequence. Each is scheduled independently.
    pub fn evaluate(&self, event: &DomainEvent, status: FunnelStatus) -> Result<Vec<Sequence>> {
        let candidates = self.db.active_sequences_for(event.event_type)?;
        let total = candidates.len();
        let matched: Vec<Sequence> = candidates
            .into_iter()
            .filter(|seq| {
                let ok = matches(seq, event.event_type, status);
                if !ok {
                    tracing::debug!(
                        "🚫 Sequence '{}' gated out for {} (status {})",
                        seq.name,
                        event.subject_id,
                        status
                    );
                }
                ok
            })
            .collect();

        for seq in &matched {
            tracing::info!(
                "⚡ Sequence '{}' matched event '{}' for {}",
                seq.name,
                event.event_type.as_str(),
                event.subject_id
            );
        }
        tracing::debug!("🔎 {}/{} candidate sequences matched", matched.len(), total);
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use notarydrip_core::funnel::StatusGate;
    use notarydrip_core::types::Channel;

    fn sequence(trigger: TriggerEvent, required: Option<FunnelStatus>, gate: StatusGate) -> Sequence {
        Sequence {
            id: uuid::Uuid::new_v4().to_string(),
            name: "seq".into(),
            active: true,
            channel: Channel::Email,
            trigger_event: trigger,
            required_status: required,
            status_gate: gate,
            steps: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_matches_trigger_and_active() {
        let mut seq = sequence(TriggerEvent::CartAbandoned, None, StatusGate::Exact);
        assert!(matches(&seq, TriggerEvent::CartAbandoned, FunnelStatus::Started));
        assert!(!matches(&seq, TriggerEvent::PaymentFailed, FunnelStatus::Started));
        seq.active = false;
        assert!(!matches(&seq, TriggerEvent::CartAbandoned, FunnelStatus::Started));
    }

    #[test]
    fn test_exact_gate() {
        let seq = sequence(
            TriggerEvent::PaymentFailed,
            Some(FunnelStatus::PaymentPending),
            StatusGate::Exact,
        );
        assert!(matches(&seq, TriggerEvent::PaymentFailed, FunnelStatus::PaymentPending));
        assert!(!matches(&seq, TriggerEvent::PaymentFailed, FunnelStatus::PaymentCompleted));
        assert!(!matches(&seq, TriggerEvent::PaymentFailed, FunnelStatus::SummaryViewed));
    }

    #[test]
    fn test_at_least_gate() {
        let seq = sequence(
            TriggerEvent::DocumentUploaded,
            Some(FunnelStatus::DocumentsUploaded),
            StatusGate::AtLeast,
        );
        assert!(matches(&seq, TriggerEvent::DocumentUploaded, FunnelStatus::DocumentsUploaded));
        assert!(matches(&seq, TriggerEvent::DocumentUploaded, FunnelStatus::PaymentPending));
        assert!(!matches(&seq, TriggerEvent::DocumentUploaded, FunnelStatus::ServicesSelected));
        assert!(!matches(&seq, TriggerEvent::DocumentUploaded, FunnelStatus::Unknown));
    }

    #[test]
    fn test_evaluate_returns_every_match() {
        let db = Arc::new(SequenceDb::open_in_memory().unwrap());
        let a = sequence(TriggerEvent::CartAbandoned, None, StatusGate::Exact);
        let b = sequence(TriggerEvent::CartAbandoned, Some(FunnelStatus::Started), StatusGate::Exact);
        let c = sequence(TriggerEvent::CartAbandoned, Some(FunnelStatus::PaymentPending), StatusGate::Exact);
        let d = sequence(TriggerEvent::PaymentFailed, None, StatusGate::Exact);
        for s in [&a, &b, &c, &d] {
            db.insert_sequence(s).unwrap();
        }

        let matcher = TriggerMatcher::new(db);
        let event = DomainEvent::new(TriggerEvent::CartAbandoned, "c1", "o1", Utc::now());
        let matched = matcher.evaluate(&event, FunnelStatus::Started).unwrap();
        let ids: Vec<&str> = matched.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(matched.len(), 2);
        assert!(ids.contains(&a.id.as_str()));
        assert!(ids.contains(&b.id.as_str()));
    }
}
