//! Failure feed: reports permanent failures and misconfigured sequences.
//! Subscribers get a live broadcast; the last 100 events stay in memory and
//! every event is persisted so operators can query it later.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use crate::persistence::SequenceDb;

const HISTORY_LIMIT: usize = 100;

/// What went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The transport rejected the message outright.
    PermanentDispatch,
    /// Transient failures used up every retry.
    RetriesExhausted,
    /// A sequence matched an event but has no active steps.
    NoActiveSteps,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::PermanentDispatch => "permanent_dispatch",
            FailureKind::RetriesExhausted => "retries_exhausted",
            FailureKind::NoActiveSteps => "no_active_steps",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "retries_exhausted" => FailureKind::RetriesExhausted,
            "no_active_steps" => FailureKind::NoActiveSteps,
            _ => FailureKind::PermanentDispatch,
        }
    }
}

/// One failure-feed entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEvent {
    pub scheduled_send_id: Option<String>,
    pub subject_id: String,
    pub sequence_id: String,
    pub step_id: Option<String>,
    pub kind: FailureKind,
    pub attempt_count: u32,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

/// Broadcast + ring-buffer history of failure events.
pub struct FailureFeed {
    tx: broadcast::Sender<FailureEvent>,
    history: Mutex<VecDeque<FailureEvent>>,
    store: Option<Arc<SequenceDb>>,
}

impl FailureFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            tx,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LIMIT)),
            store: None,
        }
    }

    /// Also persist every event to the `failure_feed` table.
    pub fn with_store(mut self, db: Arc<SequenceDb>) -> Self {
        self.store = Some(db);
        self
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<FailureEvent> {
        self.tx.subscribe()
    }

    /// Record and broadcast. Having no subscribers is fine.
    pub fn publish(&self, event: FailureEvent) {
        tracing::error!(
            "🚨 {}: subject={} sequence={} step={:?} attempts={}: {}",
            event.kind.as_str(),
            event.subject_id,
            event.sequence_id,
            event.step_id,
            event.attempt_count,
            event.detail
        );
        if let Some(db) = &self.store {
            if let Err(e) = db.insert_failure(&event) {
                tracing::warn!("⚠️ Failed to persist failure event: {e}");
            }
        }
        if let Ok(mut history) = self.history.lock() {
            history.push_back(event.clone());
            if history.len() > HISTORY_LIMIT {
                history.pop_front();
            }
        }
        let _ = self.tx.send(event);
    }

    /// Recent events, oldest first.
    pub fn history(&self) -> Vec<FailureEvent> {
        self.history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for FailureFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(n: u32) -> FailureEvent {
        FailureEvent {
            scheduled_send_id: Some(format!("send-{n}")),
            subject_id: "s1".into(),
            sequence_id: "seq".into(),
            step_id: None,
            kind: FailureKind::RetriesExhausted,
            attempt_count: n,
            detail: "boom".into(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let feed = FailureFeed::new();
        let mut rx = feed.subscribe();
        feed.publish(event(1));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.attempt_count, 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let feed = FailureFeed::new();
        for n in 0..150 {
            feed.publish(event(n));
        }
        let history = feed.history();
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history[0].attempt_count, 50);
    }

    #[test]
    fn test_events_are_persisted() {
        let db = Arc::new(SequenceDb::open_in_memory().unwrap());
        let feed = FailureFeed::new().with_store(db.clone());
        feed.publish(event(3));
        let stored = db.recent_failures(10).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].scheduled_send_id.as_deref(), Some("send-3"));
    }
}
