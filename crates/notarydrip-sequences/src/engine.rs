//! Notification Engine: event intake and the sweep loop.
//!
//! ```text
//! DomainEvent
//!   → TriggerMatcher.evaluate (catalog + funnel status guard)
//!     → StepScheduler.schedule (pending rows, one per active step)
//!
//! sweep tick (tokio interval)
//!   → due pending rows (bounded batch)
//!     → one task per row: claim → eligibility → Dispatcher.send
//! ```
//!
//! Workers on different replicas only coordinate through the idempotency
//! claim, so any number of sweepers may run at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use notarydrip_channels::ChannelSet;
use notarydrip_core::config::{DripConfig, TemplateConfig};
use notarydrip_core::error::{DripError, Result};
use notarydrip_core::funnel::FunnelStatus;
use notarydrip_core::template::{self, Preview};
use notarydrip_core::traits::SubjectStore;
use notarydrip_core::types::{Channel, DomainEvent, Subject};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::catalog::Catalog;
use crate::dedup::{Claim, DedupStore, default_worker_id};
use crate::dispatch::{DeliveryOutcome, Dispatcher, merge_variables};
use crate::feed::FailureFeed;
use crate::matcher::TriggerMatcher;
use crate::model::{ScheduledSend, Step};
use crate::persistence::SequenceDb;
use crate::planner::StepScheduler;
use crate::retry::RetryPolicy;

/// Runtime settings, resolved once from config and passed down explicitly.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub timezone: Tz,
    pub batch_size: usize,
    pub sweep_interval: Duration,
    pub dispatch_timeout: Duration,
    /// Exclusivity window of an idempotency claim on a pending send.
    pub claim_lease: Duration,
    pub worker_id: String,
    pub retry: RetryPolicy,
    pub template: TemplateConfig,
}

impl EngineSettings {
    pub fn from_config(config: &DripConfig) -> Result<Self> {
        Ok(Self {
            timezone: config.engine.timezone()?,
            batch_size: config.engine.batch_size,
            sweep_interval: Duration::from_secs(config.engine.sweep_interval_secs),
            dispatch_timeout: Duration::from_secs(config.engine.dispatch_timeout_secs),
            claim_lease: Duration::from_secs(config.engine.claim_lease_secs),
            worker_id: config
                .engine
                .worker_id
                .clone()
                .unwrap_or_else(default_worker_id),
            retry: RetryPolicy::from_config(&config.retry),
            template: config.template.clone(),
        })
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::America::New_York,
            batch_size: 100,
            sweep_interval: Duration::from_secs(60),
            dispatch_timeout: Duration::from_secs(30),
            claim_lease: Duration::from_secs(300),
            worker_id: default_worker_id(),
            retry: RetryPolicy::default(),
            template: TemplateConfig::default(),
        }
    }
}

/// Summary of one event intake. Scheduling problems are reported here rather
/// than failing the caller.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub subject_id: String,
    pub occurrence_id: String,
    pub matched: Vec<String>,
    pub scheduled: usize,
    pub duplicates: usize,
    pub errors: Vec<String>,
}

/// What happened to one due send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SendResult {
    Delivered,
    Retrying,
    Failed,
    Skipped(String),
    /// Another worker owns the key.
    Duplicate,
    /// The row was no longer pending and due once claimed.
    Stale,
}

/// Counts from one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub due: usize,
    pub delivered: usize,
    pub retrying: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duplicates: usize,
    pub errors: usize,
}

impl SweepReport {
    fn record(&mut self, result: &SendResult) {
        match result {
            SendResult::Delivered => self.delivered += 1,
            SendResult::Retrying => self.retrying += 1,
            SendResult::Failed => self.failed += 1,
            SendResult::Skipped(_) => self.skipped += 1,
            SendResult::Duplicate | SendResult::Stale => self.duplicates += 1,
        }
    }
}

/// The lifecycle notification engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct NotificationEngine {
    db: Arc<SequenceDb>,
    subjects: Arc<dyn SubjectStore>,
    catalog: Catalog,
    matcher: TriggerMatcher,
    scheduler: StepScheduler,
    dispatcher: Arc<Dispatcher>,
    dedup: DedupStore,
    feed: Arc<FailureFeed>,
    settings: Arc<EngineSettings>,
}

impl NotificationEngine {
    /// Engine over `db`, which also serves as the subject store.
    pub fn new(db: Arc<SequenceDb>, channels: ChannelSet, settings: EngineSettings) -> Self {
        let feed = Arc::new(FailureFeed::new().with_store(db.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            db.clone(),
            channels,
            settings.retry.clone(),
            feed.clone(),
            settings.template.clone(),
            settings.dispatch_timeout,
        ));
        Self {
            subjects: db.clone(),
            catalog: Catalog::new(db.clone()),
            matcher: TriggerMatcher::new(db.clone()),
            scheduler: StepScheduler::new(db.clone(), feed.clone(), settings.timezone),
            dedup: DedupStore::new(db.clone(), settings.worker_id.clone(), settings.claim_lease),
            dispatcher,
            feed,
            db,
            settings: Arc::new(settings),
        }
    }

    /// Build everything from config: database, transports, settings.
    pub fn from_config(config: &DripConfig) -> Result<Self> {
        let settings = EngineSettings::from_config(config)?;
        let db = Arc::new(SequenceDb::open(&notarydrip_core::config::expand_path(
            &config.database.path,
        ))?);
        Ok(Self::new(db, ChannelSet::from_config(config), settings))
    }

    /// Read subjects from an external store instead of the local table.
    pub fn with_subject_store(mut self, subjects: Arc<dyn SubjectStore>) -> Self {
        self.subjects = subjects;
        self
    }

    /// Same engine, claiming under a different worker id.
    pub fn with_worker_id(mut self, worker_id: &str) -> Self {
        self.dedup = DedupStore::new(self.db.clone(), worker_id, self.settings.claim_lease);
        self
    }

    pub fn db(&self) -> &Arc<SequenceDb> {
        &self.db
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn feed(&self) -> &Arc<FailureFeed> {
        &self.feed
    }

    pub fn subjects(&self) -> &Arc<dyn SubjectStore> {
        &self.subjects
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    // ─── Intake ───────────────────────────────────────────────

    /// Match an event against the catalog and schedule every matching
    /// sequence. Sequences are scheduled independently; one failing does not
    /// stop the others.
    pub async fn ingest(&self, event: &DomainEvent) -> Result<IngestReport> {
        let mut report = IngestReport {
            subject_id: event.subject_id.clone(),
            occurrence_id: event.occurrence_id.clone(),
            ..Default::default()
        };

        let status = match self.subjects.get(&event.subject_id).await? {
            Some(subject) => subject.funnel_status,
            None => {
                tracing::warn!(
                    "⚠️ Event {} for unknown subject {}",
                    event.event_type.as_str(),
                    event.subject_id
                );
                FunnelStatus::Unknown
            }
        };

        for seq in self.matcher.evaluate(event, status)? {
            report.matched.push(seq.id.clone());
            match self.scheduler.schedule(event, &seq) {
                Ok(outcome) => {
                    report.scheduled += outcome.created;
                    report.duplicates += outcome.duplicates;
                }
                Err(e) => {
                    tracing::error!("❌ Scheduling '{}' for {} failed: {e}", seq.name, event.subject_id);
                    report.errors.push(format!("{}: {e}", seq.id));
                }
            }
        }

        tracing::info!(
            "📥 Event {} ({}) for {}: {} matched, {} scheduled, {} already scheduled",
            event.event_type.as_str(),
            event.occurrence_id,
            event.subject_id,
            report.matched.len(),
            report.scheduled,
            report.duplicates
        );
        Ok(report)
    }

    // ─── Sweep ────────────────────────────────────────────────

    /// Process every send due at `now` (up to the batch size), each as its
    /// own task.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let due = self
            .db
            .due_sends(now, self.dedup.lease(), self.settings.batch_size)?;
        let mut report = SweepReport {
            due: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return Ok(report);
        }

        let mut tasks = JoinSet::new();
        for send in due {
            let engine = self.clone();
            tasks.spawn(async move { engine.process_send(send, now).await });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(result)) => report.record(&result),
                Ok(Err(e)) => {
                    tracing::error!("❌ Send processing failed: {e}");
                    report.errors += 1;
                }
                Err(e) => {
                    tracing::error!("❌ Send task panicked: {e}");
                    report.errors += 1;
                }
            }
        }

        tracing::info!(
            "🧹 Sweep: {} due, {} delivered, {} retrying, {} failed, {} skipped, {} duplicate",
            report.due,
            report.delivered,
            report.retrying,
            report.failed,
            report.skipped,
            report.duplicates
        );
        Ok(report)
    }

    /// Claim, re-check and dispatch one send.
    pub async fn process_send(&self, send: ScheduledSend, now: DateTime<Utc>) -> Result<SendResult> {
        let fresh = match self.dedup.acquire(&send, now)? {
            Claim::Acquired(fresh) => fresh,
            Claim::Held => return Ok(SendResult::Duplicate),
            Claim::Stale => return Ok(SendResult::Stale),
        };
        let key = fresh.idempotency_key.clone();

        let (step, subject) = match self.check_eligibility(&fresh).await {
            Ok(Ok(found)) => found,
            Ok(Err(reason)) => {
                self.db.mark_skipped(&fresh.id, reason, Utc::now())?;
                tracing::info!("⏭️ Skipped {} for {}: {reason}", fresh.id, fresh.subject_id);
                return Ok(SendResult::Skipped(reason.to_string()));
            }
            Err(e) => {
                self.dedup.release(&key)?;
                return Err(e);
            }
        };

        match self.dispatcher.send(&fresh, &step, &subject).await {
            Ok(DeliveryOutcome::Sent(_)) => Ok(SendResult::Delivered),
            Ok(DeliveryOutcome::Retrying { .. }) => {
                self.dedup.release(&key)?;
                Ok(SendResult::Retrying)
            }
            Ok(DeliveryOutcome::Failed { .. }) => Ok(SendResult::Failed),
            Err(e) => {
                self.dedup.release(&key)?;
                Err(e)
            }
        }
    }

    /// Fire-time eligibility. The inner error is the skip reason.
    async fn check_eligibility(
        &self,
        send: &ScheduledSend,
    ) -> Result<std::result::Result<(Step, Subject), &'static str>> {
        let Some(seq) = self.db.get_sequence(&send.sequence_id)? else {
            return Ok(Err("sequence_deleted"));
        };
        if !seq.active {
            return Ok(Err("sequence_inactive"));
        }
        let Some(step) = seq.steps.iter().find(|s| s.id == send.step_id).cloned() else {
            return Ok(Err("step_deleted"));
        };
        if !step.active {
            return Ok(Err("step_inactive"));
        }
        let Some(subject) = self.subjects.get(&send.subject_id).await? else {
            return Ok(Err("subject_unknown"));
        };
        if subject.unsubscribed {
            return Ok(Err("unsubscribed"));
        }
        if !seq.admits(subject.funnel_status) {
            return Ok(Err("status_gate"));
        }
        Ok(Ok((step, subject)))
    }

    /// Run sweeps on the configured interval until `shutdown` flips to true
    /// or its sender is dropped.
    pub fn spawn_sweeper(&self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            tracing::info!(
                "⏰ Sweeper started (every {}s, batch {}, worker {})",
                engine.settings.sweep_interval.as_secs(),
                engine.settings.batch_size,
                engine.dedup.worker_id()
            );
            let mut interval = tokio::time::interval(engine.settings.sweep_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = engine.sweep(Utc::now()).await {
                            tracing::error!("❌ Sweep failed: {e}");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::info!("🛑 Sweeper stopped");
                            break;
                        }
                    }
                }
            }
        })
    }

    // ─── Subjects & previews ──────────────────────────────────

    /// Guarded funnel-status write: only ever moves forward.
    pub async fn propose_status(&self, subject_id: &str, status: FunnelStatus) -> Result<bool> {
        let changed = self.subjects.propose_status(subject_id, status).await?;
        if changed {
            tracing::info!("📈 {subject_id} advanced to {status}");
        } else {
            tracing::debug!("↔️ {subject_id}: {status} is not an advance, ignored");
        }
        Ok(changed)
    }

    pub async fn upsert_subject(&self, subject: &Subject) -> Result<()> {
        self.subjects.upsert(subject).await
    }

    /// Render a step against a subject (or an empty one) plus extra variables.
    pub async fn preview(
        &self,
        step_id: &str,
        subject_id: Option<&str>,
        extra: &HashMap<String, String>,
    ) -> Result<Preview> {
        let step = self.catalog.get_step(step_id)?;
        let subject = match subject_id {
            Some(id) => self
                .subjects
                .get(id)
                .await?
                .ok_or_else(|| DripError::NotFound(format!("subject '{id}'")))?,
            None => Subject::new("preview"),
        };
        let vars = merge_variables(&self.settings.template.defaults(), extra, &subject);
        let subject_line = match step.channel {
            Channel::Email => step.subject.as_deref(),
            Channel::Sms => None,
        };
        Ok(template::preview(subject_line, &step.body, &vars))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FailureKind;
    use crate::model::{Delay, NewSequence, NewStep, SendStatus, SendWindow};
    use crate::testing::ScriptedTransport;
    use chrono::TimeZone;
    use notarydrip_core::funnel::StatusGate;
    use notarydrip_core::traits::TransportError;
    use notarydrip_core::types::TriggerEvent;

    fn settings() -> EngineSettings {
        EngineSettings {
            timezone: chrono_tz::UTC,
            worker_id: "test-worker".into(),
            ..Default::default()
        }
    }

    fn engine_with(email: Arc<ScriptedTransport>) -> NotificationEngine {
        let db = Arc::new(SequenceDb::open_in_memory().unwrap());
        let sms = Arc::new(ScriptedTransport::new(Channel::Sms));
        NotificationEngine::new(db, ChannelSet::new(email, sms), settings())
    }

    fn step(order: u32, delay: Delay, window: Option<SendWindow>) -> NewStep {
        NewStep {
            order_index: order,
            delay,
            window,
            channel: None,
            template_key: format!("step_{order}"),
            subject: Some("Hi {{first_name}}".into()),
            body: "<p>Step {{first_name}}</p>".into(),
            active: true,
        }
    }

    fn sequence(
        trigger: TriggerEvent,
        required: Option<FunnelStatus>,
        gate: StatusGate,
        steps: Vec<NewStep>,
    ) -> NewSequence {
        NewSequence {
            name: format!("{} flow", trigger.as_str()),
            channel: Channel::Email,
            trigger_event: trigger,
            required_status: required,
            status_gate: gate,
            active: true,
            steps,
        }
    }

    async fn subject(engine: &NotificationEngine, id: &str, status: FunnelStatus) {
        engine
            .upsert_subject(&Subject::new(id).with_email(&format!("{id}@example.com")).with_status(status))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_two_step_end_to_end() {
        let email = Arc::new(ScriptedTransport::new(Channel::Email));
        let engine = engine_with(email.clone());
        subject(&engine, "S1", FunnelStatus::Started).await;
        engine
            .catalog()
            .create_sequence(sequence(
                TriggerEvent::SubmissionCreated,
                None,
                StatusGate::Exact,
                vec![
                    step(1, Delay::zero(), None),
                    step(2, Delay::days(1), Some(SendWindow::new(9, 18))),
                ],
            ))
            .unwrap();

        // T0 = 20:00 UTC, so T0+24h is outside [9,18] and moves to 09:00 the day after.
        let t0 = Utc.with_ymd_and_hms(2026, 4, 6, 20, 0, 0).unwrap();
        let event = DomainEvent::new(TriggerEvent::SubmissionCreated, "S1", "sub-1", t0)
            .with_var("first_name", "Sam");
        let report = engine.ingest(&event).await.unwrap();
        assert_eq!(report.matched.len(), 1);
        assert_eq!(report.scheduled, 2);

        let sweep = engine.sweep(t0).await.unwrap();
        assert_eq!(sweep.due, 1);
        assert_eq!(sweep.delivered, 1);

        let mut sends = engine.db().sends_for_subject("S1").unwrap();
        sends.sort_by_key(|s| s.fire_at);
        assert_eq!(sends[0].status, SendStatus::Sent);
        assert_eq!(engine.db().delivery_count_for_key(&sends[0].idempotency_key).unwrap(), 1);
        assert_eq!(sends[1].status, SendStatus::Pending);
        assert_eq!(sends[1].fire_at, Utc.with_ymd_and_hms(2026, 4, 8, 9, 0, 0).unwrap());

        // Nothing else is due until then.
        let later = engine.sweep(t0 + chrono::Duration::hours(12)).await.unwrap();
        assert_eq!(later.due, 0);
        let at_fire = engine.sweep(sends[1].fire_at).await.unwrap();
        assert_eq!(at_fire.delivered, 1);

        let sent = email.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].subject.as_deref(), Some("Hi Sam"));
        assert_eq!(sent[0].recipient, "S1@example.com");
    }

    #[tokio::test]
    async fn test_redelivered_event_schedules_once() {
        let engine = engine_with(Arc::new(ScriptedTransport::new(Channel::Email)));
        subject(&engine, "c1", FunnelStatus::Started).await;
        engine
            .catalog()
            .create_sequence(sequence(
                TriggerEvent::CartAbandoned,
                None,
                StatusGate::Exact,
                vec![step(1, Delay::hours(1), None)],
            ))
            .unwrap();

        let event = DomainEvent::new(TriggerEvent::CartAbandoned, "c1", "cart-9", Utc::now());
        assert_eq!(engine.ingest(&event).await.unwrap().scheduled, 1);
        let again = engine.ingest(&event).await.unwrap();
        assert_eq!(again.scheduled, 0);
        assert_eq!(again.duplicates, 1);
        assert_eq!(engine.db().sends_for_subject("c1").unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_hundred_workers_deliver_once() {
        let email = Arc::new(
            ScriptedTransport::new(Channel::Email).with_delay(Duration::from_millis(20)),
        );
        let engine = engine_with(email.clone());
        subject(&engine, "c1", FunnelStatus::Started).await;
        engine
            .catalog()
            .create_sequence(sequence(
                TriggerEvent::SubmissionCreated,
                None,
                StatusGate::Exact,
                vec![step(1, Delay::zero(), None)],
            ))
            .unwrap();
        let now = Utc::now();
        engine
            .ingest(&DomainEvent::new(TriggerEvent::SubmissionCreated, "c1", "o1", now))
            .await
            .unwrap();
        let send = engine
            .db()
            .due_sends(now, engine.dedup.lease(), 10)
            .unwrap()
            .remove(0);

        let mut workers = JoinSet::new();
        for i in 0..100 {
            let worker = engine.clone().with_worker_id(&format!("worker-{i}"));
            let send = send.clone();
            workers.spawn(async move { worker.process_send(send, now).await.unwrap() });
        }
        let mut delivered = 0;
        while let Some(result) = workers.join_next().await {
            if result.unwrap() == SendResult::Delivered {
                delivered += 1;
            }
        }

        assert_eq!(delivered, 1);
        assert_eq!(email.calls(), 1);
        assert_eq!(engine.db().delivery_count_for_key(&send.idempotency_key).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_orphaned_claim_neither_blocks_nor_loses_sends() {
        let email = Arc::new(ScriptedTransport::new(Channel::Email));
        let db = Arc::new(SequenceDb::open_in_memory().unwrap());
        let engine = NotificationEngine::new(
            db,
            ChannelSet::new(email.clone(), Arc::new(ScriptedTransport::new(Channel::Sms))),
            EngineSettings {
                batch_size: 1,
                ..settings()
            },
        );
        subject(&engine, "c1", FunnelStatus::Started).await;
        subject(&engine, "c2", FunnelStatus::Started).await;
        engine
            .catalog()
            .create_sequence(sequence(
                TriggerEvent::CartAbandoned,
                None,
                StatusGate::Exact,
                vec![step(1, Delay::zero(), None)],
            ))
            .unwrap();

        let t0 = Utc.with_ymd_and_hms(2026, 4, 6, 10, 0, 0).unwrap();
        for (id, at) in [("c1", t0), ("c2", t0 + chrono::Duration::minutes(1))] {
            engine
                .ingest(&DomainEvent::new(TriggerEvent::CartAbandoned, id, &format!("{id}-cart"), at))
                .await
                .unwrap();
        }

        // A worker claims c1's send and dies before recording anything.
        let c1_key = engine.db().sends_for_subject("c1").unwrap()[0].idempotency_key.clone();
        assert!(engine.db().try_claim(&c1_key, "dead-worker", t0, engine.dedup.lease()).unwrap());

        // The held row does not occupy the only batch slot.
        let now = t0 + chrono::Duration::minutes(2);
        let first = engine.sweep(now).await.unwrap();
        assert_eq!(first.delivered, 1);
        assert_eq!(engine.db().sends_for_subject("c2").unwrap()[0].status, SendStatus::Sent);
        assert_eq!(engine.db().sends_for_subject("c1").unwrap()[0].status, SendStatus::Pending);

        // After the lease lapses the send is taken over and delivered once.
        let after_lease = t0 + engine.dedup.lease() + chrono::Duration::seconds(1);
        let second = engine.sweep(after_lease).await.unwrap();
        assert_eq!(second.delivered, 1);
        assert_eq!(engine.db().sends_for_subject("c1").unwrap()[0].status, SendStatus::Sent);
        assert_eq!(engine.db().delivery_count_for_key(&c1_key).unwrap(), 1);
        assert_eq!(email.calls(), 2);

        assert_eq!(engine.sweep(after_lease + chrono::Duration::days(1)).await.unwrap().due, 0);
    }

    #[tokio::test]
    async fn test_stored_huge_delay_is_reported_not_panicked() {
        let engine = engine_with(Arc::new(ScriptedTransport::new(Channel::Email)));
        subject(&engine, "c1", FunnelStatus::Started).await;
        let seq = engine
            .catalog()
            .create_sequence(sequence(
                TriggerEvent::CartAbandoned,
                None,
                StatusGate::Exact,
                vec![step(1, Delay::zero(), None), step(2, Delay::hours(1), None)],
            ))
            .unwrap();

        // A row written before the delay limit existed.
        let mut legacy = seq.steps[1].clone();
        legacy.delay = Delay::days(1_000_000_000_000);
        assert!(engine.db().update_step(&legacy).unwrap());

        let report = engine
            .ingest(&DomainEvent::new(TriggerEvent::CartAbandoned, "c1", "cart-1", Utc::now()))
            .await
            .unwrap();
        assert_eq!(report.matched, vec![seq.id.clone()]);
        assert_eq!(report.scheduled, 0);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("at most 365 days"));
        assert!(engine.db().sends_for_subject("c1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retries_back_off_then_fail() {
        let email = Arc::new(ScriptedTransport::new(Channel::Email).with_script(vec![
            Err(TransportError::Transient("503".into()));
            5
        ]));
        let engine = engine_with(email.clone());
        let mut feed = engine.feed().subscribe();
        subject(&engine, "c1", FunnelStatus::Started).await;
        engine
            .catalog()
            .create_sequence(sequence(
                TriggerEvent::PaymentFailed,
                None,
                StatusGate::Exact,
                vec![step(1, Delay::zero(), None)],
            ))
            .unwrap();
        let now = Utc::now();
        engine
            .ingest(&DomainEvent::new(TriggerEvent::PaymentFailed, "c1", "pay-1", now))
            .await
            .unwrap();

        let mut tick = now;
        let mut gaps = Vec::new();
        for _ in 0..4 {
            let report = engine.sweep(tick).await.unwrap();
            assert_eq!(report.retrying, 1);
            let row = &engine.db().sends_for_subject("c1").unwrap()[0];
            let next = row.next_attempt_at.unwrap();
            gaps.push((next - row.last_attempt_at.unwrap()).num_seconds());
            // Not due again before its retry time.
            assert_eq!(engine.sweep(next - chrono::Duration::seconds(1)).await.unwrap().due, 0);
            tick = next;
        }
        assert_eq!(gaps, vec![60, 300, 1800, 7200]);

        let report = engine.sweep(tick).await.unwrap();
        assert_eq!(report.failed, 1);
        let row = &engine.db().sends_for_subject("c1").unwrap()[0];
        assert_eq!(row.status, SendStatus::Failed);
        assert_eq!(row.attempt_count, 5);
        assert_eq!(email.calls(), 5);

        let event = feed.recv().await.unwrap();
        assert_eq!(event.kind, FailureKind::RetriesExhausted);
        assert_eq!(event.attempt_count, 5);
        assert_eq!(engine.db().recent_failures(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_exact_gate_skips_after_advance() {
        let email = Arc::new(ScriptedTransport::new(Channel::Email));
        let engine = engine_with(email.clone());
        subject(&engine, "c1", FunnelStatus::PaymentPending).await;
        engine
            .catalog()
            .create_sequence(sequence(
                TriggerEvent::PaymentFailed,
                Some(FunnelStatus::PaymentPending),
                StatusGate::Exact,
                vec![step(1, Delay::hours(2), None)],
            ))
            .unwrap();
        let t0 = Utc::now();
        let report = engine
            .ingest(&DomainEvent::new(TriggerEvent::PaymentFailed, "c1", "p1", t0))
            .await
            .unwrap();
        assert_eq!(report.scheduled, 1);

        assert!(engine.propose_status("c1", FunnelStatus::PaymentCompleted).await.unwrap());
        let sweep = engine.sweep(t0 + chrono::Duration::hours(3)).await.unwrap();
        assert_eq!(sweep.skipped, 1);
        assert_eq!(email.calls(), 0);
        let row = &engine.db().sends_for_subject("c1").unwrap()[0];
        assert_eq!(row.skip_reason.as_deref(), Some("status_gate"));
    }

    #[tokio::test]
    async fn test_at_least_gate_sends_after_advance() {
        let email = Arc::new(ScriptedTransport::new(Channel::Email));
        let engine = engine_with(email.clone());
        subject(&engine, "c1", FunnelStatus::DocumentsUploaded).await;
        engine
            .catalog()
            .create_sequence(sequence(
                TriggerEvent::DocumentUploaded,
                Some(FunnelStatus::DocumentsUploaded),
                StatusGate::AtLeast,
                vec![step(1, Delay::hours(1), None)],
            ))
            .unwrap();
        let t0 = Utc::now();
        engine
            .ingest(&DomainEvent::new(TriggerEvent::DocumentUploaded, "c1", "d1", t0))
            .await
            .unwrap();
        engine.propose_status("c1", FunnelStatus::SummaryViewed).await.unwrap();

        let sweep = engine.sweep(t0 + chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(sweep.delivered, 1);
        assert_eq!(email.calls(), 1);
    }

    #[tokio::test]
    async fn test_gate_blocks_enrollment() {
        let engine = engine_with(Arc::new(ScriptedTransport::new(Channel::Email)));
        subject(&engine, "c1", FunnelStatus::Started).await;
        engine
            .catalog()
            .create_sequence(sequence(
                TriggerEvent::PaymentFailed,
                Some(FunnelStatus::PaymentPending),
                StatusGate::Exact,
                vec![step(1, Delay::zero(), None)],
            ))
            .unwrap();
        let report = engine
            .ingest(&DomainEvent::new(TriggerEvent::PaymentFailed, "c1", "p1", Utc::now()))
            .await
            .unwrap();
        assert!(report.matched.is_empty());
        assert_eq!(report.scheduled, 0);
    }

    #[tokio::test]
    async fn test_deactivation_and_deletion_skip_pending() {
        let email = Arc::new(ScriptedTransport::new(Channel::Email));
        let engine = engine_with(email.clone());
        subject(&engine, "c1", FunnelStatus::Started).await;
        let a = engine
            .catalog()
            .create_sequence(sequence(
                TriggerEvent::CartAbandoned,
                None,
                StatusGate::Exact,
                vec![step(1, Delay::hours(1), None)],
            ))
            .unwrap();
        let b = engine
            .catalog()
            .create_sequence(sequence(
                TriggerEvent::CartAbandoned,
                None,
                StatusGate::Exact,
                vec![step(1, Delay::hours(1), None)],
            ))
            .unwrap();
        let t0 = Utc::now();
        let report = engine
            .ingest(&DomainEvent::new(TriggerEvent::CartAbandoned, "c1", "cart", t0))
            .await
            .unwrap();
        assert_eq!(report.scheduled, 2);

        engine.catalog().set_active(&a.id, false).unwrap();
        assert_eq!(engine.catalog().delete_sequence(&b.id).unwrap(), 1);

        let sweep = engine.sweep(t0 + chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(sweep.due, 1);
        assert_eq!(sweep.skipped, 1);
        assert_eq!(email.calls(), 0);

        let mut reasons: Vec<String> = engine
            .db()
            .sends_for_subject("c1")
            .unwrap()
            .into_iter()
            .filter_map(|s| s.skip_reason)
            .collect();
        reasons.sort();
        assert_eq!(reasons, vec!["sequence_deleted", "sequence_inactive"]);
    }

    #[tokio::test]
    async fn test_unsubscribed_subject_is_skipped() {
        let email = Arc::new(ScriptedTransport::new(Channel::Email));
        let engine = engine_with(email.clone());
        subject(&engine, "c1", FunnelStatus::Started).await;
        engine
            .catalog()
            .create_sequence(sequence(
                TriggerEvent::CartAbandoned,
                None,
                StatusGate::Exact,
                vec![step(1, Delay::zero(), None)],
            ))
            .unwrap();
        let t0 = Utc::now();
        engine
            .ingest(&DomainEvent::new(TriggerEvent::CartAbandoned, "c1", "cart", t0))
            .await
            .unwrap();
        engine.db().set_unsubscribed("c1", true).unwrap();

        let sweep = engine.sweep(t0).await.unwrap();
        assert_eq!(sweep.skipped, 1);
        assert_eq!(email.calls(), 0);
    }

    #[tokio::test]
    async fn test_preview_reports_unresolved() {
        let engine = engine_with(Arc::new(ScriptedTransport::new(Channel::Email)));
        let seq = engine
            .catalog()
            .create_sequence(sequence(
                TriggerEvent::CartAbandoned,
                None,
                StatusGate::Exact,
                vec![step(1, Delay::zero(), None)],
            ))
            .unwrap();
        let preview = engine
            .preview(&seq.steps[0].id, None, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(preview.unresolved, vec!["first_name".to_string()]);

        let vars = HashMap::from([("first_name".to_string(), "Ana".to_string())]);
        let preview = engine.preview(&seq.steps[0].id, None, &vars).await.unwrap();
        assert_eq!(preview.subject.as_deref(), Some("Hi Ana"));
        assert!(preview.unresolved.is_empty());
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let engine = engine_with(Arc::new(ScriptedTransport::new(Channel::Email)));
        let (tx, rx) = watch::channel(false);
        let handle = engine.spawn_sweeper(rx);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
