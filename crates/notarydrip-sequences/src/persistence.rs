//! SQLite-backed persistence for sequences, scheduled sends, delivery records,
//! idempotency claims, subjects and the failure feed.
//!
//! One connection behind a mutex. The lock is only ever held for synchronous
//! statements, never across an await point.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use notarydrip_core::error::{DripError, Result};
use notarydrip_core::funnel::{FunnelStatus, StatusGate};
use notarydrip_core::traits::SubjectStore;
use notarydrip_core::types::{Channel, Subject, TriggerEvent};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::feed::{FailureEvent, FailureKind};
use crate::model::{
    Delay, DelayUnit, DeliveryRecord, ScheduledSend, SendStatus, SendWindow, Sequence,
    SequenceStats, Step,
};

/// Fixed-width UTC timestamps so text comparison orders correctly.
pub fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| bad_column(idx, format!("bad timestamp '{s}': {e}")))
}

fn parse_opt_ts(idx: usize, s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(idx, &s)).transpose()
}

/// Claims taken before this instant have lapsed.
fn lease_cutoff(now: DateTime<Utc>, lease: TimeDelta) -> DateTime<Utc> {
    now.checked_sub_signed(lease).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn db_err(ctx: &'static str) -> impl Fn(rusqlite::Error) -> DripError {
    move |e| DripError::Database(format!("{ctx}: {e}"))
}

fn bad_column(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::<dyn std::error::Error + Send + Sync>::from(msg),
    )
}

fn parse_channel(idx: usize, s: &str) -> rusqlite::Result<Channel> {
    Channel::parse(s).ok_or_else(|| bad_column(idx, format!("unknown channel '{s}'")))
}

/// What a successful delivery writes to the audit log.
#[derive(Debug, Clone)]
pub struct NewDeliveryRecord {
    pub recipient: String,
    pub channel: Channel,
    pub subject: Option<String>,
    pub content_hash: String,
    pub transport: String,
    pub transport_message_id: String,
}

/// SQLite-backed store for all engine data.
pub struct SequenceDb {
    conn: Mutex<Connection>,
}

const SEQUENCE_COLUMNS: &str =
    "id, name, active, channel, trigger_event, required_status, status_gate, created_at, updated_at";

const STEP_COLUMNS: &str = "id, sequence_id, order_index, delay_value, delay_unit, window_start, \
     window_end, channel, template_key, subject, body, active";

const SEND_COLUMNS: &str = "id, idempotency_key, subject_id, sequence_id, step_id, occurrence_id, \
     trigger_at, fire_at, next_attempt_at, status, skip_reason, attempt_count, last_attempt_at, \
     last_error, variables, created_at";

const DELIVERY_COLUMNS: &str = "id, scheduled_send_id, idempotency_key, recipient, channel, \
     subject, content_hash, transport, transport_message_id, delivered_at";

impl SequenceDb {
    /// Open or create the database file.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(db_err("DB open"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(db_err("WAL"))?;
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        tracing::info!("🗄️ Database opened: {}", path.display());
        Ok(db)
    }

    /// Fresh private database, for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("DB open"))?;
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| DripError::Database(format!("Lock poisoned: {e}")))
    }

    /// Create tables and indexes. Safe to run on every start.
    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(db_err("busy_timeout"))?;
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;

            -- Drip campaigns
            CREATE TABLE IF NOT EXISTS sequences (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                channel TEXT NOT NULL,              -- 'email', 'sms'
                trigger_event TEXT NOT NULL,
                required_status TEXT,
                status_gate TEXT NOT NULL DEFAULT 'exact',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sequences_trigger
                ON sequences(trigger_event, active);

            -- Steps, ordered within their sequence
            CREATE TABLE IF NOT EXISTS steps (
                id TEXT PRIMARY KEY,
                sequence_id TEXT NOT NULL,
                order_index INTEGER NOT NULL,
                delay_value INTEGER NOT NULL DEFAULT 0,
                delay_unit TEXT NOT NULL DEFAULT 'minutes',
                window_start INTEGER,
                window_end INTEGER,
                channel TEXT NOT NULL,
                template_key TEXT NOT NULL,
                subject TEXT,
                body TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                UNIQUE (sequence_id, order_index),
                FOREIGN KEY (sequence_id) REFERENCES sequences(id) ON DELETE CASCADE
            );

            -- Delivery obligations
            CREATE TABLE IF NOT EXISTS scheduled_sends (
                id TEXT PRIMARY KEY,
                idempotency_key TEXT NOT NULL UNIQUE,
                subject_id TEXT NOT NULL,
                sequence_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                occurrence_id TEXT NOT NULL,
                trigger_at TEXT NOT NULL,
                fire_at TEXT NOT NULL,
                next_attempt_at TEXT,
                status TEXT NOT NULL DEFAULT 'pending', -- pending, sent, skipped, failed
                skip_reason TEXT,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                last_attempt_at TEXT,
                last_error TEXT,
                variables TEXT NOT NULL DEFAULT '{}',   -- JSON object
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sends_due
                ON scheduled_sends(status, fire_at);
            CREATE INDEX IF NOT EXISTS idx_sends_sequence
                ON scheduled_sends(sequence_id, status);

            -- One row per idempotency key that a worker is sending or has sent
            CREATE TABLE IF NOT EXISTS send_claims (
                idempotency_key TEXT PRIMARY KEY,
                worker_id TEXT NOT NULL,
                claimed_at TEXT NOT NULL
            );

            -- Append-only delivery audit log
            CREATE TABLE IF NOT EXISTS delivery_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scheduled_send_id TEXT NOT NULL,
                idempotency_key TEXT NOT NULL UNIQUE,
                recipient TEXT NOT NULL,
                channel TEXT NOT NULL,
                subject TEXT,
                content_hash TEXT NOT NULL,
                transport TEXT NOT NULL,
                transport_message_id TEXT NOT NULL,
                delivered_at TEXT NOT NULL
            );

            -- Subjects targeted by campaigns
            CREATE TABLE IF NOT EXISTS subjects (
                id TEXT PRIMARY KEY,
                email TEXT,
                phone TEXT,
                funnel_status TEXT NOT NULL DEFAULT 'started',
                funnel_rank INTEGER NOT NULL DEFAULT 1,
                unsubscribed INTEGER NOT NULL DEFAULT 0,
                variables TEXT NOT NULL DEFAULT '{}',
                updated_at TEXT NOT NULL
            );

            -- Failure feed history
            CREATE TABLE IF NOT EXISTS failure_feed (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scheduled_send_id TEXT,
                subject_id TEXT NOT NULL,
                sequence_id TEXT NOT NULL,
                step_id TEXT,
                kind TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                detail TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            ",
        )
        .map_err(db_err("Migration"))?;
        Ok(())
    }

    // ─── Sequences ────────────────────────────────────────────

    fn sequence_from_row(row: &Row<'_>) -> rusqlite::Result<Sequence> {
        let trigger: String = row.get(4)?;
        let required: Option<String> = row.get(5)?;
        let gate: String = row.get(6)?;
        Ok(Sequence {
            id: row.get(0)?,
            name: row.get(1)?,
            active: row.get::<_, i64>(2)? != 0,
            channel: parse_channel(3, &row.get::<_, String>(3)?)?,
            trigger_event: TriggerEvent::parse(&trigger)
                .ok_or_else(|| bad_column(4, format!("unknown trigger '{trigger}'")))?,
            required_status: required.map(|s| FunnelStatus::parse(&s)),
            status_gate: StatusGate::parse(&gate),
            steps: Vec::new(),
            created_at: parse_ts(7, &row.get::<_, String>(7)?)?,
            updated_at: parse_ts(8, &row.get::<_, String>(8)?)?,
        })
    }

    fn step_from_row(row: &Row<'_>) -> rusqlite::Result<Step> {
        let unit: String = row.get(4)?;
        let start: Option<i64> = row.get(5)?;
        let end: Option<i64> = row.get(6)?;
        let window = match (start, end) {
            (Some(s), Some(e)) => Some(SendWindow::new(s as u8, e as u8)),
            _ => None,
        };
        Ok(Step {
            id: row.get(0)?,
            sequence_id: row.get(1)?,
            order_index: row.get::<_, i64>(2)? as u32,
            delay: Delay {
                value: row.get(3)?,
                unit: DelayUnit::parse(&unit)
                    .ok_or_else(|| bad_column(4, format!("unknown delay unit '{unit}'")))?,
            },
            window,
            channel: parse_channel(7, &row.get::<_, String>(7)?)?,
            template_key: row.get(8)?,
            subject: row.get(9)?,
            body: row.get(10)?,
            active: row.get::<_, i64>(11)? != 0,
        })
    }

    fn insert_step_on(conn: &Connection, step: &Step) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT INTO steps
             (id, sequence_id, order_index, delay_value, delay_unit, window_start, window_end,
              channel, template_key, subject, body, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                step.id,
                step.sequence_id,
                step.order_index as i64,
                step.delay.value,
                step.delay.unit.as_str(),
                step.window.map(|w| w.start_hour as i64),
                step.window.map(|w| w.end_hour as i64),
                step.channel.as_str(),
                step.template_key,
                step.subject,
                step.body,
                step.active as i64,
            ],
        )
    }

    fn load_steps(conn: &Connection, sequence_id: &str) -> Result<Vec<Step>> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {STEP_COLUMNS} FROM steps WHERE sequence_id = ?1 ORDER BY order_index"
            ))
            .map_err(db_err("Prepare steps"))?;
        let steps = stmt
            .query_map(params![sequence_id], Self::step_from_row)
            .map_err(db_err("Query steps"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read step"))?;
        Ok(steps)
    }

    fn load_sequences(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Sequence>> {
        let mut stmt = conn.prepare(sql).map_err(db_err("Prepare sequences"))?;
        let mut sequences = stmt
            .query_map(args, Self::sequence_from_row)
            .map_err(db_err("Query sequences"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read sequence"))?;
        for seq in &mut sequences {
            seq.steps = Self::load_steps(conn, &seq.id)?;
        }
        Ok(sequences)
    }

    /// Insert a sequence together with its steps.
    pub fn insert_sequence(&self, seq: &Sequence) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err("Begin"))?;
        tx.execute(
            "INSERT INTO sequences
             (id, name, active, channel, trigger_event, required_status, status_gate,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                seq.id,
                seq.name,
                seq.active as i64,
                seq.channel.as_str(),
                seq.trigger_event.as_str(),
                seq.required_status.map(|s| s.as_str()),
                seq.status_gate.as_str(),
                ts(&seq.created_at),
                ts(&seq.updated_at),
            ],
        )
        .map_err(db_err("Save sequence"))?;
        for step in &seq.steps {
            Self::insert_step_on(&tx, step).map_err(db_err("Save step"))?;
        }
        tx.commit().map_err(db_err("Commit"))?;
        Ok(())
    }

    /// Update a sequence's own fields (not its steps). Returns false if absent.
    pub fn update_sequence(&self, seq: &Sequence) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn
            .execute(
                "UPDATE sequences SET name = ?2, active = ?3, channel = ?4, trigger_event = ?5,
                 required_status = ?6, status_gate = ?7, updated_at = ?8 WHERE id = ?1",
                params![
                    seq.id,
                    seq.name,
                    seq.active as i64,
                    seq.channel.as_str(),
                    seq.trigger_event.as_str(),
                    seq.required_status.map(|s| s.as_str()),
                    seq.status_gate.as_str(),
                    ts(&seq.updated_at),
                ],
            )
            .map_err(db_err("Update sequence"))?;
        Ok(n > 0)
    }

    pub fn set_sequence_active(&self, id: &str, active: bool, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn
            .execute(
                "UPDATE sequences SET active = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, active as i64, ts(&now)],
            )
            .map_err(db_err("Toggle sequence"))?;
        Ok(n > 0)
    }

    /// Delete a sequence and its steps; its pending sends become skipped.
    /// Returns the number of sends skipped, or None if the sequence was absent.
    pub fn delete_sequence(&self, id: &str, now: DateTime<Utc>) -> Result<Option<usize>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err("Begin"))?;
        let skipped = tx
            .execute(
                "UPDATE scheduled_sends SET status = 'skipped', skip_reason = 'sequence_deleted',
                 last_attempt_at = ?2 WHERE sequence_id = ?1 AND status = 'pending'",
                params![id, ts(&now)],
            )
            .map_err(db_err("Skip sends"))?;
        tx.execute("DELETE FROM steps WHERE sequence_id = ?1", params![id])
            .map_err(db_err("Delete steps"))?;
        let n = tx
            .execute("DELETE FROM sequences WHERE id = ?1", params![id])
            .map_err(db_err("Delete sequence"))?;
        tx.commit().map_err(db_err("Commit"))?;
        Ok((n > 0).then_some(skipped))
    }

    pub fn get_sequence(&self, id: &str) -> Result<Option<Sequence>> {
        let conn = self.conn()?;
        let mut found = Self::load_sequences(
            &conn,
            &format!("SELECT {SEQUENCE_COLUMNS} FROM sequences WHERE id = ?1"),
            &[&id],
        )?;
        Ok(found.pop())
    }

    pub fn list_sequences(&self) -> Result<Vec<Sequence>> {
        let conn = self.conn()?;
        Self::load_sequences(
            &conn,
            &format!("SELECT {SEQUENCE_COLUMNS} FROM sequences ORDER BY created_at, name"),
            &[],
        )
    }

    /// Active sequences listening for `trigger`.
    pub fn active_sequences_for(&self, trigger: TriggerEvent) -> Result<Vec<Sequence>> {
        let conn = self.conn()?;
        Self::load_sequences(
            &conn,
            &format!(
                "SELECT {SEQUENCE_COLUMNS} FROM sequences
                 WHERE trigger_event = ?1 AND active = 1 ORDER BY created_at, name"
            ),
            &[&trigger.as_str()],
        )
    }

    // ─── Steps ────────────────────────────────────────────────

    pub fn insert_step(&self, step: &Step) -> Result<()> {
        let conn = self.conn()?;
        Self::insert_step_on(&conn, step).map_err(db_err("Save step"))?;
        Ok(())
    }

    pub fn update_step(&self, step: &Step) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn
            .execute(
                "UPDATE steps SET order_index = ?2, delay_value = ?3, delay_unit = ?4,
                 window_start = ?5, window_end = ?6, channel = ?7, template_key = ?8,
                 subject = ?9, body = ?10, active = ?11 WHERE id = ?1",
                params![
                    step.id,
                    step.order_index as i64,
                    step.delay.value,
                    step.delay.unit.as_str(),
                    step.window.map(|w| w.start_hour as i64),
                    step.window.map(|w| w.end_hour as i64),
                    step.channel.as_str(),
                    step.template_key,
                    step.subject,
                    step.body,
                    step.active as i64,
                ],
            )
            .map_err(db_err("Update step"))?;
        Ok(n > 0)
    }

    pub fn set_step_active(&self, id: &str, active: bool) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn
            .execute(
                "UPDATE steps SET active = ?2 WHERE id = ?1",
                params![id, active as i64],
            )
            .map_err(db_err("Toggle step"))?;
        Ok(n > 0)
    }

    /// Delete a step; its pending sends become skipped.
    pub fn delete_step(&self, id: &str, now: DateTime<Utc>) -> Result<Option<usize>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err("Begin"))?;
        let skipped = tx
            .execute(
                "UPDATE scheduled_sends SET status = 'skipped', skip_reason = 'step_deleted',
                 last_attempt_at = ?2 WHERE step_id = ?1 AND status = 'pending'",
                params![id, ts(&now)],
            )
            .map_err(db_err("Skip sends"))?;
        let n = tx
            .execute("DELETE FROM steps WHERE id = ?1", params![id])
            .map_err(db_err("Delete step"))?;
        tx.commit().map_err(db_err("Commit"))?;
        Ok((n > 0).then_some(skipped))
    }

    pub fn get_step(&self, id: &str) -> Result<Option<Step>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {STEP_COLUMNS} FROM steps WHERE id = ?1"),
            params![id],
            Self::step_from_row,
        )
        .optional()
        .map_err(db_err("Load step"))
    }

    // ─── Scheduled sends ──────────────────────────────────────

    fn send_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduledSend> {
        let vars: String = row.get(14)?;
        Ok(ScheduledSend {
            id: row.get(0)?,
            idempotency_key: row.get(1)?,
            subject_id: row.get(2)?,
            sequence_id: row.get(3)?,
            step_id: row.get(4)?,
            occurrence_id: row.get(5)?,
            trigger_at: parse_ts(6, &row.get::<_, String>(6)?)?,
            fire_at: parse_ts(7, &row.get::<_, String>(7)?)?,
            next_attempt_at: parse_opt_ts(8, row.get(8)?)?,
            status: SendStatus::parse(&row.get::<_, String>(9)?),
            skip_reason: row.get(10)?,
            attempt_count: row.get::<_, i64>(11)? as u32,
            last_attempt_at: parse_opt_ts(12, row.get(12)?)?,
            last_error: row.get(13)?,
            variables: serde_json::from_str(&vars).unwrap_or_default(),
            created_at: parse_ts(15, &row.get::<_, String>(15)?)?,
        })
    }

    /// Insert unless a send with the same idempotency key exists.
    /// Returns whether a row was created.
    pub fn insert_scheduled_send(&self, send: &ScheduledSend) -> Result<bool> {
        let vars = serde_json::to_string(&send.variables)?;
        let conn = self.conn()?;
        let n = conn
            .execute(
                "INSERT INTO scheduled_sends
                 (id, idempotency_key, subject_id, sequence_id, step_id, occurrence_id, trigger_at,
                  fire_at, next_attempt_at, status, skip_reason, attempt_count, last_attempt_at,
                  last_error, variables, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                 ON CONFLICT(idempotency_key) DO NOTHING",
                params![
                    send.id,
                    send.idempotency_key,
                    send.subject_id,
                    send.sequence_id,
                    send.step_id,
                    send.occurrence_id,
                    ts(&send.trigger_at),
                    ts(&send.fire_at),
                    send.next_attempt_at.as_ref().map(ts),
                    send.status.as_str(),
                    send.skip_reason,
                    send.attempt_count as i64,
                    send.last_attempt_at.as_ref().map(ts),
                    send.last_error,
                    vars,
                    ts(&send.created_at),
                ],
            )
            .map_err(db_err("Save scheduled send"))?;
        Ok(n > 0)
    }

    pub fn get_scheduled_send(&self, id: &str) -> Result<Option<ScheduledSend>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {SEND_COLUMNS} FROM scheduled_sends WHERE id = ?1"),
            params![id],
            Self::send_from_row,
        )
        .optional()
        .map_err(db_err("Load scheduled send"))
    }

    /// Pending sends due at `now`, oldest first. Rows whose key is under a
    /// live claim (younger than `lease`) are left out so in-flight sends do
    /// not take up the batch.
    pub fn due_sends(
        &self,
        now: DateTime<Utc>,
        lease: TimeDelta,
        limit: usize,
    ) -> Result<Vec<ScheduledSend>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SEND_COLUMNS} FROM scheduled_sends
                 WHERE status = 'pending' AND COALESCE(next_attempt_at, fire_at) <= ?1
                   AND NOT EXISTS (
                       SELECT 1 FROM send_claims c
                       WHERE c.idempotency_key = scheduled_sends.idempotency_key
                         AND c.claimed_at >= ?2
                   )
                 ORDER BY COALESCE(next_attempt_at, fire_at), created_at
                 LIMIT ?3"
            ))
            .map_err(db_err("Prepare due"))?;
        let rows = stmt
            .query_map(
                params![ts(&now), ts(&lease_cutoff(now, lease)), limit as i64],
                Self::send_from_row,
            )
            .map_err(db_err("Query due"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read send"))?;
        Ok(rows)
    }

    /// Every send for a subject, newest first.
    pub fn sends_for_subject(&self, subject_id: &str) -> Result<Vec<ScheduledSend>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SEND_COLUMNS} FROM scheduled_sends
                 WHERE subject_id = ?1 ORDER BY fire_at DESC"
            ))
            .map_err(db_err("Prepare sends"))?;
        let rows = stmt
            .query_map(params![subject_id], Self::send_from_row)
            .map_err(db_err("Query sends"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read send"))?;
        Ok(rows)
    }

    /// Pending → skipped. No-op (false) if the row already left `pending`.
    pub fn mark_skipped(&self, id: &str, reason: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn
            .execute(
                "UPDATE scheduled_sends SET status = 'skipped', skip_reason = ?2,
                 last_attempt_at = ?3 WHERE id = ?1 AND status = 'pending'",
                params![id, reason, ts(&now)],
            )
            .map_err(db_err("Skip send"))?;
        Ok(n > 0)
    }

    /// Record a transient failure and when to try again.
    pub fn record_retry(
        &self,
        id: &str,
        attempt_count: u32,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE scheduled_sends SET attempt_count = ?2, last_error = ?3,
             next_attempt_at = ?4, last_attempt_at = ?5 WHERE id = ?1 AND status = 'pending'",
            params![id, attempt_count as i64, error, ts(&next_attempt_at), ts(&now)],
        )
        .map_err(db_err("Record retry"))?;
        Ok(())
    }

    /// Pending → failed.
    pub fn mark_failed(
        &self,
        id: &str,
        attempt_count: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn
            .execute(
                "UPDATE scheduled_sends SET status = 'failed', attempt_count = ?2, last_error = ?3,
                 next_attempt_at = NULL, last_attempt_at = ?4
                 WHERE id = ?1 AND status = 'pending'",
                params![id, attempt_count as i64, error, ts(&now)],
            )
            .map_err(db_err("Fail send"))?;
        Ok(n > 0)
    }

    /// Write the delivery record and mark the send `sent`, atomically.
    pub fn complete_delivery(
        &self,
        send: &ScheduledSend,
        attempt_count: u32,
        record: &NewDeliveryRecord,
        now: DateTime<Utc>,
    ) -> Result<DeliveryRecord> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err("Begin"))?;
        tx.execute(
            "INSERT INTO delivery_records
             (scheduled_send_id, idempotency_key, recipient, channel, subject, content_hash,
              transport, transport_message_id, delivered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                send.id,
                send.idempotency_key,
                record.recipient,
                record.channel.as_str(),
                record.subject,
                record.content_hash,
                record.transport,
                record.transport_message_id,
                ts(&now),
            ],
        )
        .map_err(db_err("Save delivery record"))?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE scheduled_sends SET status = 'sent', attempt_count = ?2, last_error = NULL,
             next_attempt_at = NULL, last_attempt_at = ?3 WHERE id = ?1",
            params![send.id, attempt_count as i64, ts(&now)],
        )
        .map_err(db_err("Mark sent"))?;
        tx.commit().map_err(db_err("Commit"))?;

        Ok(DeliveryRecord {
            id,
            scheduled_send_id: send.id.clone(),
            idempotency_key: send.idempotency_key.clone(),
            recipient: record.recipient.clone(),
            channel: record.channel,
            subject: record.subject.clone(),
            content_hash: record.content_hash.clone(),
            transport: record.transport.clone(),
            transport_message_id: record.transport_message_id.clone(),
            delivered_at: now,
        })
    }

    // ─── Idempotency claims ───────────────────────────────────

    /// Atomically claim a key. Exactly one caller per key gets `true`.
    ///
    /// A claim older than `lease` whose send is still pending belonged to a
    /// worker that never recorded an outcome; it is taken over in the same
    /// statement. Claims on sent, failed or skipped rows are permanent.
    pub fn try_claim(
        &self,
        key: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: TimeDelta,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn
            .execute(
                "INSERT INTO send_claims (idempotency_key, worker_id, claimed_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(idempotency_key) DO UPDATE
                   SET worker_id = excluded.worker_id, claimed_at = excluded.claimed_at
                   WHERE send_claims.claimed_at < ?4
                     AND EXISTS (
                         SELECT 1 FROM scheduled_sends s
                         WHERE s.idempotency_key = send_claims.idempotency_key
                           AND s.status = 'pending'
                     )",
                params![key, worker_id, ts(&now), ts(&lease_cutoff(now, lease))],
            )
            .map_err(db_err("Claim"))?;
        Ok(n > 0)
    }

    /// Who holds a key, and since when.
    pub fn claim_holder(&self, key: &str) -> Result<Option<(String, DateTime<Utc>)>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT worker_id, claimed_at FROM send_claims WHERE idempotency_key = ?1",
            params![key],
            |row| Ok((row.get::<_, String>(0)?, parse_ts(1, &row.get::<_, String>(1)?)?)),
        )
        .optional()
        .map_err(db_err("Load claim"))
    }

    pub fn release_claim(&self, key: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM send_claims WHERE idempotency_key = ?1",
            params![key],
        )
        .map_err(db_err("Release claim"))?;
        Ok(())
    }

    // ─── Delivery records ─────────────────────────────────────

    fn delivery_from_row(row: &Row<'_>) -> rusqlite::Result<DeliveryRecord> {
        Ok(DeliveryRecord {
            id: row.get(0)?,
            scheduled_send_id: row.get(1)?,
            idempotency_key: row.get(2)?,
            recipient: row.get(3)?,
            channel: parse_channel(4, &row.get::<_, String>(4)?)?,
            subject: row.get(5)?,
            content_hash: row.get(6)?,
            transport: row.get(7)?,
            transport_message_id: row.get(8)?,
            delivered_at: parse_ts(9, &row.get::<_, String>(9)?)?,
        })
    }

    /// Most recent deliveries first.
    pub fn delivery_records(&self, limit: usize) -> Result<Vec<DeliveryRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {DELIVERY_COLUMNS} FROM delivery_records ORDER BY id DESC LIMIT ?1"
            ))
            .map_err(db_err("Prepare deliveries"))?;
        let rows = stmt
            .query_map(params![limit as i64], Self::delivery_from_row)
            .map_err(db_err("Query deliveries"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read delivery"))?;
        Ok(rows)
    }

    pub fn delivery_count_for_key(&self, key: &str) -> Result<u64> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT COUNT(*) FROM delivery_records WHERE idempotency_key = ?1",
            params![key],
            |r| r.get::<_, i64>(0),
        )
        .map(|n| n as u64)
        .map_err(db_err("Count deliveries"))
    }

    // ─── Stats ────────────────────────────────────────────────

    /// Send counts by status for one sequence.
    pub fn sequence_stats(&self, sequence_id: &str) -> Result<SequenceStats> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT status, COUNT(*) FROM scheduled_sends
                 WHERE sequence_id = ?1 GROUP BY status",
            )
            .map_err(db_err("Prepare stats"))?;
        let rows = stmt
            .query_map(params![sequence_id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
            })
            .map_err(db_err("Query stats"))?;

        let mut stats = SequenceStats {
            sequence_id: sequence_id.to_string(),
            ..Default::default()
        };
        for row in rows {
            let (status, count) = row.map_err(db_err("Read stats"))?;
            let count = count as u64;
            match SendStatus::parse(&status) {
                SendStatus::Pending => stats.pending += count,
                SendStatus::Sent => stats.sent += count,
                SendStatus::Skipped => stats.skipped += count,
                SendStatus::Failed => stats.failed += count,
            }
        }
        Ok(stats)
    }

    // ─── Failure feed ─────────────────────────────────────────

    pub fn insert_failure(&self, event: &FailureEvent) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO failure_feed
             (scheduled_send_id, subject_id, sequence_id, step_id, kind, attempt_count, detail,
              created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.scheduled_send_id,
                event.subject_id,
                event.sequence_id,
                event.step_id,
                event.kind.as_str(),
                event.attempt_count as i64,
                event.detail,
                ts(&event.timestamp),
            ],
        )
        .map_err(db_err("Save failure"))?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent failures first.
    pub fn recent_failures(&self, limit: usize) -> Result<Vec<FailureEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT scheduled_send_id, subject_id, sequence_id, step_id, kind, attempt_count,
                 detail, created_at FROM failure_feed ORDER BY id DESC LIMIT ?1",
            )
            .map_err(db_err("Prepare failures"))?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(FailureEvent {
                    scheduled_send_id: row.get(0)?,
                    subject_id: row.get(1)?,
                    sequence_id: row.get(2)?,
                    step_id: row.get(3)?,
                    kind: FailureKind::parse(&row.get::<_, String>(4)?),
                    attempt_count: row.get::<_, i64>(5)? as u32,
                    detail: row.get(6)?,
                    timestamp: parse_ts(7, &row.get::<_, String>(7)?)?,
                })
            })
            .map_err(db_err("Query failures"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read failure"))?;
        Ok(rows)
    }

    // ─── Subjects ─────────────────────────────────────────────

    pub fn get_subject(&self, id: &str) -> Result<Option<Subject>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, email, phone, funnel_status, unsubscribed, variables
             FROM subjects WHERE id = ?1",
            params![id],
            |row| {
                let vars: String = row.get(5)?;
                Ok(Subject {
                    id: row.get(0)?,
                    email: row.get(1)?,
                    phone: row.get(2)?,
                    funnel_status: FunnelStatus::parse(&row.get::<_, String>(3)?),
                    unsubscribed: row.get::<_, i64>(4)? != 0,
                    variables: serde_json::from_str::<HashMap<String, String>>(&vars)
                        .unwrap_or_default(),
                })
            },
        )
        .optional()
        .map_err(db_err("Load subject"))
    }

    /// Create or update a subject. An existing funnel status is only ever
    /// advanced, never lowered.
    pub fn upsert_subject(&self, subject: &Subject) -> Result<()> {
        let vars = serde_json::to_string(&subject.variables)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO subjects
             (id, email, phone, funnel_status, funnel_rank, unsubscribed, variables, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                email = excluded.email,
                phone = excluded.phone,
                unsubscribed = excluded.unsubscribed,
                variables = excluded.variables,
                updated_at = excluded.updated_at,
                funnel_status = CASE WHEN excluded.funnel_rank > subjects.funnel_rank
                                     THEN excluded.funnel_status
                                     ELSE subjects.funnel_status END,
                funnel_rank = MAX(excluded.funnel_rank, subjects.funnel_rank)",
            params![
                subject.id,
                subject.email,
                subject.phone,
                subject.funnel_status.as_str(),
                subject.funnel_status.order() as i64,
                subject.unsubscribed as i64,
                vars,
                ts(&Utc::now()),
            ],
        )
        .map_err(db_err("Save subject"))?;
        Ok(())
    }

    /// Advance a subject's funnel status with one conditional UPDATE.
    /// Returns whether it changed. Unknown subjects are `NotFound`.
    pub fn propose_subject_status(&self, id: &str, proposed: FunnelStatus) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn
            .execute(
                "UPDATE subjects SET funnel_status = ?2, funnel_rank = ?3, updated_at = ?4
                 WHERE id = ?1 AND funnel_rank < ?3",
                params![id, proposed.as_str(), proposed.order() as i64, ts(&Utc::now())],
            )
            .map_err(db_err("Advance status"))?;
        if n > 0 {
            return Ok(true);
        }
        let exists = conn
            .query_row("SELECT 1 FROM subjects WHERE id = ?1", params![id], |_| Ok(()))
            .optional()
            .map_err(db_err("Load subject"))?
            .is_some();
        if exists {
            Ok(false)
        } else {
            Err(DripError::NotFound(format!("subject '{id}'")))
        }
    }

    pub fn set_unsubscribed(&self, id: &str, unsubscribed: bool) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn
            .execute(
                "UPDATE subjects SET unsubscribed = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, unsubscribed as i64, ts(&Utc::now())],
            )
            .map_err(db_err("Unsubscribe"))?;
        Ok(n > 0)
    }
}

#[async_trait]
impl SubjectStore for SequenceDb {
    async fn get(&self, subject_id: &str) -> Result<Option<Subject>> {
        self.get_subject(subject_id)
    }

    async fn propose_status(&self, subject_id: &str, proposed: FunnelStatus) -> Result<bool> {
        self.propose_subject_status(subject_id, proposed)
    }

    async fn upsert(&self, subject: &Subject) -> Result<()> {
        self.upsert_subject(subject)
    }
}
