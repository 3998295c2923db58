//! API route handlers for the gateway.
//!
//! Every handler answers `{"ok": true, ...}` or `{"ok": false, "error": ...}`.
//! Validation failures name the first rule that was broken.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use chrono::Utc;
use notarydrip_core::error::DripError;
use notarydrip_core::funnel::FunnelStatus;
use notarydrip_core::types::{DomainEvent, Subject};
use notarydrip_sequences::{NewSequence, NewStep, SequenceUpdate};
use serde_json::{Value, json};

use crate::server::AppState;

fn fail(e: impl std::fmt::Display) -> Json<Value> {
    Json(json!({"ok": false, "error": e.to_string()}))
}

fn fail_drip(e: DripError) -> Json<Value> {
    let kind = match &e {
        DripError::Validation(_) => "validation",
        DripError::NotFound(_) => "not_found",
        _ => "internal",
    };
    Json(json!({"ok": false, "error": e.to_string(), "kind": kind}))
}

fn parse<T: serde::de::DeserializeOwned>(body: Value) -> Result<T, Json<Value>> {
    serde_json::from_value(body).map_err(|e| fail(format!("Invalid request body: {e}")))
}

/// Liveness check (public).
pub async fn health_check() -> Json<Value> {
    Json(json!({"status": "ok", "time": Utc::now().to_rfc3339()}))
}

/// Engine info.
pub async fn system_info(State(state): State<Arc<AppState>>) -> Json<Value> {
    let settings = state.engine.settings();
    Json(json!({
        "name": "NotaryDrip",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "worker_id": settings.worker_id,
        "reference_timezone": settings.timezone.name(),
        "sweep_interval_secs": settings.sweep_interval.as_secs(),
        "max_attempts": settings.retry.max_attempts(),
    }))
}

// ─── Sequences ────────────────────────────────────────────────

pub async fn list_sequences(State(state): State<Arc<AppState>>) -> Json<Value> {
    match state.engine.catalog().list() {
        Ok(sequences) => Json(json!({"ok": true, "sequences": sequences})),
        Err(e) => fail_drip(e),
    }
}

pub async fn create_sequence(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let new: NewSequence = match parse(body) {
        Ok(n) => n,
        Err(e) => return e,
    };
    match state.engine.catalog().create_sequence(new) {
        Ok(seq) => Json(json!({"ok": true, "sequence": seq})),
        Err(e) => fail_drip(e),
    }
}

pub async fn get_sequence(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<Value> {
    match state.engine.catalog().get(&id) {
        Ok(seq) => Json(json!({"ok": true, "sequence": seq})),
        Err(e) => fail_drip(e),
    }
}

pub async fn update_sequence(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let update: SequenceUpdate = match parse(body) {
        Ok(u) => u,
        Err(e) => return e,
    };
    match state.engine.catalog().update_sequence(&id, update) {
        Ok(seq) => Json(json!({"ok": true, "sequence": seq})),
        Err(e) => fail_drip(e),
    }
}

pub async fn delete_sequence(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<Value> {
    match state.engine.catalog().delete_sequence(&id) {
        Ok(skipped) => Json(json!({"ok": true, "skipped_sends": skipped})),
        Err(e) => fail_drip(e),
    }
}

pub async fn set_sequence_active(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let Some(active) = body["active"].as_bool() else {
        return fail("Missing boolean field 'active'");
    };
    match state.engine.catalog().set_active(&id, active) {
        Ok(()) => Json(json!({"ok": true, "active": active})),
        Err(e) => fail_drip(e),
    }
}

pub async fn sequence_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<Value> {
    match state.engine.catalog().stats(&id) {
        Ok(stats) => Json(json!({"ok": true, "stats": stats})),
        Err(e) => fail_drip(e),
    }
}

pub async fn all_stats(State(state): State<Arc<AppState>>) -> Json<Value> {
    match state.engine.catalog().all_stats() {
        Ok(rows) => {
            let stats: Vec<Value> = rows
                .into_iter()
                .map(|(seq, stats)| {
                    json!({
                        "sequence_id": seq.id,
                        "name": seq.name,
                        "active": seq.active,
                        "pending": stats.pending,
                        "sent": stats.sent,
                        "skipped": stats.skipped,
                        "failed": stats.failed,
                    })
                })
                .collect();
            Json(json!({"ok": true, "stats": stats}))
        }
        Err(e) => fail_drip(e),
    }
}

// ─── Steps ────────────────────────────────────────────────────

pub async fn add_step(
    State(state): State<Arc<AppState>>,
    Path(sequence_id): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let new: NewStep = match parse(body) {
        Ok(n) => n,
        Err(e) => return e,
    };
    match state.engine.catalog().add_step(&sequence_id, new) {
        Ok(step) => Json(json!({"ok": true, "step": step})),
        Err(e) => fail_drip(e),
    }
}

pub async fn update_step(
    State(state): State<Arc<AppState>>,
    Path(step_id): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let new: NewStep = match parse(body) {
        Ok(n) => n,
        Err(e) => return e,
    };
    match state.engine.catalog().update_step(&step_id, new) {
        Ok(step) => Json(json!({"ok": true, "step": step})),
        Err(e) => fail_drip(e),
    }
}

pub async fn delete_step(
    State(state): State<Arc<AppState>>,
    Path(step_id): Path<String>,
) -> Json<Value> {
    match state.engine.catalog().delete_step(&step_id) {
        Ok(skipped) => Json(json!({"ok": true, "skipped_sends": skipped})),
        Err(e) => fail_drip(e),
    }
}

pub async fn set_step_active(
    State(state): State<Arc<AppState>>,
    Path(step_id): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let Some(active) = body["active"].as_bool() else {
        return fail("Missing boolean field 'active'");
    };
    match state.engine.catalog().set_step_active(&step_id, active) {
        Ok(()) => Json(json!({"ok": true, "active": active})),
        Err(e) => fail_drip(e),
    }
}

/// Render a step against a subject and/or ad-hoc variables.
pub async fn preview_step(
    State(state): State<Arc<AppState>>,
    Path(step_id): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let subject_id = body["subject_id"].as_str();
    let vars: HashMap<String, String> = match body.get("variables") {
        Some(v) if !v.is_null() => match serde_json::from_value(v.clone()) {
            Ok(vars) => vars,
            Err(e) => return fail(format!("Invalid variables: {e}")),
        },
        _ => HashMap::new(),
    };
    match state.engine.preview(&step_id, subject_id, &vars).await {
        Ok(preview) => Json(json!({"ok": true, "preview": preview})),
        Err(e) => fail_drip(e),
    }
}

// ─── Intake ───────────────────────────────────────────────────

/// Domain-event intake. Notification problems are reported in the body and
/// never surface as HTTP errors to the upstream caller.
pub async fn ingest_event(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let event: DomainEvent = match parse(body) {
        Ok(e) => e,
        Err(e) => return e,
    };
    match state.engine.ingest(&event).await {
        Ok(report) => Json(json!({"ok": report.errors.is_empty(), "report": report})),
        Err(e) => {
            tracing::error!("❌ Event intake failed for {}: {e}", event.subject_id);
            fail_drip(e)
        }
    }
}

pub async fn upsert_subject(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let subject: Subject = match parse(body) {
        Ok(s) => s,
        Err(e) => return e,
    };
    if subject.id.trim().is_empty() {
        return fail("Subject id must not be empty");
    }
    match state.engine.upsert_subject(&subject).await {
        Ok(()) => Json(json!({"ok": true, "id": subject.id})),
        Err(e) => fail_drip(e),
    }
}

pub async fn get_subject(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<Value> {
    match state.engine.subjects().get(&id).await {
        Ok(Some(subject)) => {
            let sends = state.engine.db().sends_for_subject(&id).unwrap_or_default();
            Json(json!({"ok": true, "subject": subject, "sends": sends}))
        }
        Ok(None) => fail(format!("Not found: subject '{id}'")),
        Err(e) => fail_drip(e),
    }
}

/// Guarded funnel-status write. Proposing a status that is not an advance is
/// a no-op, reported as `changed: false`.
pub async fn propose_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let Some(raw) = body["status"].as_str() else {
        return fail("Missing field 'status'");
    };
    let status = FunnelStatus::parse(raw);
    if status == FunnelStatus::Unknown {
        return fail(format!("Unknown funnel status '{raw}'"));
    }
    match state.engine.propose_status(&id, status).await {
        Ok(changed) => Json(json!({"ok": true, "changed": changed})),
        Err(e) => fail_drip(e),
    }
}

// ─── Operations ───────────────────────────────────────────────

pub async fn list_failures(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let limit = params
        .get("limit")
        .and_then(|l| l.parse::<usize>().ok())
        .unwrap_or(50)
        .min(500);
    match state.engine.db().recent_failures(limit) {
        Ok(failures) => Json(json!({"ok": true, "failures": failures})),
        Err(e) => fail_drip(e),
    }
}

/// Run one sweep right now.
pub async fn trigger_sweep(State(state): State<Arc<AppState>>) -> Json<Value> {
    match state.engine.sweep(Utc::now()).await {
        Ok(report) => Json(json!({"ok": true, "report": report})),
        Err(e) => fail_drip(e),
    }
}
