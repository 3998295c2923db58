//! HTTP server implementation using Axum.

use axum::{
    Router,
    extract::State,
    response::IntoResponse,
    routing::{get, post},
};
use notarydrip_core::config::GatewayConfig;
use notarydrip_sequences::NotificationEngine;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::routes;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub engine: NotificationEngine,
    pub gateway_config: GatewayConfig,
    pub start_time: std::time::Instant,
    /// Bearer token for `/api/*`. None leaves the API open.
    pub api_token: Option<String>,
}

impl AppState {
    pub fn new(engine: NotificationEngine, gateway_config: GatewayConfig) -> Self {
        let api_token = gateway_config
            .api_token
            .clone()
            .filter(|t| !t.trim().is_empty());
        Self {
            engine,
            gateway_config,
            start_time: std::time::Instant::now(),
            api_token,
        }
    }
}

/// Compare two tokens in time that depends only on their lengths, not on
/// where they first differ.
fn tokens_match(given: &str, expected: &str) -> bool {
    let (given, expected) = (given.as_bytes(), expected.as_bytes());
    let mut diff = given.len() ^ expected.len();
    for (i, &e) in expected.iter().enumerate() {
        let g = given.get(i).copied().unwrap_or(0);
        diff |= usize::from(g ^ e);
    }
    std::hint::black_box(diff) == 0
}

/// Bearer-token middleware. Accepts `Authorization: Bearer <token>` or
/// `X-Api-Token: <token>`. Both candidates are always checked with
/// `tokens_match`.
async fn require_token(
    State(state): State<Arc<AppState>>,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let Some(expected) = &state.api_token else {
        return next.run(req).await;
    };

    let headers = req.headers();
    let bearer = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    let direct = headers.get("X-Api-Token").and_then(|v| v.to_str().ok());
    let bearer_ok = tokens_match(bearer.unwrap_or_default(), expected);
    let direct_ok = tokens_match(direct.unwrap_or_default(), expected);
    if bearer_ok | direct_ok {
        return next.run(req).await;
    }

    tracing::warn!("🔒 Rejected {} {}: missing or invalid token", req.method(), req.uri().path());
    (
        axum::http::StatusCode::UNAUTHORIZED,
        axum::Json(serde_json::json!({"ok": false, "error": "Unauthorized: invalid or missing API token"})),
    )
        .into_response()
}

/// Build the router with all routes.
pub fn build_router(state: AppState) -> Router {
    build_router_from_arc(Arc::new(state))
}

pub fn build_router_from_arc(shared: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/api/v1/info", get(routes::system_info))
        // Sequence catalog
        .route(
            "/api/v1/sequences",
            get(routes::list_sequences).post(routes::create_sequence),
        )
        .route(
            "/api/v1/sequences/{id}",
            get(routes::get_sequence)
                .put(routes::update_sequence)
                .delete(routes::delete_sequence),
        )
        .route("/api/v1/sequences/{id}/active", post(routes::set_sequence_active))
        .route("/api/v1/sequences/{id}/stats", get(routes::sequence_stats))
        .route("/api/v1/sequences/{id}/steps", post(routes::add_step))
        // Steps
        .route(
            "/api/v1/steps/{id}",
            axum::routing::put(routes::update_step).delete(routes::delete_step),
        )
        .route("/api/v1/steps/{id}/active", post(routes::set_step_active))
        .route("/api/v1/steps/{id}/preview", post(routes::preview_step))
        // Intake
        .route("/api/v1/events", post(routes::ingest_event))
        .route("/api/v1/subjects", post(routes::upsert_subject))
        .route("/api/v1/subjects/{id}", get(routes::get_subject))
        .route("/api/v1/subjects/{id}/status", post(routes::propose_status))
        // Operations
        .route("/api/v1/stats", get(routes::all_stats))
        .route("/api/v1/failures", get(routes::list_failures))
        .route("/api/v1/sweep", post(routes::trigger_sweep))
        .route_layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_token,
        ));

    // Public routes, no auth
    let public = Router::new().route("/health", get(routes::health_check));

    protected
        .merge(public)
        .layer({
            let cors = CorsLayer::new()
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::PUT,
                    axum::http::Method::DELETE,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers(Any)
                .max_age(std::time::Duration::from_secs(3600));

            // Example: NOTARYDRIP_CORS_ORIGINS=https://admin.example.com
            if let Ok(origins_str) = std::env::var("NOTARYDRIP_CORS_ORIGINS") {
                let origins: Vec<_> = origins_str
                    .split(',')
                    .filter_map(|s| s.trim().parse::<axum::http::HeaderValue>().ok())
                    .collect();
                cors.allow_origin(origins)
            } else {
                cors.allow_origin(Any)
            }
        })
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Start the HTTP server. Returns once `shutdown` flips to true.
pub async fn start(
    engine: NotificationEngine,
    config: &GatewayConfig,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let state = AppState::new(engine, config.clone());
    if state.api_token.is_none() {
        tracing::warn!("⚠️ gateway.api_token is not set: the admin API is open");
    }
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🌐 Gateway server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            tracing::info!("🛑 Gateway shutting down");
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use notarydrip_channels::ChannelSet;
    use notarydrip_sequences::{EngineSettings, SequenceDb};
    use tower::ServiceExt;

    fn router(token: Option<&str>) -> Router {
        let db = Arc::new(SequenceDb::open_in_memory().unwrap());
        let engine = NotificationEngine::new(db, ChannelSet::logging(), EngineSettings::default());
        let config = GatewayConfig {
            api_token: token.map(String::from),
            ..Default::default()
        };
        build_router(AppState::new(engine, config))
    }

    async fn status_of(app: Router, req: Request<Body>) -> StatusCode {
        app.oneshot(req).await.unwrap().status()
    }

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("s3cret", "s3cret"));
        assert!(!tokens_match("s3creT", "s3cret"));
        assert!(!tokens_match("s3cre", "s3cret"));
        assert!(!tokens_match("s3cret!", "s3cret"));
        assert!(!tokens_match("", "s3cret"));
        // A zero byte past the end of the guess must not pass for a match.
        assert!(!tokens_match("s3cre", "s3cre\0"));
    }

    #[tokio::test]
    async fn test_prefix_of_token_is_rejected() {
        let req = Request::get("/api/v1/sequences")
            .header("X-Api-Token", "s3cre")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(router(Some("s3cret")), req).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let req = Request::get("/health").body(Body::empty()).unwrap();
        assert_eq!(status_of(router(Some("s3cret")), req).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_requires_token() {
        let req = Request::get("/api/v1/sequences").body(Body::empty()).unwrap();
        assert_eq!(status_of(router(Some("s3cret")), req).await, StatusCode::UNAUTHORIZED);

        let req = Request::get("/api/v1/sequences")
            .header("Authorization", "Bearer wrong")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(router(Some("s3cret")), req).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_api_accepts_bearer_and_header() {
        let req = Request::get("/api/v1/sequences")
            .header("Authorization", "Bearer s3cret")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(router(Some("s3cret")), req).await, StatusCode::OK);

        let req = Request::get("/api/v1/stats")
            .header("X-Api-Token", "s3cret")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(router(Some("s3cret")), req).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_open_when_no_token() {
        let req = Request::get("/api/v1/failures").body(Body::empty()).unwrap();
        assert_eq!(status_of(router(None), req).await, StatusCode::OK);

        // Blank tokens count as unset.
        let req = Request::get("/api/v1/failures").body(Body::empty()).unwrap();
        assert_eq!(status_of(router(Some("  ")), req).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_event_roundtrip_over_http() {
        let app = router(None);
        let req = Request::post("/api/v1/events")
            .header("Content-Type", "application/json")
            .body(Body::from(
                r#"{"event_type":"payment_failed","subject_id":"c1","occurrence_id":"p-1","timestamp":"2026-03-02T15:00:00Z"}"#,
            ))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["ok"], true);
        assert_eq!(json["report"]["scheduled"], 0);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let req = Request::delete("/api/v1/nope").body(Body::empty()).unwrap();
        assert_eq!(status_of(router(None), req).await, StatusCode::NOT_FOUND);
    }
}
