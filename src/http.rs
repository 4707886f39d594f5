//! Thin demonstration HTTP surface (A4): wires `/health`, `/scan/upload`,
//! `/scan/path`, `/events/push` and `/events/stream` onto the library core.
//! Routing, CORS and multipart parsing are explicitly out of scope for
//! hardening (§1) — this module exists so `main.rs` stays a one-screen
//! `bind`+`serve` wrapper and so the agent-token/SSE surface is exercisable
//! from an integration test without a real TCP listener.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Multipart, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use futures::stream::{self, Stream};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::ingestor::FastEventRequest;
use crate::models::ScanJob;
use crate::AppContext;

pub fn build_router(context: AppContext) -> Router {
    let cors = build_cors_layer(&context.config.server.cors_allowed_origins);

    Router::new()
        .route("/health", get(health))
        .route("/scan/upload", post(scan_upload))
        .route("/scan/path", post(scan_path))
        .route("/events/push", post(events_push))
        .route("/events/stream", get(events_stream))
        .with_state(context)
        .layer(ServiceBuilder::new().layer(cors).layer(TraceLayer::new_for_http()))
}

fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::permissive()
    } else {
        let parsed: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new().allow_origin(parsed)
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    db_ok: bool,
    queue_depth: usize,
    dropped_events: u64,
}

async fn health(State(ctx): State<AppContext>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        db_ok: ctx.storage.health_check().await,
        queue_depth: ctx.queue.len().await,
        dropped_events: ctx.events.dropped_count(),
    })
}

/// Accepts a multipart upload (`file` field), writes it into the configured
/// uploads directory, then runs the detection pipeline synchronously — a
/// demonstration convenience, not how the production scan fabric is driven.
async fn scan_upload(State(ctx): State<AppContext>, mut multipart: Multipart) -> impl IntoResponse {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut filename = "upload".to_string();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "malformed multipart body");
                return (StatusCode::BAD_REQUEST, "malformed multipart body").into_response();
            }
        };

        if field.name() == Some("file") {
            filename = field.file_name().unwrap_or("upload").to_string();
            file_bytes = match field.bytes().await {
                Ok(bytes) => Some(bytes.to_vec()),
                Err(e) => {
                    warn!(error = %e, "failed to read uploaded file");
                    return (StatusCode::BAD_REQUEST, "failed to read uploaded file").into_response();
                }
            };
        }
    }

    let Some(bytes) = file_bytes else {
        return (StatusCode::BAD_REQUEST, "missing file field").into_response();
    };

    if let Err(e) = tokio::fs::create_dir_all(&ctx.config.storage.uploads_dir).await {
        error!(error = %e, "failed to create uploads directory");
        return (StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable").into_response();
    }

    let dest = std::path::Path::new(&ctx.config.storage.uploads_dir).join(&filename);
    if let Err(e) = tokio::fs::write(&dest, &bytes).await {
        error!(error = %e, "failed to persist uploaded file");
        return (StatusCode::INTERNAL_SERVER_ERROR, "failed to persist upload").into_response();
    }

    match ctx.pipeline.scan(&dest, Some("upload".to_string())).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => {
            error!(error = %e, "scan failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[derive(serde::Deserialize)]
struct ScanPathRequest {
    path: String,
    #[serde(default)]
    recursive: bool,
}

#[derive(Serialize)]
struct ScanPathResponse {
    enqueued: usize,
}

/// Triggers a server-side directory walk, enqueuing a `scan_file` job for
/// every regular file found (§2 input sources).
async fn scan_path(
    State(ctx): State<AppContext>,
    Json(req): Json<ScanPathRequest>,
) -> Result<Json<ScanPathResponse>, StatusCode> {
    let root = std::path::Path::new(&req.path);
    if !root.exists() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let mut walker = walkdir::WalkDir::new(root);
    if !req.recursive {
        walker = walker.max_depth(1);
    }

    let mut enqueued = 0usize;
    for entry in walker.into_iter().filter_map(Result::ok) {
        if entry.file_type().is_file() {
            ctx.queue
                .push(ScanJob::scan_file(entry.path().to_string_lossy().to_string(), Some("directory_walk".to_string())))
                .await;
            enqueued += 1;
        }
    }

    Ok(Json(ScanPathResponse { enqueued }))
}

#[derive(Serialize)]
struct PushResponse {
    status: &'static str,
    published: bool,
    enqueued_deep_scan: bool,
}

/// `POST /events/push`: signed fast-event ingestion from an endpoint agent
/// (§4.12, §6). Authenticates via a constant-time header comparison.
async fn events_push(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Json(req): Json<FastEventRequest>,
) -> Result<Json<PushResponse>, StatusCode> {
    let Some(expected) = &ctx.config.security.agent_token else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let presented = headers
        .get("X-Agent-Token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !crate::ingestor::Ingestor::authenticate(expected, presented) {
        return Err(StatusCode::UNAUTHORIZED);
    }

    let outcome = ctx.ingestor.ingest(req).await;
    Ok(Json(PushResponse {
        status: "ok",
        published: outcome.published,
        enqueued_deep_scan: outcome.enqueued_deep_scan,
    }))
}

/// `GET /events/stream`: long-lived SSE feed with a ~20s heartbeat ping.
async fn events_stream(
    State(ctx): State<AppContext>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = ctx.events.subscribe().await;

    let stream = stream::unfold(rx, |mut rx| async move {
        tokio::select! {
            event = rx.recv() => event.map(|event| {
                let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
                (Ok(SseEvent::default().event(event.event_type.clone()).data(data)), rx)
            }),
            _ = tokio::time::sleep(Duration::from_secs(20)) => {
                Some((Ok(SseEvent::default().event("ping").data("{}")), rx))
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
