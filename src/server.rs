//! HTTP surface (feature `server`): health, emergence metrics, SSE events.
//!
//! A thin axum layer over a shared [`Engine`]: `GET /health`,
//! `GET /api/metrics/emergence?range=1h|24h|7d|30d&scope=user|system`, and
//! `GET /events/stream` — a server-sent-events channel replaying the live
//! trace/event broadcast.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use futures_util::Stream;
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;

use crate::db::Range;
use crate::engine::Engine;
use crate::error::{EngineError, KhepriResult};

/// Serve the HTTP surface until the process exits.
pub async fn serve(engine: Arc<Engine>, addr: SocketAddr) -> KhepriResult<()> {
    let app = router(engine);
    tracing::info!(%addr, "khepri server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| EngineError::InvalidConfig {
            message: format!("cannot bind {addr}: {e}"),
        })?;
    axum::serve(listener, app)
        .await
        .map_err(|e| EngineError::InvalidConfig {
            message: format!("server error: {e}"),
        })?;
    Ok(())
}

/// Build the router (split out for tests).
pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/metrics/emergence", get(emergence))
        .route("/events/stream", get(events_stream))
        .layer(CorsLayer::permissive())
        .with_state(engine)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct EmergenceQuery {
    #[serde(default)]
    range: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

async fn emergence(
    State(engine): State<Arc<Engine>>,
    Query(query): Query<EmergenceQuery>,
) -> Result<Json<Value>, StatusCode> {
    let range = match query.range.as_deref() {
        None => Range::Day,
        Some(text) => Range::parse(text).ok_or(StatusCode::BAD_REQUEST)?,
    };
    let scope = query.scope.unwrap_or_else(|| "user".to_string());
    if scope != "user" && scope != "system" {
        return Err(StatusCode::BAD_REQUEST);
    }

    let payload = engine
        .emergence()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let mut body = serde_json::to_value(&payload).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    if let Some(map) = body.as_object_mut() {
        map.insert("range_seconds".into(), json!(range.seconds()));
        map.insert("scope".into(), json!(scope));
    }
    Ok(Json(body))
}

async fn events_stream(
    State(engine): State<Arc<Engine>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = engine.events();
    let stream = futures_util::stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let data = match serde_json::to_string(&event) {
                        Ok(data) => data,
                        Err(_) => continue,
                    };
                    return Some((Ok(Event::default().event("trace").data(data)), receiver));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "SSE subscriber lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
