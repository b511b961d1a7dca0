//! HTTP surface of `lumen run`.
//!
//! - `GET /health`: current [`HealthReport`] as JSON
//! - `GET /metrics/stream`: the same report as server-sent events, once a second
//! - `GET /frames`: WebSocket, one binary message per encoded frame
//! - `POST /state`: write a field (`{"path", "value", "ttl_secs"?}`) or a
//!   nested document (`{"seed", "ttl_secs"?}`) into the shared state

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use lumen_core::{SharedState, seed_from_json};
use lumen_runtime::{DaemonHandle, FrameBytes, FrameSink, HealthReport, Offer};

const METRICS_INTERVAL: Duration = Duration::from_secs(1);

/// Frame sink feeding every connected WebSocket client.
///
/// Never blocks the frame loop: slow clients fall behind and skip frames on
/// their side of the broadcast channel.
pub struct BroadcastSink {
    tx: broadcast::Sender<FrameBytes>,
}

impl BroadcastSink {
    pub fn new(tx: broadcast::Sender<FrameBytes>) -> Self {
        Self { tx }
    }
}

impl FrameSink for BroadcastSink {
    fn name(&self) -> &str {
        "websocket"
    }

    fn offer(&mut self, frame: FrameBytes) -> Offer {
        // No subscribers is not a failure; there is simply nobody to show.
        let _ = self.tx.send(frame);
        Offer::Delivered
    }
}

#[derive(Clone)]
pub struct AppState {
    pub state: SharedState,
    pub daemon: DaemonHandle,
    pub frames: broadcast::Sender<FrameBytes>,
    pub cancel: CancellationToken,
}

pub fn router(app: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics/stream", get(metrics_stream))
        .route("/frames", get(frames))
        .route("/state", post(write_state))
        .with_state(app)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serve until `app.cancel` fires.
pub async fn serve(listen: &str, app: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    let addr: SocketAddr = listener.local_addr()?;
    tracing::info!("serving frames on ws://{addr}/frames, health on http://{addr}/health");

    let cancel = app.cancel.clone();
    axum::serve(listener, router(app))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .context("http server failed")
}

async fn health(State(app): State<AppState>) -> Json<HealthReport> {
    Json(app.daemon.health())
}

async fn metrics_stream(State(app): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        let mut ticker = tokio::time::interval(METRICS_INTERVAL);
        loop {
            let ticked = tokio::select! {
                _ = ticker.tick() => true,
                _ = app.cancel.cancelled() => false,
            };
            if !ticked {
                break;
            }
            match Event::default().event("health").json_data(app.daemon.health()) {
                Ok(event) => yield Ok(event),
                Err(e) => tracing::warn!("failed to encode health event: {e}"),
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn frames(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    let rx = app.frames.subscribe();
    ws.on_upgrade(move |socket| stream_frames(socket, rx, app.cancel))
}

async fn stream_frames(socket: WebSocket, mut rx: broadcast::Receiver<FrameBytes>, cancel: CancellationToken) {
    let (mut tx, mut incoming) = socket.split();
    tracing::debug!("frame subscriber connected");
    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Ok(frame) => {
                    if tx.send(Message::Binary(Bytes::copy_from_slice(&frame))).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("frame subscriber lagging, skipped {n} frames");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = incoming.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            _ = cancel.cancelled() => {
                let _ = tx.send(Message::Close(None)).await;
                break;
            }
        }
    }
    tracing::debug!("frame subscriber disconnected");
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StateWrite {
    Field {
        path: String,
        value: serde_json::Value,
        #[serde(default)]
        ttl_secs: Option<f64>,
    },
    Seed {
        seed: serde_json::Value,
        #[serde(default)]
        ttl_secs: Option<f64>,
    },
}

fn bad_request(msg: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": msg.into() }))).into_response()
}

fn ttl(secs: Option<f64>) -> std::result::Result<Option<Duration>, Response> {
    match secs {
        None => Ok(None),
        Some(s) => Duration::try_from_secs_f64(s)
            .map(Some)
            .map_err(|_| bad_request(format!("ttl_secs must be a non-negative number, got {s}"))),
    }
}

async fn write_state(State(app): State<AppState>, Json(write): Json<StateWrite>) -> Response {
    let written = match write {
        StateWrite::Field { path, value, ttl_secs } => {
            if path.trim().is_empty() {
                return bad_request("path must not be empty");
            }
            let ttl = match ttl(ttl_secs) {
                Ok(ttl) => ttl,
                Err(resp) => return resp,
            };
            match ttl {
                Some(ttl) => app.state.set_with_ttl(&path, value, ttl),
                None => app.state.set(&path, value),
            }
            1
        }
        StateWrite::Seed { seed, ttl_secs } => {
            if !seed.is_object() {
                return bad_request("seed must be a JSON object");
            }
            let ttl = match ttl(ttl_secs) {
                Ok(ttl) => ttl,
                Err(resp) => return resp,
            };
            seed_from_json(&app.state, &seed, ttl)
        }
    };
    tracing::debug!("state write: {written} fields");
    Json(serde_json::json!({ "written": written })).into_response()
}
