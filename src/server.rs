//! HTTP control plane exposing the worker loop and offset buffers.
//!
//! Every state-mutating endpoint returns immediately; callers poll
//! `/status`, `/message/{id}`, or the offset streams for completion. All
//! responses carry `Cache-Control: no-store`, errors are always
//! `{"error": ...}` with a 4xx/5xx status, and no request can crash the
//! process.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::rejection::{JsonRejection, QueryRejection},
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::queue::MessageStatus;
use crate::runner::RunOutcome;
use crate::worker::{ControlLoopContext, ShutdownMode, StatusSnapshot};

#[derive(Debug, Deserialize, Serialize)]
pub struct MessageRequest {
    pub prompt: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageCreated {
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageView {
    pub id: String,
    pub status: MessageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<RunOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSlice<T> {
    pub items: Vec<T>,
    pub next_offset: usize,
}

#[derive(Debug, Deserialize)]
pub struct OffsetQuery {
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InterruptResponse {
    pub interrupted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

/// Control-plane server bound to one worker context.
pub struct ControlPlaneServer {
    ctx: Arc<ControlLoopContext>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    addr: Option<SocketAddr>,
}

impl ControlPlaneServer {
    pub fn new(ctx: Arc<ControlLoopContext>) -> Self {
        Self {
            ctx,
            shutdown_tx: None,
            addr: None,
        }
    }

    /// Bind and serve in a background task. Returns the bound address.
    pub async fn start(&mut self, bind: &str) -> Result<SocketAddr> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("Failed to bind control plane on {bind}"))?;
        let addr = listener
            .local_addr()
            .context("Failed to get control plane address")?;
        self.addr = Some(addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let app = build_router(self.ctx.clone());
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
            {
                tracing::error!("control plane server error: {e}");
            }
        });

        Ok(addr)
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.addr = None;
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }
}

/// Build the axum router with all control-plane endpoints.
pub fn build_router(ctx: Arc<ControlLoopContext>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/message", post(post_message))
        .route("/message/{id}", get(get_message))
        .route("/events", get(get_events))
        .route("/logs", get(get_logs))
        .route("/interrupt", post(post_interrupt))
        .route("/detach", post(post_detach))
        .route("/stop", post(post_stop))
        .fallback(not_found)
        .layer(middleware::from_fn(no_store))
        .with_state(ctx)
}

/// Stamp `Cache-Control: no-store` on every response.
async fn no_store(request: axum::extract::Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "not found")
}

async fn healthz(State(ctx): State<Arc<ControlLoopContext>>) -> Response {
    Json(serde_json::json!({ "state": ctx.state() })).into_response()
}

async fn status(State(ctx): State<Arc<ControlLoopContext>>) -> Json<StatusSnapshot> {
    Json(ctx.snapshot().await)
}

async fn post_message(
    State(ctx): State<Arc<ControlLoopContext>>,
    body: Result<Json<MessageRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(request)) = body else {
        return error_response(StatusCode::BAD_REQUEST, "body must be {\"prompt\": string}");
    };
    if request.prompt.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "prompt must be a non-empty string");
    }
    let id = ctx.submit_message(request.prompt);
    Json(MessageCreated { id: id.to_string() }).into_response()
}

async fn get_message(
    State(ctx): State<Arc<ControlLoopContext>>,
    Path(id): Path<String>,
) -> Response {
    let Some(entry) = id.parse::<u64>().ok().and_then(|id| ctx.message(id)) else {
        return error_response(StatusCode::NOT_FOUND, format!("unknown message id {id}"));
    };
    Json(MessageView {
        id: entry.id.to_string(),
        status: entry.status,
        result: entry.result,
        error: entry.error,
    })
    .into_response()
}

async fn get_events(
    State(ctx): State<Arc<ControlLoopContext>>,
    query: Result<Query<OffsetQuery>, QueryRejection>,
) -> Response {
    let Ok(Query(query)) = query else {
        return error_response(StatusCode::BAD_REQUEST, "offset must be a non-negative integer");
    };
    let (items, next_offset) = ctx.events_since(query.offset);
    Json(StreamSlice { items, next_offset }).into_response()
}

async fn get_logs(
    State(ctx): State<Arc<ControlLoopContext>>,
    query: Result<Query<OffsetQuery>, QueryRejection>,
) -> Response {
    let Ok(Query(query)) = query else {
        return error_response(StatusCode::BAD_REQUEST, "offset must be a non-negative integer");
    };
    let (items, next_offset) = ctx.logs_since(query.offset);
    Json(StreamSlice { items, next_offset }).into_response()
}

async fn post_interrupt(State(ctx): State<Arc<ControlLoopContext>>) -> Json<InterruptResponse> {
    Json(InterruptResponse {
        interrupted: ctx.interrupt_current(),
    })
}

async fn post_detach(State(ctx): State<Arc<ControlLoopContext>>) -> Json<Ack> {
    ctx.request_shutdown(ShutdownMode::Cooperative);
    Json(Ack { ok: true })
}

async fn post_stop(State(ctx): State<Arc<ControlLoopContext>>) -> Json<Ack> {
    ctx.request_shutdown(ShutdownMode::Immediate);
    Json(Ack { ok: true })
}
