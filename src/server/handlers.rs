//! HTTP and WebSocket handlers.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::events::{ErrorCode, StageId};
use crate::pipeline::{PipelineError, PipelineRequest, RunMode};

use super::AppState;

/// How long a single frame may take to reach a client before the
/// connection is considered dead.
const WRITE_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize, Default)]
pub struct ScrapeBody {
    pub mode: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub headless: Option<bool>,
    pub request_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct StageBody {
    pub request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StopBody {
    pub pipeline_id: String,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub id: Option<String>,
}

#[derive(Debug, Serialize)]
struct TriggerResponse {
    success: bool,
    pipeline_id: String,
    message: String,
}

/// Structured error body mirroring the taxonomy.
#[derive(Debug, Serialize)]
struct ApiError {
    error_code: String,
    title: String,
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
}

fn error_response(code: ErrorCode, detail: String) -> Response {
    let status =
        StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(ApiError {
            error_code: code.as_str().to_string(),
            title: code.title().to_string(),
            detail,
            hint: Some(code.hint().to_string()),
        }),
    )
        .into_response()
}

fn pipeline_error_response(error: PipelineError) -> Response {
    error_response(error.code(), error.to_string())
}

/// Launch a run in the background and answer with its id.
async fn trigger(state: AppState, request: PipelineRequest) -> Response {
    match state.manager.begin(request).await {
        Ok(run) => {
            let pipeline_id = run.id().to_string();
            tokio::spawn(run.run());
            Json(TriggerResponse {
                success: true,
                pipeline_id,
                message: "pipeline started".to_string(),
            })
            .into_response()
        }
        Err(error) => pipeline_error_response(error),
    }
}

/// POST /api/scrape: start the full pipeline.
pub async fn start_pipeline(
    State(state): State<AppState>,
    Json(body): Json<ScrapeBody>,
) -> Response {
    let mode = match body.mode.as_deref() {
        Some(raw) => match RunMode::from_str(raw) {
            Some(mode) => mode,
            None => {
                warn!("unknown run mode {:?}, defaulting to initial", raw);
                RunMode::Initial
            }
        },
        None => RunMode::Initial,
    };

    let request = PipelineRequest {
        mode,
        from: body.from,
        to: body.to,
        headless: body.headless.unwrap_or(true),
        stages: StageId::ALL.to_vec(),
        request_id: body.request_id,
    };
    trigger(state, request).await
}

/// POST /api/process: run only the processing stage.
pub async fn start_process(
    State(state): State<AppState>,
    body: Option<Json<StageBody>>,
) -> Response {
    let mut request = PipelineRequest::single(StageId::Processing);
    request.request_id = body.and_then(|b| b.0.request_id);
    trigger(state, request).await
}

/// POST /api/indexcsv: run only the index extraction stage.
pub async fn start_indices(
    State(state): State<AppState>,
    body: Option<Json<StageBody>>,
) -> Response {
    let mut request = PipelineRequest::single(StageId::Indices);
    request.request_id = body.and_then(|b| b.0.request_id);
    trigger(state, request).await
}

/// GET /api/pipeline/status?id=...: snapshot of a run.
///
/// Without an id, answers with the active run if there is one.
pub async fn pipeline_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Response {
    let snapshot = match &query.id {
        Some(id) => state.manager.get(id).await,
        None => state.manager.active().await.into_iter().next(),
    };
    match snapshot {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "pipeline not found" })),
        )
            .into_response(),
    }
}

/// POST /api/pipeline/stop: cancel a run.
pub async fn stop_pipeline(
    State(state): State<AppState>,
    Json(body): Json<StopBody>,
) -> Response {
    if state.manager.cancel(&body.pipeline_id).await {
        Json(json!({ "status": "stopped" })).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "pipeline not found" })),
        )
            .into_response()
    }
}

/// GET /api/status: lightweight server health summary.
pub async fn server_status(State(state): State<AppState>) -> Response {
    let active = state.manager.active().await;
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "clients": state.hub.client_count().await,
        "active_pipeline": active.first().map(|p| p.id.clone()),
    }))
    .into_response()
}

/// GET /ws: upgrade to the event stream.
pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Pump hub frames to one client until it disconnects or falls behind.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let subscription = state.hub.subscribe().await;
    let client_id = subscription.client_id;
    let mut rx = subscription.rx;
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => {
                    let send = sink.send(Message::Text(frame.to_string()));
                    match tokio::time::timeout(WRITE_DEADLINE, send).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            debug!("client {} send failed: {}", client_id, e);
                            break;
                        }
                        Err(_) => {
                            warn!("client {} missed the write deadline", client_id);
                            break;
                        }
                    }
                }
                // Evicted by the hub or the hub closed.
                None => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // clients only listen; inbound frames are ignored
                Some(Err(e)) => {
                    debug!("client {} receive failed: {}", client_id, e);
                    break;
                }
            },
        }
    }

    state.hub.unsubscribe(&client_id).await;
    let _ = sink.close().await;
    debug!("client {} closed", client_id);
}
