//! Operator endpoints and the agent control-channel WebSocket.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum::body::Body;
use serde::Deserialize;
use tokio::sync::mpsc;

use gemgate_common::StreamingMode;
use gemgate_core::{AgentLink, CredentialStore, RequestCoordinator, RotationController};

use crate::proxy::extract_api_key;

#[derive(Clone)]
pub struct AdminState {
    pub coordinator: Arc<RequestCoordinator>,
    pub rotation: Arc<RotationController>,
    pub link: Arc<AgentLink>,
    pub store: Arc<CredentialStore>,
    pub api_keys: Arc<Vec<String>>,
}

pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/api/switch-account", post(switch_account))
        .route("/api/set-mode", post(set_mode))
        .route("/api/toggle-reasoning", post(toggle_reasoning))
        .route("/api/toggle-native-reasoning", post(toggle_native_reasoning))
        .route("/api/set-resume-config", post(set_resume_config))
        .route("/api/status", get(status))
        .route("/agent/ws", get(agent_ws))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth))
        .with_state(state)
}

async fn admin_auth(
    State(state): State<AdminState>,
    req: axum::http::Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let key = extract_api_key(req.headers(), req.uri().query())
        .ok_or(StatusCode::UNAUTHORIZED)?;
    if !state.api_keys.iter().any(|expected| expected == &key) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwitchAccountBody {
    target_index: Option<u32>,
}

async fn switch_account(State(state): State<AdminState>, body: axum::body::Bytes) -> Response {
    // The body is optional; an empty or unparseable body means "next".
    let target = serde_json::from_slice::<SwitchAccountBody>(&body)
        .ok()
        .and_then(|body| body.target_index);
    let result = match target {
        Some(target) => state.rotation.switch_to(target).await,
        None => state
            .rotation
            .switch_now(gemgate_core::SwitchReason::Manual)
            .await,
    };
    match result {
        Ok(index) => Json(serde_json::json!({
            "ok": true,
            "currentIndex": index,
            "name": state.store.label(index),
        }))
        .into_response(),
        Err(err) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "ok": false, "error": err.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct SetModeBody {
    mode: String,
}

async fn set_mode(State(state): State<AdminState>, Json(body): Json<SetModeBody>) -> Response {
    let Some(mode) = StreamingMode::parse(&body.mode) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "ok": false, "error": "mode must be real or fake" })),
        )
            .into_response();
    };
    state.coordinator.operator().set_streaming_mode(mode);
    Json(serde_json::json!({ "ok": true, "mode": mode.as_str() })).into_response()
}

async fn toggle_reasoning(State(state): State<AdminState>) -> Response {
    let enabled = state.coordinator.operator().toggle_reasoning();
    Json(serde_json::json!({ "ok": true, "reasoning": enabled })).into_response()
}

async fn toggle_native_reasoning(State(state): State<AdminState>) -> Response {
    let enabled = state.coordinator.operator().toggle_native_reasoning();
    Json(serde_json::json!({ "ok": true, "nativeReasoning": enabled })).into_response()
}

#[derive(Debug, Deserialize)]
struct ResumeConfigBody {
    limit: u32,
}

async fn set_resume_config(
    State(state): State<AdminState>,
    Json(body): Json<ResumeConfigBody>,
) -> Response {
    state.coordinator.operator().set_resume_limit(body.limit);
    Json(serde_json::json!({ "ok": true, "resumeLimit": body.limit })).into_response()
}

async fn status(State(state): State<AdminState>) -> Response {
    let rotation = state.rotation.snapshot().await;
    let operator = state.coordinator.operator();
    let accounts: Vec<serde_json::Value> = state
        .store
        .available_indices()
        .iter()
        .map(|&index| {
            serde_json::json!({
                "index": index,
                "name": state.store.label(index),
                "current": index == rotation.current_index,
            })
        })
        .collect();

    Json(serde_json::json!({
        "agentConnected": state.link.has_live_connection(),
        "currentIndex": rotation.current_index,
        "usageCount": rotation.usage_count,
        "failureCount": rotation.failure_count,
        "activeRequests": rotation.active_requests,
        "pendingSwitch": rotation.pending_switch,
        "isSwitching": rotation.is_switching,
        "mode": operator.streaming_mode().as_str(),
        "reasoning": operator.reasoning(),
        "nativeReasoning": operator.native_reasoning(),
        "resumeLimit": operator.resume_limit(),
        "accounts": accounts,
    }))
    .into_response()
}

async fn agent_ws(ws: WebSocketUpgrade, State(state): State<AdminState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state.link.clone()))
}

/// One agent connection: pump outbound command frames from the link and
/// feed inbound frames back into it. The link's reconnect grace handles
/// the close.
async fn handle_agent_socket(mut socket: WebSocket, link: Arc<AgentLink>) {
    let (tx, mut rx) = mpsc::channel::<String>(64);
    let conn_id = link.accept(tx);

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(text) = outbound else {
                    // Replaced by a newer connection.
                    break;
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => link.route_frame(&text),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::warn!(conn_id, error = %err, "agent socket error");
                        break;
                    }
                }
            }
        }
    }

    link.connection_closed(conn_id);
}
