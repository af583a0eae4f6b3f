//! The agent's control-channel loop: connect to the gateway, dispatch
//! request descriptors, honor cancels, and apply session switches.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use gemgate_protocol::control::{AgentCommand, AgentEvent, ControlFrame};

use crate::fetch::{Upstream, UpstreamConfig, run_request};
use crate::session::Session;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// ws:// or wss:// URL of the gateway's /agent/ws endpoint (including
    /// the key query parameter).
    pub gateway_url: String,
    pub upstream: UpstreamConfig,
}

struct AgentState {
    upstream: Upstream,
    session: Mutex<Option<Session>>,
    inflight: Mutex<HashMap<String, CancellationToken>>,
}

impl AgentState {
    fn current_session(&self) -> Option<Session> {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Run the agent until the process is stopped. Reconnects with a fixed
/// backoff whenever the control channel drops.
pub async fn run(config: AgentConfig) -> Result<(), wreq::Error> {
    let state = Arc::new(AgentState {
        upstream: Upstream::new(config.upstream.clone())?,
        session: Mutex::new(None),
        inflight: Mutex::new(HashMap::new()),
    });

    loop {
        match connect_async(&config.gateway_url).await {
            Ok((socket, _)) => {
                tracing::info!(url = %config.gateway_url, "control channel connected");
                handle_connection(socket, &state).await;
                tracing::warn!("control channel closed, reconnecting");
            }
            Err(err) => {
                tracing::warn!(error = %err, "gateway connect failed, retrying");
            }
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn handle_connection<S>(socket: tokio_tungstenite::WebSocketStream<S>, state: &Arc<AgentState>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut write, mut read) = socket.split();
    let (events_tx, mut events_rx) = mpsc::channel::<AgentEvent>(64);

    let writer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if write.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = read.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(error = %err, "control channel read failed");
                break;
            }
        };
        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };
        let command: AgentCommand = match serde_json::from_str(&text) {
            Ok(command) => command,
            Err(err) => {
                tracing::warn!(error = %err, "dropping undecodable gateway frame");
                continue;
            }
        };
        dispatch(command, state, &events_tx).await;
    }

    // Abandon in-flight work tied to this connection.
    let tokens: Vec<CancellationToken> = {
        let mut inflight = state.inflight.lock().unwrap_or_else(|e| e.into_inner());
        inflight.drain().map(|(_, token)| token).collect()
    };
    for token in tokens {
        token.cancel();
    }
    writer.abort();
}

async fn dispatch(
    command: AgentCommand,
    state: &Arc<AgentState>,
    events: &mpsc::Sender<AgentEvent>,
) {
    match command {
        AgentCommand::Control(ControlFrame::CancelRequest { request_id }) => {
            let token = {
                let inflight = state.inflight.lock().unwrap_or_else(|e| e.into_inner());
                inflight.get(&request_id).cloned()
            };
            match token {
                Some(token) => {
                    tracing::info!(request_id = %request_id, "cancelling upstream fetch");
                    token.cancel();
                }
                // Cancels are idempotent; late ones are expected.
                None => tracing::debug!(request_id = %request_id, "cancel for unknown request"),
            }
        }
        AgentCommand::Control(ControlFrame::SwitchSession {
            index,
            storage_state,
        }) => {
            let event = match Session::from_storage_state(index, &storage_state) {
                Ok(session) => {
                    tracing::info!(index, "session rebound");
                    *state.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(session);
                    AgentEvent::SessionReady { index }
                }
                Err(err) => {
                    tracing::warn!(index, error = %err, "session switch rejected");
                    AgentEvent::SessionError {
                        index,
                        message: err.to_string(),
                    }
                }
            };
            let _ = events.send(event).await;
        }
        AgentCommand::Request(descriptor) => {
            let request_id = descriptor.request_id.clone();
            let token = CancellationToken::new();
            state
                .inflight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(request_id.clone(), token.clone());

            let state = Arc::clone(state);
            let events = events.clone();
            tokio::spawn(async move {
                tracing::info!(
                    request_id = %request_id,
                    path = %descriptor.path,
                    mode = ?descriptor.streaming_mode,
                    "executing upstream request"
                );
                run_request(
                    &state.upstream,
                    state.current_session(),
                    *descriptor,
                    events,
                    token,
                )
                .await;
                state
                    .inflight
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&request_id);
            });
        }
    }
}
