//! The control-channel bridge between one agent and many in-flight requests.
//!
//! At most one connection is live. On loss, a reconnect grace timer is
//! armed; a reconnect inside the window keeps every per-request queue
//! intact, while expiry closes them all and broadcasts `ConnectionLost`
//! (the one multi-consumer event: the coordinator treats it as a
//! recoverable backend crash, the status surface refreshes).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use gemgate_protocol::control::{AgentEvent, ControlFrame, RequestDescriptor};

use crate::queue::{MessageQueue, QueueFrame};

pub const DEFAULT_RECONNECT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    ConnectionLost,
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("no live agent connection")]
    NoConnection,
    #[error("agent connection send failed")]
    SendFailed,
}

#[derive(Debug)]
struct Connection {
    id: u64,
    tx: mpsc::Sender<String>,
}

#[derive(Debug, Default)]
struct LinkInner {
    conn: Option<Connection>,
    next_conn_id: u64,
    grace_timer: Option<JoinHandle<()>>,
    pending_session: Option<(u32, oneshot::Sender<Result<u32, String>>)>,
}

pub struct AgentLink {
    inner: Mutex<LinkInner>,
    queues: Mutex<HashMap<String, Arc<MessageQueue>>>,
    events: broadcast::Sender<LinkEvent>,
    grace: Duration,
}

impl AgentLink {
    pub fn new(grace: Duration) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            inner: Mutex::new(LinkInner::default()),
            queues: Mutex::new(HashMap::new()),
            events,
            grace,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Register a new control connection. Cancels a pending grace timer and
    /// replaces any previous connection (its writer task ends when the old
    /// sender is dropped). Returns the connection id to hand back to
    /// `connection_closed`.
    pub fn accept(&self, tx: mpsc::Sender<String>) -> u64 {
        let id = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(timer) = inner.grace_timer.take() {
                timer.abort();
            }
            inner.next_conn_id += 1;
            let id = inner.next_conn_id;
            let replaced = inner.conn.replace(Connection { id, tx }).is_some();
            if replaced {
                tracing::warn!(conn_id = id, "agent connection replaced an existing one");
            } else {
                tracing::info!(conn_id = id, "agent connected");
            }
            id
        };
        let _ = self.events.send(LinkEvent::Connected);
        id
    }

    pub fn has_live_connection(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .conn
            .is_some()
    }

    /// Socket-close observer. Arms the single-shot reconnect grace timer;
    /// stale closes from an already-replaced connection are ignored.
    pub fn connection_closed(self: &Arc<Self>, conn_id: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match &inner.conn {
            Some(conn) if conn.id == conn_id => {}
            _ => return,
        }
        inner.conn = None;
        tracing::warn!(
            conn_id,
            grace_ms = self.grace.as_millis() as u64,
            "agent disconnected, starting reconnect grace"
        );
        let link = Arc::clone(self);
        inner.grace_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(link.grace).await;
            link.grace_expired();
        }));
    }

    fn grace_expired(&self) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.grace_timer = None;
            if let Some((index, ack)) = inner.pending_session.take() {
                let _ = ack.send(Err(format!("connection lost while switching to {index}")));
            }
        }
        let queues: Vec<Arc<MessageQueue>> = {
            let mut map = self.queues.lock().unwrap_or_else(|e| e.into_inner());
            map.drain().map(|(_, queue)| queue).collect()
        };
        tracing::warn!(
            in_flight = queues.len(),
            "reconnect grace expired, failing in-flight requests"
        );
        for queue in queues {
            queue.close();
        }
        let _ = self.events.send(LinkEvent::ConnectionLost);
    }

    pub fn open_queue(&self, request_id: &str) -> Arc<MessageQueue> {
        let queue = Arc::new(MessageQueue::new());
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id.to_string(), queue.clone());
        queue
    }

    pub fn close_queue(&self, request_id: &str) {
        let queue = self
            .queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(request_id);
        if let Some(queue) = queue {
            queue.close();
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<String>, LinkError> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .conn
            .as_ref()
            .map(|conn| conn.tx.clone())
            .ok_or(LinkError::NoConnection)
    }

    async fn send_text(&self, text: String) -> Result<(), LinkError> {
        let tx = self.sender()?;
        tx.send(text).await.map_err(|_| LinkError::SendFailed)
    }

    pub async fn send_descriptor(&self, descriptor: &RequestDescriptor) -> Result<(), LinkError> {
        let text = serde_json::to_string(descriptor).map_err(|_| LinkError::SendFailed)?;
        self.send_text(text).await
    }

    pub async fn send_cancel(&self, request_id: &str) -> Result<(), LinkError> {
        let frame = ControlFrame::CancelRequest {
            request_id: request_id.to_string(),
        };
        let text = serde_json::to_string(&frame).map_err(|_| LinkError::SendFailed)?;
        self.send_text(text).await
    }

    /// Ask the agent to rebind its session. The returned receiver resolves
    /// when the agent acks; a switch begun while another is pending
    /// supersedes it.
    pub async fn begin_session_switch(
        &self,
        index: u32,
        storage_state: Value,
    ) -> Result<oneshot::Receiver<Result<u32, String>>, LinkError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.conn.is_none() {
                return Err(LinkError::NoConnection);
            }
            if let Some((prev, ack)) = inner.pending_session.replace((index, ack_tx)) {
                let _ = ack.send(Err(format!("superseded by switch to {index} (was {prev})")));
            }
        }
        let frame = ControlFrame::SwitchSession {
            index,
            storage_state,
        };
        let text = serde_json::to_string(&frame).map_err(|_| LinkError::SendFailed)?;
        if let Err(err) = self.send_text(text).await {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.pending_session = None;
            return Err(err);
        }
        Ok(ack_rx)
    }

    /// Route one inbound control-channel frame to its per-request queue.
    /// Unknown request ids and undecodable frames are logged and dropped.
    pub fn route_frame(&self, text: &str) {
        let event: AgentEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(error = %err, "dropping undecodable agent frame");
                return;
            }
        };

        match event {
            AgentEvent::SessionReady { index } => self.resolve_session(index, Ok(index)),
            AgentEvent::SessionError { index, message } => {
                self.resolve_session(index, Err(message))
            }
            AgentEvent::ResponseHeaders {
                request_id,
                status,
                headers,
            } => self.deliver(&request_id, QueueFrame::ResponseHeaders { status, headers }),
            AgentEvent::Chunk { request_id, data } => {
                self.deliver(&request_id, QueueFrame::Chunk(data))
            }
            AgentEvent::StreamClose { request_id } => {
                self.deliver(&request_id, QueueFrame::StreamEnd)
            }
            AgentEvent::Error {
                request_id,
                status,
                message,
            } => self.deliver(&request_id, QueueFrame::Error { status, message }),
        }
    }

    fn deliver(&self, request_id: &str, frame: QueueFrame) {
        let queue = self
            .queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(request_id)
            .cloned();
        match queue {
            Some(queue) => queue.enqueue(frame),
            None => {
                tracing::warn!(request_id = %request_id, "frame for unknown request id dropped");
            }
        }
    }

    fn resolve_session(&self, index: u32, result: Result<u32, String>) {
        let pending = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.pending_session.take()
        };
        match pending {
            Some((expected, ack)) if expected == index => {
                let _ = ack.send(result);
            }
            Some((expected, ack)) => {
                tracing::warn!(expected, got = index, "session ack for unexpected index");
                let _ = ack.send(Err(format!("agent acked index {index}, expected {expected}")));
            }
            None => {
                tracing::warn!(index, "unsolicited session ack dropped");
            }
        }
    }
}
