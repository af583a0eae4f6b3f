//! Per-request lifecycle: admission gate, descriptor forwarding, and the
//! three response modes (pass-through streaming, synthesized streaming,
//! buffered). Every path funnels through a guaranteed-release scope that
//! closes the queue, decrements the active count, and gives a pending
//! switch its chance to run.

use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use bytes::Bytes;
use regex::Regex;
use tokio::sync::mpsc;

use gemgate_common::StreamingMode;
use gemgate_protocol::control::{RequestDescriptor, WireStreamingMode};
use gemgate_protocol::gemini::{GenerateContentResponse, ListModelsResponse};
use gemgate_protocol::openai::ChatCompletionRequestBody;

use crate::adapter::{
    AdapterError, StreamTranslator, gemini_to_chat_completion, inline_images,
    model_list_to_openai, openai_to_gemini,
};
use crate::error::GatewayError;
use crate::link::AgentLink;
use crate::queue::{MessageQueue, QueueError, QueueFrame};
use crate::rotation::RotationController;

const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(300);
const BODY_FRAME_TIMEOUT: Duration = Duration::from_secs(300);
const STREAM_CHUNK_TIMEOUT: Duration = Duration::from_secs(30);
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(3);
const KEEP_ALIVE_FRAME: &[u8] = b": keep-alive\n\n";

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Fake-stream attempts before giving up.
    pub max_retries: u32,
    /// Delay between fake-stream attempts.
    pub retry_delay: Duration,
}

/// Operator-tunable runtime flags, mutated from the admin surface and read
/// on every request.
pub struct OperatorState {
    mode: ArcSwap<StreamingMode>,
    reasoning: AtomicBool,
    native_reasoning: AtomicBool,
    resume_limit: AtomicU32,
}

impl OperatorState {
    pub fn new(mode: StreamingMode, resume_limit: u32) -> Self {
        Self {
            mode: ArcSwap::from_pointee(mode),
            reasoning: AtomicBool::new(false),
            native_reasoning: AtomicBool::new(false),
            resume_limit: AtomicU32::new(resume_limit),
        }
    }

    pub fn streaming_mode(&self) -> StreamingMode {
        **self.mode.load()
    }

    pub fn set_streaming_mode(&self, mode: StreamingMode) {
        self.mode.store(Arc::new(mode));
    }

    pub fn reasoning(&self) -> bool {
        self.reasoning.load(Ordering::Relaxed)
    }

    pub fn toggle_reasoning(&self) -> bool {
        !self.reasoning.fetch_xor(true, Ordering::Relaxed)
    }

    pub fn native_reasoning(&self) -> bool {
        self.native_reasoning.load(Ordering::Relaxed)
    }

    pub fn toggle_native_reasoning(&self) -> bool {
        !self.native_reasoning.fetch_xor(true, Ordering::Relaxed)
    }

    pub fn resume_limit(&self) -> u32 {
        self.resume_limit.load(Ordering::Relaxed)
    }

    pub fn set_resume_limit(&self, limit: u32) {
        self.resume_limit.store(limit, Ordering::Relaxed);
    }
}

/// Transport-neutral inbound request, already authenticated and with the
/// downstream key stripped from headers/query.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: String,
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl InboundRequest {
    fn accept_is_event_stream(&self) -> bool {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("accept"))
            .map(|(_, value)| value.to_ascii_lowercase().contains("text/event-stream"))
            .unwrap_or(false)
    }
}

#[derive(Debug)]
pub enum GatewayBody {
    Bytes(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

#[derive(Debug)]
pub struct GatewayResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: GatewayBody,
}

impl GatewayResponse {
    fn json(status: u16, body: String) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: GatewayBody::Bytes(Bytes::from(body)),
        }
    }

    fn error(err: &GatewayError) -> Self {
        Self::json(err.client_status(), error_body(err.client_status(), &err.to_string()))
    }

    fn sse(status: u16, rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            status,
            headers: vec![
                ("content-type".to_string(), "text/event-stream".to_string()),
                ("cache-control".to_string(), "no-cache".to_string()),
                ("connection".to_string(), "keep-alive".to_string()),
            ],
            body: GatewayBody::Stream(rx),
        }
    }
}

fn error_body(status: u16, message: &str) -> String {
    serde_json::json!({
        "error": { "code": status, "message": message, "status": "UNAVAILABLE" }
    })
    .to_string()
}

fn sse_error_chunk(status: u16, message: &str) -> Bytes {
    let payload = serde_json::json!({
        "error": { "code": status, "message": message }
    });
    Bytes::from(format!("data: {payload}\n\ndata: [DONE]\n\n"))
}

/// How the upstream body translates back to the client.
#[derive(Debug, Clone)]
enum ResponseShape {
    /// Google-native pass-through (image inlining on buffered bodies).
    Native,
    /// OpenAI chat completions, translated per frame or once when buffered.
    OpenAi { model: String },
}

struct RequestPlan {
    descriptor: RequestDescriptor,
    generative: bool,
    wants_stream: bool,
    mode: StreamingMode,
    shape: ResponseShape,
}

pub struct RequestCoordinator {
    link: Arc<AgentLink>,
    rotation: Arc<RotationController>,
    operator: Arc<OperatorState>,
    config: CoordinatorConfig,
}

impl RequestCoordinator {
    pub fn new(
        link: Arc<AgentLink>,
        rotation: Arc<RotationController>,
        operator: Arc<OperatorState>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            link,
            rotation,
            operator,
            config,
        }
    }

    pub fn operator(&self) -> &OperatorState {
        &self.operator
    }

    /// Google-native passthrough for any inbound path.
    pub async fn process_request(self: &Arc<Self>, request: InboundRequest) -> GatewayResponse {
        let generative = is_generative_path(&request.path);
        let wants_stream = request.accept_is_event_stream()
            || request.path.ends_with(":streamGenerateContent")
            || request.query.get("alt").is_some_and(|v| v == "sse");

        let mut body = request.body.clone();
        if generative && self.operator.native_reasoning() {
            body = inject_thinking_config(body);
        }

        let plan = self.build_plan(&request, body, generative, wants_stream, ResponseShape::Native);
        self.execute(plan).await
    }

    /// OpenAI chat completions: translate, re-target the path, translate
    /// frames back.
    pub async fn process_openai(self: &Arc<Self>, request: InboundRequest) -> GatewayResponse {
        let body: ChatCompletionRequestBody = match serde_json::from_slice(&request.body) {
            Ok(body) => body,
            Err(err) => {
                return GatewayResponse::error(&GatewayError::BadRequest(format!(
                    "invalid chat completions body: {err}"
                )));
            }
        };
        let wants_stream = body.wants_stream() || request.accept_is_event_stream();
        let mode = self.operator.streaming_mode();
        let translated = match openai_to_gemini(&body, self.operator.reasoning()) {
            Ok(translated) => translated,
            Err(err) => return adapter_error_response(err),
        };
        let upstream_streaming = wants_stream && mode == StreamingMode::Real;
        let action = if upstream_streaming {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        let path = format!("/v1beta/models/{}:{}", body.model, action);
        let mut query = BTreeMap::new();
        if upstream_streaming {
            query.insert("alt".to_string(), "sse".to_string());
        }

        let raw = match serde_json::to_vec(&translated) {
            Ok(raw) => Bytes::from(raw),
            Err(err) => {
                return GatewayResponse::error(&GatewayError::BadRequest(format!(
                    "failed to encode upstream body: {err}"
                )));
            }
        };

        let rewritten = InboundRequest {
            method: "POST".to_string(),
            path,
            query,
            headers: request.headers.clone(),
            body: raw.clone(),
        };
        let plan = self.build_plan(
            &rewritten,
            raw,
            true,
            wants_stream,
            ResponseShape::OpenAi {
                model: body.model.clone(),
            },
        );
        self.execute(plan).await
    }

    /// OpenAI model list: fetch the Gemini listing through the agent and
    /// translate. Takes no rotation ticket (non-generative read).
    pub async fn process_model_list(self: &Arc<Self>) -> GatewayResponse {
        if !self.link.has_live_connection() {
            return GatewayResponse::error(&GatewayError::AgentGone);
        }
        let request_id = new_request_id();
        let descriptor = RequestDescriptor {
            request_id: request_id.clone(),
            path: "/v1beta/models".to_string(),
            method: "GET".to_string(),
            headers: BTreeMap::new(),
            query_params: BTreeMap::new(),
            body: None,
            streaming_mode: WireStreamingMode::Real,
            is_generative: false,
            client_wants_stream: false,
            resume_on_prohibit: false,
            resume_limit: 0,
        };
        let queue = self.link.open_queue(&request_id);
        let result = match self.link.send_descriptor(&descriptor).await {
            Ok(()) => self.fetch_buffered(&queue).await,
            Err(_) => Err(GatewayError::AgentGone),
        };
        self.link.close_queue(&request_id);
        match result {
            Ok((status, body)) if (200..300).contains(&status) => {
                match serde_json::from_str::<ListModelsResponse>(&body) {
                    Ok(list) => match serde_json::to_string(&model_list_to_openai(&list)) {
                        Ok(body) => GatewayResponse::json(200, body),
                        Err(err) => GatewayResponse::error(&GatewayError::Upstream {
                            status: 502,
                            message: format!("failed to encode model list: {err}"),
                        }),
                    },
                    Err(err) => GatewayResponse::error(&GatewayError::Upstream {
                        status: 502,
                        message: format!("failed to decode model list: {err}"),
                    }),
                }
            }
            Ok((status, body)) => GatewayResponse::json(status, body),
            Err(err) => GatewayResponse::error(&err),
        }
    }

    fn build_plan(
        &self,
        request: &InboundRequest,
        body: Bytes,
        generative: bool,
        wants_stream: bool,
        shape: ResponseShape,
    ) -> RequestPlan {
        let mode = self.operator.streaming_mode();
        let resume_limit = self.operator.resume_limit();
        let resume = generative && wants_stream && mode == StreamingMode::Real && resume_limit > 0;
        let descriptor = RequestDescriptor {
            request_id: new_request_id(),
            path: request.path.clone(),
            method: request.method.clone(),
            headers: request.headers.clone(),
            query_params: request.query.clone(),
            body: (!body.is_empty()).then(|| String::from_utf8_lossy(&body).into_owned()),
            streaming_mode: if wants_stream && mode == StreamingMode::Fake {
                WireStreamingMode::Fake
            } else {
                WireStreamingMode::Real
            },
            is_generative: generative,
            client_wants_stream: wants_stream,
            resume_on_prohibit: resume,
            resume_limit,
        };
        RequestPlan {
            descriptor,
            generative,
            wants_stream,
            mode,
            shape,
        }
    }

    /// Common entry gate + response-mode dispatch.
    async fn execute(self: &Arc<Self>, plan: RequestPlan) -> GatewayResponse {
        if let Err(err) = self.rotation.admit().await {
            tracing::info!(error = %err, "request rejected at gate");
            return GatewayResponse::error(&GatewayError::Draining);
        }

        // Admitted: every exit below must pass through RequestScope::finish.
        if !self.link.has_live_connection() {
            if self.rotation.is_system_busy().await {
                self.rotation.release().await;
                return GatewayResponse::error(&GatewayError::Busy);
            }
            if let Err(err) = self.rotation.recover().await {
                tracing::warn!(error = %err, "silent session recovery failed");
                self.rotation.release().await;
                return GatewayResponse::error(&GatewayError::AgentGone);
            }
        }
        if self.rotation.is_system_busy().await {
            self.rotation.release().await;
            return GatewayResponse::error(&GatewayError::Busy);
        }

        self.rotation.count_usage(plan.generative).await;

        let request_id = plan.descriptor.request_id.clone();
        let queue = self.link.open_queue(&request_id);
        let scope = RequestScope {
            coordinator: Arc::clone(self),
            request_id: request_id.clone(),
        };

        tracing::info!(
            request_id = %request_id,
            path = %plan.descriptor.path,
            generative = plan.generative,
            wants_stream = plan.wants_stream,
            mode = plan.mode.as_str(),
            "request admitted"
        );

        if plan.wants_stream && plan.mode == StreamingMode::Fake {
            return self.run_fake_stream(plan, queue, scope).await;
        }

        if let Err(err) = self.link.send_descriptor(&plan.descriptor).await {
            tracing::warn!(request_id = %request_id, error = %err, "failed to forward descriptor");
            scope.finish(Err(GatewayError::AgentGone)).await;
            return GatewayResponse::error(&GatewayError::AgentGone);
        }

        if plan.wants_stream {
            self.run_real_stream(plan, queue, scope).await
        } else {
            self.run_buffered(plan, queue, scope).await
        }
    }

    /// Real-stream mode: forward upstream SSE frames as they arrive.
    async fn run_real_stream(
        self: &Arc<Self>,
        plan: RequestPlan,
        queue: Arc<MessageQueue>,
        scope: RequestScope,
    ) -> GatewayResponse {
        let first = match queue.dequeue(FIRST_FRAME_TIMEOUT).await {
            Ok(frame) => frame,
            Err(err) => {
                let err = GatewayError::from(err);
                let response = GatewayResponse::error(&err);
                scope.finish(Err(err)).await;
                return response;
            }
        };

        let status = match first {
            QueueFrame::Error { status, message } => {
                let err = GatewayError::Upstream { status, message };
                let response = GatewayResponse::error(&err);
                scope.finish(Err(err)).await;
                return response;
            }
            QueueFrame::ResponseHeaders { status, .. } => status,
            other => {
                tracing::warn!(request_id = %scope.request_id, frame = ?other, "unexpected first frame");
                let err = GatewayError::Upstream {
                    status: 502,
                    message: "unexpected first frame from agent".to_string(),
                };
                let response = GatewayResponse::error(&err);
                scope.finish(Err(err)).await;
                return response;
            }
        };

        let (tx, rx) = mpsc::channel::<Bytes>(32);
        let shape = plan.shape.clone();
        let request_id = scope.request_id.clone();
        tokio::spawn(async move {
            let mut translator = match &shape {
                ResponseShape::Native => None,
                ResponseShape::OpenAi { model } => {
                    Some(StreamTranslator::new(&request_id, model))
                }
            };
            let mut last_finish_reason: Option<String> = None;
            let outcome = loop {
                match queue.dequeue(STREAM_CHUNK_TIMEOUT).await {
                    Ok(QueueFrame::Chunk(data)) => {
                        if let Some(reason) = scan_finish_reason(&data) {
                            last_finish_reason = Some(reason);
                        }
                        let payload = match translator.as_mut() {
                            None => Bytes::from(data),
                            Some(translator) => {
                                let Some(bytes) = translate_sse_block(translator, &data) else {
                                    continue;
                                };
                                bytes
                            }
                        };
                        if tx.send(payload).await.is_err() {
                            break StreamOutcome::ClientGone;
                        }
                    }
                    Ok(QueueFrame::StreamEnd) => break StreamOutcome::Complete,
                    Ok(QueueFrame::Error { status, message }) => {
                        break StreamOutcome::UpstreamError { status, message };
                    }
                    Ok(QueueFrame::ResponseHeaders { .. }) => continue,
                    Err(QueueError::Timeout) => {
                        tracing::warn!(
                            request_id = %request_id,
                            "no chunk for 30s, treating stream as complete"
                        );
                        break StreamOutcome::Complete;
                    }
                    Err(QueueError::Closed) => {
                        break StreamOutcome::UpstreamError {
                            status: 500,
                            message: "agent connection lost".to_string(),
                        };
                    }
                }
            };

            match outcome {
                StreamOutcome::Complete => {
                    if matches!(shape, ResponseShape::OpenAi { .. }) {
                        let _ = tx.send(Bytes::from_static(b"data: [DONE]\n\n")).await;
                    }
                    tracing::info!(
                        request_id = %request_id,
                        finish_reason = last_finish_reason.as_deref().unwrap_or("none"),
                        "stream complete"
                    );
                    scope.finish(Ok(())).await;
                }
                StreamOutcome::ClientGone => {
                    let _ = scope.coordinator.link.send_cancel(&request_id).await;
                    scope.finish(Err(GatewayError::Aborted)).await;
                }
                StreamOutcome::UpstreamError { status, message } => {
                    let _ = tx.send(sse_error_chunk(status, &message)).await;
                    scope
                        .finish(Err(GatewayError::Upstream { status, message }))
                        .await;
                }
            }
        });

        GatewayResponse::sse(status, rx)
    }

    /// Fake-stream mode: non-streaming upstream wrapped in a retry loop,
    /// synthesized as a single SSE chunk plus `[DONE]`.
    async fn run_fake_stream(
        self: &Arc<Self>,
        plan: RequestPlan,
        queue: Arc<MessageQueue>,
        scope: RequestScope,
    ) -> GatewayResponse {
        let (tx, rx) = mpsc::channel::<Bytes>(32);
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let request_id = scope.request_id.clone();
            let max_attempts = coordinator.config.max_retries.max(1);
            let mut last_error: Option<(u16, String)> = None;
            let mut aborted = false;

            'attempts: for attempt in 1..=max_attempts {
                if attempt > 1 {
                    tokio::time::sleep(coordinator.config.retry_delay).await;
                }
                if let Err(err) = coordinator.link.send_descriptor(&plan.descriptor).await {
                    last_error = Some((503, err.to_string()));
                    continue;
                }

                match coordinator
                    .await_first_frame_with_keep_alive(&queue, &tx)
                    .await
                {
                    FirstFrame::ClientGone => {
                        aborted = true;
                        break 'attempts;
                    }
                    FirstFrame::Timeout => {
                        last_error = Some((504, "timed out waiting for upstream".to_string()));
                    }
                    FirstFrame::Closed => {
                        last_error = Some((500, "agent connection lost".to_string()));
                        break 'attempts;
                    }
                    FirstFrame::Error { status, message } => {
                        tracing::warn!(
                            request_id = %request_id,
                            attempt,
                            status,
                            message = %message,
                            "fake-stream attempt failed"
                        );
                        let is_abort = message.contains(crate::error::ABORT_SENTINEL);
                        last_error = Some((status, message));
                        if is_abort {
                            aborted = true;
                            break 'attempts;
                        }
                    }
                    FirstFrame::Headers { status: _ } => {
                        match coordinator.accumulate_body(&queue).await {
                            Ok(body) => {
                                let payload =
                                    render_fake_payload(&plan.shape, &request_id, &body);
                                let sent = tx.send(payload).await.is_ok()
                                    && tx
                                        .send(Bytes::from_static(b"data: [DONE]\n\n"))
                                        .await
                                        .is_ok();
                                if !sent {
                                    aborted = true;
                                    break 'attempts;
                                }
                                scope.finish(Ok(())).await;
                                return;
                            }
                            Err(err) => {
                                last_error = Some((err.client_status(), err.to_string()));
                            }
                        }
                    }
                }
            }

            if aborted {
                let _ = coordinator.link.send_cancel(&request_id).await;
                scope.finish(Err(GatewayError::Aborted)).await;
                return;
            }

            let (status, message) =
                last_error.unwrap_or((502, "no upstream response".to_string()));
            let _ = tx.send(sse_error_chunk(status, &message)).await;
            scope
                .finish(Err(GatewayError::Upstream { status, message }))
                .await;
        });

        GatewayResponse::sse(200, rx)
    }

    /// Buffered mode: accumulate the full body and answer once.
    async fn run_buffered(
        self: &Arc<Self>,
        plan: RequestPlan,
        queue: Arc<MessageQueue>,
        scope: RequestScope,
    ) -> GatewayResponse {
        let result = self.fetch_buffered(&queue).await;
        match result {
            Err(err) => {
                let response = GatewayResponse::error(&err);
                scope.finish(Err(err)).await;
                response
            }
            Ok((status, body)) => {
                let response = render_buffered(&plan.shape, &scope.request_id, status, body);
                scope.finish(Ok(())).await;
                response
            }
        }
    }

    /// First frame + body accumulation shared by buffered mode and the
    /// model list. The descriptor must already have been forwarded.
    async fn fetch_buffered(
        &self,
        queue: &Arc<MessageQueue>,
    ) -> Result<(u16, String), GatewayError> {
        let status = match queue.dequeue(FIRST_FRAME_TIMEOUT).await? {
            QueueFrame::ResponseHeaders { status, .. } => status,
            QueueFrame::Error { status, message } => {
                return Err(GatewayError::Upstream { status, message });
            }
            _ => {
                return Err(GatewayError::Upstream {
                    status: 502,
                    message: "unexpected first frame from agent".to_string(),
                });
            }
        };
        let body = self.accumulate_body(queue).await?;
        Ok((status, body))
    }

    async fn accumulate_body(&self, queue: &Arc<MessageQueue>) -> Result<String, GatewayError> {
        let mut body = String::new();
        loop {
            match queue.dequeue(BODY_FRAME_TIMEOUT).await? {
                QueueFrame::Chunk(data) => body.push_str(&data),
                QueueFrame::StreamEnd => return Ok(body),
                QueueFrame::Error { status, message } => {
                    return Err(GatewayError::Upstream { status, message });
                }
                QueueFrame::ResponseHeaders { .. } => continue,
            }
        }
    }

    async fn await_first_frame_with_keep_alive(
        &self,
        queue: &Arc<MessageQueue>,
        tx: &mpsc::Sender<Bytes>,
    ) -> FirstFrame {
        let deadline = tokio::time::Instant::now() + FIRST_FRAME_TIMEOUT;
        let mut ticker = tokio::time::interval(KEEP_ALIVE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return FirstFrame::Timeout;
            }
            tokio::select! {
                frame = queue.dequeue(remaining) => {
                    return match frame {
                        Ok(QueueFrame::ResponseHeaders { status, .. }) => {
                            FirstFrame::Headers { status }
                        }
                        Ok(QueueFrame::Error { status, message }) => {
                            FirstFrame::Error { status, message }
                        }
                        Ok(_) => FirstFrame::Error {
                            status: 502,
                            message: "unexpected first frame from agent".to_string(),
                        },
                        Err(QueueError::Timeout) => FirstFrame::Timeout,
                        Err(QueueError::Closed) => FirstFrame::Closed,
                    };
                }
                _ = ticker.tick() => {
                    if tx.send(Bytes::from_static(KEEP_ALIVE_FRAME)).await.is_err() {
                        return FirstFrame::ClientGone;
                    }
                }
            }
        }
    }

    /// Failure accounting shared by all modes. Abort-sentinel errors never
    /// count; immediate-switch statuses and the failure threshold trigger a
    /// switch before the request fully unwinds.
    async fn handle_outcome(&self, request_id: &str, outcome: Result<(), GatewayError>) {
        match outcome {
            Ok(()) => self.rotation.record_success().await,
            Err(err) if err.is_abort() => {
                tracing::info!(request_id = %request_id, "request aborted by client");
            }
            Err(err) => {
                let status = match &err {
                    GatewayError::Upstream { status, .. } => Some(*status),
                    _ => None,
                };
                tracing::warn!(request_id = %request_id, error = %err, "request failed");
                if let Some(reason) = self.rotation.record_failure(status).await
                    && let Err(switch_err) = self.rotation.switch_now(reason).await
                {
                    tracing::error!(
                        request_id = %request_id,
                        error = %switch_err,
                        "failure-triggered switch did not complete"
                    );
                }
            }
        }
    }
}

enum FirstFrame {
    Headers { status: u16 },
    Error { status: u16, message: String },
    Timeout,
    Closed,
    ClientGone,
}

enum StreamOutcome {
    Complete,
    ClientGone,
    UpstreamError { status: u16, message: String },
}

/// Guaranteed-release scope: exactly one `finish` per admitted request.
struct RequestScope {
    coordinator: Arc<RequestCoordinator>,
    request_id: String,
}

impl RequestScope {
    async fn finish(self, outcome: Result<(), GatewayError>) {
        self.coordinator.link.close_queue(&self.request_id);
        self.coordinator
            .handle_outcome(&self.request_id, outcome)
            .await;
        self.coordinator.rotation.release().await;
    }
}

fn adapter_error_response(err: AdapterError) -> GatewayResponse {
    GatewayResponse::error(&GatewayError::BadRequest(err.to_string()))
}

fn is_generative_path(path: &str) -> bool {
    path.contains(":generateContent") || path.contains(":streamGenerateContent")
}

fn new_request_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("{millis}-{:08x}", rand::random::<u32>())
}

/// Remember the latest finishReason seen in raw stream text for logging.
fn scan_finish_reason(data: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r#""finishReason"\s*:\s*"([A-Z_]+)""#).unwrap());
    re.captures_iter(data)
        .last()
        .map(|captures| captures[1].to_string())
}

/// Run every SSE data line in an upstream block through the translator and
/// re-frame the results.
fn translate_sse_block(translator: &mut StreamTranslator, data: &str) -> Option<Bytes> {
    let mut out = String::new();
    for line in data.lines() {
        let payload = line.strip_prefix("data:").map(str::trim_start).unwrap_or(line);
        if payload.is_empty() || payload.starts_with(':') {
            continue;
        }
        if let Some(chunk) = translator.translate_data(payload)
            && let Ok(encoded) = serde_json::to_string(&chunk)
        {
            out.push_str("data: ");
            out.push_str(&encoded);
            out.push_str("\n\n");
        }
    }
    (!out.is_empty()).then(|| Bytes::from(out))
}

fn render_fake_payload(shape: &ResponseShape, request_id: &str, body: &str) -> Bytes {
    match shape {
        ResponseShape::Native => {
            // Upstream pretty-prints JSON; SSE data lines must not contain
            // raw newlines, so re-serialize compactly.
            let compact = serde_json::from_str::<serde_json::Value>(body)
                .map(|value| value.to_string())
                .unwrap_or_else(|_| body.replace('\n', ""));
            Bytes::from(format!("data: {compact}\n\n"))
        }
        ResponseShape::OpenAi { model } => {
            let mut translator = StreamTranslator::new(request_id, model);
            match translator.translate_data(body) {
                Some(chunk) => match serde_json::to_string(&chunk) {
                    Ok(encoded) => Bytes::from(format!("data: {encoded}\n\n")),
                    Err(_) => Bytes::from_static(b"data: {}\n\n"),
                },
                None => Bytes::from_static(b"data: {}\n\n"),
            }
        }
    }
}

fn render_buffered(
    shape: &ResponseShape,
    request_id: &str,
    status: u16,
    body: String,
) -> GatewayResponse {
    match shape {
        ResponseShape::Native => {
            match serde_json::from_str::<serde_json::Value>(&body) {
                Ok(mut value) => {
                    let rewritten = inline_images(&mut value);
                    let body = if rewritten {
                        value.to_string()
                    } else {
                        body
                    };
                    GatewayResponse::json(status, body)
                }
                // Pass non-JSON upstream bodies through untouched.
                Err(_) => GatewayResponse {
                    status,
                    headers: Vec::new(),
                    body: GatewayBody::Bytes(Bytes::from(body)),
                },
            }
        }
        ResponseShape::OpenAi { model } => {
            match serde_json::from_str::<GenerateContentResponse>(&body) {
                Ok(response) => {
                    let completion = gemini_to_chat_completion(&response, request_id, model);
                    match serde_json::to_string(&completion) {
                        Ok(body) => GatewayResponse::json(status, body),
                        Err(err) => GatewayResponse::error(&GatewayError::Upstream {
                            status: 502,
                            message: format!("failed to encode completion: {err}"),
                        }),
                    }
                }
                Err(err) => GatewayResponse::error(&GatewayError::Upstream {
                    status: 502,
                    message: format!("failed to decode upstream response: {err}"),
                }),
            }
        }
    }
}

/// Force `generationConfig.thinkingConfig.includeThoughts` into a
/// Google-native body (operator native-reasoning toggle).
fn inject_thinking_config(body: Bytes) -> Bytes {
    let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(&body) else {
        return body;
    };
    let Some(object) = value.as_object_mut() else {
        return body;
    };
    let config = object
        .entry("generationConfig")
        .or_insert_with(|| serde_json::json!({}));
    if let Some(config) = config.as_object_mut() {
        config.insert(
            "thinkingConfig".to_string(),
            serde_json::json!({ "includeThoughts": true }),
        );
    }
    Bytes::from(value.to_string())
}
