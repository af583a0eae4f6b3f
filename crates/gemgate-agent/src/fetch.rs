//! Upstream execution: the attempt loop, response framing, and the
//! auto-resume loop around both.

use std::collections::BTreeMap;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use gemgate_protocol::control::{AgentEvent, RequestDescriptor, WireStreamingMode};
use gemgate_protocol::sse::SseParser;

use crate::resume::{ScanOutcome, append_model_turn, scan_event};
use crate::session::Session;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const MAX_ATTEMPTS: u32 = 3;
const ATTEMPT_DELAY: Duration = Duration::from_secs(2);
const FIRST_BYTE_TIMEOUT: Duration = Duration::from_secs(600);
const ABORT_MESSAGE: &str = "fetch failed: user aborted";

const STRIPPED_HEADERS: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "origin",
    "referer",
    "user-agent",
];

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub connect_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

pub struct Upstream {
    client: wreq::Client,
    config: UpstreamConfig,
}

impl Upstream {
    pub fn new(config: UpstreamConfig) -> Result<Self, wreq::Error> {
        let client = wreq::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self { client, config })
    }
}

/// Execute one request descriptor end to end, emitting control-channel
/// events. Always terminates the stream with exactly one of `stream_close`
/// or `error`; `response_headers` is emitted at most once even across
/// resumed attempts.
pub async fn run_request(
    upstream: &Upstream,
    session: Option<Session>,
    descriptor: RequestDescriptor,
    events: mpsc::Sender<AgentEvent>,
    cancel: CancellationToken,
) {
    let request_id = descriptor.request_id.clone();

    let mut path = descriptor.path.clone();
    let mut query = descriptor.query_params.clone();
    if descriptor.streaming_mode == WireStreamingMode::Fake {
        rewrite_for_fake(&mut path, &mut query);
    }

    let mut body = descriptor.body.clone();
    if let Some(existing) = body.take() {
        body = Some(filter_image_model_body(&path, existing));
    }

    let headers = sanitize_headers(&descriptor.headers);
    let resume_active = descriptor.resume_on_prohibit
        && descriptor.streaming_mode == WireStreamingMode::Real
        && descriptor.client_wants_stream;

    let mut headers_sent = false;
    let mut resume_attempts = 0u32;

    'resume: loop {
        let response = match attempt_loop(
            upstream,
            &path,
            &query,
            &descriptor.method,
            &headers,
            session.as_ref(),
            body.as_deref(),
            &cancel,
        )
        .await
        {
            Ok(response) => response,
            Err(FetchOutcome::Cancelled) => {
                emit_abort(&events, &request_id).await;
                return;
            }
            Err(FetchOutcome::Failed { status, message }) => {
                let _ = events
                    .send(AgentEvent::Error {
                        request_id,
                        status,
                        message,
                    })
                    .await;
                return;
            }
        };

        let status = response.status().as_u16();
        if !headers_sent {
            headers_sent = true;
            let _ = events
                .send(AgentEvent::ResponseHeaders {
                    request_id: request_id.clone(),
                    status,
                    headers: response_headers(&response),
                })
                .await;
        }

        let mut stream = response.bytes_stream();
        let mut decoder = Utf8Stream::default();
        let mut parser = SseParser::new();
        let mut accumulated = String::new();
        let mut first_byte = true;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    emit_abort(&events, &request_id).await;
                    return;
                }
                next = async {
                    // Idle timeout runs from dispatch until the first body
                    // byte only.
                    if first_byte {
                        match tokio::time::timeout(FIRST_BYTE_TIMEOUT, stream.next()).await {
                            Ok(item) => item.map(|item| item.map_err(Some)),
                            Err(_) => Some(Err(None)),
                        }
                    } else {
                        stream.next().await.map(|item| item.map_err(Some))
                    }
                } => next,
            };

            match next {
                None => break,
                Some(Err(None)) => {
                    let _ = events
                        .send(AgentEvent::Error {
                            request_id,
                            status: 504,
                            message: "upstream idle timeout".to_string(),
                        })
                        .await;
                    return;
                }
                Some(Err(Some(err))) => {
                    tracing::warn!(request_id = %request_id, error = %err, "upstream body read failed");
                    break;
                }
                Some(Ok(chunk)) => {
                    first_byte = false;
                    let text = decoder.push(&chunk);
                    if text.is_empty() {
                        continue;
                    }
                    if !resume_active {
                        let _ = events
                            .send(AgentEvent::Chunk {
                                request_id: request_id.clone(),
                                data: text,
                            })
                            .await;
                        continue;
                    }
                    for event in parser.push_str(&text) {
                        match scan_event(&event.data, &mut accumulated) {
                            ScanOutcome::Forward => {
                                let _ = events
                                    .send(AgentEvent::Chunk {
                                        request_id: request_id.clone(),
                                        data: format!("data: {}\n\n", event.data),
                                    })
                                    .await;
                            }
                            ScanOutcome::ResumeTruncation => {
                                resume_attempts += 1;
                                if resume_attempts > descriptor.resume_limit {
                                    tracing::info!(
                                        request_id = %request_id,
                                        attempts = resume_attempts - 1,
                                        "resume budget exhausted, ending stream"
                                    );
                                    let _ = events
                                        .send(AgentEvent::StreamClose { request_id })
                                        .await;
                                    return;
                                }
                                let Some(edited) = body
                                    .as_deref()
                                    .and_then(|raw| append_model_turn(raw, &accumulated))
                                else {
                                    tracing::warn!(
                                        request_id = %request_id,
                                        "cannot edit body for resume, ending stream"
                                    );
                                    let _ = events
                                        .send(AgentEvent::StreamClose { request_id })
                                        .await;
                                    return;
                                };
                                tracing::info!(
                                    request_id = %request_id,
                                    attempt = resume_attempts,
                                    carried_chars = accumulated.len(),
                                    "prohibited-content truncation, re-dispatching with context"
                                );
                                body = Some(edited);
                                continue 'resume;
                            }
                        }
                    }
                }
            }
        }

        if resume_active {
            for event in parser.finish() {
                if scan_event(&event.data, &mut accumulated) == ScanOutcome::Forward {
                    let _ = events
                        .send(AgentEvent::Chunk {
                            request_id: request_id.clone(),
                            data: format!("data: {}\n\n", event.data),
                        })
                        .await;
                }
            }
        }

        let _ = events.send(AgentEvent::StreamClose { request_id }).await;
        return;
    }
}

enum FetchOutcome {
    Cancelled,
    Failed { status: u16, message: String },
}

/// Inner attempt loop: retry transport errors and retryable 5xx statuses,
/// fail fast on everything else.
#[allow(clippy::too_many_arguments)]
async fn attempt_loop(
    upstream: &Upstream,
    path: &str,
    query: &BTreeMap<String, String>,
    method: &str,
    headers: &[(String, String)],
    session: Option<&Session>,
    body: Option<&str>,
    cancel: &CancellationToken,
) -> Result<wreq::Response, FetchOutcome> {
    let url = build_url(&upstream.config.base_url, path, query);
    let method = wreq::Method::from_bytes(method.as_bytes()).unwrap_or(wreq::Method::POST);
    let mut last: Option<(u16, String)> = None;

    for attempt in 1..=MAX_ATTEMPTS {
        if attempt > 1 {
            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchOutcome::Cancelled),
                _ = tokio::time::sleep(ATTEMPT_DELAY) => {}
            }
        }

        let mut builder = upstream.client.request(method.clone(), &url);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        if let Some(session) = session {
            builder = builder.header("cookie", session.cookie_header());
        }
        if let Some(body) = body {
            builder = builder.body(body.to_string());
        }

        let sent = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchOutcome::Cancelled),
            sent = builder.send() => sent,
        };

        match sent {
            Err(err) => {
                tracing::warn!(attempt, error = %err, "upstream request failed");
                last = Some((502, err.to_string()));
            }
            Ok(response) => {
                let status = response.status().as_u16();
                if (200..300).contains(&status) {
                    return Ok(response);
                }
                let message = response.text().await.unwrap_or_default();
                if !is_retryable_status(status) {
                    return Err(FetchOutcome::Failed { status, message });
                }
                tracing::warn!(attempt, status, "retryable upstream status");
                last = Some((status, message));
            }
        }
    }

    let (status, message) = last.unwrap_or((502, "upstream unreachable".to_string()));
    Err(FetchOutcome::Failed { status, message })
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 500 | 502 | 503 | 504)
}

async fn emit_abort(events: &mpsc::Sender<AgentEvent>, request_id: &str) {
    let _ = events
        .send(AgentEvent::Error {
            request_id: request_id.to_string(),
            status: 499,
            message: ABORT_MESSAGE.to_string(),
        })
        .await;
}

fn response_headers(response: &wreq::Response) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            out.insert(name.as_str().to_string(), value.to_string());
        }
    }
    out
}

pub fn build_url(base: &str, path: &str, query: &BTreeMap<String, String>) -> String {
    let mut url = format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'));
    if !query.is_empty() {
        let encoded: Vec<String> = query
            .iter()
            .map(|(k, v)| format!("{}={}", urlencode(k), urlencode(v)))
            .collect();
        url.push('?');
        url.push_str(&encoded.join("&"));
    }
    url
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Drop hop-by-hop and browser-identity headers before the outbound call.
pub fn sanitize_headers(headers: &BTreeMap<String, String>) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            let name = name.to_ascii_lowercase();
            !STRIPPED_HEADERS.contains(&name.as_str()) && !name.starts_with("sec-fetch-")
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Fake mode runs a non-streaming upstream call: rewrite the action and
/// drop the SSE framing hint.
pub fn rewrite_for_fake(path: &mut String, query: &mut BTreeMap<String, String>) {
    if let Some(rewritten) = path.strip_suffix(":streamGenerateContent") {
        *path = format!("{rewritten}:generateContent");
    }
    if query.get("alt").is_some_and(|v| v == "sse") {
        query.remove("alt");
    }
}

/// Image-generation models reject tool and thinking fields; strip them.
pub fn filter_image_model_body(path: &str, body: String) -> String {
    if !is_image_model_path(path) {
        return body;
    }
    let Ok(mut value) = serde_json::from_str::<serde_json::Value>(&body) else {
        return body;
    };
    let Some(object) = value.as_object_mut() else {
        return body;
    };
    object.remove("tool_config");
    object.remove("toolConfig");
    object.remove("toolChoice");
    object.remove("tools");
    if let Some(config) = object
        .get_mut("generationConfig")
        .and_then(serde_json::Value::as_object_mut)
    {
        config.remove("thinkingConfig");
    }
    value.to_string()
}

fn is_image_model_path(path: &str) -> bool {
    path.contains("-image-") || path.contains("imagen")
}

/// Streaming UTF-8 decoder: incomplete trailing sequences carry over to
/// the next chunk instead of being replaced.
#[derive(Debug, Default)]
pub struct Utf8Stream {
    carry: Vec<u8>,
}

impl Utf8Stream {
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.carry.extend_from_slice(chunk);
        match std::str::from_utf8(&self.carry) {
            Ok(text) => {
                let text = text.to_string();
                self.carry.clear();
                text
            }
            Err(err) => {
                let valid = err.valid_up_to();
                let text = String::from_utf8_lossy(&self.carry[..valid]).into_owned();
                self.carry.drain(..valid);
                // A hard error mid-buffer would stall forever; only keep a
                // short tail that can still become a valid sequence.
                if self.carry.len() > 4 {
                    let tail = self.carry.split_off(self.carry.len() - 4);
                    self.carry = tail;
                }
                text
            }
        }
    }
}
