//! Inbound HTTP surface: OpenAI-compatible endpoints plus Google-native
//! passthrough for every other path.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use gemgate_core::{GatewayBody, GatewayResponse, InboundRequest, RequestCoordinator};

#[derive(Clone)]
pub struct ProxyState {
    pub coordinator: Arc<RequestCoordinator>,
    pub api_keys: Arc<Vec<String>>,
}

pub fn proxy_router(state: ProxyState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(openai_chat_completions))
        .route("/v1/models", get(openai_models))
        .fallback(native_passthrough)
        .layer(middleware::from_fn_with_state(state.clone(), proxy_auth))
        .with_state(state)
}

async fn proxy_auth(
    State(state): State<ProxyState>,
    mut req: axum::http::Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let key = extract_api_key(req.headers(), req.uri().query());
    let Some(key) = key else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    if !state.api_keys.iter().any(|expected| expected == &key) {
        return Err(StatusCode::UNAUTHORIZED);
    }

    // Never forward downstream auth material upstream.
    strip_auth_headers(req.headers_mut());
    strip_key_query(req.uri_mut());
    Ok(next.run(req).await)
}

async fn openai_chat_completions(
    State(state): State<ProxyState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = inbound("POST", "/v1/chat/completions", None, &headers, body);
    to_axum_response(state.coordinator.process_openai(request).await)
}

async fn openai_models(State(state): State<ProxyState>) -> Response {
    to_axum_response(state.coordinator.process_model_list().await)
}

async fn native_passthrough(
    State(state): State<ProxyState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = inbound(method.as_str(), uri.path(), uri.query(), &headers, body);
    to_axum_response(state.coordinator.process_request(request).await)
}

fn inbound(
    method: &str,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: Bytes,
) -> InboundRequest {
    InboundRequest {
        method: method.to_string(),
        path: path.to_string(),
        query: parse_query(query),
        headers: headers_to_map(headers),
        body,
    }
}

fn parse_query(query: Option<&str>) -> BTreeMap<String, String> {
    query
        .and_then(|q| serde_urlencoded::from_str::<Vec<(String, String)>>(q).ok())
        .map(|pairs| pairs.into_iter().collect())
        .unwrap_or_default()
}

fn headers_to_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            out.insert(name.as_str().to_string(), value.to_string());
        }
    }
    out
}

fn to_axum_response(response: GatewayResponse) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY));
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in &response.headers {
            if is_hop_by_hop_or_framing_header(name) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }
        if matches!(response.body, GatewayBody::Stream(_)) {
            // Hint reverse proxies not to buffer SSE.
            headers
                .entry(HeaderName::from_static("x-accel-buffering"))
                .or_insert(HeaderValue::from_static("no"));
        }
    }

    let body = match response.body {
        GatewayBody::Bytes(bytes) => Body::from(bytes),
        GatewayBody::Stream(rx) => {
            let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
            Body::from_stream(stream)
        }
    };

    builder.body(body).unwrap_or_else(|_| {
        (StatusCode::INTERNAL_SERVER_ERROR, "response_build_failed").into_response()
    })
}

fn is_hop_by_hop_or_framing_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
        || name.eq_ignore_ascii_case("upgrade")
}

pub(crate) fn extract_api_key(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
    {
        let raw = raw.trim();
        let prefix = "Bearer ";
        if raw.len() > prefix.len() && raw[..prefix.len()].eq_ignore_ascii_case(prefix) {
            let token = raw[prefix.len()..].trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    for name in ["x-goog-api-key", "x-api-key"] {
        if let Some(value) = headers.get(name)
            && let Ok(raw) = value.to_str()
        {
            let raw = raw.trim();
            if !raw.is_empty() {
                return Some(raw.to_string());
            }
        }
    }

    let query = query?;
    let pairs = serde_urlencoded::from_str::<Vec<(String, String)>>(query).ok()?;
    pairs
        .into_iter()
        .find(|(name, _)| name == "key")
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn strip_auth_headers(headers: &mut HeaderMap) {
    headers.remove(header::AUTHORIZATION);
    headers.remove("x-api-key");
    headers.remove("x-goog-api-key");
}

fn strip_key_query(uri: &mut Uri) {
    let Some(query) = uri.query() else { return };
    let Ok(pairs) = serde_urlencoded::from_str::<Vec<(String, String)>>(query) else {
        return;
    };
    let filtered: Vec<(String, String)> =
        pairs.into_iter().filter(|(name, _)| name != "key").collect();
    let new_query = match serde_urlencoded::to_string(&filtered) {
        Ok(encoded) => encoded,
        Err(_) => return,
    };
    let path = uri.path();
    let rebuilt = if new_query.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{new_query}")
    };
    if let Ok(rebuilt) = rebuilt.parse() {
        *uri = rebuilt;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_extraction_order() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        headers.insert("x-api-key", "def".parse().unwrap());
        assert_eq!(extract_api_key(&headers, None).as_deref(), Some("abc"));

        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-key", "goog".parse().unwrap());
        assert_eq!(extract_api_key(&headers, None).as_deref(), Some("goog"));

        let headers = HeaderMap::new();
        assert_eq!(
            extract_api_key(&headers, Some("key=qqq&alt=sse")).as_deref(),
            Some("qqq")
        );
        assert_eq!(extract_api_key(&headers, Some("alt=sse")), None);
    }

    #[test]
    fn key_is_stripped_from_query() {
        let mut uri: Uri = "/v1beta/models?key=secret&alt=sse".parse().unwrap();
        strip_key_query(&mut uri);
        assert_eq!(uri.to_string(), "/v1beta/models?alt=sse");

        let mut uri: Uri = "/v1beta/models?key=secret".parse().unwrap();
        strip_key_query(&mut uri);
        assert_eq!(uri.to_string(), "/v1beta/models");
    }
}
