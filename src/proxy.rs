use crate::constants::{CORS_ALLOW_HEADERS, CORS_ALLOW_METHODS, CORS_ALLOW_ORIGIN};
use crate::hub::DebugHub;
use crate::logging::RequestId;
use crate::sanitizer::decode_body;
use crate::types::{LogEntry, RelayError};
use axum::body::{Body, HttpBody};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::net::SocketAddr;

/// Headers that describe the inbound hop and are never forwarded as-is.
const HOP_HEADERS: &[HeaderName] = &[
    header::HOST,
    header::CONNECTION,
    header::UPGRADE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
];

pub struct ProxyForwarder {
    client: reqwest::Client,
    capture_always: bool,
    max_body_size: usize,
}

impl ProxyForwarder {
    pub fn new(client: reqwest::Client, capture_always: bool, max_body_size: usize) -> Self {
        Self {
            client,
            capture_always,
            max_body_size,
        }
    }

    /// Sends `request` to the current target, keeping method, path, query,
    /// headers (minus `Host`) and body. Bodies are buffered, captured and
    /// logged while debug mode is on, or always under the capture-always
    /// policy; otherwise they are streamed.
    pub async fn forward(&self, hub: &DebugHub, request: Request<Body>, client_ip: String) -> Response {
        let target = hub.control.target_url();
        let (parts, body) = request.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let upstream_url = format!("{}{}", target, path);

        let count = hub.control.record_request();
        let debug_on = hub.control.is_enabled();
        tracing::debug!(
            method = %parts.method,
            url = %upstream_url,
            count,
            capture = debug_on || self.capture_always,
            "Forwarding request"
        );

        if !(debug_on || self.capture_always) {
            return self.pass_through(hub, parts, body, &upstream_url).await;
        }

        let request_bytes = match self.read_body(body).await {
            Ok(bytes) => bytes,
            Err(err) => return fail(hub, debug_on, &parts.method, &upstream_url, err),
        };
        let headers = outbound_headers(&parts.headers);
        let outbound = self.outbound(&parts.method, &upstream_url, &headers, &request_bytes);

        let upstream = match outbound.send().await {
            Ok(resp) => resp,
            Err(e) => return fail(hub, debug_on, &parts.method, &upstream_url, e.into()),
        };
        let status = upstream.status();
        let response_headers = upstream.headers().clone();
        let response_bytes = match upstream.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => return fail(hub, debug_on, &parts.method, &upstream_url, e.into()),
        };

        let mut entry = LogEntry::new(parts.method.as_str(), upstream_url.as_str(), path);
        entry.headers = headers_to_map(&headers);
        entry.request_body = decode_body(&request_bytes);
        entry.response_body = Some(decode_body(&response_bytes));
        entry.response_status = Some(status.as_u16());
        entry.client_ip = client_ip;
        let id = hub.record_exchange(entry);
        let request_id = parts
            .extensions
            .get::<RequestId>()
            .map(|r| r.0.as_str())
            .unwrap_or("-");
        tracing::info!(
            %id,
            request_id,
            status = status.as_u16(),
            url = %upstream_url,
            "Captured exchange"
        );

        let mut response = relay_response(status, &response_headers, Body::from(response_bytes));
        response.headers_mut().remove(header::CONTENT_LENGTH);
        response
    }

    /// Streams both bodies through without buffering or a size limit.
    async fn pass_through(
        &self,
        hub: &DebugHub,
        parts: axum::http::request::Parts,
        body: Body,
        upstream_url: &str,
    ) -> Response {
        let mut headers = outbound_headers(&parts.headers);
        let mut outbound = self
            .client
            .request(parts.method.clone(), upstream_url);
        match body.size_hint().exact() {
            Some(0) => {}
            Some(len) => {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
                outbound = outbound.body(reqwest::Body::wrap_stream(body.into_data_stream()));
            }
            None => {
                outbound = outbound.body(reqwest::Body::wrap_stream(body.into_data_stream()));
            }
        }

        match outbound.headers(headers).send().await {
            Ok(upstream) => {
                let status = upstream.status();
                let headers = upstream.headers().clone();
                relay_response(status, &headers, Body::from_stream(upstream.bytes_stream()))
            }
            Err(e) => fail(hub, false, &parts.method, upstream_url, e.into()),
        }
    }

    async fn read_body(&self, body: Body) -> Result<Bytes, RelayError> {
        axum::body::to_bytes(body, self.max_body_size)
            .await
            .map_err(|e| RelayError::BodyRead(e.to_string()))
    }

    /// The body is sent as one buffer; reqwest sets its length.
    fn outbound(
        &self,
        method: &axum::http::Method,
        url: &str,
        headers: &HeaderMap,
        body: &Bytes,
    ) -> reqwest::RequestBuilder {
        let builder = self.client.request(method.clone(), url).headers(headers.clone());
        if body.is_empty() {
            builder
        } else {
            builder.body(body.clone())
        }
    }
}

fn fail(
    hub: &DebugHub,
    debug_on: bool,
    method: &axum::http::Method,
    url: &str,
    err: RelayError,
) -> Response {
    tracing::error!(
        %method,
        %url,
        span_trace = %tracing_error::SpanTrace::capture(),
        "Proxy request failed: {}",
        err
    );
    if debug_on {
        hub.record_error(
            err.to_string(),
            serde_json::json!({ "method": method.as_str(), "url": url }),
        );
    }
    err.into_response()
}

pub fn outbound_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = inbound.clone();
    for name in HOP_HEADERS {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::TRANSFER_ENCODING);
    headers
}

/// Flattens a header map, joining repeated names with `", "`.
pub fn headers_to_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        map.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    map
}

/// Builds the client-facing response from upstream status and headers, then
/// overlays the CORS headers, replacing any the upstream sent.
pub fn relay_response(status: StatusCode, upstream_headers: &HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in upstream_headers {
        if *name == header::CONNECTION || *name == header::TRANSFER_ENCODING || *name == "keep-alive" {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    apply_cors(headers);
    response
}

pub fn apply_cors(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static(CORS_ALLOW_ORIGIN),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(CORS_ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(CORS_ALLOW_HEADERS),
    );
}

/// First `x-forwarded-for` hop, then `x-real-ip`, then the peer address.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }
    if let Some(ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        return ip.trim().to_string();
    }
    match peer {
        Some(addr) => addr.ip().to_string(),
        None => "unknown".to_string(),
    }
}
