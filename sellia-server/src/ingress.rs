//! Public HTTP/WebSocket ingress: the side the outside world talks to.
//!
//! Grounded in the teacher's `routes/ingress.rs` - subdomain extraction from
//! `Host`, the mpsc-fed streaming bridge for request/response bodies, and
//! the two-cooperating-tasks WebSocket bridge all carry over. What's new is
//! that every exchange is addressed by `request_id` through the pending
//! stores instead of assuming a single local target per process.

use crate::gateway::WSGateway;
use crate::pending::{ResponseEvent, WebSocketEvent};
use crate::registry::Tunnel;
use axum::body::{Body, Bytes};
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, Request, State};
use axum::http::{header, request::Parts, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum_extra::extract::Host;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use sellia_protocol::{opcode, ControlMessage, HeaderMap as ProtoHeaderMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::warn;

const MAX_CHUNK_SIZE: usize = 8 * 1024;
const RESPONSE_HEADERS_TIMEOUT: Duration = Duration::from_secs(30);
const WEBSOCKET_UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "proxy-authorization",
    "proxy-authenticate",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

fn to_protocol_headers(headers: &axum::http::HeaderMap) -> ProtoHeaderMap {
    let mut map = ProtoHeaderMap::new();
    for (name, value) in headers.iter() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            map.entry(name.as_str().to_string()).or_default().push(value.to_string());
        }
    }
    map
}

fn from_protocol_headers(headers: &ProtoHeaderMap) -> axum::http::HeaderMap {
    let mut out = axum::http::HeaderMap::new();
    for (name, values) in headers {
        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        for value in values {
            if let Ok(header_value) = HeaderValue::from_str(value) {
                out.append(header_name.clone(), header_value);
            }
        }
    }
    out
}

/// Extract the subdomain label from a `Host` header, given the base domain
/// the server is configured for. Returns `None` for the bare base domain or
/// a host with more than one label in front of it.
pub fn extract_subdomain(host: &str, base_domain: &str) -> Option<String> {
    let host = host.split(':').next().unwrap_or(host).to_ascii_lowercase();
    let base_domain = base_domain.to_ascii_lowercase();
    if host == base_domain {
        return None;
    }
    let suffix = format!(".{base_domain}");
    host.strip_suffix(suffix.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty() && !s.contains('.'))
}

/// The first protocol of a comma-separated `Sec-WebSocket-Protocol` value -
/// the one to echo back to the public peer in the 101 response.
fn first_protocol(headers: &ProtoHeaderMap) -> Option<String> {
    headers.get("sec-websocket-protocol").and_then(|values| {
        values
            .iter()
            .find_map(|v| v.split(',').map(str::trim).find(|s| !s.is_empty()))
            .map(|s| s.to_string())
    })
}

fn is_websocket_upgrade(headers: &axum::http::HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

fn check_basic_auth(headers: &axum::http::HeaderMap, expected: &str) -> bool {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return false;
    };
    let Ok(value) = value.to_str() else { return false };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    String::from_utf8(decoded).map(|s| s == expected).unwrap_or(false)
}

pub async fn health_check(State(gateway): State<Arc<WSGateway>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "tunnels": gateway.registry.active_tunnel_count(),
    }))
}

#[derive(Debug, serde::Deserialize)]
pub struct VerifyQuery {
    domain: String,
}

/// Used by an edge reverse proxy to decide, for an on-demand TLS cert
/// request, whether `domain` is the base domain or maps to a live tunnel.
pub async fn verify_tunnel(
    State(gateway): State<Arc<WSGateway>>,
    Query(query): Query<VerifyQuery>,
) -> impl IntoResponse {
    if query.domain.eq_ignore_ascii_case(gateway.base_domain()) {
        return StatusCode::OK;
    }
    match extract_subdomain(&query.domain, gateway.base_domain()) {
        Some(subdomain) if gateway.registry.find_by_subdomain(&subdomain).is_some() => StatusCode::OK,
        _ => StatusCode::NOT_FOUND,
    }
}

/// The fallback handler for everything that isn't `/health` or `/tunnel/verify`.
pub async fn ingress_handler(State(gateway): State<Arc<WSGateway>>, Host(host): Host, req: Request) -> Response {
    let Some(subdomain) = extract_subdomain(&host, gateway.base_domain()) else {
        return (StatusCode::NOT_FOUND, "no tunnel at this host").into_response();
    };
    let Some(tunnel) = gateway.registry.find_by_subdomain(&subdomain) else {
        return (StatusCode::NOT_FOUND, "Tunnel not found").into_response();
    };
    if !gateway.is_client_connected(&tunnel.client_id) {
        return (StatusCode::BAD_GATEWAY, "tunnel is offline").into_response();
    }
    if let Some(expected) = &tunnel.basic_auth {
        if !check_basic_auth(req.headers(), expected) {
            let mut response = (StatusCode::UNAUTHORIZED, "authentication required").into_response();
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Basic realm=\"Sellia\""));
            return response;
        }
    }
    if !gateway.rate_limiter.allow_request(&tunnel.tunnel_id) {
        return (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response();
    }

    let (mut parts, body) = req.into_parts();
    if is_websocket_upgrade(&parts.headers) {
        match WebSocketUpgrade::from_request_parts(&mut parts, &gateway).await {
            Ok(ws) => handle_ws_upgrade(gateway, tunnel, parts, ws).await,
            Err(rejection) => rejection.into_response(),
        }
    } else {
        handle_http_request(gateway, tunnel, parts, body).await
    }
}

async fn stream_request_body(gateway: Arc<WSGateway>, client_id: String, request_id: String, body: Body) {
    let mut data_stream = body.into_data_stream();
    loop {
        match data_stream.next().await {
            Some(Ok(bytes)) => {
                for piece in bytes.chunks(MAX_CHUNK_SIZE) {
                    let chunk = ControlMessage::RequestBody {
                        request_id: request_id.clone(),
                        chunk: piece.to_vec(),
                        is_final: false,
                    };
                    if gateway.send_to_client(&client_id, chunk).await.is_err() {
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                warn!(request_id, error = %e, "error reading request body");
                break;
            }
            None => break,
        }
    }
    let _ = gateway
        .send_to_client(
            &client_id,
            ControlMessage::RequestBody {
                request_id,
                chunk: Vec::new(),
                is_final: true,
            },
        )
        .await;
}

async fn handle_http_request(gateway: Arc<WSGateway>, tunnel: Tunnel, parts: Parts, body: Body) -> Response {
    let request_id = sellia_protocol::new_id();
    let headers = to_protocol_headers(&parts.headers);
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());

    let mut rx = gateway
        .pending_requests
        .register(request_id.clone(), tunnel.tunnel_id.clone());

    let start = ControlMessage::RequestStart {
        request_id: request_id.clone(),
        tunnel_id: tunnel.tunnel_id.clone(),
        method: parts.method.to_string(),
        path,
        headers,
    };
    if gateway.send_to_client(&tunnel.client_id, start).await.is_err() {
        gateway.pending_requests.remove(&request_id);
        return (StatusCode::BAD_GATEWAY, "tunnel is offline").into_response();
    }

    tokio::spawn(stream_request_body(
        gateway.clone(),
        tunnel.client_id.clone(),
        request_id.clone(),
        body,
    ));

    let (status_code, resp_headers) = match timeout(RESPONSE_HEADERS_TIMEOUT, rx.recv()).await {
        Ok(Some(ResponseEvent::Start { status_code, headers })) => (status_code, headers),
        Ok(Some(ResponseEvent::Failed)) | Ok(None) => {
            gateway.pending_requests.remove(&request_id);
            return (StatusCode::BAD_GATEWAY, "tunnel closed before responding").into_response();
        }
        Ok(Some(_)) => {
            gateway.pending_requests.remove(&request_id);
            return (StatusCode::BAD_GATEWAY, "tunnel sent an out-of-order response").into_response();
        }
        Err(_) => {
            gateway.pending_requests.remove(&request_id);
            return (StatusCode::GATEWAY_TIMEOUT, "Gateway timeout").into_response();
        }
    };

    let body_stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Some(ResponseEvent::Body(chunk)) => yield Ok::<_, std::io::Error>(Bytes::from(chunk)),
                Some(ResponseEvent::End) | Some(ResponseEvent::Failed) | None => break,
                Some(ResponseEvent::Start { .. }) => break,
            }
        }
    };

    let mut response = Response::new(Body::from_stream(body_stream));
    *response.status_mut() = StatusCode::from_u16(status_code).unwrap_or(StatusCode::BAD_GATEWAY);
    *response.headers_mut() = from_protocol_headers(&resp_headers);
    response
}

async fn handle_ws_upgrade(gateway: Arc<WSGateway>, tunnel: Tunnel, parts: Parts, ws: WebSocketUpgrade) -> Response {
    let request_id = sellia_protocol::new_id();
    let headers = to_protocol_headers(&parts.headers);
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());

    let mut rx = gateway
        .pending_sockets
        .register(request_id.clone(), tunnel.client_id.clone());

    let upgrade = ControlMessage::WebSocketUpgrade {
        request_id: request_id.clone(),
        tunnel_id: tunnel.tunnel_id.clone(),
        path,
        headers,
    };
    if gateway.send_to_client(&tunnel.client_id, upgrade).await.is_err() {
        gateway.pending_sockets.remove(&request_id);
        return (StatusCode::BAD_GATEWAY, "tunnel is offline").into_response();
    }

    let selected_protocol = match timeout(WEBSOCKET_UPGRADE_TIMEOUT, rx.recv()).await {
        Ok(Some(WebSocketEvent::UpgradeOk { headers })) => first_protocol(&headers),
        Ok(Some(WebSocketEvent::UpgradeError { status_code, message })) => {
            gateway.pending_sockets.remove(&request_id);
            let status = StatusCode::from_u16(status_code).unwrap_or(StatusCode::BAD_GATEWAY);
            return (status, message).into_response();
        }
        Ok(Some(_)) | Ok(None) => {
            gateway.pending_sockets.remove(&request_id);
            return (StatusCode::BAD_GATEWAY, "tunnel rejected websocket upgrade").into_response();
        }
        Err(_) => {
            gateway.pending_sockets.remove(&request_id);
            return (StatusCode::GATEWAY_TIMEOUT, "tunnel did not answer websocket upgrade").into_response();
        }
    };

    let ws = match selected_protocol {
        Some(protocol) => ws.protocols([protocol]),
        None => ws,
    };

    let client_id = tunnel.client_id.clone();
    ws.on_upgrade(move |socket| bridge_websocket(gateway, client_id, request_id, socket, rx))
}

fn message_to_opcode_payload(msg: &Message) -> Option<(u8, Vec<u8>)> {
    match msg {
        Message::Text(s) => Some((opcode::TEXT, s.as_bytes().to_vec())),
        Message::Binary(b) => Some((opcode::BINARY, b.to_vec())),
        Message::Ping(b) => Some((opcode::PING, b.to_vec())),
        Message::Pong(b) => Some((opcode::PONG, b.to_vec())),
        Message::Close(_) => None,
    }
}

fn opcode_payload_to_message(opcode: u8, payload: Vec<u8>) -> Option<Message> {
    match opcode {
        self::opcode::TEXT => String::from_utf8(payload).ok().map(|s| Message::Text(s.into())),
        self::opcode::BINARY => Some(Message::Binary(payload.into())),
        self::opcode::PING => Some(Message::Ping(payload.into())),
        self::opcode::PONG => Some(Message::Pong(payload.into())),
        _ => None,
    }
}

async fn bridge_websocket(
    gateway: Arc<WSGateway>,
    client_id: String,
    request_id: String,
    socket: WebSocket,
    mut rx: mpsc::Receiver<WebSocketEvent>,
) {
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            incoming = stream.next() => {
                let Some(Ok(msg)) = incoming else {
                    let _ = gateway.send_to_client(&client_id, ControlMessage::WebSocketClose {
                        request_id: request_id.clone(), code: None, reason: None,
                    }).await;
                    break;
                };
                match msg {
                    Message::Close(frame) => {
                        let (code, reason) = match frame {
                            Some(f) => (Some(f.code), Some(f.reason.to_string())),
                            None => (None, None),
                        };
                        let _ = gateway.send_to_client(&client_id, ControlMessage::WebSocketClose {
                            request_id: request_id.clone(), code, reason,
                        }).await;
                        break;
                    }
                    other => match message_to_opcode_payload(&other) {
                        Some((opcode, payload)) => {
                            let frame = ControlMessage::WebSocketFrame { request_id: request_id.clone(), opcode, payload };
                            if gateway.send_to_client(&client_id, frame).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = gateway.send_to_client(&client_id, ControlMessage::WebSocketClose {
                                request_id: request_id.clone(), code: None, reason: None,
                            }).await;
                            break;
                        }
                    },
                }
            }
            event = rx.recv() => {
                match event {
                    Some(WebSocketEvent::Frame { opcode, payload }) => {
                        if let Some(msg) = opcode_payload_to_message(opcode, payload) {
                            if sink.send(msg).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(WebSocketEvent::Close { code, reason }) => {
                        let frame = code.map(|code| CloseFrame { code, reason: reason.unwrap_or_default().into() });
                        let _ = sink.send(Message::Close(frame)).await;
                        break;
                    }
                    Some(WebSocketEvent::Failed) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    Some(_) => {}
                }
            }
        }
    }
    gateway.pending_sockets.remove(&request_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_single_label_subdomain() {
        assert_eq!(extract_subdomain("acme.sellia.dev", "sellia.dev"), Some("acme".into()));
    }

    #[test]
    fn root_domain_has_no_subdomain() {
        assert_eq!(extract_subdomain("sellia.dev", "sellia.dev"), None);
    }

    #[test]
    fn multi_label_prefix_is_rejected() {
        assert_eq!(extract_subdomain("a.b.sellia.dev", "sellia.dev"), None);
    }

    #[test]
    fn host_port_suffix_is_ignored() {
        assert_eq!(extract_subdomain("acme.sellia.dev:8080", "sellia.dev"), Some("acme".into()));
    }

    #[test]
    fn unrelated_host_has_no_subdomain() {
        assert_eq!(extract_subdomain("example.com", "sellia.dev"), None);
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("x-request-id", HeaderValue::from_static("abc"));
        let proto = to_protocol_headers(&headers);
        assert!(!proto.contains_key("connection"));
        assert!(proto.contains_key("x-request-id"));
    }

    #[test]
    fn basic_auth_accepts_matching_credentials() {
        let mut headers = axum::http::HeaderMap::new();
        let encoded = base64::engine::general_purpose::STANDARD.encode("user:pass");
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {encoded}")).unwrap(),
        );
        assert!(check_basic_auth(&headers, "user:pass"));
        assert!(!check_basic_auth(&headers, "user:wrong"));
    }

    #[test]
    fn basic_auth_rejects_missing_header() {
        let headers = axum::http::HeaderMap::new();
        assert!(!check_basic_auth(&headers, "user:pass"));
    }
}
