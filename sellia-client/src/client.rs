//! The outbound forwarder: connects to the relay's control channel, opens a
//! tunnel, and proxies every forwarded exchange to a local target.
//!
//! Grounded in the teacher's `tunnel/client.rs` `run`/`handle_tunnel` shape,
//! generalized from a single hardcoded local port to the path-based
//! [`crate::router::Router`], and from a buffer-the-whole-body forward into
//! a streaming one. The reconnect loop's linear backoff and its refusal to
//! retry on an authentication failure are grounded in `wmsyw-Aether`'s
//! `tunnel/mod.rs` dispatcher loop.

use crate::router::Router;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use sellia_protocol::{opcode, ControlMessage, HeaderMap as ProtoHeaderMap, TunnelType};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const TUNNEL_READY_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const RECONNECT_STEP: Duration = Duration::from_secs(3);
const MAX_CHUNK_SIZE: usize = 8 * 1024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Writer = Arc<Mutex<SplitSink<WsStream, WsMessage>>>;

/// Static forwarder configuration - constructed by the binary entrypoint,
/// not loaded from a config file here.
pub struct ClientConfig {
    pub relay_url: String,
    pub api_key: String,
    pub requested_subdomain: Option<String>,
    pub basic_auth: Option<String>,
    pub router: Router,
}

enum LocalWsEvent {
    Frame(u8, Vec<u8>),
    Close(Option<u16>, Option<String>),
}

enum ReconnectDecision {
    Reconnect,
    Stop,
}

pub struct TunnelClient {
    config: ClientConfig,
    http: reqwest::Client,
}

impl TunnelClient {
    pub fn new(config: ClientConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("building the local-forwarding http client");
        Self { config, http }
    }

    /// Runs until the tunnel is permanently rejected (bad credentials, an
    /// unavailable requested subdomain) or reconnection attempts are exhausted.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut attempt: u32 = 0;
        loop {
            match self.connect_and_serve().await {
                Ok(ReconnectDecision::Stop) => return Ok(()),
                Ok(ReconnectDecision::Reconnect) => {}
                Err(e) => warn!(error = %e, "tunnel connection ended with an error"),
            }

            attempt += 1;
            if attempt > MAX_RECONNECT_ATTEMPTS {
                anyhow::bail!("giving up after {attempt} reconnect attempts");
            }
            let delay = RECONNECT_STEP * attempt;
            info!(attempt, ?delay, "reconnecting to relay");
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect_and_serve(&self) -> anyhow::Result<ReconnectDecision> {
        let (ws_stream, _) = connect_async(&self.config.relay_url).await?;
        let (sink, mut stream) = ws_stream.split();
        let sink: Writer = Arc::new(Mutex::new(sink));

        send(&sink, ControlMessage::Auth { api_key: self.config.api_key.clone() }).await?;

        let auth_reply = recv_control(&mut stream, AUTH_TIMEOUT)
            .await?
            .ok_or_else(|| anyhow::anyhow!("relay closed the connection during authentication"))?;
        match auth_reply {
            ControlMessage::AuthOk { account_id, .. } => info!(account_id, "authenticated with relay"),
            ControlMessage::AuthError { error } => {
                warn!(error, "authentication rejected, not retrying");
                return Ok(ReconnectDecision::Stop);
            }
            other => anyhow::bail!("unexpected message during authentication: {}", other.tag()),
        }

        send(
            &sink,
            ControlMessage::TunnelOpen {
                tunnel_type: TunnelType::Http,
                local_port: 0,
                subdomain: self.config.requested_subdomain.clone(),
                auth: self.config.basic_auth.clone(),
            },
        )
        .await?;

        let ready = recv_control(&mut stream, TUNNEL_READY_TIMEOUT)
            .await?
            .ok_or_else(|| anyhow::anyhow!("relay closed the connection while opening the tunnel"))?;
        match ready {
            ControlMessage::TunnelReady { tunnel_id, url } => info!(tunnel_id, url, "tunnel is live"),
            ControlMessage::TunnelClose { reason, .. } => {
                let permanent = reason.as_deref().map(|r| r.contains("not available")).unwrap_or(false);
                warn!(reason, "tunnel open rejected");
                return Ok(if permanent { ReconnectDecision::Stop } else { ReconnectDecision::Reconnect });
            }
            other => anyhow::bail!("unexpected message while opening tunnel: {}", other.tag()),
        }

        let bodies: Arc<DashMap<String, mpsc::Sender<Option<Vec<u8>>>>> = Arc::new(DashMap::new());
        let sockets: Arc<DashMap<String, mpsc::Sender<LocalWsEvent>>> = Arc::new(DashMap::new());

        while let Some(frame) = stream.next().await {
            let frame = frame?;
            match frame {
                WsMessage::Binary(bytes) => {
                    let message = ControlMessage::from_bytes(&bytes)?;
                    if let ControlMessage::TunnelClose { .. } = message {
                        warn!("relay closed the tunnel");
                        return Ok(ReconnectDecision::Reconnect);
                    }
                    self.dispatch(message, &sink, &bodies, &sockets).await;
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }

        Ok(ReconnectDecision::Reconnect)
    }

    async fn dispatch(
        &self,
        message: ControlMessage,
        sink: &Writer,
        bodies: &Arc<DashMap<String, mpsc::Sender<Option<Vec<u8>>>>>,
        sockets: &Arc<DashMap<String, mpsc::Sender<LocalWsEvent>>>,
    ) {
        match message {
            ControlMessage::RequestStart { request_id, method, path, headers, .. } => {
                self.start_request(request_id, method, path, headers, sink.clone(), bodies.clone());
            }
            ControlMessage::RequestBody { request_id, chunk, is_final } => {
                if let Some(tx) = bodies.get(&request_id) {
                    if !chunk.is_empty() {
                        let _ = tx.send(Some(chunk)).await;
                    }
                    if is_final {
                        let _ = tx.send(None).await;
                    }
                }
                if is_final {
                    bodies.remove(&request_id);
                }
            }
            ControlMessage::WebSocketUpgrade { request_id, path, headers, .. } => {
                self.start_websocket(request_id, path, headers, sink.clone(), sockets.clone()).await;
            }
            ControlMessage::WebSocketFrame { request_id, opcode, payload } => {
                if let Some(tx) = sockets.get(&request_id) {
                    let _ = tx.send(LocalWsEvent::Frame(opcode, payload)).await;
                }
            }
            ControlMessage::WebSocketClose { request_id, code, reason } => {
                if let Some((_, tx)) = sockets.remove(&request_id) {
                    let _ = tx.send(LocalWsEvent::Close(code, reason)).await;
                }
            }
            ControlMessage::Ping { timestamp } => {
                let _ = send(sink, ControlMessage::Pong { timestamp }).await;
            }
            _ => {}
        }
    }

    fn start_request(
        &self,
        request_id: String,
        method: String,
        path: String,
        headers: ProtoHeaderMap,
        sink: Writer,
        bodies: Arc<DashMap<String, mpsc::Sender<Option<Vec<u8>>>>>,
    ) {
        let Some(route) = self.config.router.resolve(&path) else {
            tokio::spawn(async move {
                let body = format!("No route matched path: {path}");
                let _ = send(&sink, ControlMessage::ResponseStart {
                    request_id: request_id.clone(),
                    status_code: 502,
                    headers: ProtoHeaderMap::new(),
                }).await;
                let _ = send(&sink, ControlMessage::ResponseBody {
                    request_id: request_id.clone(),
                    chunk: body.into_bytes(),
                }).await;
                let _ = send(&sink, ControlMessage::ResponseEnd { request_id }).await;
            });
            return;
        };

        debug!(pattern = %route.pattern, "routing request");
        let (body_tx, body_rx) = mpsc::channel(32);
        bodies.insert(request_id.clone(), body_tx);
        let http = self.http.clone();
        tokio::spawn(forward_http_request(
            http, route.host, route.port, sink, request_id, method, path, headers, body_rx,
        ));
    }

    async fn start_websocket(
        &self,
        request_id: String,
        path: String,
        headers: ProtoHeaderMap,
        sink: Writer,
        sockets: Arc<DashMap<String, mpsc::Sender<LocalWsEvent>>>,
    ) {
        let Some(route) = self.config.router.resolve(&path) else {
            send_ignore_err(&sink, ControlMessage::WebSocketUpgradeError {
                request_id,
                status_code: 502,
                message: "no local route matches this path".into(),
            }).await;
            return;
        };
        debug!(pattern = %route.pattern, "routing websocket upgrade");

        let url = format!("ws://{}:{}{}", route.host, route.port, path);
        let selected_protocol = first_protocol(&headers);
        let request = match build_ws_request(&url, &headers) {
            Ok(r) => r,
            Err(e) => {
                send_ignore_err(&sink, ControlMessage::WebSocketUpgradeError {
                    request_id,
                    status_code: 502,
                    message: e.to_string(),
                }).await;
                return;
            }
        };

        match connect_async(request).await {
            Ok((local_stream, _)) => {
                let mut ok_headers = ProtoHeaderMap::new();
                if let Some(protocol) = selected_protocol {
                    ok_headers.insert("sec-websocket-protocol".to_string(), vec![protocol]);
                }
                send_ignore_err(&sink, ControlMessage::WebSocketUpgradeOk {
                    request_id: request_id.clone(),
                    headers: ok_headers,
                }).await;

                let (tx, rx) = mpsc::channel(64);
                sockets.insert(request_id.clone(), tx);
                tokio::spawn(bridge_local_websocket(local_stream, sink, request_id, rx, sockets));
            }
            Err(e) => {
                send_ignore_err(&sink, ControlMessage::WebSocketUpgradeError {
                    request_id,
                    status_code: 502,
                    message: e.to_string(),
                }).await;
            }
        }
    }
}

/// The first protocol of a comma-separated `Sec-WebSocket-Protocol` header
/// value - the one the relay must echo back to the public peer.
fn first_protocol(headers: &ProtoHeaderMap) -> Option<String> {
    headers.get("sec-websocket-protocol").and_then(|values| {
        values
            .iter()
            .find_map(|v| v.split(',').map(str::trim).find(|s| !s.is_empty()))
            .map(|s| s.to_string())
    })
}

fn build_ws_request(
    url: &str,
    headers: &ProtoHeaderMap,
) -> anyhow::Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
    let mut request = url.into_client_request()?;
    for name in ["sec-websocket-protocol", "sec-websocket-extensions", "host", "origin"] {
        let Some(values) = headers.get(name) else { continue };
        let Some(value) = values.first() else { continue };
        request.headers_mut().insert(
            tokio_tungstenite::tungstenite::http::HeaderName::from_bytes(name.as_bytes())?,
            tokio_tungstenite::tungstenite::http::HeaderValue::from_str(value)?,
        );
    }
    Ok(request)
}

async fn forward_http_request(
    http: reqwest::Client,
    host: String,
    port: u16,
    sink: Writer,
    request_id: String,
    method: String,
    path: String,
    headers: ProtoHeaderMap,
    mut body_rx: mpsc::Receiver<Option<Vec<u8>>>,
) {
    let url = format!("http://{host}:{port}{path}");
    let method = reqwest::Method::from_bytes(method.as_bytes()).unwrap_or(reqwest::Method::GET);

    let body_stream = async_stream::stream! {
        while let Some(chunk) = body_rx.recv().await {
            match chunk {
                Some(bytes) => yield Ok::<_, std::io::Error>(Bytes::from(bytes)),
                None => break,
            }
        }
    };

    let request = http
        .request(method, &url)
        .headers(header_map_to_reqwest(&headers))
        .body(reqwest::Body::wrap_stream(body_stream));

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            let (status, body) = if e.is_timeout() {
                (504, "Local service timed out".to_string())
            } else if e.is_connect() {
                (502, "Local service unavailable".to_string())
            } else {
                (500, format!("Local proxy error: {e}"))
            };
            warn!(request_id, error = %e, "local target unreachable");
            let _ = send(&sink, ControlMessage::ResponseStart {
                request_id: request_id.clone(),
                status_code: status,
                headers: ProtoHeaderMap::new(),
            }).await;
            let _ = send(&sink, ControlMessage::ResponseBody {
                request_id: request_id.clone(),
                chunk: body.into_bytes(),
            }).await;
            let _ = send(&sink, ControlMessage::ResponseEnd { request_id }).await;
            return;
        }
    };

    let status_code = response.status().as_u16();
    let resp_headers = reqwest_headers_to_protocol(response.headers());
    if send(&sink, ControlMessage::ResponseStart {
        request_id: request_id.clone(),
        status_code,
        headers: resp_headers,
    }).await.is_err() {
        return;
    }

    let mut byte_stream = response.bytes_stream();
    while let Some(chunk) = byte_stream.next().await {
        match chunk {
            Ok(bytes) => {
                for piece in bytes.chunks(MAX_CHUNK_SIZE) {
                    if send(&sink, ControlMessage::ResponseBody {
                        request_id: request_id.clone(),
                        chunk: piece.to_vec(),
                    }).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(request_id, error = %e, "error reading local response body");
                break;
            }
        }
    }
    let _ = send(&sink, ControlMessage::ResponseEnd { request_id }).await;
}

async fn bridge_local_websocket(
    local_stream: WsStream,
    sink: Writer,
    request_id: String,
    mut rx: mpsc::Receiver<LocalWsEvent>,
    sockets: Arc<DashMap<String, mpsc::Sender<LocalWsEvent>>>,
) {
    let (mut local_sink, mut local_stream) = local_stream.split();
    loop {
        tokio::select! {
            incoming = local_stream.next() => {
                let Some(Ok(msg)) = incoming else {
                    let _ = send(&sink, ControlMessage::WebSocketClose {
                        request_id: request_id.clone(), code: None, reason: None,
                    }).await;
                    break;
                };
                match msg {
                    WsMessage::Close(frame) => {
                        let (code, reason) = match frame {
                            Some(f) => (Some(u16::from(f.code)), Some(f.reason.to_string())),
                            None => (None, None),
                        };
                        let _ = send(&sink, ControlMessage::WebSocketClose {
                            request_id: request_id.clone(), code, reason,
                        }).await;
                        break;
                    }
                    other => match tungstenite_to_opcode(&other) {
                        Some((opcode, payload)) => {
                            if send(&sink, ControlMessage::WebSocketFrame {
                                request_id: request_id.clone(), opcode, payload,
                            }).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = send(&sink, ControlMessage::WebSocketClose {
                                request_id: request_id.clone(), code: None, reason: None,
                            }).await;
                            break;
                        }
                    },
                }
            }
            event = rx.recv() => {
                match event {
                    Some(LocalWsEvent::Frame(opcode, payload)) => {
                        if let Some(msg) = opcode_to_tungstenite(opcode, payload) {
                            if local_sink.send(msg).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(LocalWsEvent::Close(code, reason)) => {
                        let frame = code.map(|code| CloseFrame {
                            code: code.into(),
                            reason: reason.unwrap_or_default().into(),
                        });
                        let _ = local_sink.send(WsMessage::Close(frame)).await;
                        break;
                    }
                    None => {
                        let _ = local_sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }
    sockets.remove(&request_id);
}

fn tungstenite_to_opcode(msg: &WsMessage) -> Option<(u8, Vec<u8>)> {
    match msg {
        WsMessage::Text(s) => Some((opcode::TEXT, s.as_bytes().to_vec())),
        WsMessage::Binary(b) => Some((opcode::BINARY, b.to_vec())),
        WsMessage::Ping(b) => Some((opcode::PING, b.to_vec())),
        WsMessage::Pong(b) => Some((opcode::PONG, b.to_vec())),
        WsMessage::Close(_) | WsMessage::Frame(_) => None,
    }
}

fn opcode_to_tungstenite(opcode: u8, payload: Vec<u8>) -> Option<WsMessage> {
    match opcode {
        self::opcode::TEXT => String::from_utf8(payload).ok().map(WsMessage::Text),
        self::opcode::BINARY => Some(WsMessage::Binary(payload)),
        self::opcode::PING => Some(WsMessage::Ping(payload)),
        self::opcode::PONG => Some(WsMessage::Pong(payload)),
        _ => None,
    }
}

fn header_map_to_reqwest(headers: &ProtoHeaderMap) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::new();
    for (name, values) in headers {
        let Ok(header_name) = reqwest::header::HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        for value in values {
            if let Ok(header_value) = reqwest::header::HeaderValue::from_str(value) {
                out.append(header_name.clone(), header_value);
            }
        }
    }
    out
}

fn reqwest_headers_to_protocol(headers: &reqwest::header::HeaderMap) -> ProtoHeaderMap {
    let mut map = ProtoHeaderMap::new();
    for (name, value) in headers.iter() {
        if let Ok(value) = value.to_str() {
            map.entry(name.as_str().to_string()).or_default().push(value.to_string());
        }
    }
    map
}

async fn send(sink: &Writer, message: ControlMessage) -> anyhow::Result<()> {
    let bytes = message.to_bytes()?;
    let mut guard = sink.lock().await;
    guard.send(WsMessage::Binary(bytes)).await?;
    Ok(())
}

async fn send_ignore_err(sink: &Writer, message: ControlMessage) {
    let _ = send(sink, message).await;
}

async fn recv_control(
    stream: &mut (impl futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin),
    timeout: Duration,
) -> anyhow::Result<Option<ControlMessage>> {
    match tokio::time::timeout(timeout, stream.next()).await {
        Ok(Some(Ok(WsMessage::Binary(bytes)))) => Ok(Some(ControlMessage::from_bytes(&bytes)?)),
        Ok(Some(Ok(_))) => Ok(None),
        Ok(Some(Err(e))) => Err(e.into()),
        Ok(None) => Ok(None),
        Err(_) => anyhow::bail!("timed out waiting for relay response"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_roundtrips_through_tungstenite_messages() {
        let msg = opcode_to_tungstenite(opcode::BINARY, vec![1, 2, 3]).unwrap();
        assert_eq!(tungstenite_to_opcode(&msg), Some((opcode::BINARY, vec![1, 2, 3])));
    }

    #[test]
    fn unknown_opcode_yields_no_message() {
        assert!(opcode_to_tungstenite(0xFF, vec![]).is_none());
    }

    #[test]
    fn header_conversion_round_trips_a_simple_header() {
        let mut headers = ProtoHeaderMap::new();
        headers.insert("x-request-id".into(), vec!["abc".into()]);
        let reqwest_headers = header_map_to_reqwest(&headers);
        let back = reqwest_headers_to_protocol(&reqwest_headers);
        assert_eq!(back.get("x-request-id"), Some(&vec!["abc".to_string()]));
    }
}
