//! The control-channel state machine: one task per connected tunnel client,
//! plus one periodic liveness sweep shared by all of them.
//!
//! Grounded in the teacher's `routes/tunnel.rs` `handle_socket` - the
//! connect/auth/serve/cleanup shape and the `Arc<Mutex<SplitSink>>` writer
//! carry over directly. What changes is what "serve" dispatches: instead of
//! one hardcoded HTTP-forwarding exchange, this gateway multiplexes
//! arbitrary in-flight HTTP and WebSocket exchanges by `request_id` through
//! the pending stores.

use crate::auth::AuthProvider;
use crate::pending::{PendingRequestStore, PendingWebSocketStore, ResponseEvent, WebSocketEvent};
use crate::rate_limit::RateLimiter;
use crate::registry::TunnelRegistry;
use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use sellia_protocol::ControlMessage;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
pub const PING_INTERVAL: Duration = Duration::from_secs(30);
pub const PING_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("client is not connected")]
    ClientNotConnected,
    #[error("protocol error: {0}")]
    Protocol(#[from] sellia_protocol::ProtocolError),
    #[error("failed to write to client socket")]
    SendFailed,
}

type Writer = Arc<AsyncMutex<SplitSink<WebSocket, Message>>>;

struct ConnectionHandle {
    writer: Writer,
    last_seen_epoch_ms: Arc<AtomicI64>,
}

fn now_epoch_ms(start: Instant) -> i64 {
    Instant::now().saturating_duration_since(start).as_millis() as i64
}

/// Live control-channel connections, keyed by client id.
#[derive(Default)]
struct ConnectionManager {
    connections: DashMap<String, ConnectionHandle>,
    epoch: Instant,
}

impl ConnectionManager {
    fn new() -> Self {
        Self {
            connections: DashMap::new(),
            epoch: Instant::now(),
        }
    }

    fn register(&self, client_id: String, writer: Writer) {
        self.connections.insert(
            client_id,
            ConnectionHandle {
                writer,
                last_seen_epoch_ms: Arc::new(AtomicI64::new(now_epoch_ms(self.epoch))),
            },
        );
    }

    fn remove(&self, client_id: &str) {
        self.connections.remove(client_id);
    }

    fn touch(&self, client_id: &str) {
        if let Some(entry) = self.connections.get(client_id) {
            entry
                .last_seen_epoch_ms
                .store(now_epoch_ms(self.epoch), Ordering::Relaxed);
        }
    }

    fn writer_for(&self, client_id: &str) -> Option<Writer> {
        self.connections.get(client_id).map(|e| e.writer.clone())
    }

    fn is_connected(&self, client_id: &str) -> bool {
        self.connections.contains_key(client_id)
    }

    /// Snapshot of (client_id, writer, idle duration) for the liveness sweep.
    fn snapshot(&self) -> Vec<(String, Writer, Duration)> {
        let now_ms = now_epoch_ms(self.epoch);
        self.connections
            .iter()
            .map(|e| {
                let idle_ms = (now_ms - e.value().last_seen_epoch_ms.load(Ordering::Relaxed)).max(0);
                (e.key().clone(), e.value().writer.clone(), Duration::from_millis(idle_ms as u64))
            })
            .collect()
    }
}

/// Derive the public URL a tunnel is reachable at.
pub fn tunnel_url(scheme: &str, subdomain: &str, base_domain: &str) -> String {
    format!("{scheme}://{subdomain}.{base_domain}")
}

/// The control-channel gateway: owns every live client connection and
/// dispatches their traffic into the registry and pending stores.
pub struct WSGateway {
    pub registry: Arc<TunnelRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub auth: Arc<dyn AuthProvider>,
    pub pending_requests: Arc<PendingRequestStore>,
    pub pending_sockets: Arc<PendingWebSocketStore>,
    connections: ConnectionManager,
    base_domain: String,
    public_scheme: String,
}

impl WSGateway {
    pub fn new(
        registry: Arc<TunnelRegistry>,
        rate_limiter: Arc<RateLimiter>,
        auth: Arc<dyn AuthProvider>,
        base_domain: String,
        public_scheme: String,
    ) -> Self {
        Self {
            registry,
            rate_limiter,
            auth,
            pending_requests: Arc::new(PendingRequestStore::new()),
            pending_sockets: Arc::new(PendingWebSocketStore::new()),
            connections: ConnectionManager::new(),
            base_domain,
            public_scheme,
        }
    }

    pub fn is_client_connected(&self, client_id: &str) -> bool {
        self.connections.is_connected(client_id)
    }

    pub fn base_domain(&self) -> &str {
        &self.base_domain
    }

    /// Deliver a message to a connected client's control channel.
    pub async fn send_to_client(&self, client_id: &str, message: ControlMessage) -> Result<(), GatewayError> {
        let writer = self
            .connections
            .writer_for(client_id)
            .ok_or(GatewayError::ClientNotConnected)?;
        let bytes = message.to_bytes()?;
        let mut guard = writer.lock().await;
        guard
            .send(Message::Binary(bytes.into()))
            .await
            .map_err(|_| GatewayError::SendFailed)
    }

    /// Drive one client connection end-to-end: authenticate, serve, clean up.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket, remote_ip: String) {
        let (sink, mut stream) = socket.split();
        let writer: Writer = Arc::new(AsyncMutex::new(sink));

        let Ok(Some(Ok(first))) = tokio::time::timeout(AUTH_TIMEOUT, stream.next()).await else {
            debug!(remote_ip, "control channel handshake timed out");
            return;
        };
        let Some(bytes) = binary_payload(&first) else {
            return;
        };
        let Ok(ControlMessage::Auth { api_key }) = ControlMessage::from_bytes(&bytes) else {
            send_once(&writer, ControlMessage::AuthError { error: "expected auth message first".into() }).await;
            return;
        };
        let Some(account_id) = self.auth.account_id_for(&api_key) else {
            send_once(&writer, ControlMessage::AuthError { error: "invalid api key".into() }).await;
            return;
        };

        let client_id = sellia_protocol::new_id();
        self.connections.register(client_id.clone(), writer.clone());
        send_once(
            &writer,
            ControlMessage::AuthOk {
                account_id: account_id.clone(),
                limits: None,
            },
        )
        .await;
        info!(client_id, account_id, remote_ip, "control channel authenticated");

        while let Some(frame) = stream.next().await {
            let Ok(frame) = frame else { break };
            self.connections.touch(&client_id);
            match frame {
                Message::Close(_) => break,
                Message::Binary(bytes) => {
                    match ControlMessage::from_bytes(&bytes) {
                        Ok(message) => self.dispatch_client_message(&client_id, message).await,
                        Err(e) => warn!(client_id, error = %e, "dropping malformed control frame"),
                    }
                }
                _ => {}
            }
        }

        self.cleanup_client(&client_id).await;
    }

    async fn dispatch_client_message(&self, client_id: &str, message: ControlMessage) {
        match message {
            ControlMessage::TunnelOpen { subdomain, auth, .. } => {
                self.handle_tunnel_open(client_id, subdomain, auth).await
            }
            ControlMessage::TunnelClose { tunnel_id, .. } => {
                if let Some(tunnel_id) = tunnel_id {
                    if let Some(tunnel) = self.registry.unregister_by_id(&tunnel_id) {
                        self.pending_requests.fail_all_for_tunnel(&tunnel.tunnel_id);
                    }
                }
            }
            ControlMessage::ResponseStart { request_id, status_code, headers } => {
                self.pending_requests
                    .dispatch(&request_id, ResponseEvent::Start { status_code, headers });
            }
            ControlMessage::ResponseBody { request_id, chunk } => {
                self.pending_requests.dispatch(&request_id, ResponseEvent::Body(chunk));
            }
            ControlMessage::ResponseEnd { request_id } => {
                self.pending_requests.dispatch(&request_id, ResponseEvent::End);
            }
            ControlMessage::WebSocketUpgradeOk { request_id, headers } => {
                self.pending_sockets
                    .dispatch(&request_id, WebSocketEvent::UpgradeOk { headers });
            }
            ControlMessage::WebSocketUpgradeError { request_id, status_code, message } => {
                self.pending_sockets
                    .dispatch(&request_id, WebSocketEvent::UpgradeError { status_code, message });
            }
            ControlMessage::WebSocketFrame { request_id, opcode, payload } => {
                self.pending_sockets
                    .dispatch(&request_id, WebSocketEvent::Frame { opcode, payload });
            }
            ControlMessage::WebSocketClose { request_id, code, reason } => {
                self.pending_sockets
                    .dispatch(&request_id, WebSocketEvent::Close { code, reason });
            }
            ControlMessage::Pong { .. } => {}
            other => {
                warn!(client_id, tag = other.tag(), "unexpected message direction on control channel");
            }
        }
    }

    async fn handle_tunnel_open(&self, client_id: &str, subdomain: Option<String>, auth: Option<String>) {
        if !self.rate_limiter.allow_tunnel_open(client_id) {
            send_or_log(self, client_id, ControlMessage::TunnelClose {
                tunnel_id: None,
                reason: Some("Rate limit exceeded".into()),
            })
            .await;
            return;
        }

        match self.registry.register(client_id, subdomain.as_deref(), auth) {
            Ok((tunnel_id, subdomain)) => {
                let url = tunnel_url(&self.public_scheme, &subdomain, &self.base_domain);
                send_or_log(self, client_id, ControlMessage::TunnelReady { tunnel_id, url }).await;
            }
            Err(e) => {
                send_or_log(self, client_id, ControlMessage::TunnelClose {
                    tunnel_id: None,
                    reason: Some(e.to_string()),
                })
                .await;
            }
        }
    }

    async fn cleanup_client(&self, client_id: &str) {
        self.connections.remove(client_id);
        let tunnels = self.registry.unregister_by_client(client_id);
        for tunnel in &tunnels {
            self.pending_requests.fail_all_for_tunnel(&tunnel.tunnel_id);
        }
        self.pending_sockets.fail_all_for_client(client_id);
        info!(client_id, tunnels_closed = tunnels.len(), "control channel disconnected");
    }

    /// Runs forever, pinging every connected client and dropping ones that
    /// haven't answered inside `PING_TIMEOUT`. Spawn exactly one of these
    /// per process - the sweep itself is O(connected clients), not O(1) per
    /// client, so per-connection copies would just contend on the map.
    pub async fn run_liveness_sweep(self: Arc<Self>) {
        let mut interval = tokio::time::interval(PING_INTERVAL);
        loop {
            interval.tick().await;
            for (client_id, writer, idle) in self.connections.snapshot() {
                if idle >= PING_TIMEOUT {
                    warn!(client_id, ?idle, "dropping unresponsive control channel");
                    self.cleanup_client(&client_id).await;
                    continue;
                }
                let ping = ControlMessage::Ping { timestamp: chrono::Utc::now().timestamp_millis() };
                if let Ok(bytes) = ping.to_bytes() {
                    let mut guard = writer.lock().await;
                    let _ = guard.send(Message::Binary(bytes.into())).await;
                }
            }
        }
    }
}

fn binary_payload(message: &Message) -> Option<bytes::Bytes> {
    match message {
        Message::Binary(b) => Some(b.clone()),
        _ => None,
    }
}

async fn send_once(writer: &Writer, message: ControlMessage) {
    if let Ok(bytes) = message.to_bytes() {
        let mut guard = writer.lock().await;
        let _ = guard.send(Message::Binary(bytes.into())).await;
    }
}

async fn send_or_log(gateway: &WSGateway, client_id: &str, message: ControlMessage) {
    if let Err(e) = gateway.send_to_client(client_id, message).await {
        warn!(client_id, error = %e, "failed to deliver control message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tunnel_url_joins_scheme_subdomain_and_base() {
        assert_eq!(
            tunnel_url("https", "acme", "sellia.dev"),
            "https://acme.sellia.dev"
        );
    }

    #[test]
    fn connection_manager_tracks_registration_and_removal() {
        let manager = ConnectionManager::new();
        assert!(!manager.is_connected("c1"));
    }
}
