//! Correlates in-flight HTTP exchanges and WebSocket upgrades to the
//! `request_id` the control channel tags them with.
//!
//! Each entry is a single-producer/single-consumer waiter: the ingress task
//! awaits a channel the gateway's message dispatch feeds from incoming
//! control-channel traffic. This is the "explicit state object" the design
//! notes prefer over a raw wait/notify pair - `PendingRequest`/`PendingSocket`
//! carry exactly the (channel, buffer-in-flight, owner) triple needed to
//! synthesize a failure if the channel disappears mid-exchange.

use dashmap::DashMap;
use sellia_protocol::HeaderMap;
use tokio::sync::mpsc;

/// One chunk of a streaming HTTP response, delivered to the ingress task
/// that's waiting on a `request_id`.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    Start { status_code: u16, headers: HeaderMap },
    Body(Vec<u8>),
    End,
    /// The owning control channel was lost, or the exchange was cancelled -
    /// the ingress task should synthesize a failure response.
    Failed,
}

struct RequestEntry {
    tunnel_id: String,
    tx: mpsc::Sender<ResponseEvent>,
}

/// Correlates in-flight HTTP request ids to the ingress task awaiting their
/// response.
#[derive(Default)]
pub struct PendingRequestStore {
    entries: DashMap<String, RequestEntry>,
}

impl PendingRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending exchange, returning the receiver the ingress
    /// task should await on.
    pub fn register(&self, request_id: String, tunnel_id: String) -> mpsc::Receiver<ResponseEvent> {
        let (tx, rx) = mpsc::channel(32);
        self.entries.insert(request_id, RequestEntry { tunnel_id, tx });
        rx
    }

    /// Deliver an event for `request_id`. Returns `false` if there was no
    /// matching pending exchange (e.g. it already timed out).
    pub fn dispatch(&self, request_id: &str, event: ResponseEvent) -> bool {
        let is_terminal = matches!(event, ResponseEvent::End | ResponseEvent::Failed);
        let Some(entry) = self.entries.get(request_id) else {
            return false;
        };
        let sent = entry.tx.try_send(event).is_ok();
        drop(entry);
        if is_terminal {
            self.entries.remove(request_id);
        }
        sent
    }

    /// Remove a pending exchange without sending anything further - used
    /// when the ingress side gives up first (deadline expiry).
    pub fn remove(&self, request_id: &str) {
        self.entries.remove(request_id);
    }

    /// Fail and remove every pending exchange owned by `tunnel_id`. Used
    /// when the tunnel's owning control channel is lost.
    pub fn fail_all_for_tunnel(&self, tunnel_id: &str) {
        let matching: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().tunnel_id == tunnel_id)
            .map(|e| e.key().clone())
            .collect();
        for request_id in matching {
            if let Some((_, entry)) = self.entries.remove(&request_id) {
                let _ = entry.tx.try_send(ResponseEvent::Failed);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One event of an in-flight WebSocket passthrough, delivered to whichever
/// side (public ingress or control-channel gateway) is awaiting it.
#[derive(Debug, Clone)]
pub enum WebSocketEvent {
    UpgradeOk { headers: HeaderMap },
    UpgradeError { status_code: u16, message: String },
    Frame { opcode: u8, payload: Vec<u8> },
    Close { code: Option<u16>, reason: Option<String> },
    Failed,
}

struct SocketEntry {
    client_id: String,
    tx: mpsc::Sender<WebSocketEvent>,
}

/// Correlates in-flight WebSocket upgrades/frames to the public socket
/// handler awaiting them, keyed by `request_id`.
#[derive(Default)]
pub struct PendingWebSocketStore {
    entries: DashMap<String, SocketEntry>,
}

impl PendingWebSocketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, request_id: String, client_id: String) -> mpsc::Receiver<WebSocketEvent> {
        let (tx, rx) = mpsc::channel(64);
        self.entries.insert(request_id, SocketEntry { client_id, tx });
        rx
    }

    pub fn dispatch(&self, request_id: &str, event: WebSocketEvent) -> bool {
        let is_terminal = matches!(
            event,
            WebSocketEvent::Close { .. } | WebSocketEvent::Failed | WebSocketEvent::UpgradeError { .. }
        );
        let Some(entry) = self.entries.get(request_id) else {
            return false;
        };
        let sent = entry.tx.try_send(event).is_ok();
        drop(entry);
        if is_terminal {
            self.entries.remove(request_id);
        }
        sent
    }

    pub fn remove(&self, request_id: &str) {
        self.entries.remove(request_id);
    }

    /// Fail and remove every pending socket owned by `client_id`. Used when
    /// the control channel for that client is lost.
    pub fn fail_all_for_client(&self, client_id: &str) {
        let matching: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().client_id == client_id)
            .map(|e| e.key().clone())
            .collect();
        for request_id in matching {
            if let Some((_, entry)) = self.entries.remove(&request_id) {
                let _ = entry.tx.try_send(WebSocketEvent::Failed);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatch_delivers_events_in_order() {
        let store = PendingRequestStore::new();
        let mut rx = store.register("r1".into(), "t1".into());

        store.dispatch(
            "r1",
            ResponseEvent::Start {
                status_code: 200,
                headers: HeaderMap::new(),
            },
        );
        store.dispatch("r1", ResponseEvent::Body(b"hello".to_vec()));
        store.dispatch("r1", ResponseEvent::End);

        assert!(matches!(rx.recv().await, Some(ResponseEvent::Start { status_code: 200, .. })));
        assert!(matches!(rx.recv().await, Some(ResponseEvent::Body(b)) if b == b"hello"));
        assert!(matches!(rx.recv().await, Some(ResponseEvent::End)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn fail_all_for_tunnel_only_touches_that_tunnel() {
        let store = PendingRequestStore::new();
        let mut rx_a = store.register("a".into(), "tunnel-1".into());
        let mut rx_b = store.register("b".into(), "tunnel-2".into());

        store.fail_all_for_tunnel("tunnel-1");

        assert!(matches!(rx_a.recv().await, Some(ResponseEvent::Failed)));
        assert_eq!(store.len(), 1);
        drop(rx_b);
    }

    #[tokio::test]
    async fn dispatch_to_unknown_request_id_is_a_no_op() {
        let store = PendingRequestStore::new();
        assert!(!store.dispatch("missing", ResponseEvent::End));
    }

    #[tokio::test]
    async fn websocket_store_fails_all_for_client() {
        let store = PendingWebSocketStore::new();
        let mut rx = store.register("ws1".into(), "client-1".into());
        store.fail_all_for_client("client-1");
        assert!(matches!(rx.recv().await, Some(WebSocketEvent::Failed)));
        assert_eq!(store.len(), 0);
    }
}
