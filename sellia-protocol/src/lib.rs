//! Wire protocol for the Sellia tunnel control channel.
//!
//! [`ControlMessage`] is the closed, tagged union of every message that can
//! cross a control channel in either direction. It is encoded as MessagePack
//! with the variant carried in a `type` field, so the wire form is a
//! self-describing map and not a positional tuple - this lets a newer peer
//! add fields to a known variant without breaking an older one, while an
//! unrecognized `type` is always a hard decode error.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised while encoding or decoding a [`ControlMessage`].
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("message is missing the 'type' discriminator or is otherwise malformed")]
    InvalidFormat,
}

/// HTTP-style headers, preserving repeated header names.
pub type HeaderMap = HashMap<String, Vec<String>>;

/// Per-account limits optionally returned alongside a successful auth.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountLimits {
    pub max_tunnels: u32,
    pub max_requests_per_second: u32,
}

/// The tagged union of every control-channel message.
///
/// The discriminator lives in a `type` field (`#[serde(tag = "type")]`)
/// whose value is the variant's renamed tag below. Unknown tags fail to
/// decode; unknown extra fields inside a known variant are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "auth")]
    Auth { api_key: String },

    #[serde(rename = "auth_ok")]
    AuthOk {
        account_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limits: Option<AccountLimits>,
    },

    #[serde(rename = "auth_error")]
    AuthError { error: String },

    #[serde(rename = "tunnel_open")]
    TunnelOpen {
        tunnel_type: TunnelType,
        local_port: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subdomain: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth: Option<String>,
    },

    #[serde(rename = "tunnel_ready")]
    TunnelReady { tunnel_id: String, url: String },

    #[serde(rename = "tunnel_close")]
    TunnelClose {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tunnel_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    #[serde(rename = "request_start")]
    RequestStart {
        request_id: String,
        tunnel_id: String,
        method: String,
        path: String,
        headers: HeaderMap,
    },

    #[serde(rename = "request_body")]
    RequestBody {
        request_id: String,
        #[serde(with = "serde_bytes")]
        chunk: Vec<u8>,
        #[serde(rename = "final")]
        is_final: bool,
    },

    #[serde(rename = "response_start")]
    ResponseStart {
        request_id: String,
        status_code: u16,
        headers: HeaderMap,
    },

    #[serde(rename = "response_body")]
    ResponseBody {
        request_id: String,
        #[serde(with = "serde_bytes")]
        chunk: Vec<u8>,
    },

    #[serde(rename = "response_end")]
    ResponseEnd { request_id: String },

    #[serde(rename = "websocket_upgrade")]
    WebSocketUpgrade {
        request_id: String,
        tunnel_id: String,
        path: String,
        headers: HeaderMap,
    },

    #[serde(rename = "websocket_upgrade_ok")]
    WebSocketUpgradeOk {
        request_id: String,
        headers: HeaderMap,
    },

    #[serde(rename = "websocket_upgrade_error")]
    WebSocketUpgradeError {
        request_id: String,
        status_code: u16,
        message: String,
    },

    #[serde(rename = "websocket_frame")]
    WebSocketFrame {
        request_id: String,
        opcode: u8,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },

    #[serde(rename = "websocket_close")]
    WebSocketClose {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    #[serde(rename = "ping")]
    Ping { timestamp: i64 },

    #[serde(rename = "pong")]
    Pong { timestamp: i64 },
}

/// WebSocket opcodes the protocol carries faithfully end to end.
pub mod opcode {
    pub const TEXT: u8 = 0x01;
    pub const BINARY: u8 = 0x02;
    pub const CLOSE: u8 = 0x08;
    pub const PING: u8 = 0x09;
    pub const PONG: u8 = 0x0A;
}

/// Type of tunnel requested by `tunnel_open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelType {
    Http,
}

impl ControlMessage {
    /// The `type` tag this message would encode with - used for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            ControlMessage::Auth { .. } => "auth",
            ControlMessage::AuthOk { .. } => "auth_ok",
            ControlMessage::AuthError { .. } => "auth_error",
            ControlMessage::TunnelOpen { .. } => "tunnel_open",
            ControlMessage::TunnelReady { .. } => "tunnel_ready",
            ControlMessage::TunnelClose { .. } => "tunnel_close",
            ControlMessage::RequestStart { .. } => "request_start",
            ControlMessage::RequestBody { .. } => "request_body",
            ControlMessage::ResponseStart { .. } => "response_start",
            ControlMessage::ResponseBody { .. } => "response_body",
            ControlMessage::ResponseEnd { .. } => "response_end",
            ControlMessage::WebSocketUpgrade { .. } => "websocket_upgrade",
            ControlMessage::WebSocketUpgradeOk { .. } => "websocket_upgrade_ok",
            ControlMessage::WebSocketUpgradeError { .. } => "websocket_upgrade_error",
            ControlMessage::WebSocketFrame { .. } => "websocket_frame",
            ControlMessage::WebSocketClose { .. } => "websocket_close",
            ControlMessage::Ping { .. } => "ping",
            ControlMessage::Pong { .. } => "pong",
        }
    }

    /// Encode this message to its wire representation.
    ///
    /// Uses `to_vec_named` so struct fields (and the `type` tag) are written
    /// as a msgpack map with string keys rather than a positional array -
    /// the self-describing format the protocol promises.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decode a message from its wire representation.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.is_empty() {
            return Err(ProtocolError::InvalidFormat);
        }
        Ok(rmp_serde::from_slice(data)?)
    }
}

/// Generate a new opaque, server-minted identifier (request/tunnel/client id).
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: ControlMessage) -> ControlMessage {
        let bytes = msg.to_bytes().expect("encode");
        ControlMessage::from_bytes(&bytes).expect("decode")
    }

    #[test]
    fn auth_roundtrips() {
        let msg = ControlMessage::Auth {
            api_key: "key-123".into(),
        };
        match roundtrip(msg) {
            ControlMessage::Auth { api_key } => assert_eq!(api_key, "key-123"),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn tunnel_open_roundtrips_with_optional_fields_absent() {
        let msg = ControlMessage::TunnelOpen {
            tunnel_type: TunnelType::Http,
            local_port: 8080,
            subdomain: None,
            auth: None,
        };
        match roundtrip(msg) {
            ControlMessage::TunnelOpen {
                local_port,
                subdomain,
                auth,
                ..
            } => {
                assert_eq!(local_port, 8080);
                assert_eq!(subdomain, None);
                assert_eq!(auth, None);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn request_body_preserves_final_flag_and_bytes() {
        let msg = ControlMessage::RequestBody {
            request_id: "r1".into(),
            chunk: vec![1, 2, 3, 4, 5],
            is_final: true,
        };
        match roundtrip(msg) {
            ControlMessage::RequestBody {
                chunk, is_final, ..
            } => {
                assert_eq!(chunk, vec![1, 2, 3, 4, 5]);
                assert!(is_final);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn websocket_frame_preserves_opcode_and_arbitrary_payload() {
        let payload: Vec<u8> = (0..=255u16).map(|b| (b % 256) as u8).collect();
        let msg = ControlMessage::WebSocketFrame {
            request_id: "r1".into(),
            opcode: opcode::BINARY,
            payload: payload.clone(),
        };
        match roundtrip(msg) {
            ControlMessage::WebSocketFrame { opcode, payload: p, .. } => {
                assert_eq!(opcode, opcode::BINARY);
                assert_eq!(p, payload);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn headers_with_repeated_names_roundtrip() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "Set-Cookie".to_string(),
            vec!["a=1".to_string(), "b=2".to_string()],
        );
        let msg = ControlMessage::RequestStart {
            request_id: "r1".into(),
            tunnel_id: "t1".into(),
            method: "GET".into(),
            path: "/".into(),
            headers: headers.clone(),
        };
        match roundtrip(msg) {
            ControlMessage::RequestStart { headers: h, .. } => assert_eq!(h, headers),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_tag_is_a_decode_error() {
        // Hand-build a msgpack map with an unrecognized "type" value.
        let mut buf = Vec::new();
        let mut se = rmp_serde::Serializer::new(&mut buf);
        use serde::ser::SerializeMap;
        let mut map = serde::Serializer::serialize_map(&mut se, Some(1)).unwrap();
        map.serialize_entry("type", "not_a_real_message").unwrap();
        serde::ser::SerializeMap::end(map).unwrap();

        let err = ControlMessage::from_bytes(&buf);
        assert!(err.is_err());
    }

    #[test]
    fn empty_bytes_is_invalid_format() {
        let err = ControlMessage::from_bytes(&[]);
        assert!(matches!(err, Err(ProtocolError::InvalidFormat)));
    }

    #[test]
    fn ping_pong_carry_timestamp() {
        let msg = ControlMessage::Ping { timestamp: 1_700_000_000 };
        match roundtrip(msg) {
            ControlMessage::Ping { timestamp } => assert_eq!(timestamp, 1_700_000_000),
            other => panic!("wrong variant: {other:?}"),
        }
        let msg = ControlMessage::Pong { timestamp: 42 };
        match roundtrip(msg) {
            ControlMessage::Pong { timestamp } => assert_eq!(timestamp, 42),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn new_id_generates_distinct_values() {
        assert_ne!(new_id(), new_id());
    }
}
