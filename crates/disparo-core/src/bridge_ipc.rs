//! Wire contract between the hub and the chat-protocol bridge process.
//!
//! Every frame is one JSON object: `{version, type, request_id?, payload}`.
//! Commands flow hub -> bridge (`send`, `restart`); lifecycle notifications and
//! send results flow bridge -> hub.

use crate::session::{GatewayEvent, SessionIdentity};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const BRIDGE_PROTOCOL_VERSION: u16 = 1;
pub const MAX_BRIDGE_FRAME_BYTES: usize = 256 * 1024;

#[derive(Debug, Error)]
pub enum BridgeCodecError {
    #[error("bridge frame of {size} bytes exceeds limit {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("unsupported bridge protocol version {0}")]
    UnsupportedVersion(u16),
    #[error("bridge frame decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

fn current_version() -> u16 {
    BRIDGE_PROTOCOL_VERSION
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeEnvelope {
    #[serde(default = "current_version")]
    pub version: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub msg: BridgeMsg,
}

impl BridgeEnvelope {
    pub fn new(msg: BridgeMsg) -> Self {
        Self {
            version: BRIDGE_PROTOCOL_VERSION,
            request_id: None,
            msg,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum BridgeMsg {
    Send(SendPayload),
    Restart(RestartPayload),
    Qr(QrPayload),
    ConnectionOpen(ConnectionOpenPayload),
    ConnectionClose(ConnectionClosePayload),
    SendResult(SendResultPayload),
}

impl BridgeMsg {
    /// Lifecycle notifications map onto gateway events; commands and results do not.
    pub fn gateway_event(&self) -> Option<GatewayEvent> {
        match self {
            BridgeMsg::Qr(payload) => Some(GatewayEvent::Qr(payload.qr.clone())),
            BridgeMsg::ConnectionOpen(payload) => {
                Some(GatewayEvent::Ready(payload.identity.clone()))
            }
            BridgeMsg::ConnectionClose(payload) => Some(GatewayEvent::Disconnected {
                reason: payload.reason.clone(),
                logged_out: payload.logged_out,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendPayload {
    pub jid: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestartPayload {
    pub keep_credentials: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QrPayload {
    pub qr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionOpenPayload {
    #[serde(default)]
    pub identity: Option<SessionIdentity>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionClosePayload {
    #[serde(default = "unknown_reason")]
    pub reason: String,
    #[serde(default)]
    pub logged_out: bool,
}

fn unknown_reason() -> String {
    "unknown".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendResultPayload {
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
}

pub fn encode_frame(envelope: &BridgeEnvelope) -> Result<String, BridgeCodecError> {
    let text = serde_json::to_string(envelope)?;
    if text.len() > MAX_BRIDGE_FRAME_BYTES {
        return Err(BridgeCodecError::OversizedFrame {
            size: text.len(),
            max: MAX_BRIDGE_FRAME_BYTES,
        });
    }
    Ok(text)
}

pub fn decode_frame(text: &str) -> Result<BridgeEnvelope, BridgeCodecError> {
    if text.len() > MAX_BRIDGE_FRAME_BYTES {
        return Err(BridgeCodecError::OversizedFrame {
            size: text.len(),
            max: MAX_BRIDGE_FRAME_BYTES,
        });
    }
    let envelope: BridgeEnvelope = serde_json::from_str(text)?;
    if envelope.version != BRIDGE_PROTOCOL_VERSION {
        return Err(BridgeCodecError::UnsupportedVersion(envelope.version));
    }
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_command_wire_shape() {
        let envelope = BridgeEnvelope::new(BridgeMsg::Send(SendPayload {
            jid: "5511987654321@c.us".to_string(),
            text: "Oi".to_string(),
        }))
        .with_request_id("send-1");
        let json: serde_json::Value =
            serde_json::from_str(&encode_frame(&envelope).expect("encode")).expect("json");
        assert_eq!(json["type"], "send");
        assert_eq!(json["version"], 1);
        assert_eq!(json["request_id"], "send-1");
        assert_eq!(json["payload"]["jid"], "5511987654321@c.us");
    }

    #[test]
    fn decodes_bridge_notifications_into_gateway_events() {
        let open = decode_frame(
            r#"{"type":"connection_open","payload":{"identity":{"address":"5511999990000@c.us","displayName":"Loja"}}}"#,
        )
        .expect("decode open");
        assert_eq!(open.version, BRIDGE_PROTOCOL_VERSION);
        match open.msg.gateway_event() {
            Some(GatewayEvent::Ready(Some(identity))) => {
                assert_eq!(identity.display_name.as_deref(), Some("Loja"));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let close = decode_frame(r#"{"version":1,"type":"connection_close","payload":{}}"#)
            .expect("decode close");
        assert_eq!(
            close.msg.gateway_event(),
            Some(GatewayEvent::Disconnected {
                reason: "unknown".to_string(),
                logged_out: false,
            })
        );

        let result = decode_frame(
            r#"{"version":1,"type":"send_result","request_id":"send-4","payload":{"ok":false,"error":"not on whatsapp"}}"#,
        )
        .expect("decode result");
        assert_eq!(result.request_id.as_deref(), Some("send-4"));
        assert!(result.msg.gateway_event().is_none());
    }

    #[test]
    fn rejects_unknown_version_and_oversized_frames() {
        let err = decode_frame(r#"{"version":7,"type":"qr","payload":{"qr":"x"}}"#)
            .expect_err("version");
        assert!(matches!(err, BridgeCodecError::UnsupportedVersion(7)));

        let huge = format!(
            r#"{{"type":"qr","payload":{{"qr":"{}"}}}}"#,
            "x".repeat(MAX_BRIDGE_FRAME_BYTES)
        );
        assert!(matches!(
            decode_frame(&huge),
            Err(BridgeCodecError::OversizedFrame { .. })
        ));
        assert!(matches!(
            decode_frame("{not json"),
            Err(BridgeCodecError::Decode(_))
        ));
    }
}
