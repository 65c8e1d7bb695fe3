//! Wire-level protocol definitions shared by the push channel and the
//! REST collaborator. Kept in a dedicated crate so dashboard frontends
//! can regenerate bindings without pulling in the engine runtime.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved frame types consumed by the connection manager itself.
/// They are never republished to event listeners.
pub mod reserved {
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const CONNECTION_ESTABLISHED: &str = "connection_established";

    pub fn is_reserved(frame_type: &str) -> bool {
        matches!(frame_type, PING | PONG | CONNECTION_ESTABLISHED)
    }
}

/// Incoming push frame: a JSON object with at least a `type` field.
/// Everything beyond `type` and `entity_id` is carried opaquely so new
/// server event shapes survive the trip to listeners unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEnvelope {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

/// Outbound control frames sent by the connection manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Ping,
    Pong,
    SubscribeConversation { conversation_id: String },
}

/// Authoritative view of one entity, as returned by the full-list fetch
/// and carried inside push payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub id: String,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_envelope_keeps_unknown_fields() {
        let frame: RawEnvelope = serde_json::from_str(
            r#"{"type":"order.updated","entity_id":"o1","total":42,"source":"pos"}"#,
        )
        .unwrap();
        assert_eq!(frame.frame_type, "order.updated");
        assert_eq!(frame.entity_id.as_deref(), Some("o1"));
        assert_eq!(frame.payload.get("total"), Some(&serde_json::json!(42)));
        assert_eq!(frame.payload.get("source"), Some(&serde_json::json!("pos")));
    }

    #[test]
    fn raw_envelope_tolerates_missing_entity_id() {
        let frame: RawEnvelope =
            serde_json::from_str(r#"{"type":"connection_established"}"#).unwrap();
        assert_eq!(frame.frame_type, "connection_established");
        assert!(frame.entity_id.is_none());
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn client_frames_use_type_tags() {
        assert_eq!(
            serde_json::to_string(&ClientFrame::Ping).unwrap(),
            r#"{"type":"ping"}"#
        );
        assert_eq!(
            serde_json::to_string(&ClientFrame::SubscribeConversation {
                conversation_id: "c9".into()
            })
            .unwrap(),
            r#"{"type":"subscribe_conversation","conversation_id":"c9"}"#
        );
    }

    #[test]
    fn reserved_types_are_recognized() {
        assert!(reserved::is_reserved("ping"));
        assert!(reserved::is_reserved("pong"));
        assert!(reserved::is_reserved("connection_established"));
        assert!(!reserved::is_reserved("order.updated"));
    }
}
