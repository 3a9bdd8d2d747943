//! Wire protocol shared by the relay and its participants.
//!
//! Every frame is a single JSON object with `sessionId`, `type` and
//! `payload` fields. Inbound and outbound messages are modelled as two
//! adjacently tagged enums so that the `type` string selects the payload
//! shape. The `sessionId` is carried next to the tagged pair and is handled
//! by [`InboundFrame`] and [`ServerMessage::to_frame`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// The opaque, leader-authored state blob. The relay only ever shallow-merges it.
pub type StateMap = serde_json::Map<String, Value>;

/// Role name to player identifier.
pub type Roles = BTreeMap<String, String>;

/// Reflections keyed by round number, then by player.
pub type Reflections = BTreeMap<u32, BTreeMap<String, String>>;

/// Literal keep-alive frame sent by clients between real messages.
pub const KEEPALIVE_TOKEN: &str = "keepalive";

/// Errors produced while decoding an inbound frame
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("frame has no sessionId")]
    MissingSessionId,
    #[error("unrecognized message: {0}")]
    UnknownMessage(#[source] serde_json::Error),
}

/// Messages sent by participants to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ClientMessage {
    Register(RegisterPayload),
    SessionStart(SessionStartPayload),
    Move(MovePayload),
    Inject(InjectPayload),
    InventoryUpdate(InventoryUpdatePayload),
    StateUpdate(StateUpdatePayload),
    Reflection(ReflectionPayload),
    ReflectionMissing(ReflectionMissingPayload),
    PickupChoicesShown(Value),
    ShowModal(Value),
    Log(LogPayload),
    Hello(PlayerRef),
    MemberClicked(PlayerRef),
    GameOver(GameOverPayload),
    ResetSession(ResetPayload),
}

impl ClientMessage {
    /// Wire name of this message's `type` field
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Register(_) => "register",
            ClientMessage::SessionStart(_) => "session-start",
            ClientMessage::Move(_) => "move",
            ClientMessage::Inject(_) => "inject",
            ClientMessage::InventoryUpdate(_) => "inventory-update",
            ClientMessage::StateUpdate(_) => "state-update",
            ClientMessage::Reflection(_) => "reflection",
            ClientMessage::ReflectionMissing(_) => "reflection-missing",
            ClientMessage::PickupChoicesShown(_) => "pickup-choices-shown",
            ClientMessage::ShowModal(_) => "show-modal",
            ClientMessage::Log(_) => "log",
            ClientMessage::Hello(_) => "hello",
            ClientMessage::MemberClicked(_) => "member-clicked",
            ClientMessage::GameOver(_) => "game-over",
            ClientMessage::ResetSession(_) => "reset-session",
        }
    }

    /// Player identifier claimed by the payload, when it carries one
    pub fn player_id(&self) -> Option<&str> {
        match self {
            ClientMessage::Register(p) => Some(&p.player_id),
            ClientMessage::SessionStart(p) => Some(&p.player_id),
            ClientMessage::Move(p) => p.player_id.as_deref(),
            ClientMessage::Reflection(p) => Some(&p.player_id),
            ClientMessage::ReflectionMissing(p) => Some(&p.player_id),
            ClientMessage::Log(p) => Some(&p.player_id),
            ClientMessage::Hello(p) | ClientMessage::MemberClicked(p) => Some(&p.player_id),
            ClientMessage::ResetSession(p) => p.player_id.as_deref(),
            _ => None,
        }
    }

    /// Serializes this message into a text frame addressed to `session_id`
    pub fn to_frame(&self, session_id: &str) -> Result<String, serde_json::Error> {
        with_session_id(serde_json::to_value(self)?, session_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub player_id: String,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStartPayload {
    pub player_id: String,
    pub role: String,
    #[serde(default)]
    pub state: StateMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_id: Option<String>,
    #[serde(rename = "move")]
    pub step: Value,
    pub state: StateMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectPayload {
    pub inject: Value,
    pub state: StateMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryUpdatePayload {
    pub inventory: Value,
    pub state: StateMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdatePayload {
    pub state: StateMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReflectionPayload {
    pub player_id: String,
    pub round_num: u32,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReflectionMissingPayload {
    pub player_id: String,
    /// Falls back to the session's `state.roundNum` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round_num: Option<u32>,
    /// Whatever draft text the player had typed before the deadline
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPayload {
    pub player_id: String,
    pub msg: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRef {
    pub player_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameOverPayload {
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_id: Option<String>,
}

/// One entry of a session's accumulated per-action log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_id: Option<String>,
    pub data: Value,
}

/// Messages sent by the relay to participants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ServerMessage {
    SessionStarted {
        state: StateMap,
        roles: Roles,
    },
    StateUpdate {
        state: StateMap,
        roles: Roles,
        #[serde(default)]
        log: Vec<LogEntry>,
        #[serde(default)]
        reflections: Reflections,
    },
    Move {
        #[serde(rename = "move")]
        step: Value,
        state: StateMap,
    },
    Inject {
        inject: Value,
        state: StateMap,
    },
    InventoryUpdate {
        inventory: Value,
        state: StateMap,
    },
    #[serde(rename_all = "camelCase")]
    ReflectionPenalty {
        /// `None` when no item had a positive count
        item_code: Option<String>,
        reason: String,
        inventory: StateMap,
    },
    PickupChoicesShown(Value),
    ShowModal(Value),
    #[serde(rename_all = "camelCase")]
    Log {
        player_id: String,
        msg: String,
    },
    Hello {
        from: String,
    },
    ShowAlert {
        message: String,
    },
    SessionReset {},
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::SessionStarted { .. } => "session-started",
            ServerMessage::StateUpdate { .. } => "state-update",
            ServerMessage::Move { .. } => "move",
            ServerMessage::Inject { .. } => "inject",
            ServerMessage::InventoryUpdate { .. } => "inventory-update",
            ServerMessage::ReflectionPenalty { .. } => "reflection-penalty",
            ServerMessage::PickupChoicesShown(_) => "pickup-choices-shown",
            ServerMessage::ShowModal(_) => "show-modal",
            ServerMessage::Log { .. } => "log",
            ServerMessage::Hello { .. } => "hello",
            ServerMessage::ShowAlert { .. } => "show-alert",
            ServerMessage::SessionReset {} => "session-reset",
        }
    }

    /// Serializes this message into a text frame addressed to `session_id`
    pub fn to_frame(&self, session_id: &str) -> Result<String, serde_json::Error> {
        with_session_id(serde_json::to_value(self)?, session_id)
    }

    /// Parses an outbound frame, as received by a participant
    pub fn from_frame(text: &str) -> Result<(Option<String>, Self), ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let message = ServerMessage::deserialize(&value).map_err(ProtocolError::UnknownMessage)?;
        Ok((session_id, message))
    }
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub session_id: String,
    pub message: ClientMessage,
}

impl InboundFrame {
    /// Decodes one text frame.
    ///
    /// Returns `Ok(None)` for the keep-alive token. Anything else that does
    /// not decode into a known message with a session identifier is an error.
    pub fn parse(text: &str) -> Result<Option<Self>, ProtocolError> {
        if text.trim().eq_ignore_ascii_case(KEEPALIVE_TOKEN) {
            return Ok(None);
        }

        let value: Value = serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;
        let session_id = match value.get("sessionId").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_owned(),
            _ => return Err(ProtocolError::MissingSessionId),
        };
        let message = ClientMessage::deserialize(&value).map_err(ProtocolError::UnknownMessage)?;

        Ok(Some(InboundFrame {
            session_id,
            message,
        }))
    }
}

fn with_session_id(mut value: Value, session_id: &str) -> Result<String, serde_json::Error> {
    if let Value::Object(map) = &mut value {
        map.insert("sessionId".to_owned(), Value::String(session_id.to_owned()));
        // Variants without fields still carry an (empty) payload object.
        map.entry("payload").or_insert_with(|| Value::Object(StateMap::new()));
    }
    serde_json::to_string(&value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_move_frame() {
        let text = r#"{"sessionId":"S1","type":"move","payload":{"move":"up","state":{"curr":[1,2]}}}"#;
        let frame = InboundFrame::parse(text).unwrap().unwrap();

        assert_eq!(frame.session_id, "S1");
        match frame.message {
            ClientMessage::Move(payload) => {
                assert_eq!(payload.step, json!("up"));
                assert_eq!(payload.state.get("curr"), Some(&json!([1, 2])));
                assert!(payload.player_id.is_none());
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_keepalive_is_ignored() {
        assert!(InboundFrame::parse("keepalive").unwrap().is_none());
        assert!(InboundFrame::parse("  KeepAlive \n").unwrap().is_none());
    }

    #[test]
    fn test_malformed_frames_are_errors() {
        assert!(matches!(
            InboundFrame::parse("{not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
        assert!(matches!(
            InboundFrame::parse(r#"{"type":"register","payload":{"playerId":"p","role":"r"}}"#),
            Err(ProtocolError::MissingSessionId)
        ));
        assert!(matches!(
            InboundFrame::parse(r#"{"sessionId":"S1","type":"teleport","payload":{}}"#),
            Err(ProtocolError::UnknownMessage(_))
        ));
    }

    #[test]
    fn test_gameplay_message_requires_state() {
        let text = r#"{"sessionId":"S1","type":"inject","payload":{"inject":{"kind":"storm"}}}"#;
        assert!(InboundFrame::parse(text).is_err());
    }

    #[test]
    fn test_reflection_missing_round_is_optional() {
        let text = r#"{"sessionId":"S1","type":"reflection-missing","payload":{"playerId":"p2","text":"draft"}}"#;
        let frame = InboundFrame::parse(text).unwrap().unwrap();
        match frame.message {
            ClientMessage::ReflectionMissing(payload) => {
                assert_eq!(payload.player_id, "p2");
                assert_eq!(payload.round_num, None);
                assert_eq!(payload.text, "draft");
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_outbound_frame_layout() {
        let mut inventory = StateMap::new();
        inventory.insert("A".into(), json!(0));
        let msg = ServerMessage::ReflectionPenalty {
            item_code: Some("A".into()),
            reason: "A reflection was missed.".into(),
            inventory,
        };

        let frame: Value = serde_json::from_str(&msg.to_frame("S1").unwrap()).unwrap();
        assert_eq!(frame["sessionId"], json!("S1"));
        assert_eq!(frame["type"], json!("reflection-penalty"));
        assert_eq!(frame["payload"]["itemCode"], json!("A"));
        assert_eq!(frame["payload"]["inventory"]["A"], json!(0));
    }

    #[test]
    fn test_session_reset_carries_empty_payload() {
        let frame: Value =
            serde_json::from_str(&ServerMessage::SessionReset {}.to_frame("S9").unwrap()).unwrap();
        assert_eq!(frame["type"], json!("session-reset"));
        assert_eq!(frame["payload"], json!({}));

        let (session_id, parsed) = ServerMessage::from_frame(&frame.to_string()).unwrap();
        assert_eq!(session_id.as_deref(), Some("S9"));
        assert_eq!(parsed, ServerMessage::SessionReset {});
    }

    #[test]
    fn test_kind_matches_wire_type() {
        let msg = ClientMessage::ResetSession(ResetPayload::default());
        let frame: Value = serde_json::from_str(&msg.to_frame("S1").unwrap()).unwrap();
        assert_eq!(frame["type"], json!(msg.kind()));

        let msg = ServerMessage::ShowAlert {
            message: "hi".into(),
        };
        let frame: Value = serde_json::from_str(&msg.to_frame("S1").unwrap()).unwrap();
        assert_eq!(frame["type"], json!(msg.kind()));
    }
}
