//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every frame is a flat `{type, content}` envelope whose `content` is itself
//! a JSON document. Text frames carry the envelope as JSON; binary frames
//! carry the same envelope encoded with bincode.

use serde::{Deserialize, Serialize};

use crate::game::session::{Move, Side};

/// Errors raised while decoding or encoding protocol messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Envelope could not be parsed.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Envelope `type` is not part of the protocol.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// Envelope content does not match the payload shape for its type.
    #[error("malformed {kind} content: {source}")]
    MalformedContent {
        /// Message type being decoded.
        kind: &'static str,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Payload could not be encoded.
    #[error("failed to encode {kind}: {source}")]
    Encode {
        /// Message type being encoded.
        kind: &'static str,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

// =============================================================================
// ENVELOPE
// =============================================================================

/// A single protocol frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type discriminator.
    #[serde(rename = "type")]
    pub kind: String,
    /// JSON document specific to `kind`.
    #[serde(default)]
    pub content: String,
}

impl Envelope {
    /// Build an envelope from its parts.
    pub fn new(kind: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            content: content.into(),
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(s).map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))
    }

    /// Serialize to binary.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        bincode::deserialize(data).map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))
    }
}

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Decoded inbound message.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    /// Ask for the list of users available for a game.
    RequestOnlineUsers,
    /// Challenge another user.
    InvitationSend(InvitationPayload),
    /// Accept a pending invitation.
    InvitationAccept(InvitationPayload),
    /// Decline a pending invitation.
    InvitationReject(InvitationPayload),
    /// Withdraw a pending invitation.
    InvitationCancel(InvitationPayload),
    /// Leave a specific room.
    RoomLeave(InvitationPayload),
    /// Leave whatever room the user is in.
    LeaveRoom(LeaveRoomPayload),
    /// Move to relay to the opponent.
    GameMove {
        /// Parsed move fields.
        payload: MovePayload,
        /// Raw content, relayed verbatim.
        raw: String,
    },
    /// Client-detected checkmate.
    GameOverCheckmate {
        /// Parsed result fields.
        payload: GameOverPayload,
        /// Raw content, relayed verbatim.
        raw: String,
    },
}

impl ClientMessage {
    /// Decode an envelope into a typed message.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        fn content<T: for<'de> Deserialize<'de>>(
            kind: &'static str,
            raw: &str,
        ) -> Result<T, ProtocolError> {
            serde_json::from_str(raw).map_err(|source| ProtocolError::MalformedContent { kind, source })
        }

        let raw = envelope.content.as_str();
        let msg = match envelope.kind.as_str() {
            "request_online_users" => ClientMessage::RequestOnlineUsers,
            "invitation_send" => ClientMessage::InvitationSend(content("invitation_send", raw)?),
            "invitation_accept" => ClientMessage::InvitationAccept(content("invitation_accept", raw)?),
            "invitation_reject" => ClientMessage::InvitationReject(content("invitation_reject", raw)?),
            "invitation_cancel" => ClientMessage::InvitationCancel(content("invitation_cancel", raw)?),
            "room_leave" => ClientMessage::RoomLeave(content("room_leave", raw)?),
            "leave_room" => ClientMessage::LeaveRoom(content("leave_room", raw)?),
            "game_move" => ClientMessage::GameMove {
                payload: content("game_move", raw)?,
                raw: raw.to_string(),
            },
            "game_over_checkmate" => ClientMessage::GameOverCheckmate {
                payload: content("game_over_checkmate", raw)?,
                raw: raw.to_string(),
            },
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        };
        Ok(msg)
    }

    /// Wire name of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::RequestOnlineUsers => "request_online_users",
            ClientMessage::InvitationSend(_) => "invitation_send",
            ClientMessage::InvitationAccept(_) => "invitation_accept",
            ClientMessage::InvitationReject(_) => "invitation_reject",
            ClientMessage::InvitationCancel(_) => "invitation_cancel",
            ClientMessage::RoomLeave(_) => "room_leave",
            ClientMessage::LeaveRoom(_) => "leave_room",
            ClientMessage::GameMove { .. } => "game_move",
            ClientMessage::GameOverCheckmate { .. } => "game_over_checkmate",
        }
    }
}

/// Invitation family payload, shared by requests and notifications.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitationPayload {
    /// Invitation message type as sent by the client.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Challenger user id.
    #[serde(default)]
    pub from_user_id: String,
    /// Challenger username.
    #[serde(default)]
    pub from_username: String,
    /// Challenged user id.
    #[serde(default)]
    pub to_user_id: String,
    /// Challenged username.
    #[serde(default)]
    pub to_username: String,
    /// Invitation / room identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
}

impl InvitationPayload {
    /// Room id, treating an empty string as absent.
    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref().filter(|id| !id.is_empty())
    }
}

/// `leave_room` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeaveRoomPayload {
    /// Username the client claims is leaving.
    #[serde(default)]
    pub username: String,
}

/// `game_move` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovePayload {
    /// Session id.
    pub game_id: String,
    /// Mover user id.
    #[serde(default)]
    pub from_user_id: String,
    /// Recipient user id.
    #[serde(default)]
    pub to_user_id: String,
    /// Recipient username.
    #[serde(default)]
    pub to_username: String,
    /// The move itself.
    #[serde(rename = "move", default)]
    pub mv: Option<Move>,
    /// Position after the move.
    #[serde(default)]
    pub fen: String,
    /// Turn flag as seen by the mover.
    pub is_whites_turn: bool,
}

/// `game_over_checkmate` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameOverPayload {
    /// Session id.
    pub game_id: String,
    /// Winning side as reported.
    #[serde(default)]
    pub winner: String,
    /// Reason as reported.
    #[serde(default)]
    pub reason: String,
    /// Winner user id.
    #[serde(default)]
    pub winner_id: String,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    /// Users available for a game.
    OnlineUsers(Vec<OnlineUser>),
    /// Incoming challenge.
    Invitation(InvitationPayload),
    /// Challenge was declined.
    InvitationRejected(InvitationPayload),
    /// Challenge was withdrawn.
    InvitationCancelled(InvitationPayload),
    /// Challenge expired.
    InvitationTimeout(InvitationPayload),
    /// Session started.
    GameStart(GameStartInfo),
    /// Relayed move, verbatim.
    GameMove(String),
    /// Game ended on the clock.
    GameOver(GameOverInfo),
    /// Relayed checkmate notice, verbatim.
    GameOverCheckmate(String),
    /// Clock snapshot.
    TimeUpdate(TimeUpdate),
    /// Move was refused or could not be delivered.
    MoveError(MoveErrorInfo),
    /// Opponent left the room.
    RoomClosed(RoomClosedInfo),
}

impl ServerMessage {
    /// Wire name of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::OnlineUsers(_) => "online_users",
            ServerMessage::Invitation(_) => "invitation",
            ServerMessage::InvitationRejected(_) => "invitation_rejected",
            ServerMessage::InvitationCancelled(_) => "invitation_cancelled",
            ServerMessage::InvitationTimeout(_) => "invitation_timeout",
            ServerMessage::GameStart(_) => "game_start",
            ServerMessage::GameMove(_) => "game_move",
            ServerMessage::GameOver(_) => "game_over",
            ServerMessage::GameOverCheckmate(_) => "game_over_checkmate",
            ServerMessage::TimeUpdate(_) => "time_update",
            ServerMessage::MoveError(_) => "move_error",
            ServerMessage::RoomClosed(_) => "room_closed",
        }
    }

    /// Encode into an envelope.
    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        let kind = self.kind();
        let content = match self {
            ServerMessage::GameMove(raw) | ServerMessage::GameOverCheckmate(raw) => {
                return Ok(Envelope::new(kind, raw.clone()));
            }
            ServerMessage::OnlineUsers(users) => serde_json::to_string(users),
            ServerMessage::Invitation(p)
            | ServerMessage::InvitationRejected(p)
            | ServerMessage::InvitationCancelled(p)
            | ServerMessage::InvitationTimeout(p) => serde_json::to_string(p),
            ServerMessage::GameStart(info) => serde_json::to_string(info),
            ServerMessage::GameOver(info) => serde_json::to_string(info),
            ServerMessage::TimeUpdate(update) => serde_json::to_string(update),
            ServerMessage::MoveError(info) => serde_json::to_string(info),
            ServerMessage::RoomClosed(info) => serde_json::to_string(info),
        }
        .map_err(|source| ProtocolError::Encode { kind, source })?;

        Ok(Envelope::new(kind, content))
    }
}

/// Entry in an `online_users` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUser {
    /// User id.
    pub id: String,
    /// Username.
    pub username: String,
    /// Always false for listed users.
    pub is_in_room: bool,
}

/// Personalized `game_start` content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStartInfo {
    /// Session id.
    pub game_id: String,
    /// Challenger user id.
    pub game_creator_uid: String,
    /// Initial position.
    pub position_fen: String,
    /// Empty until the game ends.
    pub winner_id: String,
    /// White clock, MM:SS.
    pub whites_time: String,
    /// Black clock, MM:SS.
    pub blacks_time: String,
    /// Turn flag.
    pub is_whites_turn: bool,
    /// Always false at start.
    pub is_game_over: bool,
    /// Move log so far.
    pub moves: Vec<Move>,
    /// Recipient user id.
    pub user_id: String,
    /// Recipient's opponent.
    pub opponent_username: String,
    /// Recipient's side.
    pub color: Side,
}

/// `game_over` content for clock timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameOverInfo {
    /// Session id.
    pub game_id: String,
    /// Winning side.
    pub winner: Side,
    /// Finish reason.
    pub reason: String,
    /// White clock, MM:SS.
    pub white_time: String,
    /// Black clock, MM:SS.
    pub black_time: String,
    /// Winner user id.
    pub winner_id: String,
    /// Always true.
    pub is_game_over: bool,
    /// Session status name.
    pub status: String,
}

/// `time_update` content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeUpdate {
    /// Session id.
    pub room_id: String,
    /// White seconds remaining.
    pub white_time: u32,
    /// Black seconds remaining.
    pub black_time: u32,
    /// Turn flag.
    pub is_whites_turn: bool,
}

/// `move_error` content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveErrorInfo {
    /// Human-readable reason.
    pub error: String,
}

/// `room_closed` content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomClosedInfo {
    /// Session id.
    pub room_id: String,
    /// Why the room closed.
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_json_roundtrip() {
        let env = Envelope::new("request_online_users", "");
        let json = env.to_json().unwrap();
        assert!(json.contains("\"type\":\"request_online_users\""));

        let parsed = Envelope::from_json(&json).unwrap();
        assert_eq!(parsed, env);
    }

    #[test]
    fn test_envelope_binary() {
        let env = Envelope::new("game_move", r#"{"gameId":"r1"}"#);
        let bytes = env.to_bytes().unwrap();
        assert_eq!(Envelope::from_bytes(&bytes).unwrap(), env);
    }

    #[test]
    fn test_malformed_envelope() {
        let result = Envelope::from_json("not json");
        assert!(matches!(result, Err(ProtocolError::MalformedEnvelope(_))));
    }

    #[test]
    fn test_decode_invitation_send() {
        let env = Envelope::new(
            "invitation_send",
            r#"{"type":"invitation_send","from_username":"alice","to_username":"bob","room_id":"r1"}"#,
        );

        match ClientMessage::from_envelope(&env).unwrap() {
            ClientMessage::InvitationSend(inv) => {
                assert_eq!(inv.from_username, "alice");
                assert_eq!(inv.to_username, "bob");
                assert_eq!(inv.room_id(), Some("r1"));
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_empty_room_id_is_absent() {
        let inv = InvitationPayload {
            room_id: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(inv.room_id(), None);
    }

    #[test]
    fn test_decode_game_move_keeps_raw() {
        let raw = r#"{"gameId":"r1","toUsername":"bob","move":{"from":"e2","to":"e4","piece":"P"},"fen":"x","isWhitesTurn":true,"extra":1}"#;
        let env = Envelope::new("game_move", raw);

        match ClientMessage::from_envelope(&env).unwrap() {
            ClientMessage::GameMove { payload, raw: kept } => {
                assert_eq!(payload.game_id, "r1");
                assert!(payload.is_whites_turn);
                assert_eq!(payload.mv.unwrap().to, "e4");
                assert_eq!(kept, raw);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type() {
        let env = Envelope::new("public_game_request", "{}");
        let result = ClientMessage::from_envelope(&env);
        assert!(matches!(result, Err(ProtocolError::UnknownType(t)) if t == "public_game_request"));
    }

    #[test]
    fn test_malformed_content() {
        let env = Envelope::new("game_move", r#"{"gameId": 5}"#);
        let result = ClientMessage::from_envelope(&env);
        assert!(matches!(
            result,
            Err(ProtocolError::MalformedContent { kind: "game_move", .. })
        ));
    }

    #[test]
    fn test_relay_is_verbatim() {
        let raw = r#"{"gameId":"r1","winner":"white","reason":"checkmate"}"#;
        let env = ServerMessage::GameOverCheckmate(raw.to_string()).to_envelope().unwrap();
        assert_eq!(env.kind, "game_over_checkmate");
        assert_eq!(env.content, raw);
    }

    #[test]
    fn test_time_update_field_names() {
        let env = ServerMessage::TimeUpdate(TimeUpdate {
            room_id: "r1".into(),
            white_time: 59,
            black_time: 60,
            is_whites_turn: true,
        })
        .to_envelope()
        .unwrap();

        assert_eq!(env.kind, "time_update");
        let value: serde_json::Value = serde_json::from_str(&env.content).unwrap();
        assert_eq!(value["roomId"], "r1");
        assert_eq!(value["whiteTime"], 59);
        assert_eq!(value["isWhitesTurn"], true);
    }

    #[test]
    fn test_game_over_content() {
        let env = ServerMessage::GameOver(GameOverInfo {
            game_id: "r1".into(),
            winner: Side::Black,
            reason: "timeout".into(),
            white_time: "00:00".into(),
            black_time: "01:00".into(),
            winner_id: "b-id".into(),
            is_game_over: true,
            status: "finished".into(),
        })
        .to_envelope()
        .unwrap();

        let value: serde_json::Value = serde_json::from_str(&env.content).unwrap();
        assert_eq!(value["winner"], "black");
        assert_eq!(value["reason"], "timeout");
        assert_eq!(value["isGameOver"], true);
    }
}
