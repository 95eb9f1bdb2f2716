//! The signaling wire protocol: every frame exchanged between a peer and
//! the hub is one JSON object, tagged by `type`, kebab-case on the wire.

use serde::{Deserialize, Deserializer, Serialize};

/// A peer's standing within its current room. Any role may create a room;
/// only `Host`/`Ops` may impose a producer mute on another member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Ops,
    Guest,
}

impl Role {
    /// Whether this role may impose `authority: producer` on another peer.
    pub fn can_impose_producer_mute(self) -> bool {
        matches!(self, Role::Host | Role::Ops)
    }
}

impl Default for Role {
    /// The URL fragment convention (`#<room_id>?role=<...>`) defaults a
    /// missing role to guest; the same default applies wire-side.
    fn default() -> Self {
        Role::Guest
    }
}

/// The authority under which a `mute` message was sent. `producer` can only
/// be asserted by a host or ops member; `self` must target the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Authority {
    #[serde(rename = "self")]
    SelfAsserted,
    Producer,
}

/// A room member as surfaced in `room-joined`/`peer-joined`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub peer_id: String,
    pub role: Role,
}

/// An SDP payload. Accepts either a raw string or an object carrying an
/// embedded `.sdp` string, for compatibility with clients that wrap it —
/// both shapes normalize to the same plain string once parsed.
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct SdpPayload(pub String);

impl<'de> Deserialize<'de> for SdpPayload {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Shape {
            Raw(String),
            Wrapped { sdp: String },
        }
        Ok(match Shape::deserialize(deserializer)? {
            Shape::Raw(s) => SdpPayload(s),
            Shape::Wrapped { sdp } => SdpPayload(sdp),
        })
    }
}

impl SdpPayload {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Every frame the hub can send or receive. Variants not valid in a given
/// direction (e.g. a client sending `welcome`) are rejected by the hub
/// rather than by the type system, matching the wire contract's single
/// shared envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    Register { peer_id: String },
    Registered { peer_id: String },

    Ping,
    Pong { timestamp: i64 },

    CreateRoom,
    JoinRoom { room_id: String },
    CreateOrJoinRoom { room_id: Option<String>, #[serde(default)] role: Role },

    RoomCreated { room_id: String, host_id: String, role: Role },
    RoomJoined { room_id: String, participants: Vec<Participant>, role: Role },
    PeerJoined { peer_id: String, role: Role },
    PeerLeft { peer_id: String },

    Offer { from: String, to: String, sdp: SdpPayload },
    Answer { from: String, to: String, sdp: SdpPayload },
    IceCandidate { from: String, to: String, candidate: serde_json::Value },

    Mute { from: String, peer_id: String, muted: bool, authority: Authority },

    Welcome,
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sdp_accepts_raw_string_and_wrapped_object() {
        let raw: Message = serde_json::from_str(
            r#"{"type":"offer","from":"a","to":"b","sdp":"v=0..."}"#,
        )
        .unwrap();
        let wrapped: Message = serde_json::from_str(
            r#"{"type":"offer","from":"a","to":"b","sdp":{"sdp":"v=0..."}}"#,
        )
        .unwrap();
        match (raw, wrapped) {
            (Message::Offer { sdp: a, .. }, Message::Offer { sdp: b, .. }) => {
                assert_eq!(a.as_str(), "v=0...");
                assert_eq!(a.as_str(), b.as_str());
            }
            _ => panic!("expected Offer"),
        }
    }

    #[test]
    fn create_or_join_room_defaults_missing_role_to_guest() {
        let msg: Message =
            serde_json::from_str(r#"{"type":"create-or-join-room","room_id":"r1"}"#).unwrap();
        match msg {
            Message::CreateOrJoinRoom { role, .. } => assert_eq!(role, Role::Guest),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn mute_authority_self_serializes_as_reserved_word() {
        let msg = Message::Mute {
            from: "a".into(),
            peer_id: "a".into(),
            muted: true,
            authority: Authority::SelfAsserted,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"authority\":\"self\""));
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let result: Result<Message, _> = serde_json::from_str(r#"{"type":"nonsense"}"#);
        assert!(result.is_err());
    }
}
