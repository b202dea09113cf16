use serde::{Deserialize, Serialize};

pub type PeerId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// One half of an offer/answer exchange, shaped like a browser
/// `RTCSessionDescriptionInit` so the relay can forward it untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Messages sent from a participant to the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    Join {
        account_id: PeerId,
    },
    Offer {
        from_id: PeerId,
        to_id: PeerId,
        offer: SessionDescription,
    },
    Answer {
        from_id: PeerId,
        to_id: PeerId,
        answer: SessionDescription,
    },
    IceCandidate {
        from_id: PeerId,
        to_id: PeerId,
        candidate: IceCandidate,
    },
    Ping,
}

impl ClientMessage {
    /// Recipient of a point-to-point message; `None` for broadcasts.
    pub fn to_id(&self) -> Option<&str> {
        match self {
            ClientMessage::Offer { to_id, .. }
            | ClientMessage::Answer { to_id, .. }
            | ClientMessage::IceCandidate { to_id, .. } => Some(to_id),
            ClientMessage::Join { .. } | ClientMessage::Ping => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::IceCandidate { .. } => "ice_candidate",
            ClientMessage::Ping => "ping",
        }
    }
}

/// Messages delivered by the relay to a participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    /// Broadcast echo of another participant's JOIN.
    Join {
        from_id: PeerId,
    },
    Offer {
        from_id: PeerId,
        to_id: PeerId,
        offer: SessionDescription,
    },
    Answer {
        from_id: PeerId,
        to_id: PeerId,
        answer: SessionDescription,
    },
    IceCandidate {
        from_id: PeerId,
        to_id: PeerId,
        candidate: IceCandidate,
    },
    /// Full list of participants currently online in the room.
    Presence {
        peer_ids: Vec<PeerId>,
    },
    Pong,
}

/// Point-to-point signaling payload after the envelope has been routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
}

impl Signal {
    pub fn into_client_message(self, from_id: &str, to_id: &str) -> ClientMessage {
        let from_id = from_id.to_string();
        let to_id = to_id.to_string();
        match self {
            Signal::Offer(offer) => ClientMessage::Offer {
                from_id,
                to_id,
                offer,
            },
            Signal::Answer(answer) => ClientMessage::Answer {
                from_id,
                to_id,
                answer,
            },
            Signal::IceCandidate(candidate) => ClientMessage::IceCandidate {
                from_id,
                to_id,
                candidate,
            },
        }
    }
}

impl ServerMessage {
    /// Splits a point-to-point message into `(from, to, signal)`.
    pub fn into_signal(self) -> Option<(PeerId, PeerId, Signal)> {
        match self {
            ServerMessage::Offer {
                from_id,
                to_id,
                offer,
            } => Some((from_id, to_id, Signal::Offer(offer))),
            ServerMessage::Answer {
                from_id,
                to_id,
                answer,
            } => Some((from_id, to_id, Signal::Answer(answer))),
            ServerMessage::IceCandidate {
                from_id,
                to_id,
                candidate,
            } => Some((from_id, to_id, Signal::IceCandidate(candidate))),
            ServerMessage::Join { .. } | ServerMessage::Presence { .. } | ServerMessage::Pong => {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_uses_account_id_on_the_wire() {
        let value = serde_json::to_value(ClientMessage::Join {
            account_id: "alice".into(),
        })
        .expect("serialize join");
        assert_eq!(value, json!({ "type": "JOIN", "accountId": "alice" }));
    }

    #[test]
    fn candidate_envelope_matches_browser_field_names() {
        let message = ClientMessage::IceCandidate {
            from_id: "alice".into(),
            to_id: "bob".into(),
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            },
        };
        let value = serde_json::to_value(&message).expect("serialize candidate");
        assert_eq!(value["type"], "ICE_CANDIDATE");
        assert_eq!(value["fromId"], "alice");
        assert_eq!(value["toId"], "bob");
        assert_eq!(value["candidate"]["sdpMid"], "0");
        assert_eq!(value["candidate"]["sdpMLineIndex"], 0);
    }

    #[test]
    fn server_offer_decodes_and_splits_into_signal() {
        let text = r#"{"type":"OFFER","fromId":"bob","toId":"alice","offer":{"type":"offer","sdp":"v=0"}}"#;
        let message: ServerMessage = serde_json::from_str(text).expect("decode offer");
        let (from, to, signal) = message.into_signal().expect("point-to-point");
        assert_eq!(from, "bob");
        assert_eq!(to, "alice");
        assert_eq!(signal, Signal::Offer(SessionDescription::offer("v=0")));
    }

    #[test]
    fn presence_and_join_echo_decode() {
        let presence: ServerMessage =
            serde_json::from_str(r#"{"type":"PRESENCE","peerIds":["a","b"]}"#)
                .expect("decode presence");
        assert_eq!(
            presence,
            ServerMessage::Presence {
                peer_ids: vec!["a".into(), "b".into()]
            }
        );
        let join: ServerMessage =
            serde_json::from_str(r#"{"type":"JOIN","fromId":"c"}"#).expect("decode join");
        assert_eq!(join, ServerMessage::Join { from_id: "c".into() });
        assert!(join.into_signal().is_none());
    }
}
