//! WebRTC SDP/ICE signaling exchanged over the browser-facing WebSocket.
//!
//! Unlike the control language in [`crate::control`], signaling messages
//! are a closed, strongly-typed set — browsers don't hand-author these, the
//! client SDK does, so there's no need for the same permissive parsing.

use serde::{Deserialize, Serialize};

/// Signaling messages exchanged between a browser and the bridge for one
/// device session. Keyed implicitly by the WebSocket connection itself
/// (one socket per device, not a shared multiplexed channel).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// Browser → bridge: SDP offer.
    Offer { sdp: String },
    /// Bridge → browser: SDP answer.
    Answer { sdp: String },
    /// Either direction: a trickled ICE candidate.
    IceCandidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    },
    /// Bridge → browser: the device's Source is attached and streaming.
    Ready { device_id: String },
    /// Bridge → browser: a fatal signaling or device error; the socket
    /// closes after this message is sent.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_round_trips_through_json() {
        let msg = SignalingMessage::Offer {
            sdp: "v=0...".to_string(),
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "offer");
        let back: SignalingMessage = serde_json::from_value(v).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn ice_candidate_optional_fields_absent() {
        let v = serde_json::json!({
            "type": "ice_candidate",
            "candidate": "candidate:1 1 UDP 2122260223 192.0.2.1 5000 typ host",
        });
        let msg: SignalingMessage = serde_json::from_value(v).unwrap();
        assert!(matches!(
            msg,
            SignalingMessage::IceCandidate {
                sdp_mid: None,
                sdp_mline_index: None,
                ..
            }
        ));
    }

    #[test]
    fn error_message_shape() {
        let msg = SignalingMessage::Error {
            message: "device disconnected".to_string(),
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "error");
        assert_eq!(v["message"], "device disconnected");
    }
}
