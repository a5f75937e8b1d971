//! Glues the decoded JSON control language to the scrcpy-style binary
//! encoder and a Source's control socket.
//!
//! Keeps the Source itself ignorant of JSON: this module is the only place
//! that translates `screenbridge_protocol::control::InboundControl` into
//! bytes and hands them to `Source::send_control`.

use crate::source::Source;
use screenbridge_protocol::control::{
    normalize_coordinate, parse_inbound, ControlParseError, InboundControl, KeyAction,
    OutboundControlReply, TouchActionKind,
};
use screenbridge_protocol::wire::{self, TouchAction};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Handle one inbound control message: parse, normalize, encode, and write
/// to the control socket. Returns a reply to send back over the same
/// channel it arrived on, if any (currently only `ping` produces one).
///
/// Unrecognized or malformed messages are logged and dropped, never
/// propagated as an error — the control channel is best-effort per client.
pub async fn handle_inbound(
    source: &Arc<Source>,
    value: &Value,
    now_ms: u64,
) -> Option<OutboundControlReply> {
    let parsed = match parse_inbound(value) {
        Ok(p) => p,
        Err(ControlParseError::UnrecognizedType) => {
            debug!(?value, "ignoring unrecognized control message");
            return None;
        }
        Err(e) => {
            warn!(error = %e, ?value, "dropping malformed control message");
            return None;
        }
    };

    match parsed {
        InboundControl::Ping { id } => {
            return Some(OutboundControlReply::Pong { id, timestamp_ms: now_ms });
        }
        InboundControl::Key { action, keycode, repeat, meta_state } => {
            let action_byte = match action {
                KeyAction::Down => 0,
                KeyAction::Up => 1,
            };
            source
                .send_control(wire::encode_keycode(action_byte, keycode, repeat, meta_state))
                .await;
        }
        InboundControl::Touch {
            action,
            pointer_id,
            x,
            y,
            pressure,
            action_button,
            buttons,
            ..
        } => {
            let Some(info) = source.wait_for_connection_info().await else {
                debug!("dropping touch: connection info not yet available");
                return None;
            };
            let (screen_width, screen_height) = (info.width as u16, info.height as u16);
            let (Some(px), Some(py)) = (
                normalize_coordinate(x, screen_width),
                normalize_coordinate(y, screen_height),
            ) else {
                debug!(x, y, screen_width, screen_height, "dropping out-of-range touch");
                return None;
            };
            let action = match action {
                TouchActionKind::Down => TouchAction::Down,
                TouchActionKind::Up => TouchAction::Up,
                TouchActionKind::Move => TouchAction::Move,
            };
            source
                .send_control(wire::encode_touch(
                    action,
                    pointer_id,
                    px,
                    py,
                    screen_width,
                    screen_height,
                    pressure,
                    action_button,
                    buttons,
                ))
                .await;
        }
        InboundControl::Scroll { x, y, h_scroll, v_scroll, buttons, .. } => {
            let Some(info) = source.wait_for_connection_info().await else {
                debug!("dropping scroll: connection info not yet available");
                return None;
            };
            let (screen_width, screen_height) = (info.width as u16, info.height as u16);
            let (Some(px), Some(py)) = (
                normalize_coordinate(x, screen_width),
                normalize_coordinate(y, screen_height),
            ) else {
                debug!(x, y, screen_width, screen_height, "dropping out-of-range scroll");
                return None;
            };
            source
                .send_control(wire::encode_scroll(px, py, screen_width, screen_height, h_scroll, v_scroll, buttons))
                .await;
        }
        InboundControl::ResetVideo => source.request_keyframe().await,
        InboundControl::ClipboardGet => {
            source.send_control(wire::encode_get_clipboard()).await;
        }
        InboundControl::ClipboardSet { text, paste, sequence } => {
            source.send_control(wire::encode_set_clipboard(sequence, paste, &text)).await;
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use screenbridge_protocol::{DeviceConfig, StreamConfig};
    use serde_json::json;

    fn test_source() -> Arc<Source> {
        Source::new("emulator-5554", DeviceConfig::default(), StreamConfig::default())
    }

    async fn test_source_with_screen(width: u32, height: u32) -> Arc<Source> {
        let source = test_source();
        source
            .set_connection_info_for_test(crate::source::ConnectionInfo {
                serial: "emulator-5554".into(),
                width,
                height,
            })
            .await;
        source
    }

    #[tokio::test]
    async fn ping_produces_a_pong_reply() {
        let source = test_source();
        let reply = handle_inbound(&source, &json!({"type": "ping", "id": 7}), 1_000).await;
        match reply {
            Some(OutboundControlReply::Pong { id, timestamp_ms }) => {
                assert_eq!(id, json!(7));
                assert_eq!(timestamp_ms, 1_000);
            }
            other => panic!("expected Some(Pong), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_type_produces_no_reply_and_does_not_panic() {
        let source = test_source();
        let reply = handle_inbound(&source, &json!({"type": "flibbertigibbet"}), 0).await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn out_of_range_touch_is_dropped_without_panic() {
        let source = test_source_with_screen(1080, 1920).await;
        let reply = handle_inbound(
            &source,
            &json!({
                "type": "touch",
                "action": "down",
                "x": 1.5,
                "y": 0.5,
                "screen_width": 1080,
                "screen_height": 1920,
            }),
            0,
        )
        .await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn touch_within_authoritative_screen_is_accepted_regardless_of_client_claim() {
        let source = test_source_with_screen(1080, 1920).await;
        // The client claims a tiny 10x10 screen; the Source's authoritative
        // 1080x1920 connection info is what actually governs the clamp, so
        // this in-range (per the real screen) touch is not dropped.
        let reply = handle_inbound(
            &source,
            &json!({
                "type": "touch",
                "action": "down",
                "x": 0.5,
                "y": 0.5,
                "screen_width": 10,
                "screen_height": 10,
            }),
            0,
        )
        .await;
        assert!(reply.is_none()); // touch never produces a reply, success or drop
        assert!(source.get_connection_info().await.unwrap().width == 1080);
    }

    #[tokio::test(start_paused = true)]
    async fn touch_is_dropped_when_connection_info_never_arrives() {
        let source = test_source();
        let reply = handle_inbound(
            &source,
            &json!({
                "type": "touch",
                "action": "down",
                "x": 0.5,
                "y": 0.5,
                "screen_width": 1080,
                "screen_height": 1920,
            }),
            0,
        )
        .await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn reset_video_requests_a_keyframe_without_panic() {
        let source = test_source();
        let reply = handle_inbound(&source, &json!({"type": "reset_video"}), 0).await;
        assert!(reply.is_none());
    }
}
